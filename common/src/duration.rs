// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Human-readable durations for configuration.
//!
//! Accepts `25m`, `24h`, `1d12h`, `15s`, combinations thereof, or a bare
//! number of seconds.
//!
//! ```
//! use adpass_common::duration::parse_duration;
//! use std::time::Duration;
//!
//! assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
//! assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5_400));
//! assert_eq!(parse_duration("900").unwrap(), Duration::from_secs(900));
//! ```

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDurationError {
    input: String,
    reason: String,
}

impl ParseDurationError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseDurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid duration '{}': {}", self.input, self.reason)
    }
}

impl std::error::Error for ParseDurationError {}

fn unit_secs(unit: char) -> Option<u64> {
    match unit.to_ascii_lowercase() {
        'd' => Some(86_400),
        'h' => Some(3_600),
        'm' => Some(60),
        's' => Some(1),
        _ => None,
    }
}

pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParseDurationError::new(input, "empty"));
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in trimmed.chars().filter(|c| !c.is_whitespace()) {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let per_unit = unit_secs(c)
            .ok_or_else(|| ParseDurationError::new(input, format!("unknown unit '{}'", c)))?;
        if digits.is_empty() {
            return Err(ParseDurationError::new(input, format!("unit '{}' without a number", c)));
        }
        let n: u64 = digits
            .parse()
            .map_err(|_| ParseDurationError::new(input, format!("invalid number '{}'", digits)))?;
        digits.clear();
        total = n
            .checked_mul(per_unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| ParseDurationError::new(input, "overflow"))?;
    }
    if !digits.is_empty() {
        return Err(ParseDurationError::new(input, format!("number '{}' missing unit", digits)));
    }
    Ok(Duration::from_secs(total))
}

/// Inverse of [`parse_duration`] at second granularity.
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, per_unit) in [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)] {
        let n = secs / per_unit;
        if n > 0 {
            out.push_str(&format!("{}{}", n, unit));
            secs %= per_unit;
        }
    }
    out
}

/// Reads `key` from the environment; unset or unparsable falls back to `default`.
pub fn env_duration(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => match parse_duration(&raw) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(%key, error = %e, "ignoring unparsable duration");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units_and_combinations() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("25m").unwrap(), Duration::from_secs(1_500));
        assert_eq!(parse_duration("24H").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("1d 2h 3m 4s").unwrap(), Duration::from_secs(93_784));
        assert_eq!(parse_duration(" 60 ").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("1h30").is_err());
        assert!(parse_duration("99999999999999999999d").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for s in ["1d", "1h", "25m", "15s", "1d1h1m1s"] {
            assert_eq!(format_duration(parse_duration(s).unwrap()), s);
        }
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_env_duration_fallback() {
        let key = "ADPASS_TEST_DURATION_FALLBACK";
        std::env::remove_var(key);
        assert_eq!(env_duration(key, Duration::from_secs(7)), Duration::from_secs(7));
        std::env::set_var(key, "2m");
        assert_eq!(env_duration(key, Duration::ZERO), Duration::from_secs(120));
        std::env::set_var(key, "bogus");
        assert_eq!(env_duration(key, Duration::from_secs(7)), Duration::from_secs(7));
        std::env::remove_var(key);
    }
}
