// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

use adpass_common::duration::env_duration;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::ledger::API_VERSION;

pub const DEFAULT_LEDGER_URL: &str = "https://ads-serve.bravesoftware.com";
pub const DEFAULT_REDEMPTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEBUG_REDEMPTION_INTERVAL: Duration = Duration::from_secs(25 * 60);

#[derive(Clone, Debug)]
pub struct Config {
    pub ledger_url: String,
    pub api_version: u32,
    pub state_path: PathBuf,
    pub request_timeout: Duration,
    pub debug: bool,
    pub account: AccountSettings,
}

/// Knobs the account services read at construction.
#[derive(Clone, Debug)]
pub struct AccountSettings {
    /// Opted-in confirmations spend tokens and earn payment tokens.
    pub rewards_enabled: bool,
    pub redemption_interval: Duration,
    /// Randomize the scheduled payment redemption delay.
    pub randomize_redemption: bool,
    pub user_data: UserDataSettings,
}

#[derive(Clone, Debug)]
pub struct UserDataSettings {
    pub build_channel: String,
    pub platform: String,
    pub country_code: Option<String>,
    pub diagnostic_id: Option<String>,
    pub device_id: Option<String>,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            rewards_enabled: true,
            redemption_interval: DEFAULT_REDEMPTION_INTERVAL,
            randomize_redemption: true,
            user_data: UserDataSettings::default(),
        }
    }
}

impl Default for UserDataSettings {
    fn default() -> Self {
        Self {
            build_channel: "release".to_string(),
            platform: std::env::consts::OS.to_string(),
            country_code: None,
            diagnostic_id: None,
            device_id: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let ledger_url = env::var("ADPASS_LEDGER_URL").unwrap_or_else(|_| DEFAULT_LEDGER_URL.to_string());
        if !(ledger_url.starts_with("https://") || ledger_url.starts_with("http://")) {
            anyhow::bail!("ADPASS_LEDGER_URL must be an http(s) URL: {}", ledger_url);
        }

        let api_version = match env::var("ADPASS_API_VERSION") {
            Ok(v) => v.parse().context(format!("Invalid ADPASS_API_VERSION: {}", v))?,
            Err(_) => API_VERSION,
        };

        let debug = env_bool("ADPASS_DEBUG");
        let default_interval = if debug {
            DEBUG_REDEMPTION_INTERVAL
        } else {
            DEFAULT_REDEMPTION_INTERVAL
        };

        Ok(Self {
            ledger_url,
            api_version,
            state_path: env::var("ADPASS_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| "adpass_state.json".into()),
            request_timeout: env_duration("ADPASS_REQUEST_TIMEOUT", Duration::from_secs(30)),
            debug,
            account: AccountSettings {
                rewards_enabled: env::var("ADPASS_REWARDS_ENABLED")
                    .map(|v| parse_bool(&v))
                    .unwrap_or(true),
                redemption_interval: env_duration("ADPASS_REDEMPTION_INTERVAL", default_interval),
                randomize_redemption: !debug,
                user_data: UserDataSettings::from_env(),
            },
        })
    }
}

impl UserDataSettings {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            build_channel: env::var("ADPASS_BUILD_CHANNEL").unwrap_or(defaults.build_channel),
            platform: env::var("ADPASS_PLATFORM").unwrap_or(defaults.platform),
            country_code: env_opt("ADPASS_COUNTRY_CODE"),
            diagnostic_id: env_opt("ADPASS_DIAGNOSTIC_ID"),
            device_id: env_opt("ADPASS_DEVICE_ID"),
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn env_bool(key: &str) -> bool {
    env::var(key).map(|v| parse_bool(&v)).unwrap_or(false)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
