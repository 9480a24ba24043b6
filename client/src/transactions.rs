// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Transaction history and estimated earnings.
//!
//! Every confirmed ad event is recorded with the value the payment issuer
//! advertises for the key that signed its payment token. Earnings are an
//! estimate until the ledger pays out.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::confirmation::{AdType, ConfirmationType};
use crate::state::PoolState;

/// Day of the month payouts happen on.
pub const PAYMENT_DAY_OF_MONTH: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub estimated_redemption_value: f64,
    pub confirmation_type: ConfirmationType,
    #[serde(default)]
    pub ad_type: AdType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionsSummary {
    pub estimated_pending_rewards: f64,
    pub next_payment_date: DateTime<Utc>,
    pub ad_notifications_received_this_month: u64,
    pub transactions: Vec<TransactionRecord>,
}

impl TransactionsSummary {
    pub fn from_state(state: &PoolState, now: DateTime<Utc>) -> Self {
        let transactions: Vec<TransactionRecord> = state
            .transaction_history
            .iter()
            .filter(|t| t.timestamp <= now)
            .cloned()
            .collect();
        Self {
            estimated_pending_rewards: state.estimated_pending_rewards + unredeemed_value(state),
            next_payment_date: state.next_payment_date.unwrap_or_else(|| next_payment_date(now)),
            ad_notifications_received_this_month: ad_notifications_received_this_month(
                &state.transaction_history,
                now,
            ),
            transactions,
        }
    }
}

/// Parses an issuer's associated value such as `"0.05BAT"`. Anything
/// unparseable is worth nothing.
pub fn estimated_redemption_value(associated_value: &str) -> f64 {
    let amount = associated_value.trim().trim_end_matches("BAT").trim();
    match amount.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => value,
        _ => 0.0,
    }
}

/// Value of transactions whose payment tokens are still held.
pub fn unredeemed_value(state: &PoolState) -> f64 {
    state
        .transaction_history
        .iter()
        .filter(|t| {
            state
                .unblinded_payment_tokens
                .iter()
                .any(|p| p.transaction_id == t.transaction_id)
        })
        .map(|t| t.estimated_redemption_value)
        .filter(|v| *v > 0.0)
        .sum()
}

/// Paid ad notifications in the calendar month (UTC) of `now`.
pub fn ad_notifications_received_this_month(history: &[TransactionRecord], now: DateTime<Utc>) -> u64 {
    history
        .iter()
        .filter(|t| t.ad_type == AdType::AdNotification && t.estimated_redemption_value > 0.0)
        .filter(|t| t.timestamp.year() == now.year() && t.timestamp.month() == now.month())
        .count() as u64
}

/// The next payout day strictly after `now`.
pub fn next_payment_date(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.day() < PAYMENT_DAY_OF_MONTH {
        (now.year(), now.month())
    } else if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, PAYMENT_DAY_OF_MONTH, 0, 0, 0)
        .single()
        .unwrap_or(now)
}
