// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Ad confirmations paid for with anonymous tokens.
//!
//! An [`Account`](account::Account) keeps a pool of blind-signed
//! confirmation tokens, spends one per rewarded ad event, exchanges the
//! confirmation for a payment token, and periodically redeems the payment
//! tokens in a batch. Every network step retries on its own timer and the
//! pool, retry queue and schedule survive restarts.

use std::time::Duration;

pub mod account;
pub mod config;
pub mod confirmation;
pub mod confirmations;
pub mod http;
pub mod issuers;
pub mod ledger;
pub mod observer;
pub mod redeem_confirmation;
pub mod redeem_payment_tokens;
pub mod refill;
pub mod response;
pub mod state;
pub mod timer;
pub mod token_generator;
pub mod tokens;
pub mod transactions;
pub mod wallet;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use account::{Account, AccountContext};
pub use config::{AccountSettings, Config};
pub use observer::{AccountEvent, AccountObserver};

/// Fixed delay before any failed network step is retried.
pub const RETRY_DELAY: Duration = Duration::from_secs(15);
