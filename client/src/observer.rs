// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::confirmation::ConfirmationInfo;

/// Everything the account reports to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum AccountEvent {
    DidRefillUnblindedTokens,
    FailedToRefillUnblindedTokens,
    CaptchaRequiredToRefillUnblindedTokens { captcha_id: String },
    WillRetryRefillingUnblindedTokens { retry_at: DateTime<Utc> },
    DidRetryRefillingUnblindedTokens,
    DidConfirm { confirmation: ConfirmationInfo },
    FailedToConfirm { confirmation: ConfirmationInfo },
    WillRetryConfirming { retry_at: DateTime<Utc> },
    DidRedeemUnblindedPaymentTokens { count: usize },
    FailedToRedeemUnblindedPaymentTokens,
    DidScheduleNextUnblindedPaymentTokensRedemption { redeem_at: DateTime<Utc> },
    WillRetryRedeemingUnblindedPaymentTokens { retry_at: DateTime<Utc> },
    DidRetryRedeemingUnblindedPaymentTokens,
}

pub trait AccountObserver: Send + Sync {
    fn on_account_event(&self, event: &AccountEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct ObserverList {
    observers: Mutex<Vec<(ObserverId, Arc<dyn AccountObserver>)>>,
    next_id: AtomicU64,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn AccountObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, observer));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|(i, _)| *i != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: AccountEvent) {
        // Snapshot so observers may add or remove observers while handling.
        let observers: Vec<Arc<dyn AccountObserver>> =
            self.lock().iter().map(|(_, o)| Arc::clone(o)).collect();
        for observer in observers {
            observer.on_account_event(&event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ObserverId, Arc<dyn AccountObserver>)>> {
        self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
