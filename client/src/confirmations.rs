// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Confirming ad events and retrying the ones that failed.
//!
//! Failed confirmations that may succeed later are persisted in a FIFO
//! queue. One timer drains it, one confirmation per firing.

use chrono::Utc;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::account::AccountContext;
use crate::confirmation::{
    build_confirmation, rebuild_dynamic_user_data, BuildError, ConfirmationInfo, RewardSources, TransactionInfo,
    UserDataBuilder,
};
use crate::issuers::IssuerType;
use crate::observer::AccountEvent;
use crate::redeem_confirmation::{redeem, RedeemContext, RedeemOutcome};
use crate::refill::RefillConfirmationTokens;
use crate::timer::{RetryTimer, TimerTask};
use crate::tokens::UnblindedPaymentTokenInfo;
use crate::transactions::{estimated_redemption_value, TransactionRecord};
use crate::RETRY_DELAY;

pub struct Confirmations {
    ctx: AccountContext,
    refill: Arc<RefillConfirmationTokens>,
    user_data: Arc<dyn UserDataBuilder>,
    rewards_enabled: bool,
    retry_timer: RetryTimer,
    weak_self: Weak<Self>,
}

impl Confirmations {
    pub fn new(
        ctx: AccountContext,
        refill: Arc<RefillConfirmationTokens>,
        user_data: Arc<dyn UserDataBuilder>,
        rewards_enabled: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            ctx,
            refill,
            user_data,
            rewards_enabled,
            retry_timer: RetryTimer::new("confirmations"),
            weak_self: weak_self.clone(),
        })
    }

    pub fn is_retrying(&self) -> bool {
        self.retry_timer.is_running()
    }

    pub fn stop_retrying(&self) {
        self.retry_timer.stop();
    }

    fn redeem_context(&self) -> RedeemContext<'_> {
        RedeemContext {
            loader: self.ctx.loader.as_ref(),
            server: &self.ctx.server,
            issuers: self.ctx.issuers.as_ref(),
        }
    }

    /// Builds and redeems a confirmation for `transaction`.
    ///
    /// With rewards enabled this spends one unblinded token; an empty pool
    /// fails the confirm and asks for a refill.
    pub async fn confirm(&self, transaction: &TransactionInfo) -> Result<RedeemOutcome, BuildError> {
        info!(
            transaction_id = %transaction.id,
            creative_instance_id = %transaction.creative_instance_id,
            confirmation_type = %transaction.confirmation_type,
            ad_type = %transaction.ad_type,
            "confirming"
        );

        let rewards = self.rewards_enabled.then(|| RewardSources {
            token_pool: self.ctx.token_pool.as_ref(),
            token_generator: self.ctx.token_generator.as_ref(),
        });

        let confirmation = match build_confirmation(transaction, rewards, self.user_data.as_ref()).await {
            Ok(confirmation) => confirmation,
            Err(BuildError::NoUnblindedTokens) => {
                warn!(transaction_id = %transaction.id, "no unblinded tokens to confirm with");
                self.maybe_refill().await;
                return Err(BuildError::NoUnblindedTokens);
            }
            Err(e) => {
                error!(transaction_id = %transaction.id, error = %e, "failed to build confirmation");
                return Err(e);
            }
        };

        let outcome = redeem(self.redeem_context(), confirmation).await;
        self.on_redeemed(&outcome).await;
        Ok(outcome)
    }

    /// Arms the retry timer if failed confirmations are waiting.
    pub async fn process_retry_queue(&self) {
        if self.retry_timer.is_running() {
            return;
        }
        let queued = self.ctx.token_pool.failed_confirmation_count().await;
        if queued == 0 {
            return;
        }

        let retry_at = self.retry_timer.start(RETRY_DELAY, self.retry_task());
        info!(queued, %retry_at, "will retry failed confirmations");
        self.ctx.observers.notify(AccountEvent::WillRetryConfirming { retry_at });
    }

    fn retry_task(&self) -> TimerTask {
        let weak_self = self.weak_self.clone();
        Box::pin(async move {
            if let Some(this) = weak_self.upgrade() {
                this.retry().await;
            }
        })
    }

    async fn retry(&self) {
        let confirmation = match self.ctx.token_pool.pop_failed_confirmation().await {
            Ok(Some(confirmation)) => confirmation,
            Ok(None) => return,
            Err(e) => {
                error!(error = %format!("{:#}", e), "failed to dequeue confirmation");
                return;
            }
        };
        info!(
            transaction_id = %confirmation.transaction_id,
            was_created = confirmation.was_created,
            "retry confirmation"
        );

        let confirmation = if confirmation.is_opted_in() {
            match rebuild_dynamic_user_data(&confirmation, self.user_data.as_ref()) {
                Ok(rebuilt) => rebuilt,
                Err(e) => {
                    error!(transaction_id = %confirmation.transaction_id, error = %e, "failed to rebuild user data");
                    self.ctx.observers.notify(AccountEvent::FailedToConfirm { confirmation });
                    return self.process_retry_queue().await;
                }
            }
        } else {
            confirmation
        };

        let outcome = redeem(self.redeem_context(), confirmation).await;
        self.on_redeemed(&outcome).await;
    }

    async fn on_redeemed(&self, outcome: &RedeemOutcome) {
        match outcome {
            RedeemOutcome::Redeemed {
                confirmation,
                payment_token,
            } => self.on_did_confirm(confirmation, payment_token.clone()).await,
            RedeemOutcome::Failed {
                confirmation,
                should_retry,
                should_backoff,
            } => self.on_failed_to_confirm(confirmation, *should_retry, *should_backoff).await,
        }
    }

    async fn on_did_confirm(&self, confirmation: &ConfirmationInfo, payment_token: Option<UnblindedPaymentTokenInfo>) {
        let estimated_value = match &payment_token {
            Some(token) => {
                let issuers = self.ctx.issuers.issuers().await;
                issuers
                    .associated_value(IssuerType::Payments, &token.public_key.encode_base64())
                    .map(estimated_redemption_value)
                    .unwrap_or(0.0)
            }
            None => 0.0,
        };
        let record = TransactionRecord {
            transaction_id: confirmation.transaction_id.clone(),
            timestamp: Utc::now(),
            estimated_redemption_value: estimated_value,
            confirmation_type: confirmation.confirmation_type,
            ad_type: confirmation.ad_type,
        };

        let earned = payment_token.is_some();
        if let Err(e) = self.ctx.token_pool.record_transaction(record, payment_token).await {
            if earned {
                // The fetch is repeatable, so queue it again rather than lose the token.
                error!(
                    transaction_id = %confirmation.transaction_id,
                    error = %format!("{:#}", e),
                    "failed to store payment token"
                );
                return self.on_failed_to_confirm(confirmation, true, true).await;
            }
            warn!(
                transaction_id = %confirmation.transaction_id,
                error = %format!("{:#}", e),
                "failed to record transaction"
            );
        } else if earned {
            let count = self.ctx.token_pool.unblinded_payment_token_count().await;
            debug!(count, estimated_value, "stored unblinded payment token");
        }

        info!(
            transaction_id = %confirmation.transaction_id,
            creative_instance_id = %confirmation.creative_instance_id,
            confirmation_type = %confirmation.confirmation_type,
            ad_type = %confirmation.ad_type,
            "confirmed"
        );
        self.ctx.observers.notify(AccountEvent::DidConfirm {
            confirmation: confirmation.clone(),
        });

        self.retry_timer.stop();
        self.process_retry_queue().await;
        self.maybe_refill().await;
    }

    async fn on_failed_to_confirm(&self, confirmation: &ConfirmationInfo, should_retry: bool, should_backoff: bool) {
        warn!(
            transaction_id = %confirmation.transaction_id,
            creative_instance_id = %confirmation.creative_instance_id,
            confirmation_type = %confirmation.confirmation_type,
            ad_type = %confirmation.ad_type,
            should_retry,
            should_backoff,
            "failed to confirm"
        );

        if should_retry {
            if let Err(e) = self.ctx.token_pool.push_failed_confirmation(confirmation.clone()).await {
                error!(
                    transaction_id = %confirmation.transaction_id,
                    error = %format!("{:#}", e),
                    "failed to queue confirmation for retry"
                );
            }
            if !should_backoff {
                self.retry_timer.stop();
            }
        }

        self.ctx.observers.notify(AccountEvent::FailedToConfirm {
            confirmation: confirmation.clone(),
        });
        self.process_retry_queue().await;
    }

    async fn maybe_refill(&self) {
        if !self.rewards_enabled {
            return;
        }
        let wallet = self.ctx.wallet.read().await.clone();
        if let Some(wallet) = wallet {
            self.refill.maybe_refill(&wallet).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::{AdType, ConfirmationType, DefaultUserDataBuilder};
    use crate::config::UserDataSettings;
    use crate::testing::{RecordingObserver, TestAccount};
    use reqwest::Method;
    use std::time::Duration;

    async fn setup(rewards_enabled: bool) -> (TestAccount, Arc<Confirmations>, Arc<RecordingObserver>) {
        let account = TestAccount::new().await;
        let refill = RefillConfirmationTokens::new(account.ctx.clone());
        let confirmations = Confirmations::new(
            account.ctx.clone(),
            refill,
            Arc::new(DefaultUserDataBuilder::new(UserDataSettings::default())),
            rewards_enabled,
        );
        let observer = account.observe();
        (account, confirmations, observer)
    }

    fn transaction() -> TransactionInfo {
        TransactionInfo::new(
            "546fe7b0-5047-4f28-a11c-81f14edcf0f6",
            AdType::AdNotification,
            ConfirmationType::Viewed,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opted_in_confirm_stores_payment_token() {
        let (account, confirmations, observer) = setup(true).await;
        account.seed_unblinded_tokens(30).await;
        account.ledger.serve_confirmations(&account.loader);

        let outcome = confirmations.confirm(&transaction()).await.unwrap();
        assert!(outcome.is_redeemed());
        assert_eq!(account.ctx.token_pool.unblinded_token_count().await, 29);
        assert_eq!(account.ctx.token_pool.unblinded_payment_token_count().await, 1);
        assert!(matches!(observer.events().as_slice(), [AccountEvent::DidConfirm { .. }]));
        assert!(!confirmations.is_retrying());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_appends_transaction_history() {
        let (account, confirmations, _observer) = setup(true).await;
        account.seed_unblinded_tokens(30).await;
        account.ledger.serve_confirmations(&account.loader);
        let mut issuers = account.ledger.issuer.issuers_info();
        for issuer in &mut issuers.issuers {
            for value in issuer.public_keys.values_mut() {
                *value = "0.05BAT".to_string();
            }
        }
        account.ctx.issuers.set_issuers(issuers).await;

        confirmations.confirm(&transaction()).await.unwrap();
        confirmations.confirm(&transaction()).await.unwrap();

        let history = account.ctx.token_pool.transaction_history().await;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|t| t.estimated_redemption_value == 0.05));
        let summary = account.ctx.token_pool.transactions_summary(chrono::Utc::now()).await;
        assert!((summary.estimated_pending_rewards - 0.1).abs() < 1e-9);
        assert_eq!(summary.ad_notifications_received_this_month, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pool_requests_refill() {
        let (account, confirmations, observer) = setup(true).await;
        account.ledger.serve_refill(&account.loader);

        let err = confirmations.confirm(&transaction()).await.unwrap_err();
        assert!(matches!(err, BuildError::NoUnblindedTokens));
        assert_eq!(observer.events(), vec![AccountEvent::DidRefillUnblindedTokens]);
        assert_eq!(account.ctx.token_pool.unblinded_token_count().await, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_reward_confirm_spends_nothing() {
        let (account, confirmations, observer) = setup(false).await;
        account.seed_unblinded_tokens(5).await;
        account.ledger.serve_confirmations(&account.loader);

        let outcome = confirmations.confirm(&transaction()).await.unwrap();
        assert!(outcome.is_redeemed());
        assert!(!outcome.confirmation().is_opted_in());
        assert_eq!(account.ctx.token_pool.unblinded_token_count().await, 5);
        assert_eq!(account.ctx.token_pool.unblinded_payment_token_count().await, 0);
        assert_eq!(observer.count(|e| matches!(e, AccountEvent::DidConfirm { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_queued_and_retried() {
        let (account, confirmations, observer) = setup(true).await;
        account.seed_unblinded_tokens(30).await;
        account.ledger.serve_confirmations(&account.loader);
        account.loader.enqueue_front_prefix(Method::POST, "/v3/confirmation/", 500, "");

        let outcome = confirmations.confirm(&transaction()).await.unwrap();
        assert!(!outcome.is_redeemed());
        assert_eq!(account.ctx.token_pool.failed_confirmation_count().await, 1);
        assert!(confirmations.is_retrying());

        tokio::time::sleep(RETRY_DELAY + Duration::from_secs(1)).await;
        assert_eq!(account.ctx.token_pool.failed_confirmation_count().await, 0);
        assert_eq!(account.ctx.token_pool.unblinded_payment_token_count().await, 1);
        assert!(!confirmations.is_retrying());

        let kinds: Vec<_> = observer
            .events()
            .into_iter()
            .filter(|e| !matches!(e, AccountEvent::WillRetryConfirming { .. }))
            .collect();
        assert!(matches!(
            kinds.as_slice(),
            [AccountEvent::FailedToConfirm { .. }, AccountEvent::DidConfirm { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_queued() {
        let (account, confirmations, observer) = setup(true).await;
        account.seed_unblinded_tokens(30).await;
        account.ledger.serve_confirmations(&account.loader);
        account.loader.enqueue_front_prefix(Method::POST, "/v3/confirmation/", 409, "");

        confirmations.confirm(&transaction()).await.unwrap();
        assert_eq!(account.ctx.token_pool.failed_confirmation_count().await, 0);
        assert!(!confirmations.is_retrying());
        assert_eq!(observer.count(|e| matches!(e, AccountEvent::FailedToConfirm { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_survives_restart() {
        let (account, confirmations, _observer) = setup(true).await;
        account.seed_unblinded_tokens(30).await;
        account.loader.respond_prefix(Method::POST, "/v3/confirmation/", 503, "");
        confirmations.confirm(&transaction()).await.unwrap();
        confirmations.stop_retrying();
        drop(confirmations);

        let restarted = account.restart().await;
        assert_eq!(restarted.ctx.token_pool.failed_confirmation_count().await, 1);

        restarted.ledger.serve_confirmations(&restarted.loader);
        let refill = RefillConfirmationTokens::new(restarted.ctx.clone());
        let confirmations = Confirmations::new(
            restarted.ctx.clone(),
            refill,
            Arc::new(DefaultUserDataBuilder::new(UserDataSettings::default())),
            true,
        );
        confirmations.process_retry_queue().await;
        tokio::time::sleep(RETRY_DELAY + Duration::from_secs(1)).await;
        assert_eq!(restarted.ctx.token_pool.failed_confirmation_count().await, 0);
        assert_eq!(restarted.ctx.token_pool.unblinded_payment_token_count().await, 1);
    }
}
