// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! The account facade: one wallet, one token pool, and the services that
//! confirm, refill and cash out against the ledger.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{AccountSettings, Config};
use crate::confirmation::{BuildError, DefaultUserDataBuilder, TransactionInfo, UserDataBuilder};
use crate::confirmations::Confirmations;
use crate::http::{ReqwestLoader, UrlLoader};
use crate::issuers::{apply_issuers, restore_issuers, IssuerRegistry, Issuers, IssuersFetcher, IssuersInfo};
use crate::ledger::LedgerServer;
use crate::observer::{AccountObserver, ObserverId, ObserverList};
use crate::redeem_confirmation::RedeemOutcome;
use crate::redeem_payment_tokens::RedeemPaymentTokens;
use crate::refill::RefillConfirmationTokens;
use crate::state::{FileStateStore, StateStore, TokenPoolStore};
use crate::token_generator::{RandomTokenGenerator, TokenGenerator};
use crate::transactions::TransactionsSummary;
use crate::wallet::WalletInfo;

/// Collaborators shared by every account service.
#[derive(Clone)]
pub struct AccountContext {
    pub loader: Arc<dyn UrlLoader>,
    pub server: LedgerServer,
    pub token_pool: Arc<TokenPoolStore>,
    pub issuers: Arc<dyn IssuerRegistry>,
    pub observers: Arc<ObserverList>,
    pub token_generator: Arc<dyn TokenGenerator>,
    pub wallet: Arc<RwLock<Option<WalletInfo>>>,
}

impl AccountContext {
    pub fn new(loader: Arc<dyn UrlLoader>, server: LedgerServer, store: Arc<dyn StateStore>) -> Self {
        Self {
            loader,
            server,
            token_pool: Arc::new(TokenPoolStore::new(store)),
            issuers: Arc::new(Issuers::new()),
            observers: Arc::new(ObserverList::new()),
            token_generator: Arc::new(RandomTokenGenerator),
            wallet: Arc::new(RwLock::new(None)),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let loader = ReqwestLoader::new(config.request_timeout).context("create HTTP loader")?;
        let server = LedgerServer::new(&config.ledger_url, config.api_version);
        let store = FileStateStore::new(&config.state_path);
        Ok(Self::new(Arc::new(loader), server, Arc::new(store)))
    }
}

pub struct Account {
    ctx: AccountContext,
    confirmations: Arc<Confirmations>,
    refill: Arc<RefillConfirmationTokens>,
    payments: Arc<RedeemPaymentTokens>,
    issuers_fetcher: Mutex<Option<IssuersFetcher>>,
}

impl Account {
    pub fn new(ctx: AccountContext, settings: AccountSettings) -> Self {
        let user_data = Arc::new(DefaultUserDataBuilder::new(settings.user_data.clone()));
        Self::with_user_data(ctx, settings, user_data)
    }

    pub fn with_user_data(
        ctx: AccountContext,
        settings: AccountSettings,
        user_data: Arc<dyn UserDataBuilder>,
    ) -> Self {
        let refill = RefillConfirmationTokens::new(ctx.clone());
        let confirmations = Confirmations::new(ctx.clone(), Arc::clone(&refill), user_data, settings.rewards_enabled);
        let payments = RedeemPaymentTokens::new(ctx.clone(), settings);
        Self {
            ctx,
            confirmations,
            refill,
            payments,
            issuers_fetcher: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &AccountContext {
        &self.ctx
    }

    /// Loads persisted state, including the last known issuers. Must run
    /// before anything else.
    pub async fn initialize(&self) -> Result<()> {
        let pool = &self.ctx.token_pool;
        pool.initialize().await.context("initialize token pool")?;
        if restore_issuers(self.ctx.issuers.as_ref(), pool).await {
            debug!("restored persisted issuers");
        }

        let unblinded_tokens = pool.unblinded_token_count().await;
        let unblinded_payment_tokens = pool.unblinded_payment_token_count().await;
        let failed_confirmations = pool.failed_confirmation_count().await;
        info!(
            unblinded_tokens,
            unblinded_payment_tokens,
            failed_confirmations,
            "account initialized"
        );
        Ok(())
    }

    /// Installs freshly fetched issuers and persists them.
    pub async fn set_issuers(&self, issuers: IssuersInfo) {
        apply_issuers(self.ctx.issuers.as_ref(), &self.ctx.token_pool, issuers).await;
    }

    /// Keeps issuers current in the background until [`Account::shutdown`].
    pub fn start_issuers_refresh(&self) {
        let fetcher = IssuersFetcher::spawn(
            Arc::clone(&self.ctx.loader),
            self.ctx.server.clone(),
            Arc::clone(&self.ctx.issuers),
            Arc::clone(&self.ctx.token_pool),
        );
        let mut slot = self.issuers_fetcher.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.replace(fetcher) {
            previous.stop();
        }
    }

    /// Derives and installs the wallet. A payment id different from the one
    /// in memory, or the one the persisted pool was built for, discards all
    /// token and retry state; the same id keeps only tokens it signed.
    pub async fn set_wallet(&self, payment_id: &str, recovery_seed: &str) -> Result<WalletInfo> {
        let wallet = WalletInfo::derive(payment_id, recovery_seed)?;

        let mut slot = self.ctx.wallet.write().await;
        let previous = match slot.as_ref() {
            Some(current) => Some(current.payment_id.clone()),
            None => self.ctx.token_pool.payment_id().await,
        };
        let changed = previous
            .as_deref()
            .is_some_and(|previous| previous != wallet.payment_id);

        if changed {
            info!("wallet payment id changed, resetting account state");
            self.refill.reset().await;
            self.payments.reset().await;
            self.confirmations.stop_retrying();
            self.ctx
                .token_pool
                .reset_for_payment_id(&wallet.payment_id)
                .await
                .context("reset token pool")?;
        } else if self.ctx.token_pool.is_initialized().await {
            if self.ctx.token_pool.payment_id().await.as_deref() != Some(wallet.payment_id.as_str()) {
                self.ctx
                    .token_pool
                    .set_payment_id(&wallet.payment_id)
                    .await
                    .context("record payment id")?;
            }
            let dropped = self
                .ctx
                .token_pool
                .retain_unblinded_tokens(|t| t.is_signed_by(&wallet))
                .await
                .context("drop tokens from another wallet")?;
            if dropped > 0 {
                warn!(dropped, "dropped unblinded tokens not signed by this wallet");
            }
        }

        *slot = Some(wallet.clone());
        Ok(wallet)
    }

    pub async fn wallet(&self) -> Option<WalletInfo> {
        self.ctx.wallet.read().await.clone()
    }

    /// Estimated earnings, this month's paid ad notifications and the
    /// transaction history up to now.
    pub async fn transactions_summary(&self) -> TransactionsSummary {
        self.ctx.token_pool.transactions_summary(Utc::now()).await
    }

    /// Records pending rewards and payout date as reported by the ledger.
    pub async fn update_ads_rewards(
        &self,
        estimated_pending_rewards: f64,
        next_payment_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.ctx
            .token_pool
            .set_ads_rewards(estimated_pending_rewards, next_payment_date)
            .await
            .context("update ads rewards")
    }

    pub async fn confirm(&self, transaction: &TransactionInfo) -> Result<RedeemOutcome, BuildError> {
        self.confirmations.confirm(transaction).await
    }

    pub async fn maybe_refill(&self) {
        match self.wallet().await {
            Some(wallet) => self.refill.maybe_refill(&wallet).await,
            None => debug!("no wallet, skipping refill"),
        }
    }

    pub async fn maybe_redeem_after_delay(&self) {
        match self.wallet().await {
            Some(wallet) => self.payments.maybe_redeem_after_delay(&wallet).await,
            None => debug!("no wallet, skipping payment token redemption"),
        }
    }

    pub async fn process_retry_queue(&self) {
        self.confirmations.process_retry_queue().await;
    }

    pub fn add_observer(&self, observer: Arc<dyn AccountObserver>) -> ObserverId {
        self.ctx.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.ctx.observers.remove(id)
    }

    /// Stops timers and background refreshes. Persisted state is untouched.
    pub async fn shutdown(&self) {
        self.confirmations.stop_retrying();
        self.refill.reset().await;
        self.payments.reset().await;
        if let Some(fetcher) = self.issuers_fetcher.lock().unwrap_or_else(|p| p.into_inner()).take() {
            fetcher.stop();
        }
        info!("account shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{unblinded_tokens, TestAccount, PAYMENT_ID, RECOVERY_SEED};
    use adpass_common::api::IssuersResp;

    const OTHER_PAYMENT_ID: &str = "c1b8a6b0-3f4e-4d6a-9f21-0a1b2c3d4e5f";

    #[tokio::test(start_paused = true)]
    async fn test_changing_payment_id_resets_state() {
        let fixture = TestAccount::new().await;
        let account = Account::new(fixture.ctx.clone(), AccountSettings::default());
        account.set_wallet(PAYMENT_ID, RECOVERY_SEED).await.unwrap();
        fixture.seed_unblinded_tokens(10).await;
        fixture.seed_payment_tokens(2).await;

        let wallet = account.set_wallet(OTHER_PAYMENT_ID, RECOVERY_SEED).await.unwrap();
        assert_eq!(wallet.payment_id, OTHER_PAYMENT_ID);
        assert_eq!(fixture.ctx.token_pool.unblinded_token_count().await, 0);
        assert_eq!(fixture.ctx.token_pool.unblinded_payment_token_count().await, 0);
        assert_eq!(account.wallet().await.unwrap(), wallet);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_payment_id_after_restart_resets_state() {
        let fixture = TestAccount::new().await;
        fixture.seed_unblinded_tokens(10).await;
        fixture.seed_payment_tokens(2).await;
        fixture
            .ctx
            .token_pool
            .set_next_token_redemption_at(Utc::now())
            .await
            .unwrap();

        let restarted = fixture.restart().await;
        *restarted.ctx.wallet.write().await = None;
        let account = Account::new(restarted.ctx.clone(), AccountSettings::default());
        account.initialize().await.unwrap();

        account.set_wallet(OTHER_PAYMENT_ID, RECOVERY_SEED).await.unwrap();

        let pool = &restarted.ctx.token_pool;
        assert_eq!(pool.unblinded_token_count().await, 0);
        assert_eq!(pool.unblinded_payment_token_count().await, 0);
        assert!(pool.next_token_redemption_at().await.is_none());
        assert_eq!(pool.payment_id().await.as_deref(), Some(OTHER_PAYMENT_ID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_payment_id_after_restart_keeps_state() {
        let fixture = TestAccount::new().await;
        fixture.seed_unblinded_tokens(10).await;
        fixture.seed_payment_tokens(2).await;

        let restarted = fixture.restart().await;
        *restarted.ctx.wallet.write().await = None;
        let account = Account::new(restarted.ctx.clone(), AccountSettings::default());
        account.initialize().await.unwrap();
        account.set_wallet(PAYMENT_ID, RECOVERY_SEED).await.unwrap();

        assert_eq!(restarted.ctx.token_pool.unblinded_token_count().await, 10);
        assert_eq!(restarted.ctx.token_pool.unblinded_payment_token_count().await, 2);
    }

    #[tokio::test]
    async fn test_initialize_restores_persisted_issuers() {
        let fixture = TestAccount::new().await;
        let issuers = fixture.ledger.issuer.issuers_info();
        fixture.ctx.token_pool.set_issuers(issuers.to_response()).await.unwrap();

        let restarted = fixture.restart().await;
        let mut ctx = restarted.ctx.clone();
        ctx.issuers = Arc::new(Issuers::new());
        let account = Account::new(ctx.clone(), AccountSettings::default());
        account.initialize().await.unwrap();

        assert!(ctx.issuers.has_issuers().await);
        assert_eq!(ctx.issuers.issuers().await, issuers);
        let persisted: Option<IssuersResp> = ctx.token_pool.issuers().await;
        assert_eq!(persisted, Some(issuers.to_response()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_wallet_keeps_its_tokens() {
        let fixture = TestAccount::new().await;
        let account = Account::new(fixture.ctx.clone(), AccountSettings::default());
        fixture.seed_unblinded_tokens(10).await;
        let stranger = crate::wallet::WalletInfo::derive(OTHER_PAYMENT_ID, RECOVERY_SEED).unwrap();
        fixture
            .ctx
            .token_pool
            .add_unblinded_tokens(unblinded_tokens(3, &stranger))
            .await
            .unwrap();

        account.set_wallet(PAYMENT_ID, RECOVERY_SEED).await.unwrap();
        assert_eq!(fixture.ctx.token_pool.unblinded_token_count().await, 10);
    }

    #[tokio::test]
    async fn test_invalid_wallet_is_rejected() {
        let fixture = TestAccount::new().await;
        let account = Account::new(fixture.ctx.clone(), AccountSettings::default());
        assert!(account.set_wallet("nope", RECOVERY_SEED).await.is_err());
        assert_eq!(account.wallet().await.unwrap(), fixture.wallet);
    }

    #[tokio::test]
    async fn test_observers_register_and_unregister() {
        let fixture = TestAccount::new().await;
        let account = Account::new(fixture.ctx.clone(), AccountSettings::default());
        let id = account.add_observer(Arc::new(crate::testing::RecordingObserver::new()));
        assert_eq!(fixture.ctx.observers.len(), 1);
        assert!(account.remove_observer(id));
        assert!(fixture.ctx.observers.is_empty());
    }
}
