// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Durable token pools and retry queue.
//!
//! Every mutation is a transaction: the next state is built on a copy,
//! saved, and only then becomes the in-memory state. A failed save leaves
//! both the store and memory as they were.

use adpass_common::api::IssuersResp;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::confirmation::ConfirmationInfo;
use crate::refill::PendingRefill;
use crate::tokens::{UnblindedPaymentTokenInfo, UnblindedTokenInfo};
use crate::transactions::{TransactionRecord, TransactionsSummary};

/// Where the serialized pool state lives.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<String>>;
    async fn save(&self, contents: &str) -> Result<()>;
}

// ─── File store ──────────────────────────────────────────────────────────

pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {:?}", self.path)),
        }
    }

    async fn save(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {:?}", parent))?;
        }

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, contents)
            .await
            .context("write temp file")?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .context("rename temp file")?;
        Ok(())
    }
}

// ─── In-memory store ─────────────────────────────────────────────────────

/// Volatile store for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryStateStore {
    contents: RwLock<Option<String>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: RwLock::new(Some(contents.into())),
            ..Self::default()
        }
    }

    /// Makes every following `save` fail until reset.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn contents(&self) -> Option<String> {
        self.contents.read().await.clone()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.contents.read().await.clone())
    }

    async fn save(&self, contents: &str) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("state store rejected save"));
        }
        *self.contents.write().await = Some(contents.to_string());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Token pool ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
    #[serde(default)]
    pub unblinded_tokens: Vec<UnblindedTokenInfo>,
    #[serde(default)]
    pub unblinded_payment_tokens: Vec<UnblindedPaymentTokenInfo>,
    #[serde(default)]
    pub failed_confirmations: VecDeque<ConfirmationInfo>,
    #[serde(default)]
    pub next_token_redemption_at: Option<DateTime<Utc>>,
    /// Wallet the tokens and queue belong to.
    #[serde(default)]
    pub payment_id: Option<String>,
    /// A refill that already holds a nonce from the ledger.
    #[serde(default)]
    pub pending_refill: Option<PendingRefill>,
    /// Last issuer list fetched from the ledger.
    #[serde(default)]
    pub issuers: Option<IssuersResp>,
    #[serde(default)]
    pub transaction_history: Vec<TransactionRecord>,
    /// Value of redeemed payment tokens not yet paid out.
    #[serde(default)]
    pub estimated_pending_rewards: f64,
    #[serde(default)]
    pub next_payment_date: Option<DateTime<Utc>>,
}

pub struct TokenPoolStore {
    store: Arc<dyn StateStore>,
    state: Mutex<Option<PoolState>>,
}

impl TokenPoolStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            state: Mutex::new(None),
        }
    }

    /// Loads persisted state; a missing file starts empty.
    pub async fn initialize(&self) -> Result<()> {
        let loaded = match self.store.load().await? {
            Some(data) => serde_json::from_str(&data).context("deserialize token pool state")?,
            None => {
                info!("No token pool state found, starting fresh");
                PoolState::default()
            }
        };
        info!(
            unblinded_tokens = loaded.unblinded_tokens.len(),
            unblinded_payment_tokens = loaded.unblinded_payment_tokens.len(),
            failed_confirmations = loaded.failed_confirmations.len(),
            "Loaded token pool state"
        );
        *self.state.lock().await = Some(loaded);
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.is_some()
    }

    async fn read<T>(&self, f: impl FnOnce(&PoolState) -> T) -> Option<T> {
        self.state.lock().await.as_ref().map(f)
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut PoolState) -> T) -> Result<T> {
        let mut guard = self.state.lock().await;
        let current = guard.as_ref().ok_or_else(|| anyhow!("token pool is not initialized"))?;

        let mut next = current.clone();
        let out = f(&mut next);

        let json = serde_json::to_string_pretty(&next).context("serialize token pool state")?;
        if let Err(e) = self.store.save(&json).await {
            warn!(error = %e, "token pool save failed, keeping previous state");
            return Err(e.context("save token pool state"));
        }
        *guard = Some(next);
        Ok(out)
    }

    pub async fn snapshot(&self) -> Option<PoolState> {
        self.read(Clone::clone).await
    }

    // Confirmation tokens

    pub async fn unblinded_token_count(&self) -> usize {
        self.read(|s| s.unblinded_tokens.len()).await.unwrap_or(0)
    }

    pub async fn unblinded_tokens(&self) -> Vec<UnblindedTokenInfo> {
        self.read(|s| s.unblinded_tokens.clone()).await.unwrap_or_default()
    }

    pub async fn add_unblinded_tokens(&self, tokens: Vec<UnblindedTokenInfo>) -> Result<usize> {
        let count = self
            .mutate(|s| {
                for token in tokens {
                    if !s.unblinded_tokens.iter().any(|t| t.value == token.value) {
                        s.unblinded_tokens.push(token);
                    }
                }
                s.unblinded_tokens.len()
            })
            .await?;
        debug!(count, "added unblinded tokens");
        Ok(count)
    }

    /// Removes and persists the oldest token. `None` when the pool is empty.
    pub async fn take_unblinded_token(&self) -> Result<Option<UnblindedTokenInfo>> {
        if self.unblinded_token_count().await == 0 {
            return Ok(None);
        }
        self.mutate(|s| {
            if s.unblinded_tokens.is_empty() {
                None
            } else {
                Some(s.unblinded_tokens.remove(0))
            }
        })
        .await
    }

    /// Keeps only tokens matching `keep`; returns how many were dropped.
    pub async fn retain_unblinded_tokens(
        &self,
        keep: impl Fn(&UnblindedTokenInfo) -> bool,
    ) -> Result<usize> {
        self.mutate(|s| {
            let before = s.unblinded_tokens.len();
            s.unblinded_tokens.retain(|t| keep(t));
            before - s.unblinded_tokens.len()
        })
        .await
    }

    // Payment tokens

    pub async fn unblinded_payment_tokens(&self) -> Vec<UnblindedPaymentTokenInfo> {
        self.read(|s| s.unblinded_payment_tokens.clone())
            .await
            .unwrap_or_default()
    }

    pub async fn unblinded_payment_token_count(&self) -> usize {
        self.read(|s| s.unblinded_payment_tokens.len()).await.unwrap_or(0)
    }

    pub async fn add_unblinded_payment_token(&self, token: UnblindedPaymentTokenInfo) -> Result<()> {
        self.mutate(|s| {
            if !s.unblinded_payment_tokens.iter().any(|t| t.value == token.value) {
                s.unblinded_payment_tokens.push(token);
            }
        })
        .await
    }

    /// Removes exactly `tokens` (matched by value); tokens added since the
    /// caller's snapshot stay. Their estimated value moves to pending
    /// rewards.
    pub async fn remove_unblinded_payment_tokens(
        &self,
        tokens: &[UnblindedPaymentTokenInfo],
    ) -> Result<usize> {
        self.mutate(|s| {
            let redeemed: f64 = s
                .transaction_history
                .iter()
                .filter(|h| tokens.iter().any(|t| t.transaction_id == h.transaction_id))
                .map(|h| h.estimated_redemption_value)
                .filter(|v| *v > 0.0)
                .sum();
            s.estimated_pending_rewards += redeemed;

            let before = s.unblinded_payment_tokens.len();
            s.unblinded_payment_tokens
                .retain(|t| !tokens.iter().any(|r| r.value == t.value));
            before - s.unblinded_payment_tokens.len()
        })
        .await
    }

    // Transaction history

    /// Appends `record`, together with the payment token it earned.
    pub async fn record_transaction(
        &self,
        record: TransactionRecord,
        payment_token: Option<UnblindedPaymentTokenInfo>,
    ) -> Result<()> {
        self.mutate(|s| {
            if let Some(token) = payment_token {
                if !s.unblinded_payment_tokens.iter().any(|t| t.value == token.value) {
                    s.unblinded_payment_tokens.push(token);
                }
            }
            s.transaction_history.push(record);
        })
        .await
    }

    pub async fn transaction_history(&self) -> Vec<TransactionRecord> {
        self.read(|s| s.transaction_history.clone()).await.unwrap_or_default()
    }

    pub async fn transactions_summary(&self, now: DateTime<Utc>) -> TransactionsSummary {
        match self.read(|s| TransactionsSummary::from_state(s, now)).await {
            Some(summary) => summary,
            None => TransactionsSummary::from_state(&PoolState::default(), now),
        }
    }

    /// Replaces the estimate with figures reported by the ledger.
    pub async fn set_ads_rewards(
        &self,
        estimated_pending_rewards: f64,
        next_payment_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.mutate(|s| {
            s.estimated_pending_rewards = estimated_pending_rewards.max(0.0);
            s.next_payment_date = next_payment_date;
        })
        .await
    }

    // Failed confirmations

    pub async fn push_failed_confirmation(&self, confirmation: ConfirmationInfo) -> Result<()> {
        self.mutate(|s| s.failed_confirmations.push_back(confirmation)).await
    }

    pub async fn pop_failed_confirmation(&self) -> Result<Option<ConfirmationInfo>> {
        if self.failed_confirmation_count().await == 0 {
            return Ok(None);
        }
        self.mutate(|s| s.failed_confirmations.pop_front()).await
    }

    pub async fn failed_confirmations(&self) -> Vec<ConfirmationInfo> {
        self.read(|s| s.failed_confirmations.iter().cloned().collect())
            .await
            .unwrap_or_default()
    }

    pub async fn failed_confirmation_count(&self) -> usize {
        self.read(|s| s.failed_confirmations.len()).await.unwrap_or(0)
    }

    // Payment redemption schedule

    pub async fn next_token_redemption_at(&self) -> Option<DateTime<Utc>> {
        self.read(|s| s.next_token_redemption_at).await.flatten()
    }

    pub async fn set_next_token_redemption_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.mutate(|s| s.next_token_redemption_at = Some(at)).await
    }

    // Refill in flight

    pub async fn pending_refill(&self) -> Option<PendingRefill> {
        self.read(|s| s.pending_refill.clone()).await.flatten()
    }

    pub async fn set_pending_refill(&self, pending: PendingRefill) -> Result<()> {
        self.mutate(|s| s.pending_refill = Some(pending)).await
    }

    pub async fn clear_pending_refill(&self) -> Result<()> {
        if self.read(|s| s.pending_refill.is_none()).await.unwrap_or(true) {
            return Ok(());
        }
        self.mutate(|s| s.pending_refill = None).await
    }

    /// Adds a refilled batch and forgets its nonce in one save.
    pub async fn complete_refill(&self, tokens: Vec<UnblindedTokenInfo>) -> Result<usize> {
        self.mutate(|s| {
            for token in tokens {
                if !s.unblinded_tokens.iter().any(|t| t.value == token.value) {
                    s.unblinded_tokens.push(token);
                }
            }
            s.pending_refill = None;
            s.unblinded_tokens.len()
        })
        .await
    }

    // Issuers

    pub async fn issuers(&self) -> Option<IssuersResp> {
        self.read(|s| s.issuers.clone()).await.flatten()
    }

    pub async fn set_issuers(&self, issuers: IssuersResp) -> Result<()> {
        self.mutate(|s| s.issuers = Some(issuers)).await
    }

    // Wallet

    pub async fn payment_id(&self) -> Option<String> {
        self.read(|s| s.payment_id.clone()).await.flatten()
    }

    pub async fn set_payment_id(&self, payment_id: &str) -> Result<()> {
        self.mutate(|s| s.payment_id = Some(payment_id.to_string())).await
    }

    /// Drops every token, queued confirmation and schedule.
    pub async fn reset(&self) -> Result<()> {
        self.mutate(|s| *s = PoolState::default()).await?;
        info!("Token pool state reset");
        Ok(())
    }

    /// Resets the pool for a different wallet. Issuers are not per wallet
    /// and survive.
    pub async fn reset_for_payment_id(&self, payment_id: &str) -> Result<()> {
        self.mutate(|s| {
            *s = PoolState {
                payment_id: Some(payment_id.to_string()),
                issuers: s.issuers.take(),
                ..PoolState::default()
            }
        })
        .await?;
        info!("Token pool state reset for new wallet");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::{AdType, ConfirmationType};
    use crate::testing::{test_wallet, unblinded_payment_tokens, unblinded_tokens};

    fn confirmation(id: &str) -> ConfirmationInfo {
        ConfirmationInfo {
            transaction_id: id.to_string(),
            creative_instance_id: "creative".to_string(),
            confirmation_type: ConfirmationType::Viewed,
            ad_type: AdType::AdNotification,
            created_at: Some(Utc::now()),
            was_created: false,
            opted_in: None,
        }
    }

    async fn pool() -> (Arc<InMemoryStateStore>, TokenPoolStore) {
        let store = Arc::new(InMemoryStateStore::new());
        let pool = TokenPoolStore::new(store.clone());
        pool.initialize().await.unwrap();
        (store, pool)
    }

    #[tokio::test]
    async fn test_mutations_require_initialize() {
        let pool = TokenPoolStore::new(Arc::new(InMemoryStateStore::new()));
        assert!(!pool.is_initialized().await);
        assert!(pool.push_failed_confirmation(confirmation("a")).await.is_err());
        assert_eq!(pool.unblinded_token_count().await, 0);
    }

    #[tokio::test]
    async fn test_take_spends_oldest_and_persists() {
        let (store, pool) = pool().await;
        let wallet = test_wallet();
        let tokens = unblinded_tokens(3, &wallet);
        pool.add_unblinded_tokens(tokens.clone()).await.unwrap();

        let spent = pool.take_unblinded_token().await.unwrap().unwrap();
        assert_eq!(spent, tokens[0]);
        assert_eq!(pool.unblinded_token_count().await, 2);

        let reloaded = TokenPoolStore::new(store.clone());
        reloaded.initialize().await.unwrap();
        assert_eq!(reloaded.unblinded_tokens().await, tokens[1..].to_vec());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_state() {
        let (store, pool) = pool().await;
        let wallet = test_wallet();
        pool.add_unblinded_tokens(unblinded_tokens(2, &wallet)).await.unwrap();

        store.set_fail_saves(true);
        assert!(pool.take_unblinded_token().await.is_err());
        assert_eq!(pool.unblinded_token_count().await, 2);

        store.set_fail_saves(false);
        assert!(pool.take_unblinded_token().await.unwrap().is_some());
        assert_eq!(pool.unblinded_token_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_confirmations_are_fifo() {
        let (_store, pool) = pool().await;
        for id in ["a", "b", "c"] {
            pool.push_failed_confirmation(confirmation(id)).await.unwrap();
        }
        let order: Vec<String> = {
            let mut out = Vec::new();
            while let Some(c) = pool.pop_failed_confirmation().await.unwrap() {
                out.push(c.transaction_id);
            }
            out
        };
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_remove_payment_tokens_only_removes_snapshot() {
        let (_store, pool) = pool().await;
        let tokens = unblinded_payment_tokens(3);
        for t in &tokens[..2] {
            pool.add_unblinded_payment_token(t.clone()).await.unwrap();
        }
        let snapshot = pool.unblinded_payment_tokens().await;
        pool.add_unblinded_payment_token(tokens[2].clone()).await.unwrap();

        let removed = pool.remove_unblinded_payment_tokens(&snapshot).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(pool.unblinded_payment_tokens().await, vec![tokens[2].clone()]);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = Arc::new(FileStateStore::new(&path));

        let pool = TokenPoolStore::new(store.clone());
        pool.initialize().await.unwrap();
        let at = Utc::now();
        pool.set_next_token_redemption_at(at).await.unwrap();
        pool.push_failed_confirmation(confirmation("x")).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reloaded = TokenPoolStore::new(store);
        reloaded.initialize().await.unwrap();
        assert_eq!(reloaded.next_token_redemption_at().await, Some(at));
        assert_eq!(reloaded.failed_confirmations().await[0].transaction_id, "x");
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let (_store, pool) = pool().await;
        let wallet = test_wallet();
        pool.add_unblinded_tokens(unblinded_tokens(2, &wallet)).await.unwrap();
        pool.push_failed_confirmation(confirmation("a")).await.unwrap();
        pool.set_next_token_redemption_at(Utc::now()).await.unwrap();

        pool.reset().await.unwrap();
        assert_eq!(pool.snapshot().await.unwrap(), PoolState::default());
    }

    #[tokio::test]
    async fn test_reset_for_new_wallet_keeps_issuers_only() {
        let (store, pool) = pool().await;
        let wallet = test_wallet();
        pool.set_payment_id(&wallet.payment_id).await.unwrap();
        pool.add_unblinded_tokens(unblinded_tokens(2, &wallet)).await.unwrap();
        pool.add_unblinded_payment_token(unblinded_payment_tokens(1).remove(0))
            .await
            .unwrap();
        pool.push_failed_confirmation(confirmation("a")).await.unwrap();
        let issuers = IssuersResp {
            ping: 1000,
            issuers: Vec::new(),
        };
        pool.set_issuers(issuers.clone()).await.unwrap();

        pool.reset_for_payment_id("other").await.unwrap();

        let reloaded = TokenPoolStore::new(store);
        reloaded.initialize().await.unwrap();
        let state = reloaded.snapshot().await.unwrap();
        assert_eq!(state.payment_id.as_deref(), Some("other"));
        assert_eq!(state.issuers, Some(issuers));
        assert!(state.unblinded_tokens.is_empty());
        assert!(state.unblinded_payment_tokens.is_empty());
        assert!(state.failed_confirmations.is_empty());
    }

    #[tokio::test]
    async fn test_complete_refill_clears_nonce_in_same_save() {
        let (store, pool) = pool().await;
        let wallet = test_wallet();
        pool.set_pending_refill(PendingRefill {
            nonce: "n1".to_string(),
            tokens: Vec::new(),
            blinded_tokens: Vec::new(),
        })
        .await
        .unwrap();
        assert!(store.contents().await.unwrap().contains("n1"));
        let saves = store.save_count();

        let count = pool.complete_refill(unblinded_tokens(3, &wallet)).await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(store.save_count(), saves + 1);
        assert!(pool.pending_refill().await.is_none());
        assert!(!store.contents().await.unwrap().contains("n1"));

        // Nothing to clear: no save.
        pool.clear_pending_refill().await.unwrap();
        assert_eq!(store.save_count(), saves + 1);
    }

    #[tokio::test]
    async fn test_redeemed_tokens_move_to_pending_rewards() {
        let (_store, pool) = pool().await;
        let tokens = unblinded_payment_tokens(2);
        for token in &tokens {
            let record = TransactionRecord {
                transaction_id: token.transaction_id.clone(),
                timestamp: Utc::now(),
                estimated_redemption_value: 0.05,
                confirmation_type: ConfirmationType::Viewed,
                ad_type: AdType::AdNotification,
            };
            pool.record_transaction(record, Some(token.clone())).await.unwrap();
        }
        let before = pool.transactions_summary(Utc::now()).await;
        assert!((before.estimated_pending_rewards - 0.1).abs() < 1e-9);

        pool.remove_unblinded_payment_tokens(&tokens[..1]).await.unwrap();
        let after = pool.transactions_summary(Utc::now()).await;
        assert!((after.estimated_pending_rewards - 0.1).abs() < 1e-9);
        assert_eq!(pool.snapshot().await.unwrap().estimated_pending_rewards, 0.05);
        assert_eq!(pool.transaction_history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_state_fails_initialize() {
        let pool = TokenPoolStore::new(Arc::new(InMemoryStateStore::with_contents("{not json")));
        assert!(pool.initialize().await.is_err());
        assert!(!pool.is_initialized().await);
    }
}
