// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Keeps the confirmation token pool between the low and high watermarks.
//!
//! Refill is two round trips: post blinded tokens for a nonce, then fetch
//! the signed tokens for that nonce. A known nonce means a retry resumes at
//! the second round trip. The nonce and its batch are persisted with the
//! pool, so a restart resumes there too.

use adpass_common::api::{CaptchaRequiredResp, RequestSignedTokensReq, RequestSignedTokensResp, SignedTokensResp};
use adpass_crypto::{BlindedToken, Token};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::account::AccountContext;
use crate::http::UrlRequest;
use crate::issuers::IssuerType;
use crate::observer::AccountEvent;
use crate::response::{parse_json, required, SignedTokenBatch};
use crate::timer::{RetryTimer, TimerTask};
use crate::tokens::UnblindedTokenInfo;
use crate::wallet::WalletInfo;
use crate::RETRY_DELAY;

pub const MIN_UNBLINDED_TOKENS: usize = 20;
pub const MAX_UNBLINDED_TOKENS: usize = 50;

/// A batch the ledger has accepted but not yet signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRefill {
    pub nonce: String,
    pub tokens: Vec<Token>,
    pub blinded_tokens: Vec<BlindedToken>,
}

#[derive(Default)]
struct RefillState {
    is_processing: bool,
    wallet: Option<WalletInfo>,
    nonce: Option<String>,
    tokens: Vec<Token>,
    blinded_tokens: Vec<BlindedToken>,
}

impl RefillState {
    fn clear(&mut self) {
        *self = RefillState::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RefillFailure {
    Retry,
    Permanent,
    CaptchaRequired(String),
}

pub struct RefillConfirmationTokens {
    ctx: AccountContext,
    state: Mutex<RefillState>,
    retry_timer: RetryTimer,
    weak_self: Weak<Self>,
}

impl RefillConfirmationTokens {
    pub fn new(ctx: AccountContext) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            ctx,
            state: Mutex::new(RefillState::default()),
            retry_timer: RetryTimer::new("refill"),
            weak_self: weak_self.clone(),
        })
    }

    pub async fn is_processing(&self) -> bool {
        self.state.lock().await.is_processing
    }

    pub fn is_retrying(&self) -> bool {
        self.retry_timer.is_running()
    }

    /// Starts a refill when the pool is below the low watermark and nothing
    /// else is in flight.
    pub async fn maybe_refill(&self, wallet: &WalletInfo) {
        let mut state = self.state.lock().await;
        if state.is_processing || self.retry_timer.is_running() {
            debug!("refill already in progress");
            return;
        }
        if !self.ctx.token_pool.is_initialized().await {
            debug!("token pool not initialized, skipping refill");
            return;
        }
        if !wallet.is_valid() {
            warn!("invalid wallet, skipping refill");
            return;
        }
        if !self.ctx.issuers.has_issuers().await {
            warn!("no issuers, skipping refill");
            return;
        }

        if let Some(pending) = self.ctx.token_pool.pending_refill().await {
            info!(count = pending.tokens.len(), "resuming refill with a known nonce");
            *state = RefillState {
                is_processing: true,
                wallet: Some(wallet.clone()),
                nonce: Some(pending.nonce),
                tokens: pending.tokens,
                blinded_tokens: pending.blinded_tokens,
            };
            drop(state);
            return self.refill().await;
        }

        let count = self.ctx.token_pool.unblinded_token_count().await;
        if count >= MIN_UNBLINDED_TOKENS {
            debug!(count, "no need to refill unblinded tokens");
            return;
        }

        let needed = MAX_UNBLINDED_TOKENS - count;
        let tokens = self.ctx.token_generator.generate(needed);
        let blinded_tokens = match tokens.iter().map(Token::blind).collect::<Result<Vec<_>, _>>() {
            Ok(blinded) => blinded,
            Err(e) => {
                warn!(error = %e, "failed to blind tokens");
                return;
            }
        };

        info!(count, needed, "refilling unblinded tokens");
        *state = RefillState {
            is_processing: true,
            wallet: Some(wallet.clone()),
            nonce: None,
            tokens,
            blinded_tokens,
        };
        drop(state);

        self.refill().await;
    }

    /// Abandons any refill in flight, e.g. after the wallet changed. A
    /// persisted nonce is left for the pool owner to keep or reset.
    pub async fn reset(&self) {
        self.retry_timer.stop();
        self.state.lock().await.clear();
    }

    async fn refill(&self) {
        let result = match self.run_phases().await {
            Ok(()) => return self.on_refilled().await,
            Err(failure) => failure,
        };

        match result {
            RefillFailure::Retry => {
                self.ctx.observers.notify(AccountEvent::FailedToRefillUnblindedTokens);
                let retry_at = self.retry_timer.start(RETRY_DELAY, self.retry_task());
                info!(%retry_at, "will retry refilling unblinded tokens");
                self.ctx
                    .observers
                    .notify(AccountEvent::WillRetryRefillingUnblindedTokens { retry_at });
            }
            RefillFailure::Permanent => {
                self.abandon().await;
                self.ctx.observers.notify(AccountEvent::FailedToRefillUnblindedTokens);
            }
            RefillFailure::CaptchaRequired(captcha_id) => {
                self.abandon().await;
                info!("captcha required to refill unblinded tokens");
                self.ctx
                    .observers
                    .notify(AccountEvent::CaptchaRequiredToRefillUnblindedTokens { captcha_id });
            }
        }
    }

    async fn abandon(&self) {
        self.state.lock().await.clear();
        if let Err(e) = self.ctx.token_pool.clear_pending_refill().await {
            warn!(error = %format!("{:#}", e), "failed to forget refill nonce");
        }
    }

    fn retry_task(&self) -> TimerTask {
        let weak_self = self.weak_self.clone();
        Box::pin(async move {
            if let Some(this) = weak_self.upgrade() {
                info!("retry refilling unblinded tokens");
                this.ctx.observers.notify(AccountEvent::DidRetryRefillingUnblindedTokens);
                this.refill().await;
            }
        })
    }

    async fn run_phases(&self) -> Result<(), RefillFailure> {
        let has_nonce = self.state.lock().await.nonce.is_some();
        if !has_nonce {
            self.request_signed_tokens().await?;
        }
        self.get_signed_tokens().await
    }

    async fn request_signed_tokens(&self) -> Result<(), RefillFailure> {
        let (payment_id, body) = {
            let state = self.state.lock().await;
            let wallet = state.wallet.as_ref().ok_or(RefillFailure::Permanent)?;
            let req = RequestSignedTokensReq {
                blinded_tokens: state.blinded_tokens.iter().map(BlindedToken::encode_base64).collect(),
            };
            let body = serde_json::to_string(&req).map_err(|_| RefillFailure::Permanent)?;
            (wallet.payment_id.clone(), body)
        };

        debug!("request signed tokens");
        let url = self.ctx.server.request_signed_tokens(&payment_id);
        let resp = self
            .ctx
            .loader
            .load(UrlRequest::json(Method::POST, url, body))
            .await
            .map_err(|e| {
                warn!(error = %format!("{:#}", e), "request signed tokens failed");
                RefillFailure::Retry
            })?;

        match resp.status {
            StatusCode::CREATED => {}
            StatusCode::UPGRADE_REQUIRED => {
                warn!("client upgrade required to refill unblinded tokens");
                return Err(RefillFailure::Permanent);
            }
            status => {
                warn!(status = status.as_u16(), "request signed tokens failed");
                return Err(RefillFailure::Retry);
            }
        }

        let nonce = parse_json::<RequestSignedTokensResp>(&resp.body)
            .and_then(|r| required(r.nonce, "nonce"))
            .map_err(|e| {
                warn!(error = %e, "request signed tokens response");
                RefillFailure::Permanent
            })?;
        let pending = {
            let mut state = self.state.lock().await;
            state.nonce = Some(nonce.clone());
            PendingRefill {
                nonce,
                tokens: state.tokens.clone(),
                blinded_tokens: state.blinded_tokens.clone(),
            }
        };
        // The in-memory nonce still drives retries if this save fails.
        if let Err(e) = self.ctx.token_pool.set_pending_refill(pending).await {
            warn!(error = %format!("{:#}", e), "failed to persist refill nonce");
        }
        Ok(())
    }

    async fn get_signed_tokens(&self) -> Result<(), RefillFailure> {
        let (wallet, nonce) = {
            let state = self.state.lock().await;
            let wallet = state.wallet.clone().ok_or(RefillFailure::Permanent)?;
            let nonce = state.nonce.clone().ok_or(RefillFailure::Permanent)?;
            (wallet, nonce)
        };

        debug!("get signed tokens");
        let url = self.ctx.server.get_signed_tokens(&wallet.payment_id, &nonce);
        let resp = self.ctx.loader.load(UrlRequest::get(url)).await.map_err(|e| {
            warn!(error = %format!("{:#}", e), "get signed tokens failed");
            RefillFailure::Retry
        })?;

        match resp.status {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                return match parse_json::<CaptchaRequiredResp>(&resp.body)
                    .ok()
                    .and_then(|r| r.captcha_id)
                {
                    Some(captcha_id) => Err(RefillFailure::CaptchaRequired(captcha_id)),
                    None => {
                        warn!("get signed tokens unauthorized without captcha");
                        Err(RefillFailure::Permanent)
                    }
                };
            }
            status => {
                warn!(status = status.as_u16(), "get signed tokens failed");
                return Err(RefillFailure::Retry);
            }
        }

        let batch = parse_json::<SignedTokensResp>(&resp.body)
            .and_then(SignedTokenBatch::from_response)
            .map_err(|e| {
                warn!(error = %e, "get signed tokens response");
                RefillFailure::Permanent
            })?;

        if !self
            .ctx
            .issuers
            .public_key_exists(IssuerType::Confirmations, &batch.public_key_base64)
            .await
        {
            warn!("signed tokens from an unknown issuer key");
            return Err(RefillFailure::Permanent);
        }

        let unblinded = {
            let state = self.state.lock().await;
            batch
                .batch_proof
                .verify_and_unblind(
                    &state.tokens,
                    &state.blinded_tokens,
                    &batch.signed_tokens,
                    &batch.public_key,
                )
                .map_err(|e| {
                    warn!(error = %e, "signed tokens proof rejected");
                    RefillFailure::Permanent
                })?
        };

        let tokens = unblinded
            .into_iter()
            .map(|value| UnblindedTokenInfo::new(value, batch.public_key, &wallet))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                warn!(error = %e, "failed to sign unblinded tokens");
                RefillFailure::Permanent
            })?;
        let added = tokens.len();

        let count = self.ctx.token_pool.complete_refill(tokens).await.map_err(|e| {
            warn!(error = %format!("{:#}", e), "failed to store unblinded tokens");
            RefillFailure::Retry
        })?;
        info!(added, count, "added unblinded tokens");
        Ok(())
    }

    async fn on_refilled(&self) {
        self.state.lock().await.clear();
        self.retry_timer.stop();
        info!("refilled unblinded tokens");
        self.ctx.observers.notify(AccountEvent::DidRefillUnblindedTokens);
    }
}
