// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Periodic cash-out of earned payment tokens.
//!
//! All stored payment tokens go out in one batch. The batch is all or
//! nothing: on success exactly the tokens that were sent are removed.

use adpass_common::api::{PaymentCredential, RedeemPaymentTokensReq, TokenCredential};
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::account::AccountContext;
use crate::confirmation::{AdType, ConfirmationType};
use crate::config::AccountSettings;
use crate::http::UrlRequest;
use crate::observer::AccountEvent;
use crate::timer::{privacy_delay, RetryTimer, TimerTask};
use crate::tokens::UnblindedPaymentTokenInfo;
use crate::wallet::WalletInfo;
use crate::RETRY_DELAY;

/// Delay used when the stored redemption time has already passed.
pub const OVERDUE_REDEMPTION_DELAY: Duration = Duration::from_secs(60);

pub struct RedeemPaymentTokens {
    ctx: AccountContext,
    settings: AccountSettings,
    wallet: Mutex<Option<WalletInfo>>,
    is_processing: AtomicBool,
    timer: RetryTimer,
    retry_timer: RetryTimer,
    weak_self: Weak<Self>,
}

impl RedeemPaymentTokens {
    pub fn new(ctx: AccountContext, settings: AccountSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            ctx,
            settings,
            wallet: Mutex::new(None),
            is_processing: AtomicBool::new(false),
            timer: RetryTimer::new("redeem_payment_tokens"),
            retry_timer: RetryTimer::new("redeem_payment_tokens_retry"),
            weak_self: weak_self.clone(),
        })
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.is_running()
    }

    pub fn is_retrying(&self) -> bool {
        self.retry_timer.is_running()
    }

    /// Schedules the next batch unless one is already scheduled, retrying
    /// or in flight.
    pub async fn maybe_redeem_after_delay(&self, wallet: &WalletInfo) {
        if self.is_processing.load(Ordering::SeqCst) || self.timer.is_running() || self.retry_timer.is_running() {
            debug!("payment token redemption already pending");
            return;
        }
        if !wallet.is_valid() {
            warn!("invalid wallet, not scheduling payment token redemption");
            return;
        }
        *self.wallet.lock().await = Some(wallet.clone());

        let now = Utc::now();
        let redeem_at = match self.ctx.token_pool.next_token_redemption_at().await {
            Some(at) => at,
            None => self.persist_next_redemption_at(now).await,
        };
        self.schedule(redeem_at);
    }

    /// Stops every timer and forgets the wallet.
    pub async fn reset(&self) {
        self.timer.stop();
        self.retry_timer.stop();
        self.is_processing.store(false, Ordering::SeqCst);
        *self.wallet.lock().await = None;
    }

    async fn persist_next_redemption_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = if self.settings.randomize_redemption {
            privacy_delay(self.settings.redemption_interval)
        } else {
            self.settings.redemption_interval
        };
        let at = now + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::days(1));
        if let Err(e) = self.ctx.token_pool.set_next_token_redemption_at(at).await {
            error!(error = %format!("{:#}", e), "failed to persist next redemption time");
        }
        at
    }

    fn schedule(&self, redeem_at: DateTime<Utc>) {
        let now = Utc::now();
        let (redeem_at, delay) = match (redeem_at - now).to_std() {
            Ok(delay) if redeem_at > now => (redeem_at, delay),
            _ => (
                now + chrono::Duration::seconds(OVERDUE_REDEMPTION_DELAY.as_secs() as i64),
                OVERDUE_REDEMPTION_DELAY,
            ),
        };
        self.timer.start(delay, self.redeem_task());
        info!(%redeem_at, "scheduled payment token redemption");
        self.ctx
            .observers
            .notify(AccountEvent::DidScheduleNextUnblindedPaymentTokensRedemption { redeem_at });
    }

    async fn schedule_next(&self) {
        let redeem_at = self.persist_next_redemption_at(Utc::now()).await;
        self.schedule(redeem_at);
    }

    fn redeem_task(&self) -> TimerTask {
        let weak_self = self.weak_self.clone();
        Box::pin(async move {
            if let Some(this) = weak_self.upgrade() {
                this.redeem().await;
            }
        })
    }

    fn retry_task(&self) -> TimerTask {
        let weak_self = self.weak_self.clone();
        Box::pin(async move {
            if let Some(this) = weak_self.upgrade() {
                info!("retry redeeming unblinded payment tokens");
                this.ctx
                    .observers
                    .notify(AccountEvent::DidRetryRedeemingUnblindedPaymentTokens);
                this.redeem().await;
            }
        })
    }

    async fn redeem(&self) {
        if self.is_processing.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(wallet) = self.wallet.lock().await.clone() else {
            self.is_processing.store(false, Ordering::SeqCst);
            return;
        };

        let tokens = self.ctx.token_pool.unblinded_payment_tokens().await;
        if tokens.is_empty() {
            info!("no unblinded payment tokens to redeem");
            self.is_processing.store(false, Ordering::SeqCst);
            return self.schedule_next().await;
        }

        info!(count = tokens.len(), "redeeming unblinded payment tokens");
        let body = match build_request(&wallet, &tokens, &self.settings.user_data.platform) {
            Ok(req) => req,
            Err(e) => {
                error!(error = %e, "failed to build payment redemption request");
                return self.on_failed().await;
            }
        };

        let url = self.ctx.server.redeem_payment_tokens(&wallet.payment_id);
        match self.ctx.loader.load(UrlRequest::json(Method::PUT, url, body)).await {
            Ok(resp) if resp.status == StatusCode::OK => self.on_redeemed(&tokens).await,
            Ok(resp) => {
                warn!(status = resp.status.as_u16(), "redeem payment tokens failed");
                self.on_failed().await;
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "redeem payment tokens request failed");
                self.on_failed().await;
            }
        }
    }

    async fn on_redeemed(&self, redeemed: &[UnblindedPaymentTokenInfo]) {
        let count = match self.ctx.token_pool.remove_unblinded_payment_tokens(redeemed).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %format!("{:#}", e), "failed to remove redeemed payment tokens");
                return self.on_failed().await;
            }
        };
        self.is_processing.store(false, Ordering::SeqCst);
        self.retry_timer.stop();

        info!(count, "redeemed unblinded payment tokens");
        self.ctx
            .observers
            .notify(AccountEvent::DidRedeemUnblindedPaymentTokens { count });
        self.schedule_next().await;
    }

    async fn on_failed(&self) {
        self.is_processing.store(false, Ordering::SeqCst);
        self.ctx
            .observers
            .notify(AccountEvent::FailedToRedeemUnblindedPaymentTokens);

        let retry_at = self.retry_timer.start(RETRY_DELAY, self.retry_task());
        info!(%retry_at, "will retry redeeming unblinded payment tokens");
        self.ctx
            .observers
            .notify(AccountEvent::WillRetryRedeemingUnblindedPaymentTokens { retry_at });
    }
}

/// `PUT /v{N}/confirmation/payment/{payment_id}` body. Every credential
/// signs the same `{"paymentId"}` payload with its token's verification key.
pub fn build_request(
    wallet: &WalletInfo,
    tokens: &[UnblindedPaymentTokenInfo],
    platform: &str,
) -> Result<String, adpass_crypto::Error> {
    let payload = json!({ "paymentId": wallet.payment_id }).to_string();

    let payment_credentials = tokens
        .iter()
        .map(|token| {
            let signature = token.value.derive_verification_key().sign(payload.as_bytes())?;
            Ok(PaymentCredential {
                confirmation_type: token.confirmation_type.to_string(),
                credential: TokenCredential {
                    signature: signature.encode_base64(),
                    t: token.value.preimage().encode_base64(),
                },
                public_key: token.public_key.encode_base64(),
            })
        })
        .collect::<Result<Vec<_>, adpass_crypto::Error>>()?;

    let req = RedeemPaymentTokensReq {
        payload,
        payment_credentials,
        platform: Some(platform.to_string()),
        totals: totals(tokens),
    };
    serde_json::to_string(&req).map_err(|_| adpass_crypto::Error::Internal)
}

/// Per ad format, how many tokens of each confirmation type are redeemed.
fn totals(tokens: &[UnblindedPaymentTokenInfo]) -> Vec<Value> {
    let mut by_format: BTreeMap<AdType, BTreeMap<ConfirmationType, u64>> = BTreeMap::new();
    for token in tokens {
        *by_format
            .entry(token.ad_type)
            .or_default()
            .entry(token.confirmation_type)
            .or_default() += 1;
    }

    by_format
        .into_iter()
        .map(|(ad_type, counts)| {
            let mut total = Map::new();
            total.insert("adFormat".into(), json!(ad_type.as_str()));
            for (confirmation_type, count) in counts {
                total.insert(confirmation_type.as_str().into(), json!(count));
            }
            Value::Object(total)
        })
        .collect()
}
