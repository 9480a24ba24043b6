// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Trusted issuer public keys.
//!
//! Every refill and redemption response names the key that signed it; the
//! key must be listed here for the matching issuer type.

use adpass_common::api::{IssuerEntry, IssuerPublicKey, IssuersResp};
use adpass_crypto::PublicKey;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::{UrlLoader, UrlRequest};
use crate::ledger::LedgerServer;
use crate::state::TokenPoolStore;
use crate::RETRY_DELAY;

pub const DEFAULT_ISSUERS_PING: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IssuerType {
    Confirmations,
    Payments,
}

impl IssuerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssuerType::Confirmations => "confirmations",
            IssuerType::Payments => "payments",
        }
    }
}

impl fmt::Display for IssuerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssuerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmations" => Ok(IssuerType::Confirmations),
            "payments" => Ok(IssuerType::Payments),
            other => Err(format!("unknown issuer type: {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerInfo {
    pub issuer_type: IssuerType,
    /// Base64 public key -> associated value
    pub public_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuersInfo {
    pub ping: Duration,
    pub issuers: Vec<IssuerInfo>,
}

impl Default for IssuersInfo {
    fn default() -> Self {
        Self {
            ping: DEFAULT_ISSUERS_PING,
            issuers: Vec::new(),
        }
    }
}

impl IssuersInfo {
    pub fn issuer(&self, issuer_type: IssuerType) -> Option<&IssuerInfo> {
        self.issuers.iter().find(|i| i.issuer_type == issuer_type)
    }

    pub fn associated_value(&self, issuer_type: IssuerType, public_key: &str) -> Option<&str> {
        self.issuer(issuer_type)?
            .public_keys
            .get(public_key)
            .map(String::as_str)
    }

    /// The wire form, for persisting alongside the token pool.
    pub fn to_response(&self) -> IssuersResp {
        IssuersResp {
            ping: self.ping.as_millis() as u64,
            issuers: self
                .issuers
                .iter()
                .map(|issuer| IssuerEntry {
                    name: issuer.issuer_type.as_str().to_string(),
                    public_keys: issuer
                        .public_keys
                        .iter()
                        .map(|(public_key, associated_value)| IssuerPublicKey {
                            public_key: public_key.clone(),
                            associated_value: associated_value.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[async_trait]
pub trait IssuerRegistry: Send + Sync {
    async fn issuers(&self) -> IssuersInfo;
    async fn set_issuers(&self, issuers: IssuersInfo);
    /// Both confirmation and payment issuers carry at least one key.
    async fn has_issuers(&self) -> bool;
    async fn public_key_exists(&self, issuer_type: IssuerType, public_key: &str) -> bool;
}

#[derive(Default)]
pub struct Issuers {
    inner: RwLock<IssuersInfo>,
}

impl Issuers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issuers(issuers: IssuersInfo) -> Self {
        Self {
            inner: RwLock::new(issuers),
        }
    }
}

#[async_trait]
impl IssuerRegistry for Issuers {
    async fn issuers(&self) -> IssuersInfo {
        self.inner.read().await.clone()
    }

    async fn set_issuers(&self, issuers: IssuersInfo) {
        info!(
            count = issuers.issuers.len(),
            ping_secs = issuers.ping.as_secs(),
            "updated issuers"
        );
        *self.inner.write().await = issuers;
    }

    async fn has_issuers(&self) -> bool {
        let inner = self.inner.read().await;
        [IssuerType::Confirmations, IssuerType::Payments]
            .iter()
            .all(|t| inner.issuer(*t).is_some_and(|i| !i.public_keys.is_empty()))
    }

    async fn public_key_exists(&self, issuer_type: IssuerType, public_key: &str) -> bool {
        self.inner
            .read()
            .await
            .issuer(issuer_type)
            .is_some_and(|i| i.public_keys.contains_key(public_key))
    }
}

/// Converts a `GET /v{N}/issuers/` body. Unknown issuer names are skipped;
/// a key that is not a valid point rejects the whole response.
pub fn parse_issuers(resp: IssuersResp) -> Result<IssuersInfo> {
    let mut issuers: Vec<IssuerInfo> = Vec::new();
    for entry in resp.issuers {
        let Ok(issuer_type) = entry.name.parse::<IssuerType>() else {
            debug!(name = %entry.name, "ignoring unknown issuer");
            continue;
        };
        let mut public_keys = BTreeMap::new();
        for key in entry.public_keys {
            PublicKey::decode_base64(&key.public_key)
                .map_err(|e| anyhow!("invalid {} issuer public key: {}", issuer_type, e))?;
            public_keys.insert(key.public_key, key.associated_value);
        }
        match issuers.iter_mut().find(|i| i.issuer_type == issuer_type) {
            Some(existing) => existing.public_keys.extend(public_keys),
            None => issuers.push(IssuerInfo {
                issuer_type,
                public_keys,
            }),
        }
    }

    let ping = if resp.ping == 0 {
        DEFAULT_ISSUERS_PING
    } else {
        Duration::from_millis(resp.ping)
    };
    Ok(IssuersInfo { ping, issuers })
}

pub async fn fetch_issuers(loader: &dyn UrlLoader, server: &LedgerServer) -> Result<IssuersInfo> {
    let resp = loader
        .load(UrlRequest::get(server.issuers()))
        .await
        .context("issuers request failed")?;
    if resp.status != StatusCode::OK {
        bail!("issuers request returned {}", resp.status);
    }
    let body: IssuersResp = serde_json::from_str(&resp.body).context("parse issuers response")?;
    parse_issuers(body)
}

/// Installs `issuers` in the registry and persists them with the pool, so
/// a restart can verify responses before the first fetch completes.
pub async fn apply_issuers(registry: &dyn IssuerRegistry, token_pool: &TokenPoolStore, issuers: IssuersInfo) {
    if let Err(e) = token_pool.set_issuers(issuers.to_response()).await {
        warn!(error = %format!("{:#}", e), "failed to persist issuers");
    }
    registry.set_issuers(issuers).await;
}

/// Loads persisted issuers into an empty registry. Returns whether any
/// were applied.
pub async fn restore_issuers(registry: &dyn IssuerRegistry, token_pool: &TokenPoolStore) -> bool {
    if registry.has_issuers().await {
        return false;
    }
    let Some(persisted) = token_pool.issuers().await else {
        return false;
    };
    match parse_issuers(persisted) {
        Ok(issuers) => {
            registry.set_issuers(issuers).await;
            true
        }
        Err(e) => {
            warn!(error = %e, "ignoring persisted issuers");
            false
        }
    }
}

/// Keeps a registry current by refetching every `ping`.
pub struct IssuersFetcher {
    handle: JoinHandle<()>,
}

impl IssuersFetcher {
    pub fn spawn(
        loader: Arc<dyn UrlLoader>,
        server: LedgerServer,
        registry: Arc<dyn IssuerRegistry>,
        token_pool: Arc<TokenPoolStore>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                let delay = match fetch_issuers(loader.as_ref(), &server).await {
                    Ok(issuers) => {
                        let ping = issuers.ping;
                        apply_issuers(registry.as_ref(), &token_pool, issuers).await;
                        ping
                    }
                    Err(e) => {
                        warn!(error = %format!("{:#}", e), "issuer fetch failed");
                        RETRY_DELAY
                    }
                };
                tokio::time::sleep(delay).await;
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for IssuersFetcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
