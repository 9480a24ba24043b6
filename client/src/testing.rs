// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Test support: a scripted URL loader, a fake ledger that really signs
//! tokens, and fixtures for wallets, pools and confirmations.

use adpass_common::api::RequestSignedTokensReq;
use adpass_crypto::{BatchDleqProof, BlindedToken, SignedToken, SigningKey, Token};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::OsRng;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use crate::account::AccountContext;
use crate::config::UserDataSettings;
use crate::confirmation::{
    build_confirmation, AdType, ConfirmationInfo, ConfirmationType, DefaultUserDataBuilder, RewardSources,
    TransactionInfo,
};
use crate::http::{UrlLoader, UrlRequest, UrlResponse};
use crate::issuers::{IssuerInfo, IssuerType, Issuers, IssuersInfo};
use crate::ledger::{LedgerServer, API_VERSION};
use crate::observer::{AccountEvent, AccountObserver, ObserverList};
use crate::state::{InMemoryStateStore, TokenPoolStore};
use crate::token_generator::RandomTokenGenerator;
use crate::tokens::{UnblindedPaymentTokenInfo, UnblindedTokenInfo};
use crate::wallet::WalletInfo;

pub const PAYMENT_ID: &str = "27a39b2f-9b2e-4eb0-bbb2-2f84447496e7";
pub const RECOVERY_SEED: &str = "x5uBvgI5MTTVY6sjGv65e9EHr8v7i+UxkFB9qVc5fP0=";
pub const LEDGER_URL: &str = "https://ledger.test";
pub const NONCE: &str = "2f0e2891-e7a5-4262-835b-550b13e58e5c";

pub fn test_wallet() -> WalletInfo {
    WalletInfo::derive(PAYMENT_ID, RECOVERY_SEED).expect("test wallet")
}

// ─── Scripted URL loader ─────────────────────────────────────────────────

pub type Handler = Arc<dyn Fn(&UrlRequest) -> (u16, String) + Send + Sync>;

#[derive(Clone)]
enum MockResponse {
    Status(u16, String),
    Handler(Handler),
    TransportError,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct Route {
    method: Method,
    path: String,
    prefix: bool,
}

/// Answers requests by method and path (with query). Each route holds a
/// queue; the last response repeats. Unknown routes get `404`.
#[derive(Default)]
pub struct MockUrlLoader {
    routes: Mutex<HashMap<Route, VecDeque<MockResponse>>>,
    requests: Mutex<Vec<UrlRequest>>,
}

pub fn path_of(url: &str) -> &str {
    url.split_once("://")
        .and_then(|(_, rest)| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or(url)
}

impl MockUrlLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, method: Method, path: &str, prefix: bool, response: MockResponse) {
        let route = Route {
            method,
            path: path.to_string(),
            prefix,
        };
        self.routes.lock().unwrap().insert(route, VecDeque::from([response]));
    }

    fn push(&self, method: Method, path: &str, prefix: bool, response: MockResponse, front: bool) {
        let route = Route {
            method,
            path: path.to_string(),
            prefix,
        };
        let mut routes = self.routes.lock().unwrap();
        let queue = routes.entry(route).or_default();
        if front {
            queue.push_front(response);
        } else {
            queue.push_back(response);
        }
    }

    pub fn respond(&self, method: Method, path: &str, status: u16, body: &str) {
        self.set(method, path, false, MockResponse::Status(status, body.to_string()));
    }

    pub fn respond_prefix(&self, method: Method, prefix: &str, status: u16, body: &str) {
        self.set(method, prefix, true, MockResponse::Status(status, body.to_string()));
    }

    pub fn respond_with(
        &self,
        method: Method,
        path: &str,
        handler: impl Fn(&UrlRequest) -> (u16, String) + Send + Sync + 'static,
    ) {
        self.set(method, path, false, MockResponse::Handler(Arc::new(handler)));
    }

    pub fn respond_with_prefix(
        &self,
        method: Method,
        prefix: &str,
        handler: impl Fn(&UrlRequest) -> (u16, String) + Send + Sync + 'static,
    ) {
        self.set(method, prefix, true, MockResponse::Handler(Arc::new(handler)));
    }

    pub fn enqueue(&self, method: Method, path: &str, status: u16, body: &str) {
        self.push(method, path, false, MockResponse::Status(status, body.to_string()), false);
    }

    /// Answers the next request with this response, then resumes the queue.
    pub fn enqueue_front(&self, method: Method, path: &str, status: u16, body: &str) {
        self.push(method, path, false, MockResponse::Status(status, body.to_string()), true);
    }

    pub fn enqueue_front_prefix(&self, method: Method, prefix: &str, status: u16, body: &str) {
        self.push(method, prefix, true, MockResponse::Status(status, body.to_string()), true);
    }

    /// Requests to `path` fail without a response.
    pub fn fail(&self, method: Method, path: &str) {
        self.set(method, path, false, MockResponse::TransportError);
    }

    pub fn requests(&self) -> Vec<UrlRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose path and query equal `path` exactly.
    pub fn requests_to(&self, path: &str) -> Vec<UrlRequest> {
        self.requests()
            .into_iter()
            .filter(|r| path_of(&r.url) == path)
            .collect()
    }

    pub fn requests_with(&self, method: Method, path: &str) -> Vec<UrlRequest> {
        self.requests_to(path)
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }

    fn next_response(&self, method: &Method, path: &str) -> Option<MockResponse> {
        let mut routes = self.routes.lock().unwrap();
        let exact = Route {
            method: method.clone(),
            path: path.to_string(),
            prefix: false,
        };
        let route = if routes.contains_key(&exact) {
            exact
        } else {
            routes
                .keys()
                .filter(|r| r.prefix && r.method == *method && path.starts_with(&r.path))
                .max_by_key(|r| r.path.len())
                .cloned()?
        };
        let queue = routes.get_mut(&route)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl UrlLoader for MockUrlLoader {
    async fn load(&self, request: UrlRequest) -> Result<UrlResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let path = path_of(&request.url).to_string();

        let (status, body) = match self.next_response(&request.method, &path) {
            Some(MockResponse::Status(status, body)) => (status, body),
            Some(MockResponse::Handler(handler)) => handler(&request),
            Some(MockResponse::TransportError) => {
                return Err(anyhow!("connection reset: {} {}", request.method, path))
            }
            None => (404, String::new()),
        };
        Ok(UrlResponse {
            url: request.url,
            status: StatusCode::from_u16(status)?,
            body,
        })
    }
}

// ─── Observer ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<AccountEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AccountEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&AccountEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl AccountObserver for RecordingObserver {
    fn on_account_event(&self, event: &AccountEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ─── Token fixtures ──────────────────────────────────────────────────────

/// `{publicKey, batchProof, signedTokens}` for `blinded`, signed by `key`.
pub fn sign_blinded_tokens(key: &SigningKey, blinded: &[BlindedToken]) -> Value {
    let signed: Vec<SignedToken> = blinded.iter().map(|b| key.sign(b)).collect();
    let proof = BatchDleqProof::new(&mut OsRng, blinded, &signed, key).expect("batch proof");
    json!({
        "publicKey": key.public_key().encode_base64(),
        "batchProof": proof.encode_base64(),
        "signedTokens": signed.iter().map(SignedToken::encode_base64).collect::<Vec<_>>(),
    })
}

pub fn issuers_json(confirmations: &[&str], payments: &[&str]) -> Value {
    let keys = |keys: &[&str]| -> Vec<Value> {
        keys.iter()
            .map(|k| json!({"publicKey": k, "associatedValue": ""}))
            .collect()
    };
    let mut issuers = Vec::new();
    if !confirmations.is_empty() {
        issuers.push(json!({"name": "confirmations", "publicKeys": keys(confirmations)}));
    }
    if !payments.is_empty() {
        issuers.push(json!({"name": "payments", "publicKeys": keys(payments)}));
    }
    json!({"ping": 7_200_000, "issuers": issuers})
}

fn unblinded_tokens_signed_by(key: &SigningKey, count: usize, wallet: &WalletInfo) -> Vec<UnblindedTokenInfo> {
    (0..count)
        .map(|_| {
            let token = Token::random(&mut OsRng);
            let value = key.rederive_unblinded_token(token.preimage()).expect("unblind");
            UnblindedTokenInfo::new(value, key.public_key(), wallet).expect("wallet signature")
        })
        .collect()
}

fn payment_tokens_signed_by(key: &SigningKey, count: usize) -> Vec<UnblindedPaymentTokenInfo> {
    (0..count)
        .map(|_| {
            let token = Token::random(&mut OsRng);
            UnblindedPaymentTokenInfo {
                transaction_id: uuid::Uuid::new_v4().to_string(),
                value: key.rederive_unblinded_token(token.preimage()).expect("unblind"),
                public_key: key.public_key(),
                confirmation_type: ConfirmationType::Viewed,
                ad_type: AdType::AdNotification,
            }
        })
        .collect()
}

/// Spendable tokens from a throwaway issuer.
pub fn unblinded_tokens(count: usize, wallet: &WalletInfo) -> Vec<UnblindedTokenInfo> {
    unblinded_tokens_signed_by(&SigningKey::random(&mut OsRng), count, wallet)
}

pub fn unblinded_payment_tokens(count: usize) -> Vec<UnblindedPaymentTokenInfo> {
    payment_tokens_signed_by(&SigningKey::random(&mut OsRng), count)
}

pub fn non_reward_confirmation(confirmation_type: ConfirmationType, ad_type: AdType) -> ConfirmationInfo {
    let transaction = TransactionInfo::new("546fe7b0-5047-4f28-a11c-81f14edcf0f6", ad_type, confirmation_type);
    ConfirmationInfo {
        transaction_id: transaction.id,
        creative_instance_id: transaction.creative_instance_id,
        confirmation_type,
        ad_type,
        created_at: Some(transaction.created_at),
        was_created: false,
        opted_in: None,
    }
}

/// Issuer keys for both token types.
#[derive(Clone)]
pub struct FakeIssuer {
    pub confirmations: SigningKey,
    pub payments: SigningKey,
}

impl Default for FakeIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeIssuer {
    pub fn new() -> Self {
        Self {
            confirmations: SigningKey::random(&mut OsRng),
            payments: SigningKey::random(&mut OsRng),
        }
    }

    pub fn issuers_info(&self) -> IssuersInfo {
        let issuer = |issuer_type, key: &SigningKey| IssuerInfo {
            issuer_type,
            public_keys: [(key.public_key().encode_base64(), String::new())].into_iter().collect(),
        };
        IssuersInfo {
            issuers: vec![
                issuer(IssuerType::Confirmations, &self.confirmations),
                issuer(IssuerType::Payments, &self.payments),
            ],
            ..IssuersInfo::default()
        }
    }

    pub fn issuers_json(&self) -> Value {
        issuers_json(
            &[self.confirmations.public_key().encode_base64().as_str()],
            &[self.payments.public_key().encode_base64().as_str()],
        )
    }

    pub fn unblinded_tokens(&self, count: usize, wallet: &WalletInfo) -> Vec<UnblindedTokenInfo> {
        unblinded_tokens_signed_by(&self.confirmations, count, wallet)
    }

    pub fn payment_tokens(&self, count: usize) -> Vec<UnblindedPaymentTokenInfo> {
        payment_tokens_signed_by(&self.payments, count)
    }

    /// A valid opted-in confirmation spending one of this issuer's tokens.
    pub async fn opted_in_confirmation(&self) -> ConfirmationInfo {
        let pool = TokenPoolStore::new(Arc::new(InMemoryStateStore::new()));
        pool.initialize().await.expect("initialize pool");
        pool.add_unblinded_tokens(self.unblinded_tokens(1, &test_wallet()))
            .await
            .expect("seed pool");

        let transaction = TransactionInfo::new(
            "546fe7b0-5047-4f28-a11c-81f14edcf0f6",
            AdType::AdNotification,
            ConfirmationType::Viewed,
        );
        let sources = RewardSources {
            token_pool: &pool,
            token_generator: &RandomTokenGenerator,
        };
        build_confirmation(
            &transaction,
            Some(sources),
            &DefaultUserDataBuilder::new(UserDataSettings::default()),
        )
        .await
        .expect("opted-in confirmation")
    }

    /// `200` body of the fetch-payment-token call for `confirmation`.
    pub fn payment_token_json(&self, confirmation: &ConfirmationInfo) -> Value {
        let opted_in = confirmation.opted_in.as_ref().expect("opted-in confirmation");
        json!({
            "id": confirmation.transaction_id,
            "paymentToken": sign_blinded_tokens(&self.payments, &[opted_in.blinded_token]),
        })
    }
}

// ─── Fake ledger ─────────────────────────────────────────────────────────

/// Installs ledger behaviour on a [`MockUrlLoader`], remembering what was
/// posted so later calls can be answered consistently.
#[derive(Clone)]
pub struct FakeLedger {
    pub issuer: FakeIssuer,
    pub server: LedgerServer,
    pub payment_id: String,
    refill_blinded: Arc<Mutex<Vec<BlindedToken>>>,
    created: Arc<Mutex<HashMap<String, Option<BlindedToken>>>>,
}

impl FakeLedger {
    pub fn new(payment_id: &str) -> Self {
        Self {
            issuer: FakeIssuer::new(),
            server: LedgerServer::new(LEDGER_URL, API_VERSION),
            payment_id: payment_id.to_string(),
            refill_blinded: Arc::default(),
            created: Arc::default(),
        }
    }

    fn path(url: String) -> String {
        path_of(&url).to_string()
    }

    pub fn request_signed_tokens_path(&self) -> String {
        Self::path(self.server.request_signed_tokens(&self.payment_id))
    }

    pub fn get_signed_tokens_path(&self) -> String {
        Self::path(self.server.get_signed_tokens(&self.payment_id, NONCE))
    }

    pub fn redeem_payment_tokens_path(&self) -> String {
        Self::path(self.server.redeem_payment_tokens(&self.payment_id))
    }

    pub fn confirmation_prefix(&self) -> String {
        format!("/v{}/confirmation/", API_VERSION)
    }

    pub fn issuers_path(&self) -> String {
        Self::path(self.server.issuers())
    }

    /// Whether the ledger holds a created confirmation for `transaction_id`.
    pub fn has_confirmation(&self, transaction_id: &str) -> bool {
        self.created.lock().unwrap().contains_key(transaction_id)
    }

    /// Drops a created confirmation so its payment token fetch 404s.
    pub fn forget_confirmation(&self, transaction_id: &str) {
        self.created.lock().unwrap().remove(transaction_id);
    }

    pub fn serve_issuers(&self, loader: &MockUrlLoader) {
        loader.respond(Method::GET, &self.issuers_path(), 200, &self.issuer.issuers_json().to_string());
    }

    /// Accepts blinded tokens for a nonce and signs them on the fetch.
    pub fn serve_refill(&self, loader: &MockUrlLoader) {
        let captured = Arc::clone(&self.refill_blinded);
        loader.respond_with(Method::POST, &self.request_signed_tokens_path(), move |req| {
            let Some(parsed) = req
                .body
                .as_deref()
                .and_then(|b| serde_json::from_str::<RequestSignedTokensReq>(b).ok())
            else {
                return (400, String::new());
            };
            let blinded: Option<Vec<BlindedToken>> = parsed
                .blinded_tokens
                .iter()
                .map(|b| BlindedToken::decode_base64(b).ok())
                .collect();
            match blinded {
                Some(blinded) => {
                    *captured.lock().unwrap() = blinded;
                    (201, json!({ "nonce": NONCE }).to_string())
                }
                None => (400, String::new()),
            }
        });

        let captured = Arc::clone(&self.refill_blinded);
        let key = self.issuer.confirmations.clone();
        loader.respond_with(Method::GET, &self.get_signed_tokens_path(), move |_| {
            let blinded = captured.lock().unwrap().clone();
            (200, sign_blinded_tokens(&key, &blinded).to_string())
        });
    }

    /// Signed tokens come back under a key nobody trusts.
    pub fn serve_untrusted_refill(&self, loader: &MockUrlLoader) {
        let captured = Arc::clone(&self.refill_blinded);
        loader.respond_with(Method::GET, &self.get_signed_tokens_path(), move |_| {
            let blinded = captured.lock().unwrap().clone();
            let rogue = SigningKey::random(&mut OsRng);
            (200, sign_blinded_tokens(&rogue, &blinded).to_string())
        });
    }

    /// Signed tokens come back with a proof for a different batch.
    pub fn tamper_refill_proof(&self, loader: &MockUrlLoader) {
        let captured = Arc::clone(&self.refill_blinded);
        let key = self.issuer.confirmations.clone();
        loader.respond_with(Method::GET, &self.get_signed_tokens_path(), move |_| {
            let blinded = captured.lock().unwrap().clone();
            let decoy: Vec<BlindedToken> = blinded
                .iter()
                .map(|_| Token::random(&mut OsRng).blind().expect("blind"))
                .collect();
            let mut body = sign_blinded_tokens(&key, &blinded);
            body["batchProof"] = sign_blinded_tokens(&key, &decoy)["batchProof"].clone();
            (200, body.to_string())
        });
    }

    /// Creates confirmations and serves their payment tokens.
    pub fn serve_confirmations(&self, loader: &MockUrlLoader) {
        let prefix = self.confirmation_prefix();

        let created = Arc::clone(&self.created);
        let create_prefix = prefix.clone();
        loader.respond_with_prefix(Method::POST, &prefix, move |req| {
            let path = path_of(&req.url);
            let Some(transaction_id) = path
                .strip_prefix(create_prefix.as_str())
                .and_then(|rest| rest.split('/').next())
                .filter(|id| !id.is_empty())
            else {
                return (400, String::new());
            };
            let payload: Value = match req.body.as_deref().map(serde_json::from_str) {
                Some(Ok(payload)) => payload,
                _ => return (400, String::new()),
            };
            let blinded = payload["blindedPaymentTokens"][0]
                .as_str()
                .and_then(|b| BlindedToken::decode_base64(b).ok());

            let mut created = created.lock().unwrap();
            if created.contains_key(transaction_id) {
                return (409, String::new());
            }
            created.insert(transaction_id.to_string(), blinded);
            (201, json!({ "id": transaction_id, "type": payload["type"] }).to_string())
        });

        let created = Arc::clone(&self.created);
        let key = self.issuer.payments.clone();
        let fetch_prefix = prefix.clone();
        loader.respond_with_prefix(Method::GET, &prefix, move |req| {
            let path = path_of(&req.url);
            let Some(transaction_id) = path
                .strip_prefix(fetch_prefix.as_str())
                .and_then(|rest| rest.strip_suffix("/paymentToken"))
            else {
                return (404, String::new());
            };
            match created.lock().unwrap().get(transaction_id) {
                Some(Some(blinded)) => (
                    200,
                    json!({
                        "id": transaction_id,
                        "paymentToken": sign_blinded_tokens(&key, &[*blinded]),
                    })
                    .to_string(),
                ),
                Some(None) => (400, String::new()),
                None => (404, String::new()),
            }
        });
    }

    /// Answers batch redemption with `status`, echoing the credentials on `200`.
    pub fn serve_payment_redemption(&self, loader: &MockUrlLoader, status: u16) {
        loader.respond_with(Method::PUT, &self.redeem_payment_tokens_path(), move |req| {
            if status != 200 {
                return (status, String::new());
            }
            let body: Value = req
                .body
                .as_deref()
                .and_then(|b| serde_json::from_str(b).ok())
                .unwrap_or(Value::Null);
            (200, json!({ "paymentCredentials": body["paymentCredentials"] }).to_string())
        });
    }
}

// ─── Account fixture ─────────────────────────────────────────────────────

/// An initialized context wired to a [`FakeLedger`] with trusted issuers and
/// the test wallet set and recorded in the pool.
pub struct TestAccount {
    pub ctx: AccountContext,
    pub loader: Arc<MockUrlLoader>,
    pub ledger: FakeLedger,
    pub wallet: WalletInfo,
    pub store: Arc<InMemoryStateStore>,
}

impl TestAccount {
    pub async fn new() -> Self {
        let store = Arc::new(InMemoryStateStore::new());
        Self::with_store(store, FakeLedger::new(PAYMENT_ID)).await
    }

    async fn with_store(store: Arc<InMemoryStateStore>, ledger: FakeLedger) -> Self {
        let loader = Arc::new(MockUrlLoader::new());
        let token_pool = Arc::new(TokenPoolStore::new(store.clone()));
        token_pool.initialize().await.expect("initialize pool");
        let wallet = test_wallet();
        if token_pool.payment_id().await.is_none() {
            token_pool
                .set_payment_id(&wallet.payment_id)
                .await
                .expect("record payment id");
        }

        let ctx = AccountContext {
            loader: loader.clone(),
            server: ledger.server.clone(),
            token_pool,
            issuers: Arc::new(Issuers::with_issuers(ledger.issuer.issuers_info())),
            observers: Arc::new(ObserverList::new()),
            token_generator: Arc::new(RandomTokenGenerator),
            wallet: Arc::new(RwLock::new(Some(wallet.clone()))),
        };
        Self {
            ctx,
            loader,
            ledger,
            wallet,
            store,
        }
    }

    /// Same persisted state and ledger, fresh everything else.
    pub async fn restart(&self) -> Self {
        Self::with_store(self.store.clone(), self.ledger.clone()).await
    }

    pub async fn seed_unblinded_tokens(&self, count: usize) -> Vec<UnblindedTokenInfo> {
        let tokens = self.ledger.issuer.unblinded_tokens(count, &self.wallet);
        self.ctx
            .token_pool
            .add_unblinded_tokens(tokens.clone())
            .await
            .expect("seed unblinded tokens");
        tokens
    }

    pub async fn seed_payment_tokens(&self, count: usize) -> Vec<UnblindedPaymentTokenInfo> {
        let tokens = self.ledger.issuer.payment_tokens(count);
        for token in &tokens {
            self.ctx
                .token_pool
                .add_unblinded_payment_token(token.clone())
                .await
                .expect("seed payment token");
        }
        tokens
    }

    pub fn observe(&self) -> Arc<RecordingObserver> {
        let observer = Arc::new(RecordingObserver::new());
        self.ctx.observers.add(observer.clone());
        observer
    }
}
