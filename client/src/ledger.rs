// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Ledger endpoint paths.

use reqwest::Url;

/// Ledger API version embedded in every path.
pub const API_VERSION: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerServer {
    base_url: String,
    api_version: u32,
}

impl LedgerServer {
    pub fn new(base_url: impl Into<String>, api_version: u32) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            api_version,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v{}{}", self.base_url, self.api_version, path)
    }

    /// `POST /v{N}/confirmation/token/{payment_id}`
    pub fn request_signed_tokens(&self, payment_id: &str) -> String {
        self.url(&format!("/confirmation/token/{}", payment_id))
    }

    /// `GET /v{N}/confirmation/token/{payment_id}?nonce={nonce}`, with the
    /// nonce form-encoded.
    pub fn get_signed_tokens(&self, payment_id: &str, nonce: &str) -> String {
        let base = self.url(&format!("/confirmation/token/{}", payment_id));
        // An unparseable base fails in the loader anyway.
        match Url::parse(&base) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("nonce", nonce);
                url.into()
            }
            Err(_) => base,
        }
    }

    /// `POST /v{N}/confirmation/{transaction_id}/{credential}`
    pub fn create_opted_in_confirmation(&self, transaction_id: &str, credential_base64url: &str) -> String {
        self.url(&format!("/confirmation/{}/{}", transaction_id, credential_base64url))
    }

    /// `POST /v{N}/confirmation/{transaction_id}`
    pub fn create_non_reward_confirmation(&self, transaction_id: &str) -> String {
        self.url(&format!("/confirmation/{}", transaction_id))
    }

    /// `GET /v{N}/confirmation/{transaction_id}/paymentToken`
    pub fn fetch_payment_token(&self, transaction_id: &str) -> String {
        self.url(&format!("/confirmation/{}/paymentToken", transaction_id))
    }

    /// `PUT /v{N}/confirmation/payment/{payment_id}`
    pub fn redeem_payment_tokens(&self, payment_id: &str) -> String {
        self.url(&format!("/confirmation/payment/{}", payment_id))
    }

    /// `GET /v{N}/issuers/`
    pub fn issuers(&self) -> String {
        self.url("/issuers/")
    }
}
