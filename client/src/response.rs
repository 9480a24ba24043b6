// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Typed decoding of ledger responses.
//!
//! Callers map each error kind onto their own retry policy, so the kinds
//! stay distinct: unparsable JSON is not the same as a missing field.

use adpass_common::api::SignedTokensResp;
use adpass_crypto::{BatchDleqProof, PublicKey, SignedToken};
use serde::de::DeserializeOwned;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    InvalidJson,
    MissingField(&'static str),
    InvalidField(&'static str),
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseError::InvalidJson => write!(f, "response body is not valid JSON"),
            ResponseError::MissingField(name) => write!(f, "response is missing {}", name),
            ResponseError::InvalidField(name) => write!(f, "response has an invalid {}", name),
        }
    }
}

impl std::error::Error for ResponseError {}

pub fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, ResponseError> {
    serde_json::from_str(body).map_err(|_| ResponseError::InvalidJson)
}

pub fn required<T>(value: Option<T>, name: &'static str) -> Result<T, ResponseError> {
    value.ok_or(ResponseError::MissingField(name))
}

/// A decoded `{publicKey, batchProof, signedTokens}` object.
#[derive(Debug, Clone)]
pub struct SignedTokenBatch {
    /// As sent, for the issuer lookup.
    pub public_key_base64: String,
    pub public_key: PublicKey,
    pub batch_proof: BatchDleqProof,
    pub signed_tokens: Vec<SignedToken>,
}

impl SignedTokenBatch {
    pub fn from_response(resp: SignedTokensResp) -> Result<Self, ResponseError> {
        let public_key_base64 = required(resp.public_key, "publicKey")?;
        let public_key = PublicKey::decode_base64(&public_key_base64)
            .map_err(|_| ResponseError::InvalidField("publicKey"))?;

        let batch_proof = required(resp.batch_proof, "batchProof")?;
        let batch_proof = BatchDleqProof::decode_base64(&batch_proof)
            .map_err(|_| ResponseError::InvalidField("batchProof"))?;

        let signed_tokens = required(resp.signed_tokens, "signedTokens")?;
        if signed_tokens.is_empty() {
            return Err(ResponseError::InvalidField("signedTokens"));
        }
        let signed_tokens = signed_tokens
            .iter()
            .map(|s| SignedToken::decode_base64(s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ResponseError::InvalidField("signedTokens"))?;

        Ok(Self {
            public_key_base64,
            public_key,
            batch_proof,
            signed_tokens,
        })
    }
}
