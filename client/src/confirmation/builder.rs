// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Confirmation payloads and the credentials that sign them.
//!
//! The payload is a JSON object with sorted keys, so rebuilding it from the
//! same confirmation yields the same bytes. The credential embeds the
//! payload, a verification signature over it and the spent token's
//! pre-image, and travels base64url-encoded in the create-confirmation path.

use adpass_crypto::VerificationSignature;
use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use super::{ConfirmationInfo, ConfirmationType, AdType, OptedInInfo, TransactionInfo, UserDataBuilder, UserDataInfo};
use crate::state::TokenPoolStore;
use crate::token_generator::TokenGenerator;

#[derive(Debug)]
pub enum BuildError {
    InvalidTransaction,
    NotOptedIn,
    NoUnblindedTokens,
    Crypto(adpass_crypto::Error),
    Json(serde_json::Error),
    Store(anyhow::Error),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::InvalidTransaction => write!(f, "transaction is missing ids or types"),
            BuildError::NotOptedIn => write!(f, "confirmation carries no opted-in data"),
            BuildError::NoUnblindedTokens => write!(f, "no unblinded tokens to spend"),
            BuildError::Crypto(e) => write!(f, "crypto: {}", e),
            BuildError::Json(e) => write!(f, "json: {}", e),
            BuildError::Store(e) => write!(f, "token pool: {:#}", e),
        }
    }
}

impl std::error::Error for BuildError {}

impl From<adpass_crypto::Error> for BuildError {
    fn from(e: adpass_crypto::Error) -> Self {
        BuildError::Crypto(e)
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(e: serde_json::Error) -> Self {
        BuildError::Json(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub payload: String,
    pub signature: String,
    pub t: String,
}

impl Credential {
    pub fn decode(credential_base64url: &str) -> Option<Self> {
        let raw = Base64UrlUnpadded::decode_vec(credential_base64url).ok()?;
        serde_json::from_slice(&raw).ok()
    }
}

pub fn build_payload(confirmation: &ConfirmationInfo) -> Result<String, BuildError> {
    let mut payload: BTreeMap<String, Value> = BTreeMap::new();
    payload.insert("creativeInstanceId".into(), json!(confirmation.creative_instance_id));
    payload.insert("transactionId".into(), json!(confirmation.transaction_id));
    payload.insert("type".into(), json!(confirmation.confirmation_type.as_str()));

    if let Some(opted_in) = &confirmation.opted_in {
        payload.insert(
            "blindedPaymentTokens".into(),
            json!([opted_in.blinded_token.encode_base64()]),
        );
        payload.insert(
            "publicKey".into(),
            json!(opted_in.unblinded_token.public_key.encode_base64()),
        );
        // User data never overrides protocol fields.
        for (key, value) in opted_in.user_data.dynamic.iter().chain(&opted_in.user_data.fixed) {
            payload.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    Ok(serde_json::to_string(&payload)?)
}

pub fn create_opted_in_credential(confirmation: &ConfirmationInfo) -> Result<String, BuildError> {
    let opted_in = confirmation.opted_in.as_ref().ok_or(BuildError::NotOptedIn)?;
    let payload = build_payload(confirmation)?;

    let unblinded = &opted_in.unblinded_token.value;
    let signature = unblinded.derive_verification_key().sign(payload.as_bytes())?;
    let credential = Credential {
        payload,
        signature: signature.encode_base64(),
        t: unblinded.preimage().encode_base64(),
    };

    let json = serde_json::to_string(&credential)?;
    Ok(Base64UrlUnpadded::encode_string(json.as_bytes()))
}

/// Required fields are present and, when opted in, the credential verifies
/// against the payload this confirmation produces now.
pub fn is_valid(confirmation: &ConfirmationInfo) -> bool {
    if confirmation.transaction_id.is_empty()
        || confirmation.creative_instance_id.is_empty()
        || confirmation.confirmation_type == ConfirmationType::Undefined
        || confirmation.ad_type == AdType::Undefined
        || confirmation.created_at.is_none()
    {
        return false;
    }

    let Some(opted_in) = &confirmation.opted_in else {
        return true;
    };
    let Some(credential) = opted_in
        .credential_base64url
        .as_deref()
        .and_then(Credential::decode)
    else {
        return false;
    };
    let Ok(payload) = build_payload(confirmation) else {
        return false;
    };
    if credential.payload != payload {
        return false;
    }

    let unblinded = &opted_in.unblinded_token.value;
    if credential.t != unblinded.preimage().encode_base64() {
        return false;
    }
    match VerificationSignature::decode_base64(&credential.signature) {
        Ok(signature) => unblinded
            .derive_verification_key()
            .verify(payload.as_bytes(), &signature),
        Err(_) => false,
    }
}

/// Everything needed to build an opted-in confirmation.
pub struct RewardSources<'a> {
    pub token_pool: &'a TokenPoolStore,
    pub token_generator: &'a dyn TokenGenerator,
}

/// Builds a confirmation for `transaction`. With `rewards`, one unblinded
/// token is removed from the pool (and persisted) before this returns.
pub async fn build_confirmation(
    transaction: &TransactionInfo,
    rewards: Option<RewardSources<'_>>,
    user_data: &dyn UserDataBuilder,
) -> Result<ConfirmationInfo, BuildError> {
    if transaction.id.is_empty()
        || transaction.creative_instance_id.is_empty()
        || transaction.confirmation_type == ConfirmationType::Undefined
        || transaction.ad_type == AdType::Undefined
    {
        return Err(BuildError::InvalidTransaction);
    }

    let mut confirmation = ConfirmationInfo {
        transaction_id: transaction.id.clone(),
        creative_instance_id: transaction.creative_instance_id.clone(),
        confirmation_type: transaction.confirmation_type,
        ad_type: transaction.ad_type,
        created_at: Some(transaction.created_at),
        was_created: false,
        opted_in: None,
    };

    let Some(sources) = rewards else {
        return Ok(confirmation);
    };

    let token = sources
        .token_generator
        .generate(1)
        .pop()
        .ok_or(BuildError::Crypto(adpass_crypto::Error::Internal))?;
    let blinded_token = token.blind()?;

    let user_data = UserDataInfo {
        dynamic: user_data.build_dynamic(&confirmation),
        fixed: user_data.build_fixed(&confirmation),
    };

    let unblinded_token = sources
        .token_pool
        .take_unblinded_token()
        .await
        .map_err(BuildError::Store)?
        .ok_or(BuildError::NoUnblindedTokens)?;
    let remaining = sources.token_pool.unblinded_token_count().await;
    debug!(
        transaction_id = %confirmation.transaction_id,
        remaining,
        "spent unblinded token"
    );

    confirmation.opted_in = Some(OptedInInfo {
        token,
        blinded_token,
        unblinded_token,
        user_data,
        credential_base64url: None,
    });
    let credential = create_opted_in_credential(&confirmation)?;
    if let Some(opted_in) = confirmation.opted_in.as_mut() {
        opted_in.credential_base64url = Some(credential);
    }
    Ok(confirmation)
}

/// Fresh dynamic user data and a credential that matches it.
pub fn rebuild_dynamic_user_data(
    confirmation: &ConfirmationInfo,
    user_data: &dyn UserDataBuilder,
) -> Result<ConfirmationInfo, BuildError> {
    let mut rebuilt = confirmation.clone();
    let dynamic = user_data.build_dynamic(&rebuilt);
    let opted_in = rebuilt.opted_in.as_mut().ok_or(BuildError::NotOptedIn)?;
    opted_in.user_data.dynamic = dynamic;
    opted_in.credential_base64url = None;

    let credential = create_opted_in_credential(&rebuilt)?;
    if let Some(opted_in) = rebuilt.opted_in.as_mut() {
        opted_in.credential_base64url = Some(credential);
    }
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserDataSettings;
    use crate::confirmation::DefaultUserDataBuilder;
    use crate::state::InMemoryStateStore;
    use crate::testing::{test_wallet, unblinded_tokens, FakeIssuer};
    use crate::token_generator::RandomTokenGenerator;
    use std::sync::Arc;

    fn user_data() -> DefaultUserDataBuilder {
        DefaultUserDataBuilder::new(UserDataSettings {
            diagnostic_id: Some("c1298fde-7fdb-401f-a3ce-0b58fe86e6e2".to_string()),
            device_id: Some("device".to_string()),
            ..UserDataSettings::default()
        })
    }

    fn transaction() -> TransactionInfo {
        TransactionInfo::new(
            "546fe7b0-5047-4f28-a11c-81f14edcf0f6",
            AdType::AdNotification,
            ConfirmationType::Clicked,
        )
    }

    async fn pool_with(count: usize) -> TokenPoolStore {
        let pool = TokenPoolStore::new(Arc::new(InMemoryStateStore::new()));
        pool.initialize().await.unwrap();
        pool.add_unblinded_tokens(unblinded_tokens(count, &test_wallet()))
            .await
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_opted_in_spends_exactly_one_token() {
        let pool = pool_with(3).await;
        let before = pool.unblinded_tokens().await;
        let sources = RewardSources {
            token_pool: &pool,
            token_generator: &RandomTokenGenerator,
        };

        let confirmation = build_confirmation(&transaction(), Some(sources), &user_data())
            .await
            .unwrap();
        let opted_in = confirmation.opted_in.as_ref().unwrap();
        assert_eq!(opted_in.unblinded_token, before[0]);
        assert_eq!(pool.unblinded_tokens().await, before[1..].to_vec());
        assert!(is_valid(&confirmation));
    }

    #[tokio::test]
    async fn test_empty_pool_and_bad_transaction() {
        let pool = pool_with(0).await;
        let sources = RewardSources {
            token_pool: &pool,
            token_generator: &RandomTokenGenerator,
        };
        assert!(matches!(
            build_confirmation(&transaction(), Some(sources), &user_data()).await,
            Err(BuildError::NoUnblindedTokens)
        ));

        let mut tx = transaction();
        tx.creative_instance_id.clear();
        assert!(matches!(
            build_confirmation(&tx, None, &user_data()).await,
            Err(BuildError::InvalidTransaction)
        ));
    }

    #[tokio::test]
    async fn test_payload_is_deterministic_and_protocol_fields_win() {
        let mut confirmation = FakeIssuer::new().opted_in_confirmation().await;
        let first = build_payload(&confirmation).unwrap();
        assert_eq!(first, build_payload(&confirmation).unwrap());

        let opted_in = confirmation.opted_in.as_mut().unwrap();
        opted_in
            .user_data
            .fixed
            .insert("transactionId".to_string(), serde_json::json!("spoofed"));
        let payload: Value = serde_json::from_str(&build_payload(&confirmation).unwrap()).unwrap();
        assert_eq!(payload["transactionId"], confirmation.transaction_id.as_str());
        assert_eq!(payload["type"], "view");
        assert!(payload["blindedPaymentTokens"].is_array());
        assert!(payload["buildChannel"].is_string());

        let keys: Vec<_> = payload.as_object().unwrap().keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_credential() {
        let confirmation = FakeIssuer::new().opted_in_confirmation().await;
        assert!(is_valid(&confirmation));

        let mut changed = confirmation.clone();
        changed.creative_instance_id = "another-creative".to_string();
        assert!(!is_valid(&changed));

        let mut changed = confirmation.clone();
        changed.confirmation_type = ConfirmationType::Dismissed;
        assert!(!is_valid(&changed));

        let mut changed = confirmation.clone();
        changed.opted_in.as_mut().unwrap().credential_base64url = None;
        assert!(!is_valid(&changed));

        let credential = Credential::decode(
            confirmation.opted_in.as_ref().unwrap().credential_base64url.as_deref().unwrap(),
        )
        .unwrap();
        assert_eq!(credential.payload, build_payload(&confirmation).unwrap());
    }

    #[tokio::test]
    async fn test_rebuild_refreshes_credential() {
        let confirmation = FakeIssuer::new().opted_in_confirmation().await;
        let rebuilt = rebuild_dynamic_user_data(&confirmation, &user_data()).unwrap();
        assert!(is_valid(&rebuilt));
        assert_eq!(
            rebuilt.opted_in.as_ref().unwrap().unblinded_token,
            confirmation.opted_in.as_ref().unwrap().unblinded_token
        );
        assert!(rebuilt.opted_in.as_ref().unwrap().user_data.dynamic.contains_key("diagnosticId"));

        let non_reward = crate::testing::non_reward_confirmation(ConfirmationType::Viewed, AdType::AdNotification);
        assert!(matches!(
            rebuild_dynamic_user_data(&non_reward, &user_data()),
            Err(BuildError::NotOptedIn)
        ));
    }
}
