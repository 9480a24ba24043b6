// common/src/api.rs
//! Ledger wire types.
//!
//! Response fields are all optional here; the client decides which missing
//! field is fatal for which call.
use serde::{Deserialize, Serialize};

// ============================================================================
// Confirmation Token Refill
// ============================================================================

/// `POST /v{N}/confirmation/token/{payment_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSignedTokensReq {
    /// Base64 blinded tokens
    pub blinded_tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestSignedTokensResp {
    #[serde(default)]
    pub nonce: Option<String>,
}

/// `GET /v{N}/confirmation/token/{payment_id}?nonce={nonce}` (200)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTokensResp {
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub batch_proof: Option<String>,
    #[serde(default)]
    pub signed_tokens: Option<Vec<String>>,
}

/// `GET /v{N}/confirmation/token/{payment_id}?nonce={nonce}` (401)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptchaRequiredResp {
    #[serde(default)]
    pub captcha_id: Option<String>,
}

// ============================================================================
// Confirmations
// ============================================================================

/// `POST /v{N}/confirmation/{transaction_id}[/{credential}]` (201)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConfirmationResp {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, rename = "type")]
    pub confirmation_type: Option<String>,
    #[serde(default)]
    pub creative_instance_id: Option<String>,
}

/// `GET /v{N}/confirmation/{transaction_id}/paymentToken` (200)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTokenResp {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub payment_token: Option<SignedTokensResp>,
}

// ============================================================================
// Payment Token Redemption
// ============================================================================

/// `PUT /v{N}/confirmation/payment/{payment_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemPaymentTokensReq {
    /// JSON string `{"paymentId":"..."}` that every credential signs
    pub payload: String,
    pub payment_credentials: Vec<PaymentCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub totals: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCredential {
    pub confirmation_type: String,
    pub credential: TokenCredential,
    pub public_key: String,
}

/// Proof of possession for one unblinded token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCredential {
    /// Base64 verification signature over the payload
    pub signature: String,
    /// Base64 token pre-image
    pub t: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemPaymentTokensResp {
    #[serde(default)]
    pub payment_credentials: Option<Vec<PaymentCredential>>,
}

// ============================================================================
// Issuers
// ============================================================================

/// `GET /v{N}/issuers/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuersResp {
    /// Refresh interval in milliseconds
    pub ping: u64,
    pub issuers: Vec<IssuerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerEntry {
    pub name: String,
    pub public_keys: Vec<IssuerPublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerPublicKey {
    pub public_key: String,
    #[serde(default)]
    pub associated_value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_token_resp_tolerates_missing_fields() {
        let resp: PaymentTokenResp = serde_json::from_str(r#"{"id":"abc"}"#).unwrap();
        assert_eq!(resp.id.as_deref(), Some("abc"));
        assert!(resp.payment_token.is_none());

        let resp: PaymentTokenResp = serde_json::from_str(
            r#"{"id":"abc","paymentToken":{"publicKey":"pk","batchProof":"bp","signedTokens":["s"]}}"#,
        )
        .unwrap();
        let token = resp.payment_token.unwrap();
        assert_eq!(token.public_key.as_deref(), Some("pk"));
        assert_eq!(token.signed_tokens.unwrap(), vec!["s".to_string()]);
    }

    #[test]
    fn test_redeem_request_field_names() {
        let req = RedeemPaymentTokensReq {
            payload: r#"{"paymentId":"p"}"#.to_string(),
            payment_credentials: vec![PaymentCredential {
                confirmation_type: "view".to_string(),
                credential: TokenCredential {
                    signature: "sig".to_string(),
                    t: "t".to_string(),
                },
                public_key: "pk".to_string(),
            }],
            platform: None,
            totals: vec![],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["paymentCredentials"][0]["confirmationType"], "view");
        assert_eq!(json["paymentCredentials"][0]["credential"]["t"], "t");
        assert_eq!(json["paymentCredentials"][0]["publicKey"], "pk");
        assert!(json.get("platform").is_none());
    }

    #[test]
    fn test_captcha_field_is_snake_case() {
        let resp: CaptchaRequiredResp = serde_json::from_str(r#"{"captcha_id":"abc"}"#).unwrap();
        assert_eq!(resp.captcha_id.as_deref(), Some("abc"));
    }
}
