// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

use adpass_crypto::{verify_message_signature, WalletKeypair};
use base64ct::{Base64, Encoding};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    InvalidPaymentId,
    InvalidRecoverySeed,
    Derivation(adpass_crypto::Error),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletError::InvalidPaymentId => write!(f, "payment id is not a UUID"),
            WalletError::InvalidRecoverySeed => write!(f, "recovery seed is not valid base64"),
            WalletError::Derivation(e) => write!(f, "wallet key derivation failed: {}", e),
        }
    }
}

impl std::error::Error for WalletError {}

/// Account identity: payment id plus the keypair derived from the
/// recovery seed. Immutable once built.
#[derive(Clone)]
pub struct WalletInfo {
    pub payment_id: String,
    /// Base64 SEC1 public key
    pub public_key: String,
    keypair: Arc<WalletKeypair>,
}

impl WalletInfo {
    /// `recovery_seed` is base64, as stored by the rewards service.
    pub fn derive(payment_id: &str, recovery_seed: &str) -> Result<Self, WalletError> {
        Uuid::parse_str(payment_id).map_err(|_| WalletError::InvalidPaymentId)?;
        let seed = Base64::decode_vec(recovery_seed.trim()).map_err(|_| WalletError::InvalidRecoverySeed)?;
        if seed.is_empty() {
            return Err(WalletError::InvalidRecoverySeed);
        }
        let keypair = WalletKeypair::derive(payment_id, &seed).map_err(WalletError::Derivation)?;
        Ok(Self {
            payment_id: payment_id.to_string(),
            public_key: Base64::encode_string(keypair.public_key()),
            keypair: Arc::new(keypair),
        })
    }

    pub fn is_valid(&self) -> bool {
        !self.payment_id.is_empty()
            && Uuid::parse_str(&self.payment_id).is_ok()
            && !self.public_key.is_empty()
    }

    /// Base64 ECDSA signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Result<String, adpass_crypto::Error> {
        self.keypair.sign(message).map(|sig| Base64::encode_string(&sig))
    }

    pub fn verify(&self, message: &[u8], signature_base64: &str) -> bool {
        let Ok(raw) = Base64::decode_vec(signature_base64) else {
            return false;
        };
        let Ok(sig) = <[u8; 64]>::try_from(raw.as_slice()) else {
            return false;
        };
        verify_message_signature(self.keypair.public_key(), message, &sig)
    }
}

impl PartialEq for WalletInfo {
    fn eq(&self, other: &Self) -> bool {
        self.payment_id == other.payment_id && self.public_key == other.public_key
    }
}

impl Eq for WalletInfo {}

impl fmt::Debug for WalletInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletInfo")
            .field("payment_id", &self.payment_id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYMENT_ID: &str = "27a39b2f-9b2e-4eb0-bbb2-2f84447496e7";
    const SEED: &str = "x5uBvgI5MTTVY6sjGv65e9EHr8v7i+UxkFB9qVc5fP0=";

    #[test]
    fn test_derive_and_sign() {
        let wallet = WalletInfo::derive(PAYMENT_ID, SEED).unwrap();
        assert!(wallet.is_valid());
        assert_eq!(wallet, WalletInfo::derive(PAYMENT_ID, SEED).unwrap());

        let sig = wallet.sign(b"token").unwrap();
        assert!(wallet.verify(b"token", &sig));
        assert!(!wallet.verify(b"other", &sig));
        assert!(!wallet.verify(b"token", "garbage"));
    }

    #[test]
    fn test_derive_rejects_bad_input() {
        assert_eq!(
            WalletInfo::derive("not-a-uuid", SEED).unwrap_err(),
            WalletError::InvalidPaymentId
        );
        assert_eq!(
            WalletInfo::derive(PAYMENT_ID, "%%%").unwrap_err(),
            WalletError::InvalidRecoverySeed
        );
        assert_eq!(
            WalletInfo::derive(PAYMENT_ID, "").unwrap_err(),
            WalletError::InvalidRecoverySeed
        );
    }

    #[test]
    fn test_debug_hides_secret() {
        let wallet = WalletInfo::derive(PAYMENT_ID, SEED).unwrap();
        let debug = format!("{:?}", wallet);
        assert!(debug.contains(PAYMENT_ID));
        assert!(!debug.contains("keypair"));
    }
}
