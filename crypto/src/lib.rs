// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Cryptographic primitives for adpass
//!
//! Two independent capabilities live here:
//!
//! - **Blind tokens** (`voprf`): the Privacy Pass style chain
//!   `Token -> BlindedToken -> SignedToken -> UnblindedToken` with a batch
//!   DLEQ proof, and the verification key/MAC used to redeem a token.
//! - **Wallet keys**: a P-256 ECDSA keypair derived deterministically from a
//!   payment id and recovery seed, used to sign stored tokens.
//!
//! # Memory Zeroization
//!
//! - Blinding factors and issuer secrets are `Scalar`s, wiped in `Drop`.
//! - Token pre-images and verification keys derive `ZeroizeOnDrop`.
//! - Wallet secret keys are wiped when the keypair is dropped.
//! - Points, public keys, signed tokens and proofs are public values.

use core::fmt;

use hkdf::Hkdf;
use p256::elliptic_curve::{ops::Reduce, Field};
use p256::{FieldBytes, Scalar};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

pub mod voprf;

pub use voprf::{
    BatchDleqProof, BlindedToken, PublicKey, SignedToken, SigningKey, Token, TokenPreimage,
    UnblindedToken, VerificationKey, VerificationSignature,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Decode,
    InvalidPoint,
    InvalidProof,
    LengthMismatch,
    ZeroScalar,
    Internal,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Decode => write!(f, "malformed encoding"),
            Error::InvalidPoint => write!(f, "invalid curve point"),
            Error::InvalidProof => write!(f, "batch proof verification failed"),
            Error::LengthMismatch => write!(f, "token batch lengths differ or are empty"),
            Error::ZeroScalar => write!(f, "zero scalar"),
            Error::Internal => write!(f, "internal crypto error"),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Wallet keys
// ============================================================================

const WALLET_HKDF_SALT: &[u8] = b"adpass-wallet-hkdf-salt-v1";

/// Deterministic wallet keypair.
pub struct WalletKeypair {
    secret_key: [u8; 32],
    public_key: Vec<u8>,
}

impl WalletKeypair {
    /// HKDF-SHA256 over the recovery seed with the payment id as info,
    /// reduced to a non-zero P-256 scalar.
    pub fn derive(payment_id: &str, recovery_seed: &[u8]) -> Result<Self, Error> {
        if recovery_seed.is_empty() || payment_id.is_empty() {
            return Err(Error::Decode);
        }
        let hkdf = Hkdf::<Sha256>::new(Some(WALLET_HKDF_SALT), recovery_seed);

        // Counter byte guards against the (negligible) zero reduction.
        for counter in 0u8..=u8::MAX {
            let mut okm = Zeroizing::new([0u8; 32]);
            let mut info = payment_id.as_bytes().to_vec();
            info.push(counter);
            hkdf.expand(&info, &mut okm[..])
                .map_err(|_| Error::Internal)?;

            let mut scalar = Scalar::reduce_bytes(&FieldBytes::from(*okm));
            if bool::from(scalar.is_zero()) {
                continue;
            }
            let mut secret_key: [u8; 32] = scalar.to_bytes().into();
            scalar.zeroize();
            return match Self::from_secret_key(secret_key) {
                Ok(keypair) => Ok(keypair),
                Err(err) => {
                    secret_key.zeroize();
                    Err(err)
                }
            };
        }
        Err(Error::Internal)
    }

    pub fn from_secret_key(secret_key: [u8; 32]) -> Result<Self, Error> {
        let signing_key =
            p256::ecdsa::SigningKey::from_bytes((&secret_key).into()).map_err(|_| Error::Internal)?;
        let public_key = signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// SEC1 compressed public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }

    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], Error> {
        sign_message(&self.secret_key, message)
    }
}

impl Drop for WalletKeypair {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

impl fmt::Debug for WalletKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKeypair").finish_non_exhaustive()
    }
}

// ============================================================================
// Generic Message Signatures
// ============================================================================

/// Sign an arbitrary message with a 32-byte P-256 secret key.
///
/// Deterministic ECDSA (RFC 6979) over SHA-256 of the message.
///
/// # Returns
/// 64-byte ECDSA signature (r || s) or error
pub fn sign_message(secret_key: &[u8; 32], message: &[u8]) -> Result<[u8; 64], Error> {
    use p256::ecdsa::{signature::Signer, SigningKey};

    let msg_hash = Sha256::digest(message);

    let signing_key = SigningKey::from_bytes(secret_key.into()).map_err(|_| Error::Internal)?;

    let signature: p256::ecdsa::Signature = signing_key.sign(&msg_hash);

    Ok(signature.to_bytes().into())
}

/// Verify an arbitrary message signature with a SEC1 public key.
///
/// # Returns
/// true if signature is valid, false otherwise
pub fn verify_message_signature(public_key: &[u8], message: &[u8], signature: &[u8; 64]) -> bool {
    use p256::ecdsa::{signature::Verifier, VerifyingKey};

    let msg_hash = Sha256::digest(message);

    let verifying_key = match VerifyingKey::from_sec1_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let sig = match p256::ecdsa::Signature::from_bytes(signature.into()) {
        Ok(s) => s,
        Err(_) => return false,
    };

    verifying_key.verify(&msg_hash, &sig).is_ok()
}
