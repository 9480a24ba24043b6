// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! The blind-token chain over P-256.
//!
//! ```text
//!   client                                   issuer (secret k, public Y = k·G)
//!   Token {t, r}
//!   BlindedToken  M = r·H(t)      ──────▶
//!                                 ◀──────    SignedToken Z = k·M  (+ batch DLEQ proof)
//!   UnblindedToken W = r⁻¹·Z = k·H(t)
//!   VerificationKey = SHA256(dst || t || W)
//! ```
//!
//! Redeeming an unblinded token reveals `t` and a MAC made with the
//! verification key; the issuer recomputes `W` from `t` with its secret.

use core::fmt;

use base64ct::{Base64, Encoding};
use elliptic_curve::hash2curve::{ExpandMsgXmd, GroupDigest};
use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use elliptic_curve::{ops::Reduce, Field, PrimeField};
use hmac::{Hmac, Mac};
use p256::{AffinePoint, EncodedPoint, FieldBytes, NistP256, ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Error;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_PREIMAGE_LEN: usize = 64;
pub const SCALAR_LEN: usize = 32;
pub const COMPRESSED_POINT_LEN: usize = 33;
pub const TOKEN_LEN: usize = TOKEN_PREIMAGE_LEN + SCALAR_LEN;
pub const UNBLINDED_TOKEN_LEN: usize = TOKEN_PREIMAGE_LEN + COMPRESSED_POINT_LEN;
pub const VERIFICATION_SIGNATURE_LEN: usize = 32;

const HASH_TO_CURVE_DST: &[u8] = b"P256_XMD:SHA-256_SSWU_RO_adpass-token-v1";
const VERIFICATION_KEY_DST: &[u8] = b"adpass-derive-verification-key-v1";

/// RFC 9380 hash-to-curve for P-256 (SSWU_RO).
fn hash_to_curve(input: &[u8]) -> Result<ProjectivePoint, Error> {
    NistP256::hash_from_bytes::<ExpandMsgXmd<Sha256>>(&[input], &[HASH_TO_CURVE_DST])
        .map_err(|_| Error::InvalidPoint)
}

pub(crate) fn encode_point(p: &ProjectivePoint) -> Vec<u8> {
    p.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, Error> {
    if bytes.len() != COMPRESSED_POINT_LEN {
        return Err(Error::Decode);
    }
    let ep = EncodedPoint::from_bytes(bytes).map_err(|_| Error::Decode)?;
    let ap: Option<AffinePoint> = AffinePoint::from_encoded_point(&ep).into();
    let ap = ap.ok_or(Error::InvalidPoint)?;
    if ap.is_identity().into() {
        return Err(Error::InvalidPoint);
    }
    Ok(ProjectivePoint::from(ap))
}

fn scalar_from_be32(bytes: [u8; 32]) -> Result<Scalar, Error> {
    let s = Scalar::reduce_bytes(&FieldBytes::from(bytes));

    if bool::from(s.is_zero()) {
        return Err(Error::ZeroScalar);
    }
    Ok(s)
}

fn decode_scalar(bytes: &[u8]) -> Result<Scalar, Error> {
    let arr: [u8; SCALAR_LEN] = bytes.try_into().map_err(|_| Error::Decode)?;
    let s: Option<Scalar> = Scalar::from_repr(FieldBytes::from(arr)).into();
    let s = s.ok_or(Error::Decode)?;
    if bool::from(s.is_zero()) {
        return Err(Error::ZeroScalar);
    }
    Ok(s)
}

fn random_nonzero_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    loop {
        let s = Scalar::random(&mut *rng);
        if !bool::from(s.is_zero()) {
            return s;
        }
    }
}

/// Generates `encode_base64`/`decode_base64` and string serde impls from
/// the type's `to_bytes`/`from_bytes`.
macro_rules! base64_codec {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl $ty {
                pub fn encode_base64(&self) -> String {
                    Base64::encode_string(&self.to_bytes())
                }

                pub fn decode_base64(encoded: &str) -> Result<Self, Error> {
                    let bytes = Base64::decode_vec(encoded).map_err(|_| Error::Decode)?;
                    Self::from_bytes(&bytes)
                }
            }

            impl serde::Serialize for $ty {
                fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.serialize_str(&self.encode_base64())
                }
            }

            impl<'de> serde::Deserialize<'de> for $ty {
                fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                    let encoded = <String as serde::Deserialize>::deserialize(deserializer)?;
                    Self::decode_base64(&encoded).map_err(serde::de::Error::custom)
                }
            }
        )+
    };
}

// ─── Pre-images and tokens ───────────────────────────────────────────────

/// Random 64-byte pre-image revealed when an unblinded token is redeemed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TokenPreimage([u8; TOKEN_PREIMAGE_LEN]);

impl TokenPreimage {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; TOKEN_PREIMAGE_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_PREIMAGE_LEN] {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let arr: [u8; TOKEN_PREIMAGE_LEN] = bytes.try_into().map_err(|_| Error::Decode)?;
        Ok(Self(arr))
    }

    fn to_curve(&self) -> Result<ProjectivePoint, Error> {
        hash_to_curve(&self.0)
    }
}

impl fmt::Debug for TokenPreimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenPreimage(..)")
    }
}

/// Client secret: a pre-image plus the blinding factor used to hide it.
///
/// A token blinds exactly one outgoing request and unblinds exactly one
/// signed response.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    t: TokenPreimage,
    r: Scalar,
}

impl Token {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let t = TokenPreimage::random(rng);
        let r = random_nonzero_scalar(rng);
        Self { t, r }
    }

    pub fn preimage(&self) -> &TokenPreimage {
        &self.t
    }

    /// `M = r·H(t)`
    pub fn blind(&self) -> Result<BlindedToken, Error> {
        Ok(BlindedToken(self.t.to_curve()? * self.r))
    }

    /// `W = r⁻¹·Z`. Only sound after the batch proof for `signed` verified.
    pub(crate) fn unblind(&self, signed: &SignedToken) -> Result<UnblindedToken, Error> {
        let r_inv: Option<Scalar> = self.r.invert().into();
        let r_inv = r_inv.ok_or(Error::ZeroScalar)?;
        Ok(UnblindedToken {
            t: self.t.clone(),
            w: signed.0 * r_inv,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TOKEN_LEN);
        out.extend_from_slice(self.t.as_bytes());
        out.extend_from_slice(&self.r.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != TOKEN_LEN {
            return Err(Error::Decode);
        }
        let t = TokenPreimage::from_bytes(&bytes[..TOKEN_PREIMAGE_LEN])?;
        let r = decode_scalar(&bytes[TOKEN_PREIMAGE_LEN..])?;
        Ok(Self { t, r })
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.r.zeroize();
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

/// `M = r·H(t)`, safe to send to the issuer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlindedToken(pub(crate) ProjectivePoint);

impl BlindedToken {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_point(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        decode_point(bytes).map(Self)
    }
}

impl fmt::Debug for BlindedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlindedToken({})", self.encode_base64())
    }
}

/// `Z = k·M` as returned by the issuer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignedToken(pub(crate) ProjectivePoint);

impl SignedToken {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_point(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        decode_point(bytes).map(Self)
    }
}

impl fmt::Debug for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedToken({})", self.encode_base64())
    }
}

/// A spendable credential `{t, W = k·H(t)}`.
#[derive(Clone, PartialEq, Eq)]
pub struct UnblindedToken {
    t: TokenPreimage,
    w: ProjectivePoint,
}

impl UnblindedToken {
    pub fn preimage(&self) -> &TokenPreimage {
        &self.t
    }

    pub fn derive_verification_key(&self) -> VerificationKey {
        let mut h = Sha256::new();
        h.update(VERIFICATION_KEY_DST);
        h.update(self.t.as_bytes());
        h.update(encode_point(&self.w));
        VerificationKey(h.finalize().into())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(UNBLINDED_TOKEN_LEN);
        out.extend_from_slice(self.t.as_bytes());
        out.extend_from_slice(&encode_point(&self.w));
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != UNBLINDED_TOKEN_LEN {
            return Err(Error::Decode);
        }
        let t = TokenPreimage::from_bytes(&bytes[..TOKEN_PREIMAGE_LEN])?;
        let w = decode_point(&bytes[TOKEN_PREIMAGE_LEN..])?;
        Ok(Self { t, w })
    }
}

impl fmt::Debug for UnblindedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnblindedToken(..)")
    }
}

// ─── Issuer keys ─────────────────────────────────────────────────────────

/// Issuer public key `Y = k·G`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub(crate) ProjectivePoint);

impl PublicKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_point(&self.0)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        decode_point(bytes).map(Self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.encode_base64())
    }
}

/// Issuer secret. Lives on the ledger; the client only needs it in tests.
#[derive(Clone)]
pub struct SigningKey {
    k: Scalar,
    public_key: PublicKey,
}

impl SigningKey {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_scalar(random_nonzero_scalar(rng))
    }

    /// Reduces big-endian bytes modulo the group order; zero is rejected.
    pub fn from_secret_bytes(sk_bytes: [u8; 32]) -> Result<Self, Error> {
        scalar_from_be32(sk_bytes).map(Self::from_scalar)
    }

    fn from_scalar(k: Scalar) -> Self {
        let public_key = PublicKey(ProjectivePoint::GENERATOR * k);
        Self { k, public_key }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub(crate) fn scalar(&self) -> &Scalar {
        &self.k
    }

    pub fn sign(&self, blinded: &BlindedToken) -> SignedToken {
        SignedToken(blinded.0 * self.k)
    }

    /// Recomputes `W = k·H(t)` from a revealed pre-image.
    pub fn rederive_unblinded_token(&self, t: &TokenPreimage) -> Result<UnblindedToken, Error> {
        Ok(UnblindedToken {
            t: t.clone(),
            w: t.to_curve()? * self.k,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.k.to_bytes().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        decode_scalar(bytes).map(Self::from_scalar)
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        self.k.zeroize();
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

// ─── Redemption MAC ──────────────────────────────────────────────────────

/// Shared MAC key both sides derive from an unblinded token.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VerificationKey([u8; 32]);

impl VerificationKey {
    pub fn sign(&self, message: &[u8]) -> Result<VerificationSignature, Error> {
        let mut mac = HmacSha256::new_from_slice(&self.0).map_err(|_| Error::Internal)?;
        mac.update(message);
        Ok(VerificationSignature(mac.finalize().into_bytes().into()))
    }

    /// Constant-time check of `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &VerificationSignature) -> bool {
        match self.sign(message) {
            Ok(expected) => bool::from(expected.0.ct_eq(&signature.0)),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VerificationKey(..)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VerificationSignature([u8; VERIFICATION_SIGNATURE_LEN]);

impl VerificationSignature {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let arr: [u8; VERIFICATION_SIGNATURE_LEN] = bytes.try_into().map_err(|_| Error::Decode)?;
        Ok(Self(arr))
    }
}

base64_codec!(
    TokenPreimage,
    Token,
    BlindedToken,
    SignedToken,
    UnblindedToken,
    PublicKey,
    SigningKey,
    VerificationSignature,
);
