// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

/// Discrete Log Equality (DLEQ) proofs for P-256
///
/// Prove that the same secret 'k' links two point pairs:
///   Y = k·G  and  Z = k·M
/// without revealing 'k'. A batch proof folds every (M_i, Z_i) pair of an
/// issuance into one composite pair with hash-derived weights.
use core::fmt;
use p256::{
    elliptic_curve::{ops::Reduce, sec1::ToEncodedPoint, Field},
    AffinePoint, FieldBytes, ProjectivePoint, Scalar,
};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::core::{encode_point, BlindedToken, PublicKey, SignedToken, SigningKey, Token, UnblindedToken};
use crate::Error;

pub const PROOF_LEN: usize = 64;

/// A DLEQ proof (challenge `c` and response `s`).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DleqProof {
    /// Fiat-Shamir challenge scalar.
    pub c: Scalar,
    /// Schnorr response scalar.
    pub s: Scalar,
}

impl fmt::Debug for DleqProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DleqProof {{ c: 0x{}, s: 0x{} }}",
            hex32(&self.c),
            hex32(&self.s)
        )
    }
}

/// Domain separation tag for the transcript.
const DLEQ_DST: &[u8] = b"DLEQ-P256-v1";
/// Domain separation tag for the batch weights.
const BATCH_DST: &[u8] = b"adpass-batch-dleq-v1";

/// Compute Fiat-Shamir challenge as a scalar: c = H(bytes) mod n.
fn challenge_scalar(
    g: &AffinePoint,
    y: &AffinePoint,
    a: &AffinePoint,
    b: &AffinePoint,
    t1: &AffinePoint,
    t2: &AffinePoint,
    dst: &[u8],
) -> Scalar {
    let mut hasher = Sha256::new();

    hasher.update(u32::try_from(dst.len()).unwrap_or(0).to_be_bytes());
    hasher.update(dst);

    for p in [g, y, a, b, t1, t2] {
        let enc = p.to_encoded_point(true);
        hasher.update(enc.as_bytes());
    }

    Scalar::reduce_bytes(&hasher.finalize())
}

fn full_dst(dst: Option<&[u8]>) -> Vec<u8> {
    let mut full = Vec::with_capacity(DLEQ_DST.len() + dst.map_or(0, |d| d.len()));
    full.extend_from_slice(DLEQ_DST);
    if let Some(extra) = dst {
        full.extend_from_slice(extra);
    }
    full
}

/// Create a DLEQ proof that 'y = k·g' and 'b = k·a' for the same 'k'.
pub fn prove<R: RngCore + CryptoRng>(
    k: &Scalar,
    g: &AffinePoint,
    y: &AffinePoint,
    a: &AffinePoint,
    b: &AffinePoint,
    rng: &mut R,
    dst: Option<&[u8]>,
) -> DleqProof {
    // Ephemeral nonce
    let r = Scalar::random(rng);
    let t1 = (ProjectivePoint::from(*g) * r).to_affine();
    let t2 = (ProjectivePoint::from(*a) * r).to_affine();

    let c = challenge_scalar(g, y, a, b, &t1, &t2, &full_dst(dst));
    let s = r + c * *k;

    DleqProof { c, s }
}

/// Verify a DLEQ proof.
pub fn verify(
    g: &AffinePoint,
    y: &AffinePoint,
    a: &AffinePoint,
    b: &AffinePoint,
    proof: &DleqProof,
    dst: Option<&[u8]>,
) -> bool {
    let s_g = ProjectivePoint::from(*g) * proof.s;
    let c_y = ProjectivePoint::from(*y) * proof.c;
    let t1_prime = (s_g - c_y).to_affine();

    let s_a = ProjectivePoint::from(*a) * proof.s;
    let c_b = ProjectivePoint::from(*b) * proof.c;
    let t2_prime = (s_a - c_b).to_affine();

    let c_check = challenge_scalar(g, y, a, b, &t1_prime, &t2_prime, &full_dst(dst));

    bool::from(c_check.to_bytes().ct_eq(&proof.c.to_bytes()))
}

/// Serialize proof to 64 bytes.
pub fn encode_proof(proof: &DleqProof) -> [u8; PROOF_LEN] {
    let mut out = [0u8; PROOF_LEN];
    out[..32].copy_from_slice(&proof.c.to_bytes());
    out[32..].copy_from_slice(&proof.s.to_bytes());
    out
}

/// Deserialize proof from bytes.
pub fn decode_proof(bytes: &[u8]) -> Result<DleqProof, Error> {
    if bytes.len() != PROOF_LEN {
        return Err(Error::Decode);
    }
    let mut c_bytes = [0u8; 32];
    let mut s_bytes = [0u8; 32];
    c_bytes.copy_from_slice(&bytes[..32]);
    s_bytes.copy_from_slice(&bytes[32..]);
    let c = Scalar::reduce_bytes(&FieldBytes::from(c_bytes));
    let s = Scalar::reduce_bytes(&FieldBytes::from(s_bytes));
    Ok(DleqProof { c, s })
}

fn hex32(x: &Scalar) -> String {
    let b = x.to_bytes();
    b.iter().map(|byte| format!("{:02x}", byte)).collect()
}

// ─── Batch proofs ────────────────────────────────────────────────────────

/// Weights `c_i = H(H(Y || M_1..M_n || Z_1..Z_n) || i)`.
fn batch_weights(public_key: &PublicKey, blinded: &[BlindedToken], signed: &[SignedToken]) -> Vec<Scalar> {
    let mut seed = Sha256::new();
    seed.update(BATCH_DST);
    seed.update(encode_point(&ProjectivePoint::GENERATOR));
    seed.update(encode_point(&public_key.0));
    for m in blinded {
        seed.update(encode_point(&m.0));
    }
    for z in signed {
        seed.update(encode_point(&z.0));
    }
    let seed = seed.finalize();

    (0..blinded.len() as u64)
        .map(|i| {
            let mut h = Sha256::new();
            h.update(seed);
            h.update(i.to_be_bytes());
            Scalar::reduce_bytes(&h.finalize())
        })
        .collect()
}

fn composite(
    public_key: &PublicKey,
    blinded: &[BlindedToken],
    signed: &[SignedToken],
) -> Result<(AffinePoint, AffinePoint), Error> {
    if blinded.is_empty() || blinded.len() != signed.len() {
        return Err(Error::LengthMismatch);
    }
    let weights = batch_weights(public_key, blinded, signed);
    let mut m = ProjectivePoint::IDENTITY;
    let mut z = ProjectivePoint::IDENTITY;
    for ((c, bt), st) in weights.iter().zip(blinded).zip(signed) {
        m += bt.0 * c;
        z += st.0 * c;
    }
    Ok((m.to_affine(), z.to_affine()))
}

/// One proof that every signed token in a batch was produced with the
/// secret behind `public_key`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BatchDleqProof(DleqProof);

impl BatchDleqProof {
    pub fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        blinded: &[BlindedToken],
        signed: &[SignedToken],
        signing_key: &SigningKey,
    ) -> Result<Self, Error> {
        let public_key = signing_key.public_key();
        let (m, z) = composite(&public_key, blinded, signed)?;
        let proof = prove(
            signing_key.scalar(),
            &AffinePoint::GENERATOR,
            &public_key.0.to_affine(),
            &m,
            &z,
            rng,
            Some(BATCH_DST),
        );
        Ok(Self(proof))
    }

    pub fn verify(
        &self,
        blinded: &[BlindedToken],
        signed: &[SignedToken],
        public_key: &PublicKey,
    ) -> Result<(), Error> {
        let (m, z) = composite(public_key, blinded, signed)?;
        if verify(
            &AffinePoint::GENERATOR,
            &public_key.0.to_affine(),
            &m,
            &z,
            &self.0,
            Some(BATCH_DST),
        ) {
            Ok(())
        } else {
            Err(Error::InvalidProof)
        }
    }

    /// Checks the proof, then unblinds `signed[i]` with `tokens[i]`.
    pub fn verify_and_unblind(
        &self,
        tokens: &[Token],
        blinded: &[BlindedToken],
        signed: &[SignedToken],
        public_key: &PublicKey,
    ) -> Result<Vec<UnblindedToken>, Error> {
        if tokens.len() != blinded.len() {
            return Err(Error::LengthMismatch);
        }
        self.verify(blinded, signed, public_key)?;
        tokens
            .iter()
            .zip(signed)
            .map(|(token, st)| token.unblind(st))
            .collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_proof(&self.0).to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        decode_proof(bytes).map(Self)
    }

    pub fn encode_base64(&self) -> String {
        use base64ct::{Base64, Encoding};
        Base64::encode_string(&self.to_bytes())
    }

    pub fn decode_base64(encoded: &str) -> Result<Self, Error> {
        use base64ct::{Base64, Encoding};
        let bytes = Base64::decode_vec(encoded).map_err(|_| Error::Decode)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::{ProjectivePoint, Scalar};
    use rand_core::OsRng;

    fn issue(
        n: usize,
        key: &SigningKey,
    ) -> (Vec<Token>, Vec<BlindedToken>, Vec<SignedToken>, BatchDleqProof) {
        let mut rng = OsRng;
        let tokens: Vec<Token> = (0..n).map(|_| Token::random(&mut rng)).collect();
        let blinded: Vec<BlindedToken> = tokens.iter().map(|t| t.blind().unwrap()).collect();
        let signed: Vec<SignedToken> = blinded.iter().map(|b| key.sign(b)).collect();
        let proof = BatchDleqProof::new(&mut rng, &blinded, &signed, key).unwrap();
        (tokens, blinded, signed, proof)
    }

    #[test]
    fn round_trip_proof() {
        let mut rng = OsRng;
        let k = Scalar::random(&mut rng);
        let g = AffinePoint::GENERATOR;
        let a = (ProjectivePoint::GENERATOR * Scalar::random(&mut rng)).to_affine();
        let y = (ProjectivePoint::from(g) * k).to_affine();
        let b = (ProjectivePoint::from(a) * k).to_affine();

        let proof = prove(&k, &g, &y, &a, &b, &mut rng, Some(b"test-dst"));
        assert!(verify(&g, &y, &a, &b, &proof, Some(b"test-dst")));

        let dec = decode_proof(&encode_proof(&proof)).unwrap();
        assert_eq!(proof, dec);
    }

    #[test]
    fn test_proof_rejection_patterns() {
        let mut rng = OsRng;
        let k = Scalar::random(&mut rng);
        let g = AffinePoint::GENERATOR;
        let a = (ProjectivePoint::GENERATOR * Scalar::random(&mut rng)).to_affine();
        let y = (ProjectivePoint::from(g) * k).to_affine();
        let b = (ProjectivePoint::from(a) * k).to_affine();

        let proof = prove(&k, &g, &y, &a, &b, &mut rng, Some(b"test"));
        assert!(verify(&g, &y, &a, &b, &proof, Some(b"test")));

        let bad_c = DleqProof { c: proof.c + Scalar::ONE, s: proof.s };
        assert!(!verify(&g, &y, &a, &b, &bad_c, Some(b"test")));

        let bad_s = DleqProof { c: proof.c, s: proof.s + Scalar::ONE };
        assert!(!verify(&g, &y, &a, &b, &bad_s, Some(b"test")));

        assert!(!verify(&g, &y, &a, &b, &proof, Some(b"wrong-dst")));

        let zero_c = DleqProof { c: Scalar::ZERO, s: proof.s };
        assert!(!verify(&g, &y, &a, &b, &zero_c, Some(b"test")));
    }

    #[test]
    fn test_batch_verify_and_unblind() {
        let key = SigningKey::random(&mut OsRng);
        let (tokens, blinded, signed, proof) = issue(5, &key);

        let unblinded = proof
            .verify_and_unblind(&tokens, &blinded, &signed, &key.public_key())
            .unwrap();
        assert_eq!(unblinded.len(), 5);
        for (token, ut) in tokens.iter().zip(&unblinded) {
            assert_eq!(ut, &key.rederive_unblinded_token(token.preimage()).unwrap());
        }
    }

    #[test]
    fn test_batch_rejects_wrong_key() {
        let key = SigningKey::random(&mut OsRng);
        let other = SigningKey::random(&mut OsRng);
        let (tokens, blinded, signed, proof) = issue(3, &key);

        let result = proof.verify_and_unblind(&tokens, &blinded, &signed, &other.public_key());
        assert!(matches!(result, Err(Error::InvalidProof)));
    }

    #[test]
    fn test_batch_rejects_substituted_signature() {
        let key = SigningKey::random(&mut OsRng);
        let other = SigningKey::random(&mut OsRng);
        let (tokens, blinded, mut signed, proof) = issue(3, &key);

        signed[1] = other.sign(&blinded[1]);
        let result = proof.verify_and_unblind(&tokens, &blinded, &signed, &key.public_key());
        assert!(matches!(result, Err(Error::InvalidProof)));
    }

    #[test]
    fn test_batch_rejects_tampered_proof_bytes() {
        let key = SigningKey::random(&mut OsRng);
        let (tokens, blinded, signed, proof) = issue(2, &key);

        let mut bytes = proof.to_bytes();
        bytes[40] ^= 0x01;
        let tampered = BatchDleqProof::from_bytes(&bytes).unwrap();
        assert!(tampered
            .verify_and_unblind(&tokens, &blinded, &signed, &key.public_key())
            .is_err());
    }

    #[test]
    fn test_batch_length_mismatch() {
        let key = SigningKey::random(&mut OsRng);
        let (tokens, blinded, signed, proof) = issue(3, &key);

        assert!(matches!(
            proof.verify(&blinded[..2], &signed, &key.public_key()),
            Err(Error::LengthMismatch)
        ));
        assert!(matches!(
            proof.verify_and_unblind(&tokens[..1], &blinded, &signed, &key.public_key()),
            Err(Error::LengthMismatch)
        ));
        assert!(matches!(
            BatchDleqProof::new(&mut OsRng, &[], &[], &key),
            Err(Error::LengthMismatch)
        ));
    }
}
