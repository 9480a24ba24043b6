//! Blind tokens over P-256 with batched DLEQ proofs, built on RustCrypto.
pub mod core;
pub mod dleq;
pub use self::core::{
    BlindedToken, PublicKey, SignedToken, SigningKey, Token, TokenPreimage, UnblindedToken,
    VerificationKey, VerificationSignature,
};
pub use self::dleq::BatchDleqProof;
