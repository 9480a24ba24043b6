// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

use adpass_crypto::Token;
use rand::rngs::OsRng;

/// Source of fresh token pre-images for blinding.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self, count: usize) -> Vec<Token>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn generate(&self, count: usize) -> Vec<Token> {
        let mut rng = OsRng;
        (0..count).map(|_| Token::random(&mut rng)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_distinct_tokens() {
        let tokens = RandomTokenGenerator.generate(5);
        assert_eq!(tokens.len(), 5);
        for (i, a) in tokens.iter().enumerate() {
            for b in &tokens[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(RandomTokenGenerator.generate(0).is_empty());
    }
}
