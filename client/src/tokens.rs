// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Stored token records.

use adpass_crypto::{PublicKey, UnblindedToken};
use serde::{Deserialize, Serialize};

use crate::confirmation::{AdType, ConfirmationType};
use crate::wallet::WalletInfo;

/// A spendable confirmation token, signed by the wallet that acquired it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnblindedTokenInfo {
    pub value: UnblindedToken,
    pub public_key: PublicKey,
    /// Base64 wallet signature over `value.encode_base64()`
    pub signature: String,
}

impl UnblindedTokenInfo {
    pub fn new(
        value: UnblindedToken,
        public_key: PublicKey,
        wallet: &WalletInfo,
    ) -> Result<Self, adpass_crypto::Error> {
        let signature = wallet.sign(value.encode_base64().as_bytes())?;
        Ok(Self {
            value,
            public_key,
            signature,
        })
    }

    pub fn is_signed_by(&self, wallet: &WalletInfo) -> bool {
        wallet.verify(self.value.encode_base64().as_bytes(), &self.signature)
    }
}

/// Earned by a redeemed confirmation; cashed out in a payment batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnblindedPaymentTokenInfo {
    pub transaction_id: String,
    pub value: UnblindedToken,
    pub public_key: PublicKey,
    pub confirmation_type: ConfirmationType,
    pub ad_type: AdType,
}
