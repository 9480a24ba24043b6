// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Ad events and the confirmation records built from them.

use adpass_crypto::{BlindedToken, Token};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::tokens::UnblindedTokenInfo;

mod builder;
mod user_data;

pub use builder::{
    build_confirmation, build_payload, create_opted_in_credential, is_valid, rebuild_dynamic_user_data,
    BuildError, Credential, RewardSources,
};
pub use user_data::{DefaultUserDataBuilder, UserDataBuilder, UserDataInfo};

macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub enum $name {
            #[default]
            #[serde(rename = "")]
            Undefined,
            $(#[serde(rename = $wire)] $variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $name::Undefined => "",
                    $($name::$variant => $wire,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {:?}", stringify!($name), other)),
                }
            }
        }
    };
}

wire_enum!(ConfirmationType {
    Clicked => "click",
    Dismissed => "dismiss",
    Viewed => "view",
    Served => "served",
    Transferred => "landed",
    Flagged => "flag",
    Upvoted => "upvote",
    Downvoted => "downvote",
    Conversion => "conversion",
});

wire_enum!(AdType {
    AdNotification => "ad_notification",
    NewTabPageAd => "new_tab_page_ad",
    PromotedContentAd => "promoted_content_ad",
    InlineContentAd => "inline_content_ad",
    SearchResultAd => "search_result_ad",
});

/// An ad event the user earned (or would have earned) credit for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub id: String,
    pub creative_instance_id: String,
    pub ad_type: AdType,
    pub confirmation_type: ConfirmationType,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

impl TransactionInfo {
    pub fn new(creative_instance_id: &str, ad_type: AdType, confirmation_type: ConfirmationType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            creative_instance_id: creative_instance_id.to_string(),
            ad_type,
            confirmation_type,
            value: 0.0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationInfo {
    pub transaction_id: String,
    pub creative_instance_id: String,
    #[serde(rename = "type")]
    pub confirmation_type: ConfirmationType,
    pub ad_type: AdType,
    pub created_at: Option<DateTime<Utc>>,
    /// The create-confirmation step already succeeded.
    #[serde(default)]
    pub was_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opted_in: Option<OptedInInfo>,
}

impl ConfirmationInfo {
    /// Opted-in confirmations spend a token and earn a payment token.
    pub fn is_opted_in(&self) -> bool {
        self.opted_in.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptedInInfo {
    /// Fresh token whose blinded form asks for the payment token.
    pub token: Token,
    pub blinded_token: BlindedToken,
    /// The confirmation token spent on this confirmation.
    pub unblinded_token: UnblindedTokenInfo,
    pub user_data: UserDataInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_base64url: Option<String>,
}
