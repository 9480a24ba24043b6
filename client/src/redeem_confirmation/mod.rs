// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Exchanging a confirmation with the ledger.
//!
//! Redemption is stateless: the outcome carries the (possibly updated)
//! confirmation back to the caller, which owns queueing and retries.

use tracing::warn;

use crate::confirmation::{self, ConfirmationInfo};
use crate::http::UrlLoader;
use crate::issuers::IssuerRegistry;
use crate::ledger::LedgerServer;
use crate::tokens::UnblindedPaymentTokenInfo;

mod non_reward;
mod opted_in;

pub use non_reward::redeem_non_reward;
pub use opted_in::redeem_opted_in;

/// Borrowed collaborators for one redemption.
#[derive(Clone, Copy)]
pub struct RedeemContext<'a> {
    pub loader: &'a dyn UrlLoader,
    pub server: &'a LedgerServer,
    pub issuers: &'a dyn IssuerRegistry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RedeemOutcome {
    Redeemed {
        confirmation: ConfirmationInfo,
        payment_token: Option<UnblindedPaymentTokenInfo>,
    },
    Failed {
        confirmation: ConfirmationInfo,
        should_retry: bool,
        should_backoff: bool,
    },
}

impl RedeemOutcome {
    pub fn confirmation(&self) -> &ConfirmationInfo {
        match self {
            RedeemOutcome::Redeemed { confirmation, .. } | RedeemOutcome::Failed { confirmation, .. } => {
                confirmation
            }
        }
    }

    pub fn is_redeemed(&self) -> bool {
        matches!(self, RedeemOutcome::Redeemed { .. })
    }
}

/// How a failed step should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Failure {
    pub should_retry: bool,
    pub should_backoff: bool,
}

impl Failure {
    pub const RETRY: Failure = Failure {
        should_retry: true,
        should_backoff: true,
    };
    pub const RETRY_NOW: Failure = Failure {
        should_retry: true,
        should_backoff: false,
    };
    pub const PERMANENT: Failure = Failure {
        should_retry: false,
        should_backoff: false,
    };

    pub fn into_outcome(self, confirmation: ConfirmationInfo) -> RedeemOutcome {
        RedeemOutcome::Failed {
            confirmation,
            should_retry: self.should_retry,
            should_backoff: self.should_backoff,
        }
    }
}

/// Dispatches on whether the confirmation carries opted-in data.
pub async fn redeem(ctx: RedeemContext<'_>, confirmation: ConfirmationInfo) -> RedeemOutcome {
    if !confirmation::is_valid(&confirmation) {
        warn!(
            transaction_id = %confirmation.transaction_id,
            "refusing to redeem invalid confirmation"
        );
        return Failure::PERMANENT.into_outcome(confirmation);
    }

    if confirmation.is_opted_in() {
        redeem_opted_in(ctx, confirmation).await
    } else {
        redeem_non_reward(ctx, confirmation).await
    }
}
