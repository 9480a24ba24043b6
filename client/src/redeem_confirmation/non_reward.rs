// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

use reqwest::{Method, StatusCode};
use tracing::{info, warn};

use super::{Failure, RedeemContext, RedeemOutcome};
use crate::confirmation::{build_payload, ConfirmationInfo};
use crate::http::UrlRequest;

/// Reports the event without spending a token; nothing is earned.
pub async fn redeem_non_reward(ctx: RedeemContext<'_>, mut confirmation: ConfirmationInfo) -> RedeemOutcome {
    if confirmation.was_created {
        return RedeemOutcome::Redeemed {
            confirmation,
            payment_token: None,
        };
    }

    let payload = match build_payload(&confirmation) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(transaction_id = %confirmation.transaction_id, error = %e, "failed to build payload");
            return Failure::PERMANENT.into_outcome(confirmation);
        }
    };

    let url = ctx.server.create_non_reward_confirmation(&confirmation.transaction_id);
    let resp = match ctx.loader.load(UrlRequest::json(Method::POST, url, payload)).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(
                transaction_id = %confirmation.transaction_id,
                error = %format!("{:#}", e),
                "create confirmation request failed"
            );
            return Failure::RETRY.into_outcome(confirmation);
        }
    };

    match resp.status {
        StatusCode::CREATED => {
            info!(
                transaction_id = %confirmation.transaction_id,
                creative_instance_id = %confirmation.creative_instance_id,
                confirmation_type = %confirmation.confirmation_type,
                ad_type = %confirmation.ad_type,
                "created non-reward confirmation"
            );
            confirmation.was_created = true;
            RedeemOutcome::Redeemed {
                confirmation,
                payment_token: None,
            }
        }
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT => {
            warn!(transaction_id = %confirmation.transaction_id, status = resp.status.as_u16(), "confirmation rejected");
            Failure::PERMANENT.into_outcome(confirmation)
        }
        status => {
            warn!(transaction_id = %confirmation.transaction_id, status = status.as_u16(), "create confirmation failed");
            Failure::RETRY.into_outcome(confirmation)
        }
    }
}
