// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! Create confirmation, then fetch and unblind its payment token.
//!
//! `was_created` makes the two steps resumable: a retried confirmation that
//! was already created goes straight to the fetch.

use adpass_common::api::PaymentTokenResp;
use reqwest::{Method, StatusCode};
use std::slice;
use tracing::{debug, info, warn};

use super::{Failure, RedeemContext, RedeemOutcome};
use crate::confirmation::{build_payload, ConfirmationInfo};
use crate::http::UrlRequest;
use crate::issuers::IssuerType;
use crate::response::{parse_json, required, ResponseError, SignedTokenBatch};
use crate::tokens::UnblindedPaymentTokenInfo;

pub async fn redeem_opted_in(ctx: RedeemContext<'_>, mut confirmation: ConfirmationInfo) -> RedeemOutcome {
    if !ctx.issuers.has_issuers().await {
        warn!(transaction_id = %confirmation.transaction_id, "no issuers, cannot redeem");
        return Failure::RETRY.into_outcome(confirmation);
    }

    if !confirmation.was_created {
        if let Err(failure) = create_confirmation(ctx, &confirmation).await {
            return failure.into_outcome(confirmation);
        }
        confirmation.was_created = true;
    }

    match fetch_payment_token(ctx, &confirmation).await {
        Ok(payment_token) => {
            info!(
                transaction_id = %confirmation.transaction_id,
                creative_instance_id = %confirmation.creative_instance_id,
                confirmation_type = %confirmation.confirmation_type,
                ad_type = %confirmation.ad_type,
                "redeemed opted-in confirmation"
            );
            RedeemOutcome::Redeemed {
                confirmation,
                payment_token: Some(payment_token),
            }
        }
        Err(FetchFailure::NotFound) => {
            // The ledger lost the confirmation; start over from create.
            confirmation.was_created = false;
            Failure::RETRY_NOW.into_outcome(confirmation)
        }
        Err(FetchFailure::Failed(failure)) => failure.into_outcome(confirmation),
    }
}

async fn create_confirmation(ctx: RedeemContext<'_>, confirmation: &ConfirmationInfo) -> Result<(), Failure> {
    let transaction_id = &confirmation.transaction_id;
    let credential = confirmation
        .opted_in
        .as_ref()
        .and_then(|o| o.credential_base64url.as_deref())
        .ok_or(Failure::PERMANENT)?;
    let payload = build_payload(confirmation).map_err(|e| {
        warn!(%transaction_id, error = %e, "failed to build payload");
        Failure::PERMANENT
    })?;

    let url = ctx.server.create_opted_in_confirmation(transaction_id, credential);
    let resp = ctx
        .loader
        .load(UrlRequest::json(Method::POST, url, payload))
        .await
        .map_err(|e| {
            warn!(%transaction_id, error = %format!("{:#}", e), "create confirmation request failed");
            Failure::RETRY
        })?;

    match resp.status {
        StatusCode::CREATED => {
            debug!(%transaction_id, "confirmation created");
            Ok(())
        }
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT => {
            warn!(%transaction_id, status = resp.status.as_u16(), "confirmation rejected");
            Err(Failure::PERMANENT)
        }
        status => {
            warn!(%transaction_id, status = status.as_u16(), "create confirmation failed");
            Err(Failure::RETRY)
        }
    }
}

enum FetchFailure {
    NotFound,
    Failed(Failure),
}

impl From<Failure> for FetchFailure {
    fn from(failure: Failure) -> Self {
        FetchFailure::Failed(failure)
    }
}

async fn fetch_payment_token(
    ctx: RedeemContext<'_>,
    confirmation: &ConfirmationInfo,
) -> Result<UnblindedPaymentTokenInfo, FetchFailure> {
    let transaction_id = &confirmation.transaction_id;
    let opted_in = confirmation.opted_in.as_ref().ok_or(Failure::PERMANENT)?;

    let url = ctx.server.fetch_payment_token(transaction_id);
    let resp = ctx.loader.load(UrlRequest::get(url)).await.map_err(|e| {
        warn!(%transaction_id, error = %format!("{:#}", e), "fetch payment token request failed");
        Failure::RETRY
    })?;

    match resp.status {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND => {
            warn!(%transaction_id, "confirmation not found, will recreate");
            return Err(FetchFailure::NotFound);
        }
        StatusCode::BAD_REQUEST => {
            warn!(%transaction_id, "payment token credential rejected");
            return Err(Failure::PERMANENT.into());
        }
        StatusCode::ACCEPTED => {
            debug!(%transaction_id, "payment token not ready");
            return Err(Failure::RETRY_NOW.into());
        }
        status => {
            warn!(%transaction_id, status = status.as_u16(), "fetch payment token failed");
            return Err(Failure::RETRY.into());
        }
    }

    let body: PaymentTokenResp = parse_json(&resp.body).map_err(|e| {
        warn!(%transaction_id, error = %e, "unparsable payment token response");
        Failure::RETRY
    })?;
    let batch = decode_payment_token(transaction_id, body).map_err(|e| {
        warn!(%transaction_id, error = %e, "malformed payment token response");
        Failure::PERMANENT
    })?;

    if !ctx
        .issuers
        .public_key_exists(IssuerType::Payments, &batch.public_key_base64)
        .await
    {
        warn!(%transaction_id, "payment token signed by an unknown issuer key");
        return Err(Failure::RETRY.into());
    }

    let mut unblinded = batch
        .batch_proof
        .verify_and_unblind(
            slice::from_ref(&opted_in.token),
            slice::from_ref(&opted_in.blinded_token),
            &batch.signed_tokens,
            &batch.public_key,
        )
        .map_err(|e| {
            warn!(%transaction_id, error = %e, "payment token proof rejected");
            Failure::PERMANENT
        })?;
    let value = unblinded.pop().ok_or(Failure::PERMANENT)?;

    Ok(UnblindedPaymentTokenInfo {
        transaction_id: transaction_id.clone(),
        value,
        public_key: batch.public_key,
        confirmation_type: confirmation.confirmation_type,
        ad_type: confirmation.ad_type,
    })
}

fn decode_payment_token(transaction_id: &str, body: PaymentTokenResp) -> Result<SignedTokenBatch, ResponseError> {
    let id = required(body.id, "id")?;
    if id != transaction_id {
        return Err(ResponseError::InvalidField("id"));
    }
    SignedTokenBatch::from_response(required(body.payment_token, "paymentToken")?)
}
