// SPDX-License-Identifier: Apache-2.0 OR MIT
// Integration test: Batch Payment Token Redemption
//
// Payment tokens earned by confirmations are cashed out in one PUT after
// the redemption delay, then the next batch is scheduled.

use std::time::Duration;

use adpass_client::confirmation::{AdType, ConfirmationType, TransactionInfo};
use adpass_client::testing::TestAccount;
use adpass_client::{Account, AccountEvent, AccountSettings, RETRY_DELAY};
use adpass_common::api::RedeemPaymentTokensReq;
use chrono::Utc;

const INTERVAL: Duration = Duration::from_secs(25 * 60);

fn settings() -> AccountSettings {
    AccountSettings {
        redemption_interval: INTERVAL,
        randomize_redemption: false,
        ..AccountSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_redemption_empties_pool_and_reschedules() {
    let fixture = TestAccount::new().await;
    fixture.seed_payment_tokens(2).await;
    fixture.ledger.serve_payment_redemption(&fixture.loader, 200);
    let observer = fixture.observe();
    let account = Account::new(fixture.ctx.clone(), settings());

    account.maybe_redeem_after_delay().await;
    let first_at = fixture.ctx.token_pool.next_token_redemption_at().await.unwrap();
    assert!(first_at > Utc::now());

    tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;

    let pool = &fixture.ctx.token_pool;
    assert_eq!(pool.unblinded_payment_token_count().await, 0);

    let puts = fixture.loader.requests_to(&fixture.ledger.redeem_payment_tokens_path());
    assert_eq!(puts.len(), 1);
    let body: RedeemPaymentTokensReq = serde_json::from_str(puts[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(body.payment_credentials.len(), 2);
    assert_eq!(
        body.payload,
        serde_json::json!({ "paymentId": fixture.wallet.payment_id }).to_string()
    );

    let events = observer.events();
    assert!(matches!(
        events.as_slice(),
        [
            AccountEvent::DidScheduleNextUnblindedPaymentTokensRedemption { .. },
            AccountEvent::DidRedeemUnblindedPaymentTokens { count: 2 },
            AccountEvent::DidScheduleNextUnblindedPaymentTokensRedemption { .. },
        ]
    ));
    let next_at = pool.next_token_redemption_at().await.unwrap();
    assert!(next_at >= first_at);
    assert!(next_at > Utc::now());
}

#[tokio::test(start_paused = true)]
async fn test_failed_redemption_keeps_tokens_and_retries() {
    let fixture = TestAccount::new().await;
    fixture.seed_payment_tokens(3).await;
    fixture.ledger.serve_payment_redemption(&fixture.loader, 500);
    let observer = fixture.observe();
    let account = Account::new(fixture.ctx.clone(), settings());

    account.maybe_redeem_after_delay().await;
    tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;

    assert_eq!(fixture.ctx.token_pool.unblinded_payment_token_count().await, 3);
    assert_eq!(
        observer.count(|e| matches!(e, AccountEvent::FailedToRedeemUnblindedPaymentTokens)),
        1
    );

    fixture.ledger.serve_payment_redemption(&fixture.loader, 200);
    tokio::time::sleep(RETRY_DELAY + Duration::from_secs(1)).await;

    assert_eq!(fixture.ctx.token_pool.unblinded_payment_token_count().await, 0);
    assert_eq!(
        observer.count(|e| matches!(e, AccountEvent::DidRetryRedeemingUnblindedPaymentTokens)),
        1
    );
    assert_eq!(
        observer.count(|e| matches!(e, AccountEvent::DidRedeemUnblindedPaymentTokens { count: 3 })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_overdue_redemption_runs_shortly_after_start() {
    let fixture = TestAccount::new().await;
    fixture.seed_payment_tokens(1).await;
    fixture
        .ctx
        .token_pool
        .set_next_token_redemption_at(Utc::now() - chrono::Duration::hours(3))
        .await
        .unwrap();
    fixture.ledger.serve_payment_redemption(&fixture.loader, 200);
    let account = Account::new(fixture.ctx.clone(), settings());

    account.maybe_redeem_after_delay().await;
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(fixture.ctx.token_pool.unblinded_payment_token_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_earned_tokens_are_redeemed() {
    let fixture = TestAccount::new().await;
    fixture.seed_unblinded_tokens(30).await;
    fixture.ledger.serve_confirmations(&fixture.loader);
    fixture.ledger.serve_payment_redemption(&fixture.loader, 200);
    let account = Account::new(fixture.ctx.clone(), settings());

    for _ in 0..2 {
        let transaction = TransactionInfo::new(
            "546fe7b0-5047-4f28-a11c-81f14edcf0f6",
            AdType::NewTabPageAd,
            ConfirmationType::Viewed,
        );
        assert!(account.confirm(&transaction).await.unwrap().is_redeemed());
    }
    assert_eq!(fixture.ctx.token_pool.unblinded_payment_token_count().await, 2);

    account.maybe_redeem_after_delay().await;
    tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;

    let puts = fixture.loader.requests_to(&fixture.ledger.redeem_payment_tokens_path());
    assert_eq!(puts.len(), 1);
    let body: serde_json::Value = serde_json::from_str(puts[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(body["totals"][0]["adFormat"], "new_tab_page_ad");
    assert_eq!(body["totals"][0]["view"], 2);
    assert_eq!(fixture.ctx.token_pool.unblinded_payment_token_count().await, 0);
}
