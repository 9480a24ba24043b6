// SPDX-License-Identifier: Apache-2.0 OR MIT
// Integration test: Wallet Changes
//
// Switching to a different payment id discards tokens, queued
// confirmations and pending timers that belonged to the old wallet, also
// when the switch happens across a restart.

use std::time::Duration;

use adpass_client::confirmation::{AdType, ConfirmationType, TransactionInfo};
use adpass_client::testing::{TestAccount, PAYMENT_ID, RECOVERY_SEED};
use adpass_client::{Account, AccountEvent, AccountSettings, RETRY_DELAY};
use reqwest::Method;

const OTHER_PAYMENT_ID: &str = "c1b8a6b0-3f4e-4d6a-9f21-0a1b2c3d4e5f";

#[tokio::test(start_paused = true)]
async fn test_new_payment_id_discards_old_state() {
    let fixture = TestAccount::new().await;
    fixture.seed_unblinded_tokens(30).await;
    fixture.seed_payment_tokens(2).await;
    fixture.ledger.serve_confirmations(&fixture.loader);
    fixture
        .loader
        .enqueue_front_prefix(Method::POST, &fixture.ledger.confirmation_prefix(), 500, "");
    let account = Account::new(fixture.ctx.clone(), AccountSettings::default());
    account.set_wallet(PAYMENT_ID, RECOVERY_SEED).await.unwrap();

    let transaction = TransactionInfo::new(
        "546fe7b0-5047-4f28-a11c-81f14edcf0f6",
        AdType::AdNotification,
        ConfirmationType::Viewed,
    );
    assert!(!account.confirm(&transaction).await.unwrap().is_redeemed());
    account.maybe_redeem_after_delay().await;

    let observer = fixture.observe();
    let wallet = account.set_wallet(OTHER_PAYMENT_ID, RECOVERY_SEED).await.unwrap();
    assert_eq!(wallet.payment_id, OTHER_PAYMENT_ID);

    let pool = &fixture.ctx.token_pool;
    assert_eq!(pool.unblinded_token_count().await, 0);
    assert_eq!(pool.unblinded_payment_token_count().await, 0);
    assert_eq!(pool.failed_confirmation_count().await, 0);
    assert!(pool.next_token_redemption_at().await.is_none());

    // Timers armed for the old wallet never fire.
    fixture.loader.clear_requests();
    tokio::time::sleep(RETRY_DELAY * 4).await;
    assert!(fixture.loader.requests().is_empty());
    assert!(observer.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refill_after_wallet_change_uses_new_payment_id() {
    let fixture = TestAccount::new().await;
    fixture.seed_unblinded_tokens(30).await;
    let account = Account::new(fixture.ctx.clone(), AccountSettings::default());
    account.set_wallet(PAYMENT_ID, RECOVERY_SEED).await.unwrap();
    let wallet = account.set_wallet(OTHER_PAYMENT_ID, RECOVERY_SEED).await.unwrap();

    let mut ledger = fixture.ledger.clone();
    ledger.payment_id = OTHER_PAYMENT_ID.to_string();
    ledger.serve_refill(&fixture.loader);
    let observer = fixture.observe();

    account.maybe_refill().await;

    assert_eq!(observer.events(), vec![AccountEvent::DidRefillUnblindedTokens]);
    assert_eq!(fixture.ctx.token_pool.unblinded_token_count().await, 50);
    for token in fixture.ctx.token_pool.unblinded_tokens().await {
        assert!(token.is_signed_by(&wallet));
        assert!(!token.is_signed_by(&fixture.wallet));
    }
}

#[tokio::test(start_paused = true)]
async fn test_same_wallet_keeps_state() {
    let fixture = TestAccount::new().await;
    fixture.seed_unblinded_tokens(12).await;
    fixture.seed_payment_tokens(1).await;
    let account = Account::new(fixture.ctx.clone(), AccountSettings::default());

    account.set_wallet(PAYMENT_ID, RECOVERY_SEED).await.unwrap();
    account.set_wallet(PAYMENT_ID, RECOVERY_SEED).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.ctx.token_pool.unblinded_token_count().await, 12);
    assert_eq!(fixture.ctx.token_pool.unblinded_payment_token_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_new_payment_id_after_restart_discards_old_state() {
    let fixture = TestAccount::new().await;
    fixture.seed_unblinded_tokens(30).await;
    fixture.seed_payment_tokens(2).await;
    fixture.ledger.serve_confirmations(&fixture.loader);
    fixture
        .loader
        .enqueue_front_prefix(Method::POST, &fixture.ledger.confirmation_prefix(), 500, "");
    let first = Account::new(fixture.ctx.clone(), AccountSettings::default());
    first.set_wallet(PAYMENT_ID, RECOVERY_SEED).await.unwrap();
    let transaction = TransactionInfo::new(
        "546fe7b0-5047-4f28-a11c-81f14edcf0f6",
        AdType::AdNotification,
        ConfirmationType::Viewed,
    );
    first.confirm(&transaction).await.unwrap();
    first.maybe_redeem_after_delay().await;
    first.shutdown().await;

    // A new process starts without a wallet in memory.
    let restarted = fixture.restart().await;
    *restarted.ctx.wallet.write().await = None;
    let account = Account::new(restarted.ctx.clone(), AccountSettings::default());
    account.initialize().await.unwrap();
    account.set_wallet(OTHER_PAYMENT_ID, RECOVERY_SEED).await.unwrap();

    let pool = &restarted.ctx.token_pool;
    assert_eq!(pool.unblinded_token_count().await, 0);
    assert_eq!(pool.unblinded_payment_token_count().await, 0);
    assert_eq!(pool.failed_confirmation_count().await, 0);
    assert!(pool.next_token_redemption_at().await.is_none());

    // Nothing of the old wallet is ever sent to the new id's endpoint.
    let mut ledger = restarted.ledger.clone();
    ledger.payment_id = OTHER_PAYMENT_ID.to_string();
    ledger.serve_payment_redemption(&restarted.loader, 200);
    account.process_retry_queue().await;
    account.maybe_redeem_after_delay().await;
    tokio::time::sleep(Duration::from_secs(25 * 60 * 60)).await;
    assert!(restarted
        .loader
        .requests_with(Method::PUT, &ledger.redeem_payment_tokens_path())
        .is_empty());
}
