// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! adpass command-line client
//!
//! Drives one account against a ledger: refills confirmation tokens,
//! confirms ad events, drains the retry queue and cashes out payment tokens.
//!
//! # Usage
//!
//! ```bash
//! export ADPASS_LEDGER_URL=https://ledger.example.com
//! export ADPASS_PAYMENT_ID=27a39b2f-9b2e-4eb0-bbb2-2f84447496e7
//! export ADPASS_RECOVERY_SEED=<base64 seed>
//!
//! adpass status                        # Token pool and retry queue
//! adpass issuers                       # Fetch and show issuer keys
//! adpass refill                        # Top up confirmation tokens
//! adpass confirm <creative-id> -c view # Confirm one ad event
//! adpass run                           # Keep retrying and redeeming until Ctrl-C
//! ```

use adpass_client::confirmation::{AdType, ConfirmationType, TransactionInfo};
use adpass_client::issuers::{fetch_issuers, IssuerType};
use adpass_client::redeem_confirmation::RedeemOutcome;
use adpass_client::{Account, AccountContext, AccountEvent, AccountObserver, Config};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// adpass - anonymous ad confirmations and payment token redemption
#[derive(Parser)]
#[command(name = "adpass")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Ledger base URL (or set ADPASS_LEDGER_URL)
    #[arg(short, long, env = "ADPASS_LEDGER_URL")]
    ledger_url: Option<String>,

    /// Token pool state file (or set ADPASS_STATE_PATH)
    #[arg(short, long, env = "ADPASS_STATE_PATH")]
    state: Option<PathBuf>,

    /// Wallet payment id (or set ADPASS_PAYMENT_ID)
    #[arg(long, env = "ADPASS_PAYMENT_ID")]
    payment_id: Option<String>,

    /// Base64 wallet recovery seed (or set ADPASS_RECOVERY_SEED)
    #[arg(long, env = "ADPASS_RECOVERY_SEED", hide_env_values = true)]
    recovery_seed: Option<String>,

    /// Output format: table or json
    #[arg(short, long, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show token pool, retry queue and redemption schedule
    Status,

    /// Fetch and show the ledger's issuer keys
    Issuers,

    /// Refill confirmation tokens if the pool is low
    Refill,

    /// Confirm one ad event
    Confirm {
        /// Creative instance id of the ad
        creative_instance_id: String,

        /// Ad type, e.g. ad_notification or new_tab_page_ad
        #[arg(short, long, default_value = "ad_notification")]
        ad_type: AdType,

        /// Confirmation type, e.g. view, click or dismiss
        #[arg(short, long, default_value = "view")]
        confirmation_type: ConfirmationType,
    },

    /// Retry failed confirmations, refill and redeem until interrupted
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,
    },
}

/// Forwards account events to the command loop.
struct ChannelObserver {
    tx: mpsc::UnboundedSender<AccountEvent>,
}

impl AccountObserver for ChannelObserver {
    fn on_account_event(&self, event: &AccountEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    adpass_common::logging::init("warn,adpass_client=info");

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(url) = cli.ledger_url.clone() {
        config.ledger_url = url;
    }
    if let Some(path) = cli.state.clone() {
        config.state_path = path;
    }

    let ctx = AccountContext::from_config(&config)?;
    let account = Account::new(ctx, config.account.clone());
    account.initialize().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    account.add_observer(Arc::new(ChannelObserver { tx }));

    let credentials = cli.payment_id.as_deref().zip(cli.recovery_seed.as_deref());

    match cli.command {
        Commands::Status => {
            set_wallet_if_given(credentials, &account).await?;
            print_status(&account, cli.format).await;
        }
        Commands::Issuers => {
            load_issuers(&account).await?;
            print_issuers(&account, cli.format).await;
        }
        Commands::Refill => {
            require_wallet(credentials, &account).await?;
            load_issuers(&account).await?;
            let before = account.context().token_pool.unblinded_token_count().await;
            account.maybe_refill().await;
            drain_events(&mut rx);
            let after = account.context().token_pool.unblinded_token_count().await;
            println!("Unblinded tokens: {} -> {}", before, after.to_string().bold());
        }
        Commands::Confirm {
            creative_instance_id,
            ad_type,
            confirmation_type,
        } => {
            require_wallet(credentials, &account).await?;
            load_issuers(&account).await?;
            let transaction = TransactionInfo::new(&creative_instance_id, ad_type, confirmation_type);
            let outcome = account
                .confirm(&transaction)
                .await
                .context("build confirmation")?;
            drain_events(&mut rx);
            print_outcome(&outcome);
        }
        Commands::Run { duration } => {
            require_wallet(credentials, &account).await?;
            load_issuers(&account).await?;
            account.start_issuers_refresh();
            account.maybe_refill().await;
            account.process_retry_queue().await;
            account.maybe_redeem_after_delay().await;

            let deadline = duration.map(Duration::from_secs);
            let stop = async {
                match deadline {
                    Some(d) => tokio::time::sleep(d).await,
                    None => {
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
            };
            tokio::pin!(stop);

            println!("{}", "Running, press Ctrl-C to stop".dimmed());
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    Some(event) = rx.recv() => print_event(&event),
                }
            }
            account.shutdown().await;
            drain_events(&mut rx);
        }
    }

    Ok(())
}

async fn set_wallet_if_given(credentials: Option<(&str, &str)>, account: &Account) -> Result<bool> {
    match credentials {
        Some((payment_id, seed)) => {
            account
                .set_wallet(payment_id, seed)
                .await
                .context("invalid wallet")?;
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn require_wallet(credentials: Option<(&str, &str)>, account: &Account) -> Result<()> {
    if !set_wallet_if_given(credentials, account).await? {
        anyhow::bail!("a wallet is required: pass --payment-id and --recovery-seed");
    }
    Ok(())
}

async fn load_issuers(account: &Account) -> Result<()> {
    let ctx = account.context();
    let issuers = fetch_issuers(ctx.loader.as_ref(), &ctx.server)
        .await
        .context("fetch issuers")?;
    account.set_issuers(issuers).await;
    Ok(())
}

fn drain_events(rx: &mut mpsc::UnboundedReceiver<AccountEvent>) {
    while let Ok(event) = rx.try_recv() {
        print_event(&event);
    }
}

fn print_event(event: &AccountEvent) {
    let stamp = Utc::now().format("%H:%M:%S").to_string().dimmed();
    let line = match event {
        AccountEvent::DidRefillUnblindedTokens => "Refilled unblinded tokens".green(),
        AccountEvent::FailedToRefillUnblindedTokens => "Failed to refill unblinded tokens".red(),
        AccountEvent::CaptchaRequiredToRefillUnblindedTokens { captcha_id } => {
            format!("Captcha {} required to refill unblinded tokens", captcha_id).yellow()
        }
        AccountEvent::WillRetryRefillingUnblindedTokens { retry_at } => {
            format!("Will retry refilling at {}", retry_at.to_rfc3339()).yellow()
        }
        AccountEvent::DidRetryRefillingUnblindedTokens => "Retrying refill".normal(),
        AccountEvent::DidConfirm { confirmation } => format!(
            "Confirmed {} {} ({})",
            confirmation.ad_type, confirmation.confirmation_type, confirmation.transaction_id
        )
        .green(),
        AccountEvent::FailedToConfirm { confirmation } => format!(
            "Failed to confirm {} {} ({})",
            confirmation.ad_type, confirmation.confirmation_type, confirmation.transaction_id
        )
        .red(),
        AccountEvent::WillRetryConfirming { retry_at } => {
            format!("Will retry confirming at {}", retry_at.to_rfc3339()).yellow()
        }
        AccountEvent::DidRedeemUnblindedPaymentTokens { count } => {
            format!("Redeemed {} payment tokens", count).green()
        }
        AccountEvent::FailedToRedeemUnblindedPaymentTokens => "Failed to redeem payment tokens".red(),
        AccountEvent::DidScheduleNextUnblindedPaymentTokensRedemption { redeem_at } => {
            format!("Next payment token redemption at {}", redeem_at.to_rfc3339()).normal()
        }
        AccountEvent::WillRetryRedeemingUnblindedPaymentTokens { retry_at } => {
            format!("Will retry redeeming at {}", retry_at.to_rfc3339()).yellow()
        }
        AccountEvent::DidRetryRedeemingUnblindedPaymentTokens => "Retrying redemption".normal(),
    };
    println!("{} {}", stamp, line);
}

fn print_outcome(outcome: &RedeemOutcome) {
    match outcome {
        RedeemOutcome::Redeemed {
            confirmation,
            payment_token,
        } => {
            println!("{} {}", "✓".green().bold(), confirmation.transaction_id);
            if payment_token.is_some() {
                println!("  Earned one payment token");
            }
        }
        RedeemOutcome::Failed {
            confirmation,
            should_retry,
            ..
        } => {
            println!("{} {}", "✗".red().bold(), confirmation.transaction_id);
            if *should_retry {
                println!("  Queued for retry; `adpass run` will resubmit it");
            }
        }
    }
}

async fn print_status(account: &Account, format: OutputFormat) {
    let pool = &account.context().token_pool;
    let wallet = account.wallet().await;
    let unblinded = pool.unblinded_token_count().await;
    let payment = pool.unblinded_payment_token_count().await;
    let queued = pool.failed_confirmations().await;
    let next_redemption = pool.next_token_redemption_at().await;
    let summary = account.transactions_summary().await;

    match format {
        OutputFormat::Json => {
            let status = json!({
                "paymentId": wallet.as_ref().map(|w| w.payment_id.clone()),
                "unblindedTokens": unblinded,
                "unblindedPaymentTokens": payment,
                "failedConfirmations": queued.len(),
                "nextTokenRedemptionAt": next_redemption.map(|t| t.to_rfc3339()),
                "estimatedPendingRewards": summary.estimated_pending_rewards,
                "adNotificationsReceivedThisMonth": summary.ad_notifications_received_this_month,
                "nextPaymentDate": summary.next_payment_date.to_rfc3339(),
                "transactions": summary.transactions,
            });
            println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
        }
        OutputFormat::Table => {
            println!("{}", "Account".bold().underline());
            let payment_id = wallet
                .map(|w| w.payment_id)
                .unwrap_or_else(|| "-".to_string());
            println!("  {:<26} {}", "Payment id:", payment_id);
            println!("  {:<26} {}", "Unblinded tokens:", unblinded.to_string().cyan());
            println!("  {:<26} {}", "Unblinded payment tokens:", payment.to_string().cyan());
            println!("  {:<26} {}", "Failed confirmations:", queued.len().to_string().cyan());
            let next = next_redemption
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "not scheduled".to_string());
            println!("  {:<26} {}", "Next redemption:", next);
            println!(
                "  {:<26} {}",
                "Estimated pending rewards:",
                format!("{:.2} BAT", summary.estimated_pending_rewards).green()
            );
            println!(
                "  {:<26} {}",
                "Ads this month:",
                summary.ad_notifications_received_this_month.to_string().cyan()
            );
            println!(
                "  {:<26} {}",
                "Next payment date:",
                summary.next_payment_date.format("%Y-%m-%d")
            );
            for confirmation in queued {
                println!(
                    "    {} {} {} {}",
                    "•".dimmed(),
                    confirmation.transaction_id,
                    confirmation.confirmation_type,
                    if confirmation.was_created { "(created)" } else { "" }
                );
            }
        }
    }
}

async fn print_issuers(account: &Account, format: OutputFormat) {
    let issuers = account.context().issuers.issuers().await;
    match format {
        OutputFormat::Json => {
            let value = json!({
                "ping": issuers.ping.as_millis() as u64,
                "issuers": issuers.issuers.iter().map(|i| json!({
                    "name": i.issuer_type.as_str(),
                    "publicKeys": i.public_keys,
                })).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        }
        OutputFormat::Table => {
            println!(
                "{} (refresh every {})",
                "Issuers".bold().underline(),
                adpass_common::duration::format_duration(issuers.ping)
            );
            for issuer_type in [IssuerType::Confirmations, IssuerType::Payments] {
                println!("  {}", issuer_type.as_str().bold());
                match issuers.issuer(issuer_type) {
                    Some(issuer) if !issuer.public_keys.is_empty() => {
                        for (key, value) in &issuer.public_keys {
                            println!("    {} {}", key, value.dimmed());
                        }
                    }
                    _ => println!("    {}", "none".red()),
                }
            }
        }
    }
}
