//! CLI command implementations

use anyhow::{bail, Result};
use chrono::Utc;
use dialoguer::Confirm;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::alert::AlertSink;
use crate::allocator::{Bucket, JsonBucketLedger};
use crate::config::{lamports_to_sol, Config};
use crate::pipeline;
use crate::position::PositionBook;
use crate::risk::{ControlQueue, OperatorCommand, RiskLedger, RiskLimits};
use crate::store::JsonStore;

/// How long workers get to finish after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Run the pipeline until Ctrl-C
pub async fn start(config: &Config, dry_run: bool) -> Result<()> {
    if dry_run {
        warn!("Running in DRY-RUN mode - no real trades will be executed");
    }

    info!("Starting confluence engine...");
    info!(
        "Emit threshold: {}, window: {}s, max positions: {}, daily loss limit: {} SOL",
        config.aggregator.emit_threshold,
        config.aggregator.window_secs,
        config.risk.max_concurrent_positions,
        config.risk.daily_loss_limit_sol
    );

    let alerts = AlertSink::new();
    let shutdown = CancellationToken::new();
    let handles = pipeline::start(config, dry_run, alerts, shutdown.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping workers...");
    shutdown.cancel();

    let joined = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles)).await;
    match joined {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!("Worker panicked: {}", e);
                }
            }
        }
        Err(_) => warn!("Workers did not stop within {:?}", SHUTDOWN_GRACE),
    }

    info!("Stopped");
    Ok(())
}

/// Show risk ledger, positions, pending exits and bucket balances
pub async fn status(config: &Config) -> Result<()> {
    let storage = &config.storage;
    if storage.state_dir.is_none() {
        bail!("No state directory configured; nothing to show");
    }

    let ledger: Option<RiskLedger> = JsonStore::new(storage.file("ledger.json")).load().await?;
    let book = PositionBook::open(JsonStore::new(storage.file("book.json"))).await?;
    let buckets = JsonBucketLedger::open(JsonStore::new(storage.file("buckets.json"))).await?;

    println!("\n=== CONFLUENCE ENGINE STATUS ===\n");

    match ledger {
        Some(l) => {
            println!("Ledger day: {}", l.day);
            println!("Equity: {:.4} SOL", lamports_to_sol(l.equity()));
            println!(
                "Realized today: {:.4} SOL (limit -{} SOL)",
                lamports_to_sol(l.realized_pnl_today),
                config.risk.daily_loss_limit_sol
            );
            println!("Realized total: {:.4} SOL", lamports_to_sol(l.total_realized_pnl));
            println!(
                "Open slots: {} / {}",
                l.open_position_count, config.risk.max_concurrent_positions
            );
            if l.kill_switch_engaged {
                println!(
                    "Kill switch: ENGAGED ({})",
                    l.kill_switch_reason.as_deref().unwrap_or("no reason recorded")
                );
            } else {
                println!("Kill switch: off");
            }
        }
        None => println!("No risk ledger yet."),
    }

    println!("\n=== LIVE POSITIONS ===\n");
    let live = book.live_positions().await;
    if live.is_empty() {
        println!("No live positions.");
    }
    for p in &live {
        println!(
            "{}  {}  {}  entry {:.10}  remaining {:.2}/{:.2}  cost {:.4} SOL{}",
            p.id,
            p.token,
            p.state,
            p.entry_price,
            p.remaining_token_amount,
            p.original_token_amount,
            lamports_to_sol(p.cost_lamports as i64),
            if p.needs_manual_intervention {
                "  [MANUAL INTERVENTION]"
            } else {
                ""
            }
        );
        if let Some(err) = &p.last_error {
            println!("    last error: {}", err);
        }
    }

    let pending = book.pending_exits().await;
    if !pending.is_empty() {
        println!("\n=== PENDING EXITS ===\n");
        for exit in pending {
            println!(
                "{}  position {}  {:?}  attempts {}  {}",
                exit.instruction.id,
                exit.instruction.position_id,
                exit.status,
                exit.attempts,
                exit.instruction.reason
            );
        }
    }

    println!("\n=== ALLOCATIONS ===\n");
    let allocations = book.allocations().await;
    println!("Closed positions allocated: {}", allocations.len());
    for bucket in Bucket::ALL {
        println!(
            "  {:<9} {:.4} SOL",
            bucket.as_str(),
            lamports_to_sol(buckets.balance(bucket).await as i64)
        );
    }

    Ok(())
}

fn control_queue(config: &Config) -> Result<ControlQueue> {
    match config.storage.file("control") {
        Some(path) => Ok(ControlQueue::new(Some(path))),
        None => bail!("No state directory configured; the running engine cannot be reached"),
    }
}

/// Queue a kill-switch engagement for the running engine
pub async fn kill_switch_engage(config: &Config, reason: &str) -> Result<()> {
    control_queue(config)?
        .submit(OperatorCommand::engage(reason))
        .await?;
    println!(
        "Kill switch engagement queued; the engine applies it within {}s.",
        config.risk.housekeeping_interval_secs
    );
    Ok(())
}

/// Queue a kill-switch reset, after confirmation unless `force`
pub async fn kill_switch_reset(config: &Config, force: bool) -> Result<()> {
    let queue = control_queue(config)?;

    let ledger: Option<RiskLedger> = JsonStore::new(config.storage.file("ledger.json")).load().await?;
    if let Some(l) = ledger {
        let limits = RiskLimits::from_config(&config.risk);
        if l.day >= Utc::now().date_naive() && l.loss_bound_reached(&limits) {
            bail!(
                "Daily loss limit reached ({:.4} SOL realized); the kill switch clears at the UTC rollover",
                lamports_to_sol(l.realized_pnl_today)
            );
        }
    }

    if !force {
        let confirmed = Confirm::new()
            .with_prompt("Reset the kill switch and allow new entries?")
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Reset cancelled by user");
            return Ok(());
        }
    }

    queue
        .submit(OperatorCommand::reset("manual reset from CLI"))
        .await?;
    println!(
        "Kill switch reset queued; the engine applies it within {}s.",
        config.risk.housekeeping_interval_secs
    );
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}
