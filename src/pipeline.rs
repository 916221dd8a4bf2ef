//! Wires the workers together
//!
//! adapters -> aggregator -> validator pool -> risk gate -> execution
//! engine, with the position monitor feeding exits back into the engine.
//! Every worker stops on the shared `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::{Aggregator, Candidate};
use crate::alert::AlertSink;
use crate::allocator::{BucketLedger, JsonBucketLedger, ProfitAllocator};
use crate::config::{Config, SourceConfig, SourceKind};
use crate::error::Result;
use crate::execution::{ExecutionEngine, PaperExecutor, PumpPortalExecutor, SwapExecutor};
use crate::position::{DexScreenerPriceSource, ExitInstruction, PositionBook, PositionMonitor, PriceSource};
use crate::risk::{ControlQueue, PositionSizer, RiskManager};
use crate::signal::dexscreener::DexScreenerAdapter;
use crate::signal::pumpportal::PumpPortalAdapter;
use crate::signal::{AdapterSupervisor, Signal, SignalSink, SourceAdapter};
use crate::store::JsonStore;
use crate::validator::{ValidatedCandidate, Validator};

/// How often the aggregator drops expired windows
const EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

/// Durable state shared by the engine and the read-only CLI commands
pub struct State {
    pub book: Arc<PositionBook>,
    pub risk: Arc<RiskManager>,
    pub buckets: Arc<JsonBucketLedger>,
    pub allocator: Arc<ProfitAllocator>,
}

impl State {
    /// Open every state document and bring them back in sync
    ///
    /// Positions whose entry was interrupted are flagged, the risk ledger
    /// is reconciled with the book, and any allocation whose bucket credit
    /// did not finish is credited again (idempotent).
    pub async fn open(config: &Config, alerts: &AlertSink) -> Result<Self> {
        let storage = &config.storage;
        match &storage.state_dir {
            Some(dir) => info!("State directory: {}", dir),
            None => warn!("No state directory configured; state is memory-only"),
        }

        let book = Arc::new(PositionBook::open(JsonStore::new(storage.file("book.json"))).await?);
        let control = ControlQueue::new(storage.file("control"));
        let risk = RiskManager::open(
            &config.risk,
            JsonStore::new(storage.file("ledger.json")),
            control,
            alerts.clone(),
        )
        .await?;

        let buckets =
            Arc::new(JsonBucketLedger::open(JsonStore::new(storage.file("buckets.json"))).await?);
        let ledger: Arc<dyn BucketLedger> = buckets.clone();
        let allocator = Arc::new(ProfitAllocator::new(config.allocation, ledger));

        let flagged = book.flag_interrupted_entries().await?;
        if flagged > 0 {
            warn!(
                "{} positions were mid-entry at shutdown; flagged for manual intervention",
                flagged
            );
        }

        risk.reconcile(book.live_positions().await.len(), &book.closed_pnls().await)
            .await?;

        for record in book.allocations().await {
            allocator.credit(&record).await?;
        }

        Ok(Self {
            book,
            risk,
            buckets,
            allocator,
        })
    }
}

fn build_adapter(source: &SourceConfig) -> Result<Arc<dyn SourceAdapter>> {
    let adapter: Arc<dyn SourceAdapter> = match source.kind {
        SourceKind::NewListing | SourceKind::WalletCopy => {
            Arc::new(PumpPortalAdapter::from_config(source)?)
        }
        SourceKind::Social | SourceKind::OnChain => Arc::new(DexScreenerAdapter::from_config(source)?),
    };
    Ok(adapter)
}

/// Risk gate: size, reserve a slot, then enter in its own task
async fn run_entries(
    validated_rx: async_channel::Receiver<ValidatedCandidate>,
    risk: Arc<RiskManager>,
    sizer: PositionSizer,
    engine: Arc<ExecutionEngine>,
    shutdown: CancellationToken,
) {
    loop {
        let candidate = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = validated_rx.recv() => match next {
                Ok(c) => c,
                Err(_) => break,
            },
        };

        let size = sizer.size_for(candidate.score());
        let reservation = match risk.try_reserve(&candidate, size).await {
            Ok(r) => r,
            Err(e) if e.is_safety_violation() => continue,
            Err(e) => {
                error!(token = %candidate.token(), "Risk check failed: {}", e);
                continue;
            }
        };

        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let token = candidate.token().clone();
            if let Err(e) = engine.enter(candidate, reservation).await {
                warn!(token = %token, "Entry failed: {}", e);
            }
        });
    }

    info!("Entry stage stopped");
}

async fn run_housekeeping(risk: Arc<RiskManager>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = risk.housekeeping().await {
                    warn!("Risk housekeeping failed: {}", e);
                }
            }
        }
    }
}

/// Start every worker; returns their handles
///
/// `dry_run` swaps the live executor for `PaperExecutor`.
pub async fn start(
    config: &Config,
    dry_run: bool,
    alerts: AlertSink,
    shutdown: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let state = State::open(config, &alerts).await?;
    let mut handles = Vec::new();

    let prices: Arc<dyn PriceSource> = Arc::new(DexScreenerPriceSource::new(
        &config.monitor.price_api_url,
        Duration::from_millis(config.monitor.price_timeout_ms),
    )?);

    let executor: Arc<dyn SwapExecutor> = if dry_run {
        warn!("DRY-RUN mode: fills are simulated, no trades are submitted");
        Arc::new(PaperExecutor::new(
            prices.clone(),
            config.execution.paper_slippage_bps,
        ))
    } else {
        Arc::new(PumpPortalExecutor::new(&config.execution, prices.clone())?)
    };

    let engine = Arc::new(ExecutionEngine::new(
        &config.execution,
        executor,
        state.book.clone(),
        state.risk.clone(),
        state.allocator.clone(),
        alerts.clone(),
    ));

    // Exits
    let (exit_tx, exit_rx) = mpsc::channel::<ExitInstruction>(256);
    handles.push(tokio::spawn(
        Arc::clone(&engine).run_exits(exit_rx, shutdown.clone()),
    ));

    let monitor = PositionMonitor::new(
        &config.monitor,
        state.book.clone(),
        prices,
        alerts.clone(),
        exit_tx,
    );
    handles.push(tokio::spawn(monitor.run(shutdown.clone())));

    // Entries
    let (signal_tx, signal_rx) = async_channel::bounded::<Signal>(config.aggregator.channel_capacity);
    let (candidate_tx, candidate_rx) =
        async_channel::bounded::<Candidate>(config.validator.queue_capacity);
    let (validated_tx, validated_rx) =
        async_channel::bounded::<ValidatedCandidate>(config.validator.queue_capacity);

    for source in config.sources.iter().filter(|s| s.enabled) {
        let adapter = build_adapter(source)?;
        let sink = SignalSink::new(&source.id, source.weight, signal_tx.clone());
        let supervisor =
            AdapterSupervisor::new(adapter, sink, config.adapter_backoff.clone(), alerts.clone());
        handles.push(tokio::spawn(supervisor.run(shutdown.clone())));
    }
    drop(signal_tx);

    let aggregator = Aggregator::new(&config.aggregator);
    handles.push(tokio::spawn(aggregator.run(
        signal_rx,
        candidate_tx,
        EXPIRY_INTERVAL,
        shutdown.clone(),
    )));

    let validator = Arc::new(Validator::from_config(&config.validator)?);
    handles.extend(validator.spawn_workers(
        config.validator.workers,
        candidate_rx,
        validated_tx,
        shutdown.clone(),
    ));

    let sizer = PositionSizer::new(&config.risk, config.aggregator.emit_threshold);
    handles.push(tokio::spawn(run_entries(
        validated_rx,
        state.risk.clone(),
        sizer,
        engine,
        shutdown.clone(),
    )));

    handles.push(tokio::spawn(run_housekeeping(
        state.risk.clone(),
        Duration::from_secs(config.risk.housekeeping_interval_secs.max(1)),
        shutdown.clone(),
    )));

    info!(
        sources = config.sources.iter().filter(|s| s.enabled).count(),
        validator_workers = config.validator.workers,
        "Pipeline started"
    );
    Ok(handles)
}
