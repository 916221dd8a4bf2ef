//! Execution engine
//!
//! Entries and exits for one token never overlap: each operation holds the
//! token's lock from the first book write to the last. Different tokens
//! run in parallel.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{retry_with_backoff, RetryPolicy};
use super::{BuyOrder, SellOrder, SwapExecutor};
use crate::alert::{Alert, AlertSink};
use crate::allocator::ProfitAllocator;
use crate::config::{lamports_to_sol, ExecutionConfig};
use crate::error::{Error, Result};
use crate::position::{ExitInstruction, ExitReason, Position, PositionBook, SellAmount};
use crate::risk::{RiskManager, SlotReservation};
use crate::signal::TokenKey;
use crate::validator::ValidatedCandidate;

/// What an exit did to its position
#[derive(Debug, Clone, PartialEq)]
pub enum ExitResult {
    Partial(Position),
    Closed(Position),
    /// Instruction no longer pending (replaced, or already done)
    Skipped,
}

pub struct ExecutionEngine {
    executor: Arc<dyn SwapExecutor>,
    book: Arc<PositionBook>,
    risk: Arc<RiskManager>,
    allocator: Arc<ProfitAllocator>,
    alerts: AlertSink,
    policy: RetryPolicy,
    slippage_bps: u32,
    rug_slippage_bps: u32,
    locks: DashMap<TokenKey, Arc<Mutex<()>>>,
}

impl ExecutionEngine {
    pub fn new(
        config: &ExecutionConfig,
        executor: Arc<dyn SwapExecutor>,
        book: Arc<PositionBook>,
        risk: Arc<RiskManager>,
        allocator: Arc<ProfitAllocator>,
        alerts: AlertSink,
    ) -> Self {
        Self {
            executor,
            book,
            risk,
            allocator,
            alerts,
            policy: RetryPolicy::from_config(config),
            slippage_bps: config.slippage_bps,
            rug_slippage_bps: config.rug_slippage_bps,
            locks: DashMap::new(),
        }
    }

    fn token_lock(&self, token: &TokenKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(token.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a token's lock once no operation holds or waits on it
    fn prune_lock(&self, token: &TokenKey, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(token, |_, m| Arc::strong_count(m) == 1);
    }

    /// Buy into a validated candidate using a reserved risk slot
    ///
    /// The reservation is committed on a fill and released on any failure.
    pub async fn enter(
        &self,
        candidate: ValidatedCandidate,
        reservation: SlotReservation,
    ) -> Result<Position> {
        let token = candidate.token().clone();
        let lock = self.token_lock(&token);
        let result = {
            let _guard = lock.lock().await;
            self.enter_locked(candidate, reservation).await
        };
        self.prune_lock(&token, lock);
        result
    }

    async fn enter_locked(
        &self,
        candidate: ValidatedCandidate,
        reservation: SlotReservation,
    ) -> Result<Position> {
        let token = candidate.token().clone();
        let position = Position::pending(token.clone(), reservation.size(), candidate.score());
        let id = position.id.clone();

        if let Err(e) = self.book.insert_pending(position).await {
            debug!(token = %token, "Entry refused: {}", e);
            reservation.release().await?;
            return Err(e);
        }

        let order = BuyOrder {
            token: token.clone(),
            lamports: reservation.size(),
            slippage_bps: self.slippage_bps,
        };

        info!(
            position_id = %id,
            token = %token,
            size_sol = lamports_to_sol(order.lamports as i64),
            score = candidate.score(),
            executor = self.executor.name(),
            "Submitting entry"
        );

        let result = retry_with_backoff(&self.policy, "buy", |_| self.executor.buy(&order)).await;

        let fill = match result {
            Ok(fill) => fill,
            Err(e) => {
                self.alerts.raise(Alert::ExecutionFatal {
                    position_id: id.clone(),
                    token: token.to_string(),
                    error: e.to_string(),
                });
                if let Err(book_err) = self.book.mark_failed_entry(&id, &e.to_string()).await {
                    // Position stays PENDING_ENTRY and keeps its slot; restart flags it
                    error!(position_id = %id, "Failed to record failed entry: {}", book_err);
                    reservation.commit();
                    return Err(e);
                }
                reservation.release().await?;
                return Err(e);
            }
        };

        // Tokens are held from here on; the slot belongs to the position
        reservation.commit();

        let position = self.book.mark_open(&id, &fill).await.map_err(|e| {
            error!(position_id = %id, signature = %fill.signature, "Bought but failed to record fill: {}", e);
            e
        })?;

        info!(
            position_id = %id,
            token = %token,
            tokens = fill.token_amount,
            price = fill.price,
            signature = %fill.signature,
            "Position opened"
        );
        Ok(position)
    }

    /// Execute one exit instruction
    ///
    /// Failures leave the position open, flag it for manual intervention,
    /// and mark the pending exit `Failed` for the monitor to re-dispatch.
    pub async fn exit(&self, instruction: ExitInstruction) -> Result<ExitResult> {
        let token = instruction.token.clone();
        let lock = self.token_lock(&token);
        let result = {
            let _guard = lock.lock().await;
            self.exit_locked(instruction).await
        };
        self.prune_lock(&token, lock);
        result
    }

    async fn exit_locked(&self, instruction: ExitInstruction) -> Result<ExitResult> {
        if self.book.begin_exit(&instruction.id).await?.is_none() {
            debug!(exit_id = %instruction.id, "Exit no longer pending, skipping");
            return Ok(ExitResult::Skipped);
        }

        let position = match self.book.get(&instruction.position_id).await {
            Some(p) if p.state.is_held() && p.remaining_token_amount > 0.0 => p,
            _ => {
                warn!(position_id = %instruction.position_id, "Exit for a position that is not held");
                self.book.discard_exit(&instruction.id).await?;
                return Ok(ExitResult::Skipped);
            }
        };

        let amount = match instruction.sell {
            SellAmount::All => position.remaining_token_amount,
            SellAmount::Tokens(t) => t.min(position.remaining_token_amount),
        };
        let full = position.sells_out(amount);
        let is_rug = instruction.reason.is_rug();

        let order = SellOrder {
            token: position.token.clone(),
            token_amount: if full { position.remaining_token_amount } else { amount },
            sell_all: full,
            slippage_bps: if is_rug {
                self.rug_slippage_bps
            } else {
                self.slippage_bps
            },
        };

        info!(
            position_id = %position.id,
            token = %position.token,
            reason = %instruction.reason,
            tokens = order.token_amount,
            full,
            "Submitting exit"
        );

        let fill = match retry_with_backoff(&self.policy, "sell", |_| self.executor.sell(&order)).await {
            Ok(fill) => fill,
            Err(e) => {
                self.alerts.raise(Alert::ExitFailure {
                    position_id: position.id.clone(),
                    token: position.token.to_string(),
                    error: e.to_string(),
                });
                self.book
                    .fail_exit(&instruction.id, &position.id, &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        if !full {
            let tiers = match &instruction.reason {
                ExitReason::TakeProfit { tiers, .. } => tiers.clone(),
                _ => Vec::new(),
            };
            let updated = self
                .book
                .apply_partial_exit(&position.id, &instruction.id, &fill, &tiers)
                .await?;
            info!(
                position_id = %position.id,
                remaining = updated.remaining_token_amount,
                signature = %fill.signature,
                "Partial exit filled"
            );
            return Ok(ExitResult::Partial(updated));
        }

        let (closed, record) = match self
            .book
            .close_and_allocate(&position.id, &instruction.id, &fill, &self.allocator)
            .await
        {
            Ok(done) => done,
            Err(e @ Error::LedgerInvariant(_)) => {
                self.alerts.raise(Alert::LedgerInvariant {
                    detail: e.to_string(),
                });
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let pnl = record.realized_pnl;
        info!(
            position_id = %closed.id,
            token = %closed.token,
            pnl_sol = lamports_to_sol(pnl),
            signature = %fill.signature,
            "Position closed"
        );

        // Both are replayed from the book at startup if they fail here
        if let Err(e) = self.risk.settle(&closed.id, pnl).await {
            error!(position_id = %closed.id, "Failed to settle position: {}", e);
        }
        if let Err(e) = self.allocator.credit(&record).await {
            warn!(position_id = %closed.id, "Bucket credit failed, will retry on restart: {}", e);
        }

        Ok(ExitResult::Closed(closed))
    }

    /// Consume exit instructions until shutdown; each runs in its own task
    pub async fn run_exits(
        self: Arc<Self>,
        mut exit_rx: mpsc::Receiver<ExitInstruction>,
        shutdown: CancellationToken,
    ) {
        loop {
            let instruction = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = exit_rx.recv() => match next {
                    Some(i) => i,
                    None => break,
                },
            };

            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                let position_id = instruction.position_id.clone();
                if let Err(e) = engine.exit(instruction).await {
                    warn!(position_id = %position_id, "Exit failed: {}", e);
                }
            });
        }

        info!("Exit dispatcher stopped");
    }
}
