//! Risk manager: the single serialization point for the risk ledger
//!
//! Every operation takes the ledger lock, rolls the day over if needed,
//! checks and mutates, persists, and only then releases the lock. A failed
//! persist restores the previous ledger so memory never runs ahead of disk.

use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::control::{ControlQueue, OperatorCommand};
use super::ledger::{ClosedPnl, RiskLedger, RiskLimits};
use super::RiskRejection;
use crate::alert::{Alert, AlertSink};
use crate::config::{lamports_to_sol, RiskConfig};
use crate::error::{Error, Result};
use crate::signal::TokenKey;
use crate::store::JsonStore;
use crate::validator::ValidatedCandidate;

/// Result of applying a closed position to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Applied { kill_switch_tripped: bool },
    /// Position was settled before (replay)
    AlreadySettled,
}

pub struct RiskManager {
    limits: RiskLimits,
    ledger: Mutex<RiskLedger>,
    store: JsonStore,
    control: ControlQueue,
    alerts: AlertSink,
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl RiskManager {
    pub fn with_ledger(
        limits: RiskLimits,
        ledger: RiskLedger,
        store: JsonStore,
        control: ControlQueue,
        alerts: AlertSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            limits,
            ledger: Mutex::new(ledger),
            store,
            control,
            alerts,
        })
    }

    /// Load the persisted ledger (or start a fresh one) and apply queued
    /// operator commands
    pub async fn open(
        config: &RiskConfig,
        store: JsonStore,
        control: ControlQueue,
        alerts: AlertSink,
    ) -> Result<Arc<Self>> {
        let limits = RiskLimits::from_config(config);
        let ledger = match store.load::<Option<RiskLedger>>().await? {
            Some(ledger) => {
                info!(
                    day = %ledger.day,
                    open = ledger.open_position_count,
                    realized_sol = lamports_to_sol(ledger.realized_pnl_today),
                    kill_switch = ledger.kill_switch_engaged,
                    "Loaded risk ledger"
                );
                ledger
            }
            None => RiskLedger::new(limits.starting_equity, today()),
        };

        let manager = Self::with_ledger(limits, ledger, store, control, alerts);
        manager.housekeeping().await?;
        Ok(manager)
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    fn roll(ledger: &mut RiskLedger) {
        let previous = ledger.day;
        if ledger.roll_to(today()) {
            info!(
                from = %previous,
                to = %ledger.day,
                equity_sol = lamports_to_sol(ledger.day_start_equity),
                "Risk ledger rolled over"
            );
        }
    }

    async fn persist(&self, ledger: &mut RiskLedger, before: RiskLedger) -> Result<()> {
        if let Err(e) = self.store.save(&*ledger).await {
            error!("Failed to persist risk ledger: {}", e);
            *ledger = before;
            return Err(e);
        }
        Ok(())
    }

    /// Check a validated candidate and reserve a position slot for it
    pub async fn try_reserve(
        self: &Arc<Self>,
        candidate: &ValidatedCandidate,
        size: u64,
    ) -> Result<SlotReservation> {
        let mut ledger = self.ledger.lock().await;
        let before = ledger.clone();
        Self::roll(&mut ledger);

        if let Err(rejection) = ledger.check_entry(size, &self.limits) {
            info!(token = %candidate.token(), reason = %rejection, "Entry rejected by risk manager");
            if *ledger != before {
                self.persist(&mut ledger, before).await?;
            }
            return Err(rejection.into());
        }

        ledger.open_position_count += 1;
        self.persist(&mut ledger, before).await?;

        info!(
            token = %candidate.token(),
            size_sol = lamports_to_sol(size as i64),
            open = ledger.open_position_count,
            "Position slot reserved"
        );

        Ok(SlotReservation {
            manager: Arc::clone(self),
            token: candidate.token().clone(),
            size,
            consumed: false,
        })
    }

    /// Give back a slot whose entry never produced a position
    pub async fn release_slot(&self) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        let before = ledger.clone();
        Self::roll(&mut ledger);

        if ledger.open_position_count == 0 {
            let detail = "slot release with no open positions".to_string();
            self.alerts.raise(Alert::LedgerInvariant {
                detail: detail.clone(),
            });
            return Err(Error::LedgerInvariant(detail));
        }

        ledger.open_position_count -= 1;
        self.persist(&mut ledger, before).await
    }

    /// Release a closed position's slot and apply its realized P&L
    ///
    /// Idempotent per position id.
    pub async fn settle(&self, position_id: &str, realized_pnl: i64) -> Result<SettleOutcome> {
        let mut ledger = self.ledger.lock().await;
        let before = ledger.clone();
        Self::roll(&mut ledger);

        if ledger.is_settled(position_id) {
            warn!(position_id, "Position already settled, ignoring replay");
            if *ledger != before {
                self.persist(&mut ledger, before).await?;
            }
            return Ok(SettleOutcome::AlreadySettled);
        }

        if ledger.open_position_count == 0 {
            self.alerts.raise(Alert::LedgerInvariant {
                detail: format!("settling {} with no open slot", position_id),
            });
        } else {
            ledger.open_position_count -= 1;
        }
        let day = ledger.day;
        ledger.book_closed(position_id, realized_pnl, day);

        let tripped = self.trip_if_loss_bound(&mut ledger);
        self.persist(&mut ledger, before).await?;

        info!(
            position_id,
            pnl_sol = lamports_to_sol(realized_pnl),
            realized_today_sol = lamports_to_sol(ledger.realized_pnl_today),
            open = ledger.open_position_count,
            "Position settled"
        );

        if let Some(reason) = tripped.clone() {
            self.alerts.raise(Alert::KillSwitchEngaged { reason });
        }

        Ok(SettleOutcome::Applied {
            kill_switch_tripped: tripped.is_some(),
        })
    }

    fn trip_if_loss_bound(&self, ledger: &mut RiskLedger) -> Option<String> {
        if ledger.kill_switch_engaged || !ledger.loss_bound_reached(&self.limits) {
            return None;
        }
        let reason = format!(
            "daily loss limit reached: {:.4} SOL realized (limit {:.4} SOL)",
            lamports_to_sol(ledger.realized_pnl_today),
            lamports_to_sol(self.limits.daily_loss_limit as i64)
        );
        ledger.kill_switch_engaged = true;
        ledger.kill_switch_reason = Some(reason.clone());
        Some(reason)
    }

    /// Block all new entries until reset or rollover
    pub async fn engage_kill_switch(&self, reason: &str) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        let before = ledger.clone();
        Self::roll(&mut ledger);

        if ledger.kill_switch_engaged {
            info!("Kill switch already engaged");
            if *ledger != before {
                self.persist(&mut ledger, before).await?;
            }
            return Ok(());
        }

        ledger.kill_switch_engaged = true;
        ledger.kill_switch_reason = Some(reason.to_string());
        self.persist(&mut ledger, before).await?;

        self.alerts.raise(Alert::KillSwitchEngaged {
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Manual override of an engaged kill switch
    ///
    /// Refused while today's realized loss is at the limit; only the UTC
    /// rollover clears a loss-limit trip.
    pub async fn reset_kill_switch(&self, reason: &str) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        let before = ledger.clone();
        Self::roll(&mut ledger);

        let refused = ledger.kill_switch_engaged && ledger.loss_bound_reached(&self.limits);
        if !ledger.kill_switch_engaged || refused {
            if *ledger != before {
                self.persist(&mut ledger, before.clone()).await?;
            }
        }
        if !ledger.kill_switch_engaged {
            return Ok(());
        }
        if refused {
            warn!("Kill switch reset refused: daily loss limit reached, entries stay blocked until rollover");
            return Err(RiskRejection::LossLimitReached {
                realized_pnl_today: ledger.realized_pnl_today,
                limit: self.limits.daily_loss_limit,
            }
            .into());
        }

        ledger.kill_switch_engaged = false;
        ledger.kill_switch_reason = None;
        self.persist(&mut ledger, before).await?;

        self.alerts.raise(Alert::KillSwitchReset {
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Current ledger (after any pending rollover)
    pub async fn snapshot(&self) -> RiskLedger {
        let mut ledger = self.ledger.lock().await;
        Self::roll(&mut ledger);
        ledger.clone()
    }

    /// Periodic tick: persist rollovers and apply operator commands
    pub async fn housekeeping(&self) -> Result<()> {
        {
            let mut ledger = self.ledger.lock().await;
            let before = ledger.clone();
            Self::roll(&mut ledger);
            if *ledger != before {
                self.persist(&mut ledger, before).await?;
            }
        }

        for queued in self.control.pending().await? {
            let applied = match &queued.command {
                OperatorCommand::EngageKillSwitch { reason, .. } => {
                    self.engage_kill_switch(reason).await
                }
                OperatorCommand::ResetKillSwitch { reason, .. } => {
                    self.reset_kill_switch(reason).await
                }
            };
            match applied {
                Ok(()) => {}
                // Refused commands are dropped, not retried
                Err(e @ Error::RiskRejected(_)) => {
                    warn!("Operator command {:?} refused: {}", queued.command, e)
                }
                Err(e) => return Err(e),
            }
            self.control.ack(queued).await?;
        }
        Ok(())
    }

    /// Rebuild counters from the position book after a restart
    ///
    /// `live` is the number of positions still holding a slot, `closed` the
    /// realized P&L of every closed position; ones not yet settled are
    /// booked now to the day they closed on. Positions that closed before
    /// the settled-id horizon were settled long ago and are skipped.
    pub async fn reconcile(&self, live: usize, closed: &[ClosedPnl]) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        let before = ledger.clone();
        Self::roll(&mut ledger);

        if ledger.open_position_count != live {
            warn!(
                ledger = ledger.open_position_count,
                book = live,
                "Open position count out of sync with book, correcting"
            );
            ledger.open_position_count = live;
        }

        let horizon = ledger.settled_horizon();
        let mut applied = 0;
        for closed in closed {
            if closed.closed_on < horizon || ledger.is_settled(&closed.position_id) {
                continue;
            }
            ledger.book_closed(&closed.position_id, closed.realized_pnl, closed.closed_on);
            applied += 1;
        }

        let tripped = self.trip_if_loss_bound(&mut ledger);
        if *ledger != before {
            self.persist(&mut ledger, before).await?;
        }
        if applied > 0 {
            info!("Applied {} unsettled closed positions to the ledger", applied);
        }
        if let Some(reason) = tripped {
            self.alerts.raise(Alert::KillSwitchEngaged { reason });
        }
        Ok(())
    }
}

/// A reserved position slot
///
/// Must end in `commit` (the slot now belongs to a position and is freed by
/// `settle`) or `release`. Dropping it unconsumed releases the slot in the
/// background.
pub struct SlotReservation {
    manager: Arc<RiskManager>,
    token: TokenKey,
    size: u64,
    consumed: bool,
}

impl SlotReservation {
    pub fn token(&self) -> &TokenKey {
        &self.token
    }

    /// Lamports approved for the entry
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn commit(mut self) {
        self.consumed = true;
    }

    pub async fn release(mut self) -> Result<()> {
        self.consumed = true;
        self.manager.release_slot().await
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        warn!(token = %self.token, "Slot reservation dropped without commit, releasing");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = Arc::clone(&self.manager);
            handle.spawn(async move {
                if let Err(e) = manager.release_slot().await {
                    error!("Failed to release dropped reservation: {}", e);
                }
            });
        }
    }
}
