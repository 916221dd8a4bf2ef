//! Durable position book
//!
//! Positions, allocation records and the pending-exit queue live in one
//! document (`book.json`) so that closing a position and recording its
//! allocation is a single atomic write.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ExitInstruction, PendingExit, PendingExitStatus, Position, PositionState};
use crate::allocator::{AllocationRecord, ProfitAllocator};
use crate::error::{Error, Result};
use crate::execution::Fill;
use crate::risk::ClosedPnl;
use crate::signal::TokenKey;
use crate::store::JsonStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookDocument {
    #[serde(default)]
    pub positions: BTreeMap<String, Position>,
    #[serde(default)]
    pub allocations: BTreeMap<String, AllocationRecord>,
    /// Keyed by exit instruction id
    #[serde(default)]
    pub pending_exits: BTreeMap<String, PendingExit>,
}

impl BookDocument {
    fn live_for_token(&self, token: &TokenKey) -> Option<&Position> {
        self.positions
            .values()
            .find(|p| p.state.is_live() && &p.token == token)
    }

    fn position_mut(&mut self, id: &str) -> Result<&mut Position> {
        self.positions
            .get_mut(id)
            .ok_or_else(|| Error::PositionNotFound(id.to_string()))
    }
}

fn transition(position: &mut Position, next: PositionState) -> Result<()> {
    if !position.state.can_transition_to(next) {
        return Err(Error::InvalidTransition {
            position_id: position.id.clone(),
            from: position.state.to_string(),
            to: next.to_string(),
        });
    }
    position.state = next;
    Ok(())
}

/// Position book
pub struct PositionBook {
    doc: RwLock<BookDocument>,
    store: JsonStore,
}

impl PositionBook {
    pub async fn open(store: JsonStore) -> Result<Self> {
        let doc: BookDocument = store.load().await?;
        if !doc.positions.is_empty() {
            info!(
                "Loaded {} positions, {} pending exits",
                doc.positions.len(),
                doc.pending_exits.len()
            );
        }
        Ok(Self {
            doc: RwLock::new(doc),
            store,
        })
    }

    /// Apply `f` to the document and persist; roll back if either fails
    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut BookDocument) -> Result<T>,
    {
        let mut doc = self.doc.write().await;
        let before = doc.clone();

        let value = match f(&mut doc) {
            Ok(v) => v,
            Err(e) => {
                *doc = before;
                return Err(e);
            }
        };

        if let Err(e) = self.store.save(&*doc).await {
            *doc = before;
            return Err(e);
        }
        Ok(value)
    }

    /// Record a new PENDING_ENTRY position; refuses a second live
    /// position for the same token
    pub async fn insert_pending(&self, position: Position) -> Result<()> {
        self.mutate(|doc| {
            if let Some(existing) = doc.live_for_token(&position.token) {
                return Err(Error::DuplicatePosition(format!(
                    "{} (position {})",
                    position.token, existing.id
                )));
            }
            doc.positions.insert(position.id.clone(), position);
            Ok(())
        })
        .await
    }

    pub async fn mark_open(&self, id: &str, fill: &Fill) -> Result<Position> {
        self.mutate(|doc| {
            let position = doc.position_mut(id)?;
            transition(position, PositionState::Open)?;
            position.apply_entry(fill);
            Ok(position.clone())
        })
        .await
    }

    pub async fn mark_failed_entry(&self, id: &str, error: &str) -> Result<()> {
        self.mutate(|doc| {
            let position = doc.position_mut(id)?;
            transition(position, PositionState::FailedEntry)?;
            position.last_error = Some(error.to_string());
            Ok(())
        })
        .await
    }

    /// Apply a partial exit fill and clear its pending exit
    pub async fn apply_partial_exit(
        &self,
        id: &str,
        exit_id: &str,
        fill: &Fill,
        tiers: &[usize],
    ) -> Result<Position> {
        self.mutate(|doc| {
            let position = doc.position_mut(id)?;
            transition(position, PositionState::PartialExit)?;
            position.apply_exit(fill);
            position.tiers_hit.extend(tiers.iter().copied());
            position.needs_manual_intervention = false;
            position.last_error = None;
            let updated = position.clone();
            doc.pending_exits.remove(exit_id);
            Ok(updated)
        })
        .await
    }

    /// Close a position and record its allocation in one write
    ///
    /// Fails with `LedgerInvariant` if the position already has an
    /// allocation record.
    pub async fn close_and_allocate(
        &self,
        id: &str,
        exit_id: &str,
        fill: &Fill,
        allocator: &ProfitAllocator,
    ) -> Result<(Position, AllocationRecord)> {
        self.mutate(|doc| {
            if doc.allocations.contains_key(id) {
                return Err(Error::LedgerInvariant(format!(
                    "position {} already allocated",
                    id
                )));
            }

            let position = doc.position_mut(id)?;
            transition(position, PositionState::Closed)?;
            position.apply_exit(fill);
            position.remaining_token_amount = 0.0;
            position.closed_at = Some(chrono::Utc::now());
            position.needs_manual_intervention = false;
            position.last_error = None;

            let pnl = position.running_pnl();
            position.realized_pnl = Some(pnl);
            let closed = position.clone();

            let record = allocator.split(id, pnl);
            doc.allocations.insert(id.to_string(), record.clone());
            doc.pending_exits.remove(exit_id);
            Ok((closed, record))
        })
        .await
    }

    /// Queue an exit unless one is already pending for the position
    ///
    /// A rug exit replaces a pending non-rug exit that is not in flight.
    /// Returns the instruction to dispatch, if any.
    pub async fn enqueue_exit(&self, instruction: ExitInstruction) -> Result<Option<ExitInstruction>> {
        self.mutate(|doc| {
            let existing = doc
                .pending_exits
                .iter()
                .find(|(_, p)| p.instruction.position_id == instruction.position_id)
                .map(|(id, p)| (id.clone(), p.status, p.instruction.reason.is_rug()));

            if let Some((existing_id, status, existing_is_rug)) = existing {
                let replace = instruction.reason.is_rug()
                    && !existing_is_rug
                    && status != PendingExitStatus::InFlight;
                if !replace {
                    return Ok(None);
                }
                debug!(position_id = %instruction.position_id, "Rug exit replaces pending exit");
                doc.pending_exits.remove(&existing_id);
            }

            doc.pending_exits.insert(
                instruction.id.clone(),
                PendingExit {
                    instruction: instruction.clone(),
                    status: PendingExitStatus::Queued,
                    attempts: 0,
                    last_error: None,
                },
            );
            Ok(Some(instruction))
        })
        .await
    }

    /// Mark an exit in flight; returns it if still pending
    pub async fn begin_exit(&self, exit_id: &str) -> Result<Option<PendingExit>> {
        self.mutate(|doc| {
            let Some(pending) = doc.pending_exits.get_mut(exit_id) else {
                return Ok(None);
            };
            pending.status = PendingExitStatus::InFlight;
            pending.attempts += 1;
            Ok(Some(pending.clone()))
        })
        .await
    }

    /// Record an exit failure: pending exit `Failed`, position flagged
    pub async fn fail_exit(&self, exit_id: &str, position_id: &str, error: &str) -> Result<()> {
        self.mutate(|doc| {
            if let Some(pending) = doc.pending_exits.get_mut(exit_id) {
                pending.status = PendingExitStatus::Failed;
                pending.last_error = Some(error.to_string());
            }
            let position = doc.position_mut(position_id)?;
            position.needs_manual_intervention = true;
            position.last_error = Some(error.to_string());
            Ok(())
        })
        .await
    }

    /// Drop a pending exit that can no longer run (position gone or closed)
    pub async fn discard_exit(&self, exit_id: &str) -> Result<()> {
        self.mutate(|doc| {
            if doc.pending_exits.remove(exit_id).is_some() {
                warn!(exit_id, "Discarded pending exit");
            }
            Ok(())
        })
        .await
    }

    /// Move failed exits back to `Queued`; returns them for re-dispatch
    pub async fn requeue_failed_exits(&self) -> Result<Vec<ExitInstruction>> {
        self.mutate(|doc| {
            Ok(doc
                .pending_exits
                .values_mut()
                .filter(|p| p.status == PendingExitStatus::Failed)
                .map(|p| {
                    p.status = PendingExitStatus::Queued;
                    p.instruction.clone()
                })
                .collect())
        })
        .await
    }

    /// Every pending exit back to `Queued` (startup: nothing is in flight)
    pub async fn requeue_all_exits(&self) -> Result<Vec<ExitInstruction>> {
        self.mutate(|doc| {
            Ok(doc
                .pending_exits
                .values_mut()
                .map(|p| {
                    p.status = PendingExitStatus::Queued;
                    p.instruction.clone()
                })
                .collect())
        })
        .await
    }

    pub async fn set_reference_liquidity(&self, id: &str, liquidity_usd: f64) -> Result<()> {
        self.mutate(|doc| {
            let position = doc.position_mut(id)?;
            if position.reference_liquidity_usd.is_none() {
                position.reference_liquidity_usd = Some(liquidity_usd);
            }
            Ok(())
        })
        .await
    }

    /// Flag positions whose entry outcome is unknown after a restart
    pub async fn flag_interrupted_entries(&self) -> Result<usize> {
        self.mutate(|doc| {
            let mut flagged = 0;
            for position in doc.positions.values_mut() {
                if position.state == PositionState::PendingEntry && !position.needs_manual_intervention {
                    position.needs_manual_intervention = true;
                    position.last_error = Some("entry interrupted by restart".into());
                    flagged += 1;
                }
            }
            Ok(flagged)
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Option<Position> {
        self.doc.read().await.positions.get(id).cloned()
    }

    pub async fn live_for_token(&self, token: &TokenKey) -> Option<Position> {
        self.doc.read().await.live_for_token(token).cloned()
    }

    pub async fn live_positions(&self) -> Vec<Position> {
        self.doc
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.state.is_live())
            .cloned()
            .collect()
    }

    pub async fn all_positions(&self) -> Vec<Position> {
        self.doc.read().await.positions.values().cloned().collect()
    }

    pub async fn pending_exit_for(&self, position_id: &str) -> Option<PendingExit> {
        self.doc
            .read()
            .await
            .pending_exits
            .values()
            .find(|p| p.instruction.position_id == position_id)
            .cloned()
    }

    pub async fn pending_exits(&self) -> Vec<PendingExit> {
        self.doc.read().await.pending_exits.values().cloned().collect()
    }

    pub async fn allocation(&self, position_id: &str) -> Option<AllocationRecord> {
        self.doc.read().await.allocations.get(position_id).cloned()
    }

    pub async fn allocations(&self) -> Vec<AllocationRecord> {
        self.doc.read().await.allocations.values().cloned().collect()
    }

    /// Realized P&L and closing day of every closed position
    pub async fn closed_pnls(&self) -> Vec<ClosedPnl> {
        self.doc
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.state == PositionState::Closed)
            .map(|p| ClosedPnl {
                position_id: p.id.clone(),
                realized_pnl: p.realized_pnl.unwrap_or(0),
                closed_on: p.closed_at.unwrap_or(p.created_at).date_naive(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{BucketLedger, JsonBucketLedger};
    use crate::config::AllocationConfig;
    use crate::position::{ExitReason, SellAmount};
    use std::sync::Arc;
    use tempfile::tempdir;

    const MINT: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    fn token() -> TokenKey {
        TokenKey::parse("solana", MINT).unwrap()
    }

    fn fill(tokens: f64, lamports: u64) -> Fill {
        Fill {
            signature: format!("sig-{}", lamports),
            token_amount: tokens,
            lamports,
            price: lamports as f64 / 1e9 / tokens,
        }
    }

    async fn allocator() -> ProfitAllocator {
        let ledger: Arc<dyn BucketLedger> =
            Arc::new(JsonBucketLedger::open(JsonStore::memory()).await.unwrap());
        ProfitAllocator::new(AllocationConfig::default(), ledger)
    }

    fn exit(position: &Position, reason: ExitReason) -> ExitInstruction {
        ExitInstruction::new(
            position,
            super::super::ExitDecision {
                reason,
                sell: SellAmount::All,
            },
        )
    }

    #[tokio::test]
    async fn test_one_live_position_per_token() {
        let book = PositionBook::open(JsonStore::memory()).await.unwrap();
        let first = Position::pending(token(), 100_000_000, 0.8);
        let first_id = first.id.clone();
        book.insert_pending(first).await.unwrap();

        let dup = book.insert_pending(Position::pending(token(), 100_000_000, 0.9)).await;
        assert!(matches!(dup, Err(Error::DuplicatePosition(_))));

        // After a failed entry the token is free again
        book.mark_failed_entry(&first_id, "boom").await.unwrap();
        book.insert_pending(Position::pending(token(), 100_000_000, 0.9))
            .await
            .unwrap();
        assert_eq!(book.live_positions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_and_allocate_exactly_once() {
        let book = PositionBook::open(JsonStore::memory()).await.unwrap();
        let allocator = allocator().await;

        let p = Position::pending(token(), 100_000_000, 0.8);
        let id = p.id.clone();
        book.insert_pending(p).await.unwrap();
        let open = book.mark_open(&id, &fill(1_000.0, 100_000_000)).await.unwrap();

        let instr = exit(&open, ExitReason::StopLoss { price: 0.00005 });
        let exit_id = instr.id.clone();
        book.enqueue_exit(instr).await.unwrap();

        let (closed, record) = book
            .close_and_allocate(&id, &exit_id, &fill(1_000.0, 300_000_000), &allocator)
            .await
            .unwrap();
        assert_eq!(closed.state, PositionState::Closed);
        assert_eq!(closed.realized_pnl, Some(200_000_000));
        assert_eq!(record.total(), 200_000_000);
        assert!(book.pending_exits().await.is_empty());

        let again = book
            .close_and_allocate(&id, &exit_id, &fill(1_000.0, 300_000_000), &allocator)
            .await;
        assert!(matches!(again, Err(Error::LedgerInvariant(_))));
        assert_eq!(book.allocations().await.len(), 1);
        // Rolled back: still closed with the original P&L
        assert_eq!(book.get(&id).await.unwrap().realized_pnl, Some(200_000_000));
    }

    #[tokio::test]
    async fn test_rug_replaces_queued_exit_but_not_in_flight() {
        let book = PositionBook::open(JsonStore::memory()).await.unwrap();
        let p = Position::pending(token(), 100_000_000, 0.8);
        let id = p.id.clone();
        book.insert_pending(p).await.unwrap();
        let open = book.mark_open(&id, &fill(1_000.0, 100_000_000)).await.unwrap();

        let tp = exit(&open, ExitReason::TakeProfit { tiers: vec![0], price: 0.0003 });
        let tp_id = tp.id.clone();
        assert!(book.enqueue_exit(tp).await.unwrap().is_some());

        // Second non-rug exit is ignored
        let sl = exit(&open, ExitReason::StopLoss { price: 0.00005 });
        assert!(book.enqueue_exit(sl).await.unwrap().is_none());

        let rug = exit(&open, ExitReason::Rug { detail: "lp pulled".into() });
        assert!(book.enqueue_exit(rug).await.unwrap().is_some());
        assert!(book.begin_exit(&tp_id).await.unwrap().is_none());

        let pending = book.pending_exit_for(&id).await.unwrap();
        assert!(pending.instruction.reason.is_rug());
        book.begin_exit(&pending.instruction.id).await.unwrap();

        // In flight: nothing replaces it
        let rug2 = exit(&open, ExitReason::Rug { detail: "again".into() });
        assert!(book.enqueue_exit(rug2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_book_survives_restart() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(Some(dir.path().join("book.json")));

        let book = PositionBook::open(store.clone()).await.unwrap();
        let p = Position::pending(token(), 100_000_000, 0.8);
        let id = p.id.clone();
        book.insert_pending(p).await.unwrap();
        let open = book.mark_open(&id, &fill(1_000.0, 100_000_000)).await.unwrap();
        let instr = exit(&open, ExitReason::MaxHold);
        let exit_id = instr.id.clone();
        book.enqueue_exit(instr).await.unwrap();
        book.begin_exit(&exit_id).await.unwrap();
        book.fail_exit(&exit_id, &id, "rpc down").await.unwrap();
        drop(book);

        let reopened = PositionBook::open(store).await.unwrap();
        let position = reopened.get(&id).await.unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert!(position.needs_manual_intervention);

        let requeued = reopened.requeue_all_exits().await.unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].id, exit_id);
    }
}
