//! Portfolio risk controls
//!
//! The risk ledger is the one piece of shared mutable state in the
//! pipeline. All reads and writes go through `RiskManager`, which holds it
//! behind a single lock and persists every mutation before releasing it.

pub mod control;
pub mod ledger;
pub mod manager;
pub mod sizing;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::lamports_to_sol;

pub use control::{ControlQueue, OperatorCommand, QueuedCommand};
pub use ledger::{ClosedPnl, RiskLedger, RiskLimits};
pub use manager::{RiskManager, SettleOutcome, SlotReservation};
pub use sizing::PositionSizer;

/// Why a new entry was refused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRejection {
    KillSwitchEngaged {
        reason: String,
    },
    /// Losing the whole position would reach the daily loss limit
    DailyLossLimit {
        realized_pnl_today: i64,
        size: u64,
        limit: u64,
    },
    MaxConcurrentPositions {
        open: usize,
        max: usize,
    },
    PositionTooLarge {
        requested: u64,
        max: u64,
    },
    InvalidSize,
    /// Today's realized loss is at the limit; only rollover clears it
    LossLimitReached {
        realized_pnl_today: i64,
        limit: u64,
    },
}

impl fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskRejection::KillSwitchEngaged { reason } => {
                write!(f, "kill switch engaged ({})", reason)
            }
            RiskRejection::DailyLossLimit {
                realized_pnl_today,
                size,
                limit,
            } => write!(
                f,
                "daily loss limit: realized {:.4} SOL, size {:.4} SOL, limit {:.4} SOL",
                lamports_to_sol(*realized_pnl_today),
                lamports_to_sol(*size as i64),
                lamports_to_sol(*limit as i64)
            ),
            RiskRejection::MaxConcurrentPositions { open, max } => {
                write!(f, "max concurrent positions: {}/{}", open, max)
            }
            RiskRejection::PositionTooLarge { requested, max } => write!(
                f,
                "position too large: {:.4} SOL exceeds cap {:.4} SOL",
                lamports_to_sol(*requested as i64),
                lamports_to_sol(*max as i64)
            ),
            RiskRejection::InvalidSize => f.write_str("position size must be positive"),
            RiskRejection::LossLimitReached {
                realized_pnl_today,
                limit,
            } => write!(
                f,
                "daily loss limit reached: realized {:.4} SOL, limit {:.4} SOL",
                lamports_to_sol(*realized_pnl_today),
                lamports_to_sol(*limit as i64)
            ),
        }
    }
}
