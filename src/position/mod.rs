//! Positions, their durable book, and the exit-rule monitor

pub mod exit_rules;
pub mod manager;
pub mod monitor;
pub mod price_feed;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::execution::Fill;
use crate::signal::TokenKey;

pub use exit_rules::{ExitDecision, ExitRules};
pub use manager::PositionBook;
pub use monitor::PositionMonitor;
pub use price_feed::{DexScreenerPriceSource, PriceQuote, PriceSource};

/// Remaining token amounts at or below this share of the original are dust
const DUST_FRACTION: f64 = 1e-9;

/// Position lifecycle
///
/// `PendingEntry -> Open -> (PartialExit)* -> Closed`, or
/// `PendingEntry -> FailedEntry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    PendingEntry,
    Open,
    PartialExit,
    Closed,
    FailedEntry,
}

impl PositionState {
    /// Holds (or may hold) tokens and a risk slot
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            PositionState::PendingEntry | PositionState::Open | PositionState::PartialExit
        )
    }

    /// Eligible for exit-rule evaluation
    pub fn is_held(&self) -> bool {
        matches!(self, PositionState::Open | PositionState::PartialExit)
    }

    pub fn can_transition_to(&self, next: PositionState) -> bool {
        use PositionState::*;
        matches!(
            (self, next),
            (PendingEntry, Open)
                | (PendingEntry, FailedEntry)
                | (Open, PartialExit)
                | (Open, Closed)
                | (PartialExit, PartialExit)
                | (PartialExit, Closed)
        )
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionState::PendingEntry => "PENDING_ENTRY",
            PositionState::Open => "OPEN",
            PositionState::PartialExit => "PARTIAL_EXIT",
            PositionState::Closed => "CLOSED",
            PositionState::FailedEntry => "FAILED_ENTRY",
        };
        f.write_str(s)
    }
}

/// A position in one token
///
/// Token amounts are whole tokens; prices are in the native quote asset
/// (SOL) per token; money is integer lamports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub token: TokenKey,
    pub state: PositionState,
    pub confluence_score: f64,
    /// Lamports approved by the risk manager
    pub size_lamports: u64,
    pub entry_price: f64,
    /// Lamports actually spent on entry
    pub cost_lamports: u64,
    pub original_token_amount: f64,
    pub remaining_token_amount: f64,
    /// Lamports received from all exits so far
    pub proceeds_lamports: u64,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Set on close: proceeds minus cost
    pub realized_pnl: Option<i64>,
    /// Indices of take-profit tiers already executed
    #[serde(default)]
    pub tiers_hit: BTreeSet<usize>,
    /// Liquidity at the first fresh quote, baseline for rug detection
    #[serde(default)]
    pub reference_liquidity_usd: Option<f64>,
    #[serde(default)]
    pub needs_manual_intervention: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub signatures: Vec<String>,
}

impl Position {
    pub fn pending(token: TokenKey, size_lamports: u64, confluence_score: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            token,
            state: PositionState::PendingEntry,
            confluence_score,
            size_lamports,
            entry_price: 0.0,
            cost_lamports: 0,
            original_token_amount: 0.0,
            remaining_token_amount: 0.0,
            proceeds_lamports: 0,
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
            realized_pnl: None,
            tiers_hit: BTreeSet::new(),
            reference_liquidity_usd: None,
            needs_manual_intervention: false,
            last_error: None,
            signatures: Vec::new(),
        }
    }

    /// Would selling `amount` leave only dust behind
    pub fn sells_out(&self, amount: f64) -> bool {
        self.remaining_token_amount - amount <= self.original_token_amount * DUST_FRACTION
    }

    /// Proceeds minus cost, as of now
    pub fn running_pnl(&self) -> i64 {
        self.proceeds_lamports as i64 - self.cost_lamports as i64
    }

    pub(crate) fn apply_entry(&mut self, fill: &Fill) {
        self.entry_price = fill.price;
        self.cost_lamports = fill.lamports;
        self.original_token_amount = fill.token_amount;
        self.remaining_token_amount = fill.token_amount;
        self.opened_at = Some(Utc::now());
        self.signatures.push(fill.signature.clone());
    }

    pub(crate) fn apply_exit(&mut self, fill: &Fill) {
        self.remaining_token_amount = (self.remaining_token_amount - fill.token_amount).max(0.0);
        self.proceeds_lamports += fill.lamports;
        self.signatures.push(fill.signature.clone());
    }
}

/// How much of a position an exit sells
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellAmount {
    /// Everything that remains
    All,
    /// Fixed token amount, capped at what remains
    Tokens(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    Rug { detail: String },
    StopLoss { price: f64 },
    TakeProfit { tiers: Vec<usize>, price: f64 },
    MaxHold,
}

impl ExitReason {
    pub fn is_rug(&self) -> bool {
        matches!(self, ExitReason::Rug { .. })
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Rug { detail } => write!(f, "rug detected ({})", detail),
            ExitReason::StopLoss { price } => write!(f, "stop loss at {}", price),
            ExitReason::TakeProfit { tiers, price } => {
                write!(f, "take profit tiers {:?} at {}", tiers, price)
            }
            ExitReason::MaxHold => f.write_str("max hold time"),
        }
    }
}

/// Instruction from the monitor to the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitInstruction {
    pub id: String,
    pub position_id: String,
    pub token: TokenKey,
    pub sell: SellAmount,
    pub reason: ExitReason,
    pub created_at: DateTime<Utc>,
}

impl ExitInstruction {
    pub fn new(position: &Position, decision: ExitDecision) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            position_id: position.id.clone(),
            token: position.token.clone(),
            sell: decision.sell,
            reason: decision.reason,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingExitStatus {
    /// Persisted, waiting for the engine
    Queued,
    /// Engine is submitting
    InFlight,
    /// Last attempt failed; re-dispatched on the next monitor tick
    Failed,
}

/// Durable record of an exit that has not completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExit {
    pub instruction: ExitInstruction,
    pub status: PendingExitStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}
