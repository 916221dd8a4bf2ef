//! Operator alerts
//!
//! Capital-at-risk events (kill switch, failed exits, failed entries,
//! stale price feeds) are surfaced the moment they happen, never batched.
//! Every alert is logged under the `alert` target and published on a
//! broadcast channel for anything that wants to react (CLI, tests).

use std::fmt;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Degraded but no capital at risk
    Warning,
    /// Capital at risk, operator should look now
    Critical,
}

/// Operator-visible alert
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    KillSwitchEngaged {
        reason: String,
    },
    KillSwitchReset {
        reason: String,
    },
    /// Exit could not be executed; position left open and retried next tick
    ExitFailure {
        position_id: String,
        token: String,
        error: String,
    },
    /// Entry attempts exhausted; position marked FAILED_ENTRY
    ExecutionFatal {
        position_id: String,
        token: String,
        error: String,
    },
    StalePriceFeed {
        position_id: String,
        token: String,
        missed_polls: u32,
    },
    SourceDegraded {
        source_id: String,
        consecutive_failures: u32,
    },
    LedgerInvariant {
        detail: String,
    },
}

impl Alert {
    pub fn severity(&self) -> Severity {
        match self {
            Alert::SourceDegraded { .. } | Alert::KillSwitchReset { .. } => Severity::Warning,
            _ => Severity::Critical,
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::KillSwitchEngaged { reason } => write!(f, "KILL SWITCH ENGAGED: {}", reason),
            Alert::KillSwitchReset { reason } => write!(f, "Kill switch reset: {}", reason),
            Alert::ExitFailure {
                position_id,
                token,
                error,
            } => write!(
                f,
                "EXIT FAILED for position {} ({}): {} - manual intervention required",
                position_id, token, error
            ),
            Alert::ExecutionFatal {
                position_id,
                token,
                error,
            } => write!(f, "ENTRY FAILED for position {} ({}): {}", position_id, token, error),
            Alert::StalePriceFeed {
                position_id,
                token,
                missed_polls,
            } => write!(
                f,
                "Price feed stale for position {} ({}) after {} polls - exit rules suspended",
                position_id, token, missed_polls
            ),
            Alert::SourceDegraded {
                source_id,
                consecutive_failures,
            } => write!(
                f,
                "Source {} degraded after {} consecutive failures",
                source_id, consecutive_failures
            ),
            Alert::LedgerInvariant { detail } => write!(f, "LEDGER INVARIANT VIOLATION: {}", detail),
        }
    }
}

/// Fan-out point for operator alerts
#[derive(Clone)]
pub struct AlertSink {
    tx: broadcast::Sender<Alert>,
}

impl AlertSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Log and publish an alert immediately
    pub fn raise(&self, alert: Alert) {
        match alert.severity() {
            Severity::Critical => error!(target: "alert", "{}", alert),
            Severity::Warning => warn!(target: "alert", "{}", alert),
        }
        // No subscribers is fine; the log line is the primary surface
        let _ = self.tx.send(alert);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }
}

impl Default for AlertSink {
    fn default() -> Self {
        Self::new()
    }
}
