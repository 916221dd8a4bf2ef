//! Operator command queue
//!
//! The CLI never writes the risk ledger directly while the engine may be
//! running. Each command is written to its own file under the control
//! directory; the engine applies the files in issue order on its
//! housekeeping tick (and at startup), deleting each one only after it has
//! been applied. Submitter and engine never rewrite a shared file, so a
//! command can neither be lost nor replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::error;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::JsonStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OperatorCommand {
    EngageKillSwitch {
        reason: String,
        issued_at: DateTime<Utc>,
    },
    ResetKillSwitch {
        reason: String,
        issued_at: DateTime<Utc>,
    },
}

impl OperatorCommand {
    pub fn engage(reason: impl Into<String>) -> Self {
        OperatorCommand::EngageKillSwitch {
            reason: reason.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn reset(reason: impl Into<String>) -> Self {
        OperatorCommand::ResetKillSwitch {
            reason: reason.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        match self {
            OperatorCommand::EngageKillSwitch { issued_at, .. }
            | OperatorCommand::ResetKillSwitch { issued_at, .. } => *issued_at,
        }
    }
}

/// A command read from the queue, removed with `ControlQueue::ack`
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    store: JsonStore,
    pub command: OperatorCommand,
}

#[derive(Debug, Clone)]
pub struct ControlQueue {
    dir: Option<PathBuf>,
}

impl ControlQueue {
    /// Queue rooted at `dir`; `None` keeps nothing
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Write a command for the engine to apply
    pub async fn submit(&self, command: OperatorCommand) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        // Zero-padded so lexical order is issue order
        let nanos = command.issued_at().timestamp_nanos_opt().unwrap_or(0).max(0);
        let name = format!("{:020}-{}.json", nanos, Uuid::new_v4());
        JsonStore::new(Some(dir.join(name))).save(&command).await
    }

    /// Every queued command, oldest first
    ///
    /// Unreadable command files are logged and skipped; they stay on disk
    /// for the operator to inspect.
    pub async fn pending(&self) -> Result<Vec<QueuedCommand>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Persistence(format!("read {}: {}", dir.display(), e)))
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Persistence(format!("read {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut queued = Vec::with_capacity(paths.len());
        for path in paths {
            let store = JsonStore::new(Some(path));
            match store.load::<Option<OperatorCommand>>().await {
                Ok(Some(command)) => queued.push(QueuedCommand { store, command }),
                // Acked between listing and reading
                Ok(None) => {}
                Err(e) => error!("Skipping unreadable operator command: {}", e),
            }
        }
        Ok(queued)
    }

    /// Remove an applied command
    pub async fn ack(&self, queued: QueuedCommand) -> Result<()> {
        queued.store.remove().await
    }
}
