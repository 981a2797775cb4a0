//! Operator-visible faults.
//!
//! Anything that stops the agent from keeping a backup in sync without
//! operator help ends up here, from aborted reconciliations and lost watch
//! coverage to exhausted task retries and dropped change events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::error;
use uuid::Uuid;

/// Faults kept for the diagnostics API
pub const FAULT_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    ReconcileAborted,
    RemoteUnavailable,
    WatchSetupFailed,
    CoverageLost,
    TaskFailed {
        task_id: Uuid,
        operation: String,
        path: PathBuf,
    },
    EventsDropped {
        count: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Fault {
    pub at: DateTime<Utc>,
    pub backup: Option<String>,
    #[serde(flatten)]
    pub kind: FaultKind,
    pub message: String,
}

/// Logs faults and keeps the most recent ones. Clones share one history.
#[derive(Clone)]
pub struct FaultReporter {
    history: Arc<Mutex<VecDeque<Fault>>>,
}

impl FaultReporter {
    pub fn new() -> Self {
        Self {
            history: Arc::new(Mutex::new(VecDeque::with_capacity(FAULT_HISTORY))),
        }
    }

    pub fn report(&self, backup: Option<&str>, kind: FaultKind, message: impl Into<String>) {
        let fault = Fault {
            at: Utc::now(),
            backup: backup.map(str::to_string),
            kind,
            message: message.into(),
        };

        error!(
            backup = fault.backup.as_deref().unwrap_or("-"),
            fault = ?fault.kind,
            "{}",
            fault.message
        );

        let mut history = self.lock();
        if history.len() == FAULT_HISTORY {
            history.pop_front();
        }
        history.push_back(fault);
    }

    /// Most recent faults, oldest first
    pub fn recent(&self) -> Vec<Fault> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Fault>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FaultReporter {
    fn default() -> Self {
        Self::new()
    }
}
