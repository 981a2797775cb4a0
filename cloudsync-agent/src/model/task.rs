//! Pending remote operations.
//!
//! Tasks live only in memory. A task that is lost (crash, remote failure,
//! shutdown) is not replayed; the next reconciliation pass re-detects the
//! discrepancy and issues an equivalent one.

use super::{Backup, Fingerprint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Upload,
    Replace,
    Delete,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::Upload => "upload",
            TaskKind::Replace => "replace",
            TaskKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// How a task ended, as seen by its completion notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The remote operation is durable
    Succeeded,
    /// Retries were exhausted
    Failed(String),
    /// The task was dropped before it could finish
    Abandoned,
}

type Notify = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Completion notification attached to a task.
///
/// Fires exactly once. Dropping it unfired reports [`Outcome::Abandoned`].
pub struct Completion {
    notify: Option<Notify>,
}

impl Completion {
    pub fn new<F>(notify: F) -> Self
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        Self {
            notify: Some(Box::new(notify)),
        }
    }

    pub fn noop() -> Self {
        Self { notify: None }
    }

    pub fn succeed(self) {
        self.finish(Outcome::Succeeded);
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.finish(Outcome::Failed(reason.into()));
    }

    fn finish(mut self, outcome: Outcome) {
        if let Some(notify) = self.notify.take() {
            notify(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(notify) = self.notify.take() {
            notify(Outcome::Abandoned);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.notify.is_some())
            .finish()
    }
}

/// A unit of pending remote work.
#[derive(Debug)]
pub struct Task {
    /// Correlation id for logs
    pub id: Uuid,

    pub kind: TaskKind,

    pub backup: Backup,

    /// Absolute path of the file the task concerns
    pub path: PathBuf,

    /// Fingerprint observed when the task was decided (upload/replace only)
    pub fingerprint: Option<Fingerprint>,

    completion: Completion,
}

impl Task {
    pub fn new(
        kind: TaskKind,
        backup: Backup,
        path: PathBuf,
        fingerprint: Option<Fingerprint>,
        completion: Completion,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            backup,
            path,
            fingerprint,
            completion,
        }
    }

    /// Report remote success
    pub fn succeed(self) {
        self.completion.succeed();
    }

    /// Report a terminal remote failure
    pub fn fail(self, reason: impl Into<String>) {
        self.completion.fail(reason);
    }
}
