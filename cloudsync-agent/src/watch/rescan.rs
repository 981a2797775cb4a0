//! Subtree rescan requests.
//!
//! Requests for a `(backup, dir)` pair that is already waiting are dropped:
//! one pass over the subtree serves them all. A request made while its pass
//! is running is queued again, since the running pass may have missed the
//! change that caused it.

use crate::model::Backup;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RescanReason {
    /// The watch service lost events for the directory
    Overflow,
    /// The directory was brought under watch after files may have landed in it
    NewDirectory,
    /// A watched directory went away with its contents
    DirectoryRemoved,
    /// A bus consumer lagged and dropped events
    EventsDropped,
}

/// Ask the reconciler to re-diff one directory subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescanRequest {
    pub backup: Backup,
    pub dir: PathBuf,
    pub reason: RescanReason,
}

impl RescanRequest {
    pub fn new(backup: &Backup, dir: impl Into<PathBuf>, reason: RescanReason) -> Self {
        Self {
            backup: backup.clone(),
            dir: dir.into(),
            reason,
        }
    }
}

type Pending = Arc<Mutex<HashSet<(Backup, PathBuf)>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashSet<(Backup, PathBuf)>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Create a connected rescan sender/receiver pair
pub fn rescan_queue() -> (RescanSender, RescanReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Pending::default();
    (
        RescanSender {
            tx,
            pending: Arc::clone(&pending),
        },
        RescanReceiver { rx, pending },
    )
}

#[derive(Clone)]
pub struct RescanSender {
    tx: mpsc::UnboundedSender<RescanRequest>,
    pending: Pending,
}

impl RescanSender {
    /// Queue a request. Returns `false` when an identical subtree is already
    /// waiting or the receiver is gone.
    pub fn request(&self, request: RescanRequest) -> bool {
        let key = (request.backup.clone(), request.dir.clone());
        let mut pending = lock(&self.pending);
        if pending.contains(&key) {
            debug!(
                backup = %request.backup.name,
                reason = ?request.reason,
                "Rescan of {} already queued",
                request.dir.display()
            );
            return false;
        }

        match self.tx.send(request) {
            Ok(()) => {
                pending.insert(key);
                true
            }
            Err(e) => {
                debug!(dir = %e.0.dir.display(), "Rescan receiver closed, request dropped");
                false
            }
        }
    }
}

pub struct RescanReceiver {
    rx: mpsc::UnboundedReceiver<RescanRequest>,
    pending: Pending,
}

impl RescanReceiver {
    /// Next request, or `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<RescanRequest> {
        let request = self.rx.recv().await?;
        self.taken(&request);
        Some(request)
    }

    pub fn try_recv(&mut self) -> Option<RescanRequest> {
        let request = self.rx.try_recv().ok()?;
        self.taken(&request);
        Some(request)
    }

    fn taken(&self, request: &RescanRequest) {
        lock(&self.pending).remove(&(request.backup.clone(), request.dir.clone()));
    }
}
