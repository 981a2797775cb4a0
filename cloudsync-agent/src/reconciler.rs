//! Consistency reconciler.
//!
//! Diffs a backup tree against the local index and feeds the engine
//! whatever tasks close the gap. Runs once per backup at startup and again
//! for a subtree whenever the watcher may have missed changes.
//!
//! Order matters: the root is probed before anything else, so an unmounted
//! or unreadable root aborts the pass instead of turning every record into
//! a delete.

use crate::engine::{Decision, SyncEngine};
use crate::fs::metadata::stat_file;
use crate::fs::walker::{walk_files, WalkOptions};
use crate::index::LocalIndex;
use crate::model::{Backup, TaskKind};
use crate::utils::errors::{AgentError, Result};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub uploads: usize,
    pub replaces: usize,
    pub deletes: usize,
    /// Paths that already had a task in flight
    pub deferred: usize,
    pub unchanged: usize,
    /// Entries that could not be read
    pub skipped: usize,
}

impl ReconcileReport {
    /// Tasks issued by this pass
    pub fn tasks(&self) -> usize {
        self.uploads + self.replaces + self.deletes
    }

    fn tally(&mut self, decision: Decision) {
        match decision {
            Decision::Dispatched(TaskKind::Upload) => self.uploads += 1,
            Decision::Dispatched(TaskKind::Replace) => self.replaces += 1,
            Decision::Dispatched(TaskKind::Delete) => self.deletes += 1,
            Decision::Deferred => self.deferred += 1,
            Decision::Unchanged | Decision::Orphaned => self.unchanged += 1,
            Decision::Ignored | Decision::Undeliverable => self.skipped += 1,
        }
    }
}

pub struct Reconciler {
    engine: Arc<SyncEngine>,
    index: Arc<dyn LocalIndex>,
    max_depth: usize,
}

impl Reconciler {
    pub fn new(engine: Arc<SyncEngine>, index: Arc<dyn LocalIndex>, max_depth: usize) -> Self {
        Self {
            engine,
            index,
            max_depth,
        }
    }

    /// Full pass over a backup
    pub fn reconcile(&self, backup: &Backup) -> Result<ReconcileReport> {
        self.reconcile_subtree(backup, &backup.root)
    }

    /// Pass restricted to records and files under `dir`
    pub fn reconcile_subtree(&self, backup: &Backup, dir: &Path) -> Result<ReconcileReport> {
        if let Err(source) = fs::read_dir(&backup.root) {
            return Err(AgentError::ReconcileAborted {
                backup: backup.name.clone(),
                source,
            });
        }

        let mut report = ReconcileReport::default();

        // Records whose file is gone
        for record in self.index.list_records(backup)? {
            if !record.path.starts_with(dir) {
                continue;
            }
            match stat_file(&record.path) {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        backup = %backup.name,
                        path = %record.path.display(),
                        "Cannot stat indexed file, skipping: {}",
                        e
                    );
                    report.skipped += 1;
                    continue;
                }
            }
            report.tally(self.engine.remove_file(backup, &record.path)?);
        }

        // Files on disk
        let walk = match walk_files(dir, &WalkOptions { max_depth: self.max_depth }) {
            Ok(walk) => Some(walk),
            Err(e) if dir != backup.root && e.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "Subtree no longer exists");
                None
            }
            Err(source) => {
                return Err(AgentError::ReconcileAborted {
                    backup: backup.name.clone(),
                    source,
                })
            }
        };

        for entry in walk.into_iter().flatten() {
            match entry {
                Ok(file) => report.tally(self.engine.check_file(backup, &file.path)?),
                Err(e) => {
                    warn!(backup = %backup.name, "Skipping unreadable entry: {}", e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            backup = %backup.name,
            dir = %dir.display(),
            uploads = report.uploads,
            replaces = report.replaces,
            deletes = report.deletes,
            deferred = report.deferred,
            unchanged = report.unchanged,
            skipped = report.skipped,
            "Reconciliation complete"
        );
        Ok(report)
    }
}
