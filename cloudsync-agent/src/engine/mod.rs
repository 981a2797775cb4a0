//! Sync engine: turns "this path may have changed" into remote tasks.
//!
//! Every decision follows the same sequence: claim the path, compare the
//! filesystem with the index, dispatch at most one task. A path stays
//! claimed until its task settles, so at most one task per path is ever in
//! flight. Changes that arrive meanwhile only mark the path dirty; it is
//! re-evaluated once the task settles.
//!
//! The index is written only from task completions, after remote success.

pub mod router;

use crate::dispatch::TaskDispatcher;
use crate::events::{ChangeEvent, ChangeKind};
use crate::fs::metadata::stat_file;
use crate::index::{IndexError, LocalIndex};
use crate::model::{Backup, Completion, Fingerprint, Outcome, Record, Task, TaskKind};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

pub use router::EventRouter;

type PathKey = (String, PathBuf);

fn path_key(backup: &Backup, path: &Path) -> PathKey {
    (backup.name.clone(), path.to_path_buf())
}

#[derive(Default)]
struct Pending {
    dirty: bool,
}

/// What a single evaluation of a path decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A task was queued
    Dispatched(TaskKind),
    /// Index and filesystem agree
    Unchanged,
    /// A task for the path is in flight; it will be re-evaluated afterwards
    Deferred,
    /// Not a regular file (directory, symlink, already gone)
    Ignored,
    /// Delete for a path the index never recorded
    Orphaned,
    /// The task queue is closed; the task was abandoned
    Undeliverable,
}

#[derive(Debug, Clone, Copy)]
enum Intent {
    Check,
    Remove,
}

impl Intent {
    fn for_path(path: &Path) -> Self {
        if path.symlink_metadata().is_ok() {
            Intent::Check
        } else {
            Intent::Remove
        }
    }
}

/// Index change applied once the remote confirms a task
#[derive(Debug)]
enum IndexUpdate {
    Put(Record),
    Delete(Record),
}

enum Plan {
    Dispatch(TaskKind, Option<Fingerprint>, IndexUpdate),
    Skip(Decision),
}

#[derive(Default)]
struct SyncStats {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    deferred: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub deferred: u64,
    pub in_flight: usize,
}

pub struct SyncEngine {
    index: Arc<dyn LocalIndex>,
    dispatcher: TaskDispatcher,
    in_flight: Mutex<HashMap<PathKey, Pending>>,
    stats: SyncStats,
}

impl SyncEngine {
    pub fn new(index: Arc<dyn LocalIndex>, dispatcher: TaskDispatcher) -> Arc<Self> {
        Arc::new(Self {
            index,
            dispatcher,
            in_flight: Mutex::new(HashMap::new()),
            stats: SyncStats::default(),
        })
    }

    /// Upload or replace `path` if it differs from its record.
    pub fn check_file(self: &Arc<Self>, backup: &Backup, path: &Path) -> Result<Decision, IndexError> {
        self.evaluate(backup, path, Intent::Check)
    }

    /// Delete the remote copy of `path` if the index knows it.
    pub fn remove_file(self: &Arc<Self>, backup: &Backup, path: &Path) -> Result<Decision, IndexError> {
        self.evaluate(backup, path, Intent::Remove)
    }

    pub fn handle_event(self: &Arc<Self>, event: &ChangeEvent) -> Result<Decision, IndexError> {
        let decision = match event.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                self.check_file(&event.backup, &event.path)?
            }
            ChangeKind::Deleted => self.remove_file(&event.backup, &event.path)?,
        };
        debug!(
            backup = %event.backup.name,
            event = %event.kind,
            decision = ?decision,
            "{}",
            event.path.display()
        );
        Ok(decision)
    }

    /// Paths with a task in flight
    pub fn in_flight(&self) -> usize {
        self.table().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            abandoned: self.stats.abandoned.load(Ordering::Relaxed),
            deferred: self.stats.deferred.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }

    fn evaluate(
        self: &Arc<Self>,
        backup: &Backup,
        path: &Path,
        mut intent: Intent,
    ) -> Result<Decision, IndexError> {
        let key = path_key(backup, path);
        loop {
            if !self.claim(&key) {
                self.stats.deferred.fetch_add(1, Ordering::Relaxed);
                return Ok(Decision::Deferred);
            }

            let plan = match self.plan(intent, backup, path) {
                Ok(plan) => plan,
                Err(e) => {
                    self.release(&key);
                    return Err(e);
                }
            };

            match plan {
                Plan::Dispatch(kind, fingerprint, update) => {
                    return Ok(self.send(kind, backup, path, fingerprint, update));
                }
                Plan::Skip(decision) => {
                    if !self.release(&key) {
                        return Ok(decision);
                    }
                    intent = Intent::for_path(path);
                }
            }
        }
    }

    fn plan(&self, intent: Intent, backup: &Backup, path: &Path) -> Result<Plan, IndexError> {
        match intent {
            Intent::Check => {
                let fingerprint = match stat_file(path) {
                    Ok(Some(fingerprint)) => fingerprint,
                    Ok(None) => return Ok(Plan::Skip(Decision::Ignored)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Ok(Plan::Skip(Decision::Ignored))
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "Cannot stat file, skipping: {}", e);
                        return Ok(Plan::Skip(Decision::Ignored));
                    }
                };

                let plan = match self.index.get_record(backup, path)? {
                    None => Plan::Dispatch(
                        TaskKind::Upload,
                        Some(fingerprint),
                        IndexUpdate::Put(Record::new(backup, path, fingerprint)),
                    ),
                    Some(record) if record.matches(path, &fingerprint) => {
                        Plan::Skip(Decision::Unchanged)
                    }
                    Some(mut record) => {
                        record.refresh(fingerprint);
                        Plan::Dispatch(TaskKind::Replace, Some(fingerprint), IndexUpdate::Put(record))
                    }
                };
                Ok(plan)
            }
            Intent::Remove => match self.index.get_record(backup, path)? {
                Some(record) => Ok(Plan::Dispatch(TaskKind::Delete, None, IndexUpdate::Delete(record))),
                None => {
                    debug!(
                        backup = %backup.name,
                        path = %path.display(),
                        "Delete for untracked path, nothing to do"
                    );
                    Ok(Plan::Skip(Decision::Orphaned))
                }
            },
        }
    }

    fn send(
        self: &Arc<Self>,
        kind: TaskKind,
        backup: &Backup,
        path: &Path,
        fingerprint: Option<Fingerprint>,
        update: IndexUpdate,
    ) -> Decision {
        let engine = Arc::downgrade(self);
        let owner = backup.clone();
        let target = path.to_path_buf();
        let completion = Completion::new(move |outcome| match engine.upgrade() {
            Some(engine) => engine.settle(&owner, &target, update, outcome),
            None => debug!(path = %target.display(), "Engine gone, dropping completion"),
        });

        let task = Task::new(kind, backup.clone(), path.to_path_buf(), fingerprint, completion);
        info!(
            task = %task.id,
            backup = %backup.name,
            kind = %kind,
            "Queueing {}",
            path.display()
        );

        if self.dispatcher.dispatch(task) {
            self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            Decision::Dispatched(kind)
        } else {
            Decision::Undeliverable
        }
    }

    fn settle(self: &Arc<Self>, backup: &Backup, path: &Path, update: IndexUpdate, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                let applied = match &update {
                    IndexUpdate::Put(record) => self.index.put_record(record),
                    IndexUpdate::Delete(record) => self.index.delete_record(record),
                };
                if let Err(e) = applied {
                    error!(
                        backup = %backup.name,
                        path = %path.display(),
                        "Remote succeeded but index update failed: {}",
                        e
                    );
                }
            }
            Outcome::Failed(reason) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    backup = %backup.name,
                    path = %path.display(),
                    "Task failed, index left unchanged: {}",
                    reason
                );
            }
            Outcome::Abandoned => {
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                debug!(
                    backup = %backup.name,
                    path = %path.display(),
                    "Task abandoned; next reconciliation will heal it"
                );
            }
        }

        let dirty = self.release(&path_key(backup, path));
        if dirty && !self.dispatcher.is_closed() {
            if let Err(e) = self.evaluate(backup, path, Intent::for_path(path)) {
                error!(path = %path.display(), "Re-evaluation failed: {}", e);
            }
        }
    }

    /// Claim `key` for a decision. A key that is already claimed is marked
    /// dirty instead.
    fn claim(&self, key: &PathKey) -> bool {
        let mut table = self.table();
        match table.get_mut(key) {
            Some(pending) => {
                pending.dirty = true;
                false
            }
            None => {
                table.insert(key.clone(), Pending::default());
                true
            }
        }
    }

    /// Release `key`; returns whether it was marked dirty meanwhile.
    fn release(&self, key: &PathKey) -> bool {
        self.table()
            .remove(key)
            .map(|pending| pending.dirty)
            .unwrap_or(false)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PathKey, Pending>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
