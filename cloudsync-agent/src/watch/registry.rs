//! Watch handle → directory registrations.
//!
//! Mutated only by the watcher's poll loop; the diagnostics API reads it
//! concurrently.

use super::service::WatchHandle;
use crate::model::Backup;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub handle: WatchHandle,
    pub dir: PathBuf,
    pub backup: Backup,
}

#[derive(Clone, Default)]
pub struct WatchRegistry {
    inner: Arc<RwLock<HashMap<WatchHandle, Registration>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration. An existing handle keeps its first owner.
    pub fn insert(&self, registration: Registration) -> bool {
        let mut map = self.write();
        if map.contains_key(&registration.handle) {
            return false;
        }
        map.insert(registration.handle, registration);
        true
    }

    pub fn remove(&self, handle: WatchHandle) -> Option<Registration> {
        self.write().remove(&handle)
    }

    pub fn get(&self, handle: WatchHandle) -> Option<Registration> {
        self.read().get(&handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All registrations ordered by directory
    pub fn snapshot(&self) -> Vec<Registration> {
        let mut all: Vec<Registration> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.dir.cmp(&b.dir));
        all
    }

    pub fn contains_dir(&self, dir: &Path) -> bool {
        self.read().values().any(|r| r.dir == dir)
    }

    pub fn handles(&self) -> Vec<WatchHandle> {
        self.read().keys().copied().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WatchHandle, Registration>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WatchHandle, Registration>> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
