//! Last confirmed synced state of a file.

use super::Backup;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Cheap content proxy: byte size plus last-modified time in milliseconds.
///
/// Two different contents with identical size and mtime are indistinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified_ms: i64,
}

impl Fingerprint {
    pub fn new(size: u64, modified_ms: i64) -> Self {
        Self { size, modified_ms }
    }
}

/// One row of the local index. At most one record exists per `(backup, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Owning backup name
    pub backup: String,

    /// Absolute file path
    pub path: PathBuf,

    pub modified_ms: i64,

    pub size: u64,
}

impl Record {
    pub fn new(backup: &Backup, path: impl Into<PathBuf>, fingerprint: Fingerprint) -> Self {
        Self {
            backup: backup.name.clone(),
            path: path.into(),
            modified_ms: fingerprint.modified_ms,
            size: fingerprint.size,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.size, self.modified_ms)
    }

    /// True iff path, size and modification time all agree.
    pub fn matches(&self, path: &Path, fingerprint: &Fingerprint) -> bool {
        self.path == path && self.fingerprint() == *fingerprint
    }

    /// Refresh size and mtime after a successful replace
    pub fn refresh(&mut self, fingerprint: Fingerprint) {
        self.size = fingerprint.size;
        self.modified_ms = fingerprint.modified_ms;
    }
}
