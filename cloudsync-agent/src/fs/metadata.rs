//! File metadata used for change detection.
//!
//! Symlinks are never followed: a link is neither a regular file nor a
//! directory as far as the agent is concerned.

use crate::model::Fingerprint;
use serde::{Deserialize, Serialize};
use std::fs::{self, Metadata};
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Metadata snapshot of a single filesystem entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (milliseconds since Unix epoch)
    pub modified_ms: i64,

    pub is_file: bool,

    pub is_dir: bool,

    pub is_symlink: bool,
}

impl FileMetadata {
    /// Extract metadata from a path without following symlinks
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Self::from_metadata(&metadata)
    }

    pub fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        let file_type = metadata.file_type();
        Ok(Self {
            size: metadata.len(),
            modified_ms: modified_millis(metadata)?,
            is_file: file_type.is_file(),
            is_dir: file_type.is_dir(),
            is_symlink: file_type.is_symlink(),
        })
    }

    /// Fingerprint of a regular file; `None` for anything else
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.is_file
            .then(|| Fingerprint::new(self.size, self.modified_ms))
    }
}

/// Stat `path` and return its fingerprint when it is a regular file.
pub fn stat_file(path: &Path) -> io::Result<Option<Fingerprint>> {
    Ok(FileMetadata::from_path(path)?.fingerprint())
}

fn modified_millis(metadata: &Metadata) -> io::Result<i64> {
    let modified = metadata.modified()?;
    let millis = match modified.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(after) => after.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    };
    Ok(millis)
}
