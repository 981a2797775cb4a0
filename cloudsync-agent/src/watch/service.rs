//! Per-directory watch primitive.
//!
//! Modelled on kernel watch-key APIs: each registered directory gets an
//! opaque handle, handles become "ready" when something happened in their
//! directory, and a drained handle has to be reset before it is reported
//! again. A reset that returns `false` means the handle is dead.

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WatchHandle(pub u64);

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Deleted,
    /// Events were lost; the directory must be rescanned
    Overflow,
}

/// One notification for a watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawKind,
    /// Entry name relative to the watched directory; absent for overflow
    pub name: Option<PathBuf>,
}

impl RawEvent {
    pub fn new(kind: RawKind, name: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            name: Some(name.into()),
        }
    }

    pub fn overflow() -> Self {
        Self {
            kind: RawKind::Overflow,
            name: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to start watch service: {0}")]
    Init(#[from] notify::Error),

    #[error("Failed to watch {path}: {source}")]
    Register {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Watch coverage lost: no directories remain registered")]
    CoverageLost,
}

pub trait WatchService: Send {
    /// Start watching `dir` for create, modify and delete of its entries.
    fn register(&mut self, dir: &Path) -> Result<WatchHandle, WatchError>;

    /// Next handle with pending events, without blocking
    fn poll(&mut self) -> Option<WatchHandle>;

    /// Take the pending events of a handle
    fn drain(&mut self, handle: WatchHandle) -> Vec<RawEvent>;

    /// Re-arm a drained handle. `false` means the handle is no longer valid.
    fn reset(&mut self, handle: WatchHandle) -> bool;

    /// Stop watching and release the handle
    fn cancel(&mut self, handle: WatchHandle);
}
