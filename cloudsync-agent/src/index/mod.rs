//! Local index: durable "last known synced state" per file.

pub mod memory;
pub mod sqlite;

use crate::config::{Config, IndexKind};
use crate::model::{Backup, Record};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backup {name} is registered with root {existing}, not {requested}")]
    RootMismatch {
        name: String,
        existing: PathBuf,
        requested: PathBuf,
    },
}

/// Storage for [`Record`]s, shared by the reconciler and the engine.
///
/// Implementations must be safe to call from several threads at once; the
/// engine serializes decisions per path, not index access.
pub trait LocalIndex: Send + Sync {
    /// Register a backup. Idempotent for an identical `(name, root)`; a name
    /// already bound to another root is rejected.
    fn register_backup(&self, backup: &Backup) -> Result<(), IndexError>;

    fn list_backups(&self) -> Result<Vec<Backup>, IndexError>;

    fn get_record(&self, backup: &Backup, path: &Path) -> Result<Option<Record>, IndexError>;

    /// Insert or update the record for `(record.backup, record.path)`
    fn put_record(&self, record: &Record) -> Result<(), IndexError>;

    /// Snapshot of every record of a backup, ordered by path
    fn list_records(&self, backup: &Backup) -> Result<Vec<Record>, IndexError>;

    fn delete_record(&self, record: &Record) -> Result<(), IndexError>;
}

/// Open the index selected by configuration
pub fn open(config: &Config) -> Result<Arc<dyn LocalIndex>, IndexError> {
    match config.index.kind {
        IndexKind::Memory => Ok(Arc::new(MemoryIndex::new())),
        IndexKind::Sqlite => {
            let path = config.index_path();
            tracing::info!(path = %path.display(), "Opening SQLite index");
            Ok(Arc::new(SqliteIndex::open(&path)?))
        }
    }
}
