//! SQLite-backed index.
//!
//! Paths are stored as UTF-8 text; non UTF-8 path bytes are replaced lossily.

use super::{IndexError, LocalIndex};
use crate::model::{Backup, Record};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
  name TEXT PRIMARY KEY,
  root TEXT NOT NULL,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS records (
  backup TEXT NOT NULL REFERENCES backups(name) ON DELETE CASCADE,
  path TEXT NOT NULL,
  modified_ms INTEGER NOT NULL,
  size INTEGER NOT NULL,
  updated_at TEXT NOT NULL DEFAULT (datetime('now')),
  PRIMARY KEY (backup, path)
);
"#;

pub struct SqliteIndex {
    pool: DbPool,
}

impl SqliteIndex {
    /// Open (and create if needed) the index database at `path`
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = FULL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder().max_size(4).build(manager)?;
        Self::with_pool(pool)
    }

    /// Private in-memory database. Each in-memory connection is a separate
    /// database, so the pool holds exactly one.
    pub fn open_in_memory() -> Result<Self, IndexError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::with_pool(pool)
    }

    fn with_pool(pool: DbPool) -> Result<Self, IndexError> {
        pool.get()?.execute_batch(SCHEMA)?;
        tracing::debug!("Index schema ready");
        Ok(Self { pool })
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn row_to_record(row: &Row) -> rusqlite::Result<Record> {
    let path: String = row.get("path")?;
    let size: i64 = row.get("size")?;
    Ok(Record {
        backup: row.get("backup")?,
        path: PathBuf::from(path),
        modified_ms: row.get("modified_ms")?,
        size: size as u64,
    })
}

impl LocalIndex for SqliteIndex {
    fn register_backup(&self, backup: &Backup) -> Result<(), IndexError> {
        let conn = self.pool.get()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT root FROM backups WHERE name = ?1",
                params![backup.name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(root) if Path::new(&root) != backup.root => Err(IndexError::RootMismatch {
                name: backup.name.clone(),
                existing: PathBuf::from(root),
                requested: backup.root.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT OR IGNORE INTO backups (name, root) VALUES (?1, ?2)",
                    params![backup.name, path_text(&backup.root)],
                )?;
                Ok(())
            }
        }
    }

    fn list_backups(&self) -> Result<Vec<Backup>, IndexError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT name, root FROM backups ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let root: String = row.get(1)?;
            Ok(Backup::new(name, root))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn get_record(&self, backup: &Backup, path: &Path) -> Result<Option<Record>, IndexError> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                "SELECT backup, path, modified_ms, size FROM records WHERE backup = ?1 AND path = ?2",
                params![backup.name, path_text(path)],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn put_record(&self, record: &Record) -> Result<(), IndexError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO records (backup, path, modified_ms, size)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(backup, path) DO UPDATE SET
               modified_ms = excluded.modified_ms,
               size = excluded.size,
               updated_at = datetime('now')",
            params![
                record.backup,
                path_text(&record.path),
                record.modified_ms,
                record.size as i64,
            ],
        )?;
        Ok(())
    }

    fn list_records(&self, backup: &Backup) -> Result<Vec<Record>, IndexError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT backup, path, modified_ms, size FROM records WHERE backup = ?1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![backup.name], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_record(&self, record: &Record) -> Result<(), IndexError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM records WHERE backup = ?1 AND path = ?2",
            params![record.backup, path_text(&record.path)],
        )?;
        Ok(())
    }
}
