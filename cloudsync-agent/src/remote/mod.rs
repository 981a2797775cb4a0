//! Remote object store: where backup objects end up.

pub mod http;
pub mod mirror;

use crate::config::{Config, RemoteConfig};
use crate::model::Backup;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub use http::HttpStore;
pub use mirror::MirrorStore;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} of {key} rejected with status {status}")]
    Rejected {
        operation: &'static str,
        key: String,
        status: u16,
    },

    #[error("{0} is not inside the backup root")]
    OutsideRoot(PathBuf),
}

impl RemoteError {
    /// Errors that cannot succeed on retry
    pub fn is_permanent(&self) -> bool {
        match self {
            RemoteError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            RemoteError::Http(_) => false,
            RemoteError::Rejected { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            RemoteError::OutsideRoot(_) => true,
        }
    }
}

/// Remote operations used by the task runner.
///
/// `upload_file` returns only once the remote object durably reflects the
/// file's bytes. `remove_file` treats an already-absent object as success.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Ensure the backup's container exists. Idempotent.
    async fn create_container(&self, backup: &Backup) -> Result<(), RemoteError>;

    async fn upload_file(&self, backup: &Backup, path: &Path) -> Result<(), RemoteError>;

    async fn remove_file(&self, backup: &Backup, path: &Path) -> Result<(), RemoteError>;
}

/// Object key for `path`, or an error when it escapes the backup root
pub(crate) fn object_key(backup: &Backup, path: &Path) -> Result<String, RemoteError> {
    backup
        .object_key(path)
        .ok_or_else(|| RemoteError::OutsideRoot(path.to_path_buf()))
}

/// Build the remote store selected by configuration
pub fn open(config: &Config) -> Result<Arc<dyn RemoteStore>, RemoteError> {
    match &config.remote {
        RemoteConfig::Mirror { root } => {
            tracing::info!(root = %root.display(), "Using mirror remote store");
            Ok(Arc::new(MirrorStore::new(root.clone())))
        }
        RemoteConfig::Http { url, token } => {
            tracing::info!(url = %url, "Using HTTP remote store");
            Ok(Arc::new(HttpStore::new(url, token, &config.agent.id)?))
        }
    }
}
