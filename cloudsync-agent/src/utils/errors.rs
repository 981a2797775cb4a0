//! Custom error types for the sync agent.

use crate::index::IndexError;
use crate::remote::RemoteError;
use crate::watch::WatchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Reconciliation of backup {backup} aborted: {source}")]
    ReconcileAborted {
        backup: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
