//! Cloudsync Agent Library
//!
//! Continuous backup agent: keeps local directory trees mirrored into a
//! remote object store, using a local index of the last synced state of
//! every file.

pub mod agent;
pub mod api;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod faults;
pub mod fs;
pub mod index;
pub mod model;
pub mod reconciler;
pub mod remote;
pub mod utils;
pub mod watch;

// Re-export commonly used types
pub use agent::Agent;
pub use config::Config;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
