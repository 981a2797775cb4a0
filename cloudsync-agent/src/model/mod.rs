//! Tracked state: backups, per-file records and pending tasks.

pub mod backup;
pub mod record;
pub mod task;

pub use backup::Backup;
pub use record::{Fingerprint, Record};
pub use task::{Completion, Outcome, Task, TaskKind};
