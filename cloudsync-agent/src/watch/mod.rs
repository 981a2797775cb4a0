//! Filesystem watching: the watch primitive, its `notify` backend, the
//! registration map, the recursive poll loop and its rescan queue.

pub mod notify_service;
pub mod registry;
pub mod rescan;
pub mod service;
pub mod watcher;

pub use notify_service::NotifyWatchService;
pub use registry::{Registration, WatchRegistry};
pub use rescan::{rescan_queue, RescanReason, RescanReceiver, RescanRequest, RescanSender};
pub use service::{RawEvent, RawKind, WatchError, WatchHandle, WatchService};
pub use watcher::{FsWatcher, WatcherOptions};
