//! In-process broadcast of normalized filesystem changes.
//!
//! Delivery is at-most-once and nothing is persisted: a subscriber only sees
//! events published after it subscribed, and a subscriber that falls more
//! than `capacity` events behind loses the oldest ones.

use crate::model::Backup;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::broadcast;

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A change to one absolute path within a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub backup: Backup,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>, backup: Backup) -> Self {
        Self {
            kind,
            path: path.into(),
            backup,
        }
    }
}

#[derive(Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers it reached,
    /// zero when nobody is listening.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn event(kind: ChangeKind, path: &str) -> ChangeEvent {
        ChangeEvent::new(kind, path, Backup::new("photos", "/data/photos"))
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = ChangeBus::default();
        assert_eq!(bus.publish(event(ChangeKind::Created, "/data/photos/a.jpg")), 0);

        let mut late = bus.subscribe();
        assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_events_in_order() {
        let bus = ChangeBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(event(ChangeKind::Created, "/data/photos/a.jpg"));
        bus.publish(event(ChangeKind::Modified, "/data/photos/a.jpg"));

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Created);
            assert_eq!(rx.recv().await.unwrap().kind, ChangeKind::Modified);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_observes_lag() {
        let bus = ChangeBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(event(ChangeKind::Modified, &format!("/data/photos/{i}.jpg")));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
    }
}
