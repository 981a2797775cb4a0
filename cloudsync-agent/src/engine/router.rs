//! Bus consumer feeding the engine.
//!
//! Events are sharded by `(backup, path)` onto a fixed pool of blocking
//! workers, so events for one path are always handled in publish order
//! while unrelated paths proceed in parallel.

use super::SyncEngine;
use crate::events::ChangeEvent;
use crate::faults::{FaultKind, FaultReporter};
use crate::model::Backup;
use crate::watch::{RescanReason, RescanRequest, RescanSender};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct EventRouter {
    engine: Arc<SyncEngine>,
    workers: usize,
    faults: FaultReporter,
    rescans: RescanSender,
    backups: Vec<Backup>,
}

impl EventRouter {
    pub fn new(
        engine: Arc<SyncEngine>,
        workers: usize,
        faults: FaultReporter,
        rescans: RescanSender,
        backups: Vec<Backup>,
    ) -> Self {
        Self {
            engine,
            workers: workers.max(1),
            faults,
            rescans,
            backups,
        }
    }

    pub async fn run(self, mut events: broadcast::Receiver<ChangeEvent>, shutdown: CancellationToken) {
        let mut queues = Vec::with_capacity(self.workers);
        let mut workers = Vec::with_capacity(self.workers);

        for worker in 0..self.workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
            let engine = Arc::clone(&self.engine);
            let cancel = shutdown.clone();
            workers.push(tokio::task::spawn_blocking(move || {
                while let Some(event) = rx.blocking_recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Err(e) = engine.handle_event(&event) {
                        warn!(
                            worker,
                            backup = %event.backup.name,
                            "Failed to handle {} event for {}: {}",
                            event.kind,
                            event.path.display(),
                            e
                        );
                    }
                }
            }));
            queues.push(tx);
        }

        info!(workers = self.workers, "Event router started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        let shard = shard_for(&event, queues.len());
                        if queues[shard].send(event).is_err() {
                            warn!(shard, "Event worker stopped unexpectedly");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(count)) => self.on_lag(count),
                    Err(RecvError::Closed) => {
                        debug!("Change bus closed");
                        break;
                    }
                },
            }
        }

        drop(queues);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Event worker panicked: {}", e);
            }
        }
        info!("Event router stopped");
    }

    /// Dropped events are treated like an overflow of every backup root.
    fn on_lag(&self, count: u64) {
        self.faults.report(
            None,
            FaultKind::EventsDropped { count },
            format!("Event consumer lagged, {} change events dropped", count),
        );

        for backup in &self.backups {
            self.rescans.request(RescanRequest::new(
                backup,
                &backup.root,
                RescanReason::EventsDropped,
            ));
        }
    }
}

fn shard_for(event: &ChangeEvent, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    event.backup.name.hash(&mut hasher);
    event.path.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
