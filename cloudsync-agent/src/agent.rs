//! Startup sequencing and lifetime of the sync pipeline.
//!
//! Per backup, in configuration order: ensure the remote container, watch
//! the tree, reconcile it. Watches go live before the reconciliation walk so
//! changes made during the walk are queued rather than lost; the poll loop
//! only starts once every backup has had its startup pass.

use crate::api::{self, AppState};
use crate::config::Config;
use crate::dispatch::{task_queue, TaskRunner};
use crate::engine::{EventRouter, StatsSnapshot, SyncEngine};
use crate::events::ChangeBus;
use crate::faults::{FaultKind, FaultReporter};
use crate::index::{self, IndexError, LocalIndex};
use crate::model::Backup;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::remote::{self, RemoteStore};
use crate::utils::errors::{AgentError, Result};
use crate::watch::{rescan_queue, FsWatcher, RescanReceiver, WatchError, WatchService};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Agent {
    config: Config,
    index: Arc<dyn LocalIndex>,
    remote: Arc<dyn RemoteStore>,
    faults: FaultReporter,
}

impl Agent {
    pub fn new(config: Config, index: Arc<dyn LocalIndex>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            config,
            index,
            remote,
            faults: FaultReporter::new(),
        }
    }

    /// Validate configuration and open the configured index and remote store
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let index = index::open(&config)?;
        let remote = remote::open(&config)?;
        Ok(Self::new(config, index, remote))
    }

    pub fn faults(&self) -> FaultReporter {
        self.faults.clone()
    }

    /// Run until `shutdown` fires or watch coverage is lost.
    pub async fn run(self, service: Box<dyn WatchService>, shutdown: CancellationToken) -> Result<()> {
        let backups = self.register_backups().await?;
        let stop = shutdown.child_token();

        let (dispatcher, receiver) = task_queue();
        let engine = SyncEngine::new(Arc::clone(&self.index), dispatcher);
        let bus = ChangeBus::new(self.config.watcher.bus_capacity);
        let (rescan_tx, rescan_rx) = rescan_queue();

        let runner = self.runner();
        let runner_handle = tokio::spawn(runner.run(receiver, stop.clone()));

        let router = EventRouter::new(
            Arc::clone(&engine),
            self.config.tasks.event_workers,
            self.faults.clone(),
            rescan_tx.clone(),
            backups.clone(),
        );
        let router_handle = tokio::spawn(router.run(bus.subscribe(), stop.clone()));

        let mut watcher = FsWatcher::new(
            service,
            bus,
            rescan_tx,
            self.faults.clone(),
            self.config.watcher.options(),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&engine),
            Arc::clone(&self.index),
            self.config.watcher.max_depth,
        ));

        for backup in &backups {
            if stop.is_cancelled() {
                break;
            }
            if !self.ensure_container(backup).await {
                continue;
            }
            if watcher.watch_backup(backup).is_err() {
                warn!(backup = %backup.name, "Reconciling without live coverage");
            }
            self.startup_pass(&reconciler, backup).await;
        }

        let registry = watcher.registry();
        let api_handle = self.spawn_api(&backups, &registry, &engine, &stop);
        let rescan_handle = tokio::spawn(rescan_loop(
            Arc::clone(&reconciler),
            self.faults.clone(),
            rescan_rx,
            stop.clone(),
        ));

        let result = if registry.is_empty() && !stop.is_cancelled() {
            self.faults.report(
                None,
                FaultKind::CoverageLost,
                "No backup could be watched; live changes would go undetected",
            );
            Err(AgentError::Watch(WatchError::CoverageLost))
        } else {
            let mut watcher_handle = tokio::spawn(watcher.run(stop.clone()));
            let outcome = tokio::select! {
                _ = stop.cancelled() => None,
                finished = &mut watcher_handle => Some(finished),
            };
            match outcome {
                None => finish(watcher_handle).await,
                Some(Ok(Ok(()))) => Ok(()),
                Some(Ok(Err(e))) => Err(e.into()),
                Some(Err(e)) => Err(e.into()),
            }
        };

        info!("Stopping sync pipeline");
        stop.cancel();

        for handle in [router_handle, rescan_handle, runner_handle] {
            if let Err(e) = handle.await {
                error!("Pipeline task failed: {}", e);
            }
        }
        if let Some(handle) = api_handle {
            match handle.await {
                Ok(Ok(())) => debug!("Diagnostics API stopped"),
                Ok(Err(e)) => error!("Diagnostics API error: {}", e),
                Err(e) => error!("Diagnostics API task failed: {}", e),
            }
        }

        let stats = engine.stats();
        info!(
            dispatched = stats.dispatched,
            succeeded = stats.succeeded,
            failed = stats.failed,
            abandoned = stats.abandoned,
            "Agent stopped"
        );
        result
    }

    /// Reconcile every backup once, wait for the resulting tasks, then stop.
    pub async fn run_once(self) -> Result<StatsSnapshot> {
        let backups = self.register_backups().await?;
        let stop = CancellationToken::new();

        let (dispatcher, receiver) = task_queue();
        let engine = SyncEngine::new(Arc::clone(&self.index), dispatcher);
        let runner_handle = tokio::spawn(self.runner().run(receiver, stop.clone()));

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&engine),
            Arc::clone(&self.index),
            self.config.watcher.max_depth,
        ));

        for backup in &backups {
            if self.ensure_container(backup).await {
                self.startup_pass(&reconciler, backup).await;
            }
        }

        // Settled twice in a row: a settling task may queue a follow-up
        let mut idle_ticks = 0;
        while idle_ticks < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if engine.in_flight() == 0 {
                idle_ticks += 1;
            } else {
                idle_ticks = 0;
            }
        }

        stop.cancel();
        runner_handle.await?;

        let stats = engine.stats();
        info!(
            dispatched = stats.dispatched,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "One-shot sync complete"
        );
        Ok(stats)
    }

    fn runner(&self) -> TaskRunner {
        TaskRunner::new(
            Arc::clone(&self.remote),
            self.faults.clone(),
            self.config.tasks.retry_policy(),
            self.config.tasks.max_concurrent,
            self.config.tasks.shutdown_grace(),
        )
    }

    /// Register configured backups in the index and return the usable ones.
    async fn register_backups(&self) -> Result<Vec<Backup>> {
        let index = Arc::clone(&self.index);
        let configured = self.config.backups();
        tokio::task::spawn_blocking(move || register_backups(index.as_ref(), configured)).await?
    }

    async fn ensure_container(&self, backup: &Backup) -> bool {
        match self.remote.create_container(backup).await {
            Ok(()) => true,
            Err(e) => {
                self.faults.report(
                    Some(&backup.name),
                    FaultKind::RemoteUnavailable,
                    format!("Cannot prepare remote container, skipping backup: {}", e),
                );
                false
            }
        }
    }

    async fn startup_pass(&self, reconciler: &Arc<Reconciler>, backup: &Backup) {
        info!(backup = %backup.name, "Reconciling {}", backup.root.display());
        if let Err(e) = reconcile(reconciler, backup, None).await {
            self.faults.report(
                Some(&backup.name),
                FaultKind::ReconcileAborted,
                e.to_string(),
            );
        }
    }

    fn spawn_api(
        &self,
        backups: &[Backup],
        registry: &crate::watch::WatchRegistry,
        engine: &Arc<SyncEngine>,
        stop: &CancellationToken,
    ) -> Option<JoinHandle<std::io::Result<()>>> {
        if !self.config.api.enabled {
            return None;
        }

        let addr: SocketAddr = match format!("{}:{}", self.config.api.host, self.config.api.port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(host = %self.config.api.host, "Invalid API address, API disabled: {}", e);
                return None;
            }
        };

        let state = AppState {
            agent_id: self.config.agent.id.clone(),
            started: Instant::now(),
            backups: backups.to_vec(),
            registry: registry.clone(),
            engine: Arc::clone(engine),
            faults: self.faults.clone(),
        };
        Some(tokio::spawn(api::serve(state, addr, stop.clone())))
    }
}

fn register_backups(index: &dyn LocalIndex, configured: Vec<Backup>) -> Result<Vec<Backup>> {
    let mut usable = Vec::with_capacity(configured.len());
    for backup in configured {
        match index.register_backup(&backup) {
            Ok(()) => usable.push(backup),
            Err(e @ IndexError::RootMismatch { .. }) => {
                warn!(backup = %backup.name, "Skipping backup: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    for known in index.list_backups()? {
        if !usable.contains(&known) {
            warn!(
                backup = %known.name,
                root = %known.root.display(),
                "Index holds a backup that is not configured; ignoring it"
            );
        }
    }

    if usable.is_empty() {
        return Err(AgentError::Config("no usable backups".into()));
    }
    Ok(usable)
}

async fn reconcile(
    reconciler: &Arc<Reconciler>,
    backup: &Backup,
    dir: Option<PathBuf>,
) -> Result<ReconcileReport> {
    let reconciler = Arc::clone(reconciler);
    let backup = backup.clone();
    tokio::task::spawn_blocking(move || match dir {
        Some(dir) => reconciler.reconcile_subtree(&backup, &dir),
        None => reconciler.reconcile(&backup),
    })
    .await?
}

/// Serve rescan requests from the watcher and the event router, one at a time.
async fn rescan_loop(
    reconciler: Arc<Reconciler>,
    faults: FaultReporter,
    mut requests: RescanReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        info!(
            backup = %request.backup.name,
            reason = ?request.reason,
            "Rescanning {}",
            request.dir.display()
        );
        if let Err(e) = reconcile(&reconciler, &request.backup, Some(request.dir.clone())).await {
            faults.report(
                Some(&request.backup.name),
                FaultKind::ReconcileAborted,
                format!("Rescan of {} failed: {}", request.dir.display(), e),
            );
        }
    }
}

async fn finish(handle: JoinHandle<std::result::Result<(), WatchError>>) -> Result<()> {
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}
