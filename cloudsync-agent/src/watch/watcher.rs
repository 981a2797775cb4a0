//! Recursive filesystem watcher.
//!
//! Keeps a watch on every directory of each backup tree, polls the watch
//! service on a fixed interval and republishes normalized events on the
//! [`ChangeBus`]. Lost events (overflow) and freshly watched directories are
//! turned into subtree rescan requests for the reconciler.

use super::registry::{Registration, WatchRegistry};
use super::rescan::{RescanReason, RescanRequest, RescanSender};
use super::service::{RawKind, WatchError, WatchHandle, WatchService};
use crate::events::{ChangeBus, ChangeEvent, ChangeKind};
use crate::faults::{FaultKind, FaultReporter};
use crate::fs::walker::DEFAULT_MAX_DEPTH;
use crate::model::Backup;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Watch directories created after startup
    pub recursive: bool,
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub max_depth: usize,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            initial_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(3),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

pub struct FsWatcher {
    service: Box<dyn WatchService>,
    registry: WatchRegistry,
    bus: ChangeBus,
    rescans: RescanSender,
    faults: FaultReporter,
    options: WatcherOptions,
}

impl FsWatcher {
    pub fn new(
        service: Box<dyn WatchService>,
        bus: ChangeBus,
        rescans: RescanSender,
        faults: FaultReporter,
        options: WatcherOptions,
    ) -> Self {
        Self {
            service,
            registry: WatchRegistry::new(),
            bus,
            rescans,
            faults,
            options,
        }
    }

    pub fn registry(&self) -> WatchRegistry {
        self.registry.clone()
    }

    /// Watch every directory of a backup tree, root included.
    ///
    /// All-or-nothing: on failure the directories registered so far are
    /// released and a `WatchSetupFailed` fault is reported.
    pub fn watch_backup(&mut self, backup: &Backup) -> Result<usize, WatchError> {
        match self.register_tree(backup, &backup.root, true) {
            Ok(added) => {
                info!(
                    backup = %backup.name,
                    directories = added.len(),
                    "Watching backup root {}",
                    backup.root.display()
                );
                Ok(added.len())
            }
            Err(e) => {
                self.faults.report(
                    Some(&backup.name),
                    FaultKind::WatchSetupFailed,
                    format!("Cannot watch {}: {}", backup.root.display(), e),
                );
                Err(e)
            }
        }
    }

    /// Register `top` and, when recursive, every directory below it.
    ///
    /// Strict mode rolls back and fails on the first error; otherwise
    /// failing directories are logged and skipped.
    fn register_tree(
        &mut self,
        backup: &Backup,
        top: &Path,
        strict: bool,
    ) -> Result<Vec<WatchHandle>, WatchError> {
        let mut added = Vec::new();
        let mut worklist = vec![(top.to_path_buf(), 0usize)];

        while let Some((dir, depth)) = worklist.pop() {
            let handle = match self.service.register(&dir) {
                Ok(handle) => handle,
                Err(e) if strict => {
                    self.rollback(&added);
                    return Err(e);
                }
                Err(e) => {
                    warn!(dir = %dir.display(), "Skipping directory: {}", e);
                    continue;
                }
            };

            let fresh = self.registry.insert(Registration {
                handle,
                dir: dir.clone(),
                backup: backup.clone(),
            });
            if fresh {
                added.push(handle);
            }

            if !self.options.recursive || depth >= self.options.max_depth {
                continue;
            }

            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if strict => {
                    self.rollback(&added);
                    return Err(WatchError::Io(e));
                }
                Err(e) => {
                    warn!(dir = %dir.display(), "Cannot list directory: {}", e);
                    continue;
                }
            };

            for entry in entries.flatten() {
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    worklist.push((entry.path(), depth + 1));
                }
            }
        }

        Ok(added)
    }

    fn rollback(&mut self, added: &[WatchHandle]) {
        for handle in added {
            self.registry.remove(*handle);
            self.service.cancel(*handle);
        }
    }

    /// Poll until cancelled. Returns `Err(CoverageLost)` when the last
    /// watched directory is invalidated.
    ///
    /// Ticks run on the blocking pool: extending coverage to a freshly
    /// created tree walks it synchronously.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), WatchError> {
        let start = Instant::now() + self.options.initial_delay;
        let mut ticker = interval_at(start, self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            directories = self.registry.len(),
            "Watcher started (poll every {:?})",
            self.options.poll_interval
        );

        let mut watcher = self;
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = ticker.tick() => {}
            }

            let ticked = tokio::task::spawn_blocking(move || {
                let outcome = watcher.tick();
                (watcher, outcome)
            })
            .await;
            let outcome = match ticked {
                Ok((back, outcome)) => {
                    watcher = back;
                    outcome
                }
                Err(e) => {
                    warn!("Watcher tick did not complete: {}", e);
                    return Err(WatchError::Io(std::io::Error::other(e)));
                }
            };
            if let Err(e) = outcome {
                break Err(e);
            }
        };

        watcher.release_all();
        info!("Watcher stopped");
        result
    }

    /// Drain every ready handle once
    pub fn tick(&mut self) -> Result<usize, WatchError> {
        let mut seen = HashSet::new();
        while let Some(handle) = self.service.poll() {
            self.process(handle)?;
            if !seen.insert(handle) {
                break;
            }
        }
        Ok(seen.len())
    }

    fn process(&mut self, handle: WatchHandle) -> Result<(), WatchError> {
        let Some(registration) = self.registry.get(handle) else {
            warn!(%handle, "Dropping events for unknown watch handle");
            self.service.drain(handle);
            self.service.cancel(handle);
            return Ok(());
        };
        let backup = &registration.backup;

        for event in self.service.drain(handle) {
            let kind = match event.kind {
                RawKind::Overflow => {
                    self.request_rescan(backup, &registration.dir, RescanReason::Overflow);
                    continue;
                }
                RawKind::Created => ChangeKind::Created,
                RawKind::Modified => ChangeKind::Modified,
                RawKind::Deleted => ChangeKind::Deleted,
            };
            let Some(name) = event.name else {
                continue;
            };
            let path = registration.dir.join(name);

            match kind {
                ChangeKind::Created if self.options.recursive && is_directory(&path) => {
                    self.extend(backup, &path);
                }
                ChangeKind::Deleted if self.registry.contains_dir(&path) => {
                    self.request_rescan(backup, &path, RescanReason::DirectoryRemoved);
                }
                _ => {}
            }

            self.bus.publish(ChangeEvent::new(kind, path, backup.clone()));
        }

        if !self.service.reset(handle) {
            self.registry.remove(handle);
            info!(
                backup = %backup.name,
                dir = %registration.dir.display(),
                "Watch invalidated"
            );

            if self.registry.is_empty() {
                self.faults.report(
                    Some(&backup.name),
                    FaultKind::CoverageLost,
                    "No watched directories remain; live changes are no longer detected",
                );
                return Err(WatchError::CoverageLost);
            }
        }

        Ok(())
    }

    fn extend(&mut self, backup: &Backup, dir: &Path) {
        match self.register_tree(backup, dir, false) {
            Ok(added) => {
                debug!(
                    backup = %backup.name,
                    directories = added.len(),
                    "Extended watch to {}",
                    dir.display()
                );
                self.request_rescan(backup, dir, RescanReason::NewDirectory);
            }
            Err(e) => warn!(dir = %dir.display(), "Cannot extend watch: {}", e),
        }
    }

    fn request_rescan(&self, backup: &Backup, dir: &Path, reason: RescanReason) {
        self.rescans.request(RescanRequest::new(backup, dir, reason));
    }

    fn release_all(&mut self) {
        for handle in self.registry.handles() {
            self.registry.remove(handle);
            self.service.cancel(handle);
        }
    }
}

fn is_directory(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::watch::rescan::{rescan_queue, RescanReceiver};
    use crate::watch::service::RawEvent;
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::thread::{self, ThreadId};
    use tempfile::TempDir;

    /// Scripted watch service; tests push events through the shared state.
    #[derive(Default)]
    pub(crate) struct Script {
        dirs: HashMap<PathBuf, WatchHandle>,
        ready: VecDeque<WatchHandle>,
        queues: HashMap<WatchHandle, Vec<RawEvent>>,
        pub invalid: HashSet<WatchHandle>,
        pub cancelled: Vec<WatchHandle>,
        pub fail_on: Option<PathBuf>,
        pub polled_on: HashSet<ThreadId>,
        next: u64,
    }

    impl Script {
        pub fn handle_of(&self, dir: &Path) -> Option<WatchHandle> {
            self.dirs.get(dir).copied()
        }

        pub fn emit(&mut self, handle: WatchHandle, events: Vec<RawEvent>) {
            self.queues.entry(handle).or_default().extend(events);
            self.ready.push_back(handle);
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeService(pub Arc<Mutex<Script>>);

    impl WatchService for FakeService {
        fn register(&mut self, dir: &Path) -> Result<WatchHandle, WatchError> {
            let mut script = self.0.lock().unwrap();
            if script.fail_on.as_deref() == Some(dir) {
                return Err(WatchError::NotADirectory(dir.to_path_buf()));
            }
            if let Some(handle) = script.dirs.get(dir) {
                return Ok(*handle);
            }
            script.next += 1;
            let handle = WatchHandle(script.next);
            script.dirs.insert(dir.to_path_buf(), handle);
            Ok(handle)
        }

        fn poll(&mut self) -> Option<WatchHandle> {
            let mut script = self.0.lock().unwrap();
            script.polled_on.insert(thread::current().id());
            script.ready.pop_front()
        }

        fn drain(&mut self, handle: WatchHandle) -> Vec<RawEvent> {
            self.0
                .lock()
                .unwrap()
                .queues
                .remove(&handle)
                .unwrap_or_default()
        }

        fn reset(&mut self, handle: WatchHandle) -> bool {
            !self.0.lock().unwrap().invalid.contains(&handle)
        }

        fn cancel(&mut self, handle: WatchHandle) {
            let mut script = self.0.lock().unwrap();
            script.cancelled.push(handle);
            script.dirs.retain(|_, h| *h != handle);
        }
    }

    struct Fixture {
        _temp: TempDir,
        backup: Backup,
        script: FakeService,
        watcher: FsWatcher,
        events: tokio::sync::broadcast::Receiver<ChangeEvent>,
        rescans: RescanReceiver,
        faults: FaultReporter,
    }

    fn fixture(subdirs: &[&str]) -> Fixture {
        let temp = TempDir::new().unwrap();
        for sub in subdirs {
            fs::create_dir_all(temp.path().join(sub)).unwrap();
        }
        let backup = Backup::new("photos", temp.path());
        let script = FakeService::default();
        let bus = ChangeBus::new(64);
        let events = bus.subscribe();
        let (tx, rescans) = rescan_queue();
        let faults = FaultReporter::new();
        let watcher = FsWatcher::new(
            Box::new(script.clone()),
            bus,
            tx,
            faults.clone(),
            WatcherOptions::default(),
        );

        Fixture {
            _temp: temp,
            backup,
            script,
            watcher,
            events,
            rescans,
            faults,
        }
    }

    #[test]
    fn test_watch_backup_covers_whole_tree() {
        let mut f = fixture(&["2024", "2024/summer", "2025"]);
        assert_eq!(f.watcher.watch_backup(&f.backup).unwrap(), 4);
        assert_eq!(f.watcher.registry().len(), 4);
    }

    #[test]
    fn test_failed_setup_rolls_back() {
        let mut f = fixture(&["2024", "2025"]);
        f.script.0.lock().unwrap().fail_on = Some(f.backup.root.join("2025"));

        assert!(f.watcher.watch_backup(&f.backup).is_err());
        assert!(f.watcher.registry().is_empty());
        assert!(!f.script.0.lock().unwrap().cancelled.is_empty());
        assert_eq!(f.faults.recent()[0].kind, FaultKind::WatchSetupFailed);
    }

    #[test]
    fn test_events_are_normalized_onto_bus() {
        let mut f = fixture(&[]);
        f.watcher.watch_backup(&f.backup).unwrap();
        let root = f.script.0.lock().unwrap().handle_of(&f.backup.root).unwrap();

        f.script.0.lock().unwrap().emit(
            root,
            vec![
                RawEvent::new(RawKind::Created, "a.jpg"),
                RawEvent::new(RawKind::Deleted, "b.jpg"),
            ],
        );
        f.watcher.tick().unwrap();

        let first = f.events.try_recv().unwrap();
        assert_eq!(first.kind, ChangeKind::Created);
        assert_eq!(first.path, f.backup.root.join("a.jpg"));
        assert_eq!(first.backup, f.backup);
        assert_eq!(f.events.try_recv().unwrap().kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_new_directory_extends_coverage_and_requests_rescan() {
        let mut f = fixture(&[]);
        f.watcher.watch_backup(&f.backup).unwrap();
        let root = f.script.0.lock().unwrap().handle_of(&f.backup.root).unwrap();

        fs::create_dir_all(f.backup.root.join("new/inner")).unwrap();
        f.script
            .0
            .lock()
            .unwrap()
            .emit(root, vec![RawEvent::new(RawKind::Created, "new")]);
        f.watcher.tick().unwrap();

        assert_eq!(f.watcher.registry().len(), 3);
        let request = f.rescans.try_recv().unwrap();
        assert_eq!(request.dir, f.backup.root.join("new"));
        assert_eq!(request.reason, RescanReason::NewDirectory);
        assert_eq!(f.events.try_recv().unwrap().path, f.backup.root.join("new"));

        // Files landing in the new directories are seen through their own watches
        let (new, inner) = {
            let script = f.script.0.lock().unwrap();
            (
                script.handle_of(&f.backup.root.join("new")).unwrap(),
                script.handle_of(&f.backup.root.join("new/inner")).unwrap(),
            )
        };
        {
            let mut script = f.script.0.lock().unwrap();
            script.emit(new, vec![RawEvent::new(RawKind::Created, "x.jpg")]);
            script.emit(inner, vec![RawEvent::new(RawKind::Modified, "y.jpg")]);
        }
        f.watcher.tick().unwrap();

        let created = f.events.try_recv().unwrap();
        assert_eq!(created.kind, ChangeKind::Created);
        assert_eq!(created.path, f.backup.root.join("new/x.jpg"));
        assert_eq!(created.backup, f.backup);
        let modified = f.events.try_recv().unwrap();
        assert_eq!(modified.kind, ChangeKind::Modified);
        assert_eq!(modified.path, f.backup.root.join("new/inner/y.jpg"));
        assert!(f.rescans.try_recv().is_none());
    }

    #[test]
    fn test_repeated_overflow_queues_one_rescan() {
        let mut f = fixture(&["2024"]);
        f.watcher.watch_backup(&f.backup).unwrap();
        let dir = f.backup.root.join("2024");
        let handle = f.script.0.lock().unwrap().handle_of(&dir).unwrap();

        for _ in 0..3 {
            f.script.0.lock().unwrap().emit(handle, vec![RawEvent::overflow()]);
            f.watcher.tick().unwrap();
        }

        assert_eq!(f.rescans.try_recv().unwrap().dir, dir);
        assert!(f.rescans.try_recv().is_none());
    }

    #[test]
    fn test_overflow_requests_rescan_without_publishing() {
        let mut f = fixture(&["2024"]);
        f.watcher.watch_backup(&f.backup).unwrap();
        let dir = f.backup.root.join("2024");
        let handle = f.script.0.lock().unwrap().handle_of(&dir).unwrap();

        f.script.0.lock().unwrap().emit(handle, vec![RawEvent::overflow()]);
        f.watcher.tick().unwrap();

        let request = f.rescans.try_recv().unwrap();
        assert_eq!(request.dir, dir);
        assert_eq!(request.reason, RescanReason::Overflow);
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    fn test_removed_directory_requests_rescan() {
        let mut f = fixture(&["2024"]);
        f.watcher.watch_backup(&f.backup).unwrap();
        let root = f.script.0.lock().unwrap().handle_of(&f.backup.root).unwrap();

        f.script
            .0
            .lock()
            .unwrap()
            .emit(root, vec![RawEvent::new(RawKind::Deleted, "2024")]);
        f.watcher.tick().unwrap();

        let request = f.rescans.try_recv().unwrap();
        assert_eq!(request.reason, RescanReason::DirectoryRemoved);
        assert_eq!(request.dir, f.backup.root.join("2024"));
    }

    #[test]
    fn test_invalidating_last_watch_is_coverage_loss() {
        let mut f = fixture(&["2024"]);
        f.watcher.watch_backup(&f.backup).unwrap();
        let (root, sub) = {
            let script = f.script.0.lock().unwrap();
            (
                script.handle_of(&f.backup.root).unwrap(),
                script.handle_of(&f.backup.root.join("2024")).unwrap(),
            )
        };

        {
            let mut script = f.script.0.lock().unwrap();
            script.invalid.insert(sub);
            script.emit(sub, vec![]);
        }
        f.watcher.tick().unwrap();
        assert_eq!(f.watcher.registry().len(), 1);

        {
            let mut script = f.script.0.lock().unwrap();
            script.invalid.insert(root);
            script.emit(root, vec![]);
        }
        assert!(matches!(f.watcher.tick(), Err(WatchError::CoverageLost)));
        assert_eq!(f.faults.recent().last().unwrap().kind, FaultKind::CoverageLost);
    }

    #[test]
    fn test_unknown_handle_is_cancelled() {
        let mut f = fixture(&[]);
        f.watcher.watch_backup(&f.backup).unwrap();

        f.script
            .0
            .lock()
            .unwrap()
            .emit(WatchHandle(99), vec![RawEvent::new(RawKind::Created, "x")]);
        f.watcher.tick().unwrap();

        assert_eq!(f.script.0.lock().unwrap().cancelled, vec![WatchHandle(99)]);
        assert!(f.events.try_recv().is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_file_in_new_directory_is_seen_with_notify() {
        use crate::watch::NotifyWatchService;

        let temp = TempDir::new().unwrap();
        let backup = Backup::new("photos", temp.path());
        let bus = ChangeBus::new(64);
        let mut events = bus.subscribe();
        let (tx, _rescans) = rescan_queue();
        let mut watcher = FsWatcher::new(
            Box::new(NotifyWatchService::new().unwrap()),
            bus,
            tx,
            FaultReporter::new(),
            WatcherOptions::default(),
        );
        watcher.watch_backup(&backup).unwrap();

        let sub = temp.path().join("sub");
        fs::create_dir(&sub).unwrap();
        for _ in 0..50 {
            watcher.tick().unwrap();
            if watcher.registry().contains_dir(&sub) {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(watcher.registry().contains_dir(&sub));

        let file = sub.join("x.txt");
        fs::write(&file, b"hello").unwrap();
        let mut seen = Vec::new();
        for _ in 0..50 {
            watcher.tick().unwrap();
            while let Ok(event) = events.try_recv() {
                seen.push((event.kind, event.path));
            }
            if seen.contains(&(ChangeKind::Created, file.clone())) {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(seen.contains(&(ChangeKind::Created, file)));
    }

    #[tokio::test]
    async fn test_run_publishes_then_releases_on_shutdown() {
        let mut f = fixture(&[]);
        f.watcher.options.initial_delay = Duration::ZERO;
        f.watcher.options.poll_interval = Duration::from_millis(10);
        f.watcher.watch_backup(&f.backup).unwrap();
        let root = f.script.0.lock().unwrap().handle_of(&f.backup.root).unwrap();
        f.script
            .0
            .lock()
            .unwrap()
            .emit(root, vec![RawEvent::new(RawKind::Modified, "a.jpg")]);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(f.watcher.run(shutdown.clone()));

        let event = tokio::time::timeout(Duration::from_secs(5), f.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Modified);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        let script = f.script.0.lock().unwrap();
        assert_eq!(script.cancelled, vec![root]);
        // Single-threaded runtime: polling happened off the runtime thread
        assert!(!script.polled_on.contains(&thread::current().id()));
    }
}
