//! [`WatchService`] on top of `notify`.
//!
//! Every directory gets its own non-recursive watch. Raw notify events are
//! pumped from a channel on `poll` and routed to the handle of the parent
//! directory of each affected path.

use super::service::{RawEvent, RawKind, WatchError, WatchHandle, WatchService};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use tracing::{debug, trace, warn};

struct Slot {
    dir: PathBuf,
    queue: Vec<RawEvent>,
    /// In the ready queue, or handed out by `poll` and not yet reset
    signalled: bool,
    invalid: bool,
}

pub struct NotifyWatchService {
    watcher: RecommendedWatcher,
    events: std_mpsc::Receiver<notify::Result<notify::Event>>,
    dirs: HashMap<PathBuf, WatchHandle>,
    slots: HashMap<WatchHandle, Slot>,
    ready: VecDeque<WatchHandle>,
    next_handle: u64,
}

impl NotifyWatchService {
    pub fn new() -> Result<Self, WatchError> {
        let (tx, events) = std_mpsc::channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        Ok(Self {
            watcher,
            events,
            dirs: HashMap::new(),
            slots: HashMap::new(),
            ready: VecDeque::new(),
            next_handle: 1,
        })
    }

    fn pump(&mut self) {
        while let Ok(res) = self.events.try_recv() {
            match res {
                Ok(event) => self.route(event),
                Err(e) => {
                    warn!("Watch backend error: {}", e);
                    self.overflow(&e.paths);
                }
            }
        }
    }

    fn route(&mut self, event: notify::Event) {
        if event.need_rescan() {
            self.overflow(&event.paths);
            return;
        }

        match &event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.deliver(RawKind::Created, path);
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::Both => {
                    if let Some(from) = event.paths.first() {
                        self.deliver(RawKind::Deleted, from);
                    }
                    if let Some(to) = event.paths.get(1) {
                        self.deliver(RawKind::Created, to);
                    }
                }
                RenameMode::From => {
                    for path in &event.paths {
                        self.deliver(RawKind::Deleted, path);
                    }
                }
                RenameMode::To => {
                    for path in &event.paths {
                        self.deliver(RawKind::Created, path);
                    }
                }
                _ => {
                    for path in &event.paths {
                        let kind = if path.symlink_metadata().is_ok() {
                            RawKind::Created
                        } else {
                            RawKind::Deleted
                        };
                        self.deliver(kind, path);
                    }
                }
            },
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.deliver(RawKind::Modified, path);
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.deliver(RawKind::Deleted, path);
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }

    fn deliver(&mut self, kind: RawKind, path: &Path) {
        if kind == RawKind::Deleted {
            if let Some(&handle) = self.dirs.get(path) {
                self.invalidate(handle);
            }
        }

        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return;
        };
        let Some(&handle) = self.dirs.get(parent) else {
            trace!(path = %path.display(), "Event outside watched directories");
            return;
        };
        self.push(handle, RawEvent::new(kind, name));
    }

    /// Mark the directories owning `paths` (or every directory, when no
    /// path is known) as having lost events.
    fn overflow(&mut self, paths: &[PathBuf]) {
        let handles: Vec<WatchHandle> = if paths.is_empty() {
            self.slots.keys().copied().collect()
        } else {
            paths
                .iter()
                .filter_map(|p| {
                    self.dirs
                        .get(p.as_path())
                        .or_else(|| p.parent().and_then(|parent| self.dirs.get(parent)))
                        .copied()
                })
                .collect()
        };

        for handle in handles {
            let already = self
                .slots
                .get(&handle)
                .is_some_and(|slot| slot.queue.iter().any(|e| e.kind == RawKind::Overflow));
            if !already {
                self.push(handle, RawEvent::overflow());
            }
        }
    }

    fn invalidate(&mut self, handle: WatchHandle) {
        if let Some(slot) = self.slots.get_mut(&handle) {
            slot.invalid = true;
            if !slot.signalled {
                slot.signalled = true;
                self.ready.push_back(handle);
            }
        }
    }

    fn push(&mut self, handle: WatchHandle, event: RawEvent) {
        if let Some(slot) = self.slots.get_mut(&handle) {
            slot.queue.push(event);
            if !slot.signalled {
                slot.signalled = true;
                self.ready.push_back(handle);
            }
        }
    }

    fn release(&mut self, handle: WatchHandle) {
        if let Some(slot) = self.slots.remove(&handle) {
            self.dirs.remove(&slot.dir);
            self.ready.retain(|h| *h != handle);
            if let Err(e) = self.watcher.unwatch(&slot.dir) {
                debug!(dir = %slot.dir.display(), "Unwatch failed: {}", e);
            }
        }
    }
}

impl WatchService for NotifyWatchService {
    fn register(&mut self, dir: &Path) -> Result<WatchHandle, WatchError> {
        if let Some(&handle) = self.dirs.get(dir) {
            return Ok(handle);
        }
        if !dir.is_dir() {
            return Err(WatchError::NotADirectory(dir.to_path_buf()));
        }

        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Register {
                path: dir.to_path_buf(),
                source,
            })?;

        let handle = WatchHandle(self.next_handle);
        self.next_handle += 1;
        self.dirs.insert(dir.to_path_buf(), handle);
        self.slots.insert(
            handle,
            Slot {
                dir: dir.to_path_buf(),
                queue: Vec::new(),
                signalled: false,
                invalid: false,
            },
        );
        Ok(handle)
    }

    fn poll(&mut self) -> Option<WatchHandle> {
        self.pump();
        self.ready.pop_front()
    }

    fn drain(&mut self, handle: WatchHandle) -> Vec<RawEvent> {
        self.slots
            .get_mut(&handle)
            .map(|slot| std::mem::take(&mut slot.queue))
            .unwrap_or_default()
    }

    fn reset(&mut self, handle: WatchHandle) -> bool {
        let valid = match self.slots.get(&handle) {
            Some(slot) => !slot.invalid && slot.dir.is_dir(),
            None => false,
        };
        if !valid {
            self.release(handle);
            return false;
        }

        if let Some(slot) = self.slots.get_mut(&handle) {
            slot.signalled = !slot.queue.is_empty();
            if slot.signalled {
                self.ready.push_back(handle);
            }
        }
        true
    }

    fn cancel(&mut self, handle: WatchHandle) {
        self.release(handle);
    }
}
