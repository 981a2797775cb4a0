//! The single consumer of the task queue.
//!
//! Executes tasks against the remote store with bounded concurrency,
//! retries transient failures with exponential backoff and fires each
//! task's completion exactly once.

use super::TaskReceiver;
use crate::faults::{FaultKind, FaultReporter};
use crate::model::{Task, TaskKind};
use crate::remote::{RemoteError, RemoteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per task, the first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

pub struct TaskRunner {
    remote: Arc<dyn RemoteStore>,
    faults: FaultReporter,
    policy: RetryPolicy,
    max_concurrent: usize,
    grace: Duration,
}

impl TaskRunner {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        faults: FaultReporter,
        policy: RetryPolicy,
        max_concurrent: usize,
        grace: Duration,
    ) -> Self {
        Self {
            remote,
            faults,
            policy,
            max_concurrent: max_concurrent.max(1),
            grace,
        }
    }

    /// Consume tasks until the queue closes or `shutdown` fires.
    ///
    /// On shutdown, running tasks get `grace` to finish; whatever is still
    /// running or queued after that is abandoned.
    pub async fn run(self, mut receiver: TaskReceiver, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut running = JoinSet::new();

        info!(max_concurrent = self.max_concurrent, "Task runner started");

        loop {
            while running.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = receiver.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let remote = Arc::clone(&self.remote);
            let faults = self.faults.clone();
            let policy = self.policy.clone();
            let cancel = shutdown.clone();
            running.spawn(async move {
                let _permit = permit;
                execute(remote.as_ref(), &faults, &policy, task, &cancel).await;
            });
        }

        receiver.close();
        let mut abandoned = 0usize;
        while let Some(task) = receiver.try_recv() {
            debug!(task = %task.id, "Abandoning queued task");
            abandoned += 1;
        }

        if shutdown.is_cancelled() {
            let finished = tokio::time::timeout(self.grace, async {
                while running.join_next().await.is_some() {}
            })
            .await
            .is_ok();

            if !finished {
                warn!(
                    running = running.len(),
                    "Tasks still running after {:?}, abandoning them",
                    self.grace
                );
                abandoned += running.len();
                running.abort_all();
                while running.join_next().await.is_some() {}
            }
        } else {
            while running.join_next().await.is_some() {}
        }

        info!(abandoned, "Task runner stopped");
    }
}

async fn execute(
    remote: &dyn RemoteStore,
    faults: &FaultReporter,
    policy: &RetryPolicy,
    task: Task,
    shutdown: &CancellationToken,
) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match task.kind {
            TaskKind::Upload | TaskKind::Replace => {
                remote.upload_file(&task.backup, &task.path).await
            }
            TaskKind::Delete => remote.remove_file(&task.backup, &task.path).await,
        };

        match result {
            Ok(()) => {
                debug!(
                    task = %task.id,
                    kind = %task.kind,
                    attempt,
                    "Completed {}",
                    task.path.display()
                );
                complete(task, None).await;
                return;
            }
            Err(e) if e.is_permanent() || attempt >= policy.max_attempts => {
                report_failure(faults, &task, attempt, &e);
                let reason = e.to_string();
                complete(task, Some(reason)).await;
                return;
            }
            Err(e) => {
                let delay = policy.backoff(attempt);
                warn!(
                    task = %task.id,
                    kind = %task.kind,
                    attempt,
                    "{} failed, retrying in {:?}: {}",
                    task.path.display(),
                    delay,
                    e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(task = %task.id, "Shutdown during backoff, abandoning task");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn report_failure(faults: &FaultReporter, task: &Task, attempts: u32, e: &RemoteError) {
    faults.report(
        Some(&task.backup.name),
        FaultKind::TaskFailed {
            task_id: task.id,
            operation: task.kind.to_string(),
            path: task.path.clone(),
        },
        format!(
            "{} of {} failed after {} attempt(s): {}",
            task.kind,
            task.path.display(),
            attempts,
            e
        ),
    );
}

/// Fire the completion off the async workers; it may touch the index.
async fn complete(task: Task, failure: Option<String>) {
    let id = task.id;
    let fired = tokio::task::spawn_blocking(move || match failure {
        None => task.succeed(),
        Some(reason) => task.fail(reason),
    })
    .await;

    if let Err(e) = fired {
        error!(task = %id, "Completion handler panicked: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::task_queue;
    use crate::model::{Backup, Completion, Outcome};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct FlakyRemote {
        failures: AtomicU32,
        calls: AtomicU32,
        error: fn() -> RemoteError,
        stall: bool,
    }

    impl FlakyRemote {
        fn new(failures: u32, error: fn() -> RemoteError) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                error,
                stall: false,
            })
        }

        fn stalled() -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(0),
                calls: AtomicU32::new(0),
                error: unavailable,
                stall: true,
            })
        }

        async fn attempt(&self) -> Result<(), RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err((self.error)());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteStore for FlakyRemote {
        async fn create_container(&self, _backup: &Backup) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn upload_file(&self, _backup: &Backup, _path: &Path) -> Result<(), RemoteError> {
            self.attempt().await
        }

        async fn remove_file(&self, _backup: &Backup, _path: &Path) -> Result<(), RemoteError> {
            self.attempt().await
        }
    }

    fn unavailable() -> RemoteError {
        RemoteError::Rejected {
            operation: "upload",
            key: "a.jpg".into(),
            status: 503,
        }
    }

    fn missing() -> RemoteError {
        RemoteError::Io(std::io::Error::from(std::io::ErrorKind::NotFound))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn task(kind: TaskKind, outcomes: &mpsc::UnboundedSender<Outcome>) -> Task {
        let tx = outcomes.clone();
        Task::new(
            kind,
            Backup::new("photos", "/data/photos"),
            PathBuf::from("/data/photos/a.jpg"),
            None,
            Completion::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
    }

    async fn run_to_completion(
        remote: Arc<FlakyRemote>,
        faults: &FaultReporter,
        policy: RetryPolicy,
        kinds: &[TaskKind],
    ) -> Vec<Outcome> {
        let (dispatcher, receiver) = task_queue();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for kind in kinds {
            dispatcher.dispatch(task(*kind, &tx));
        }
        drop(dispatcher);
        drop(tx);

        let runner = TaskRunner::new(remote, faults.clone(), policy, 2, Duration::from_secs(1));
        runner.run(receiver, CancellationToken::new()).await;

        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let remote = FlakyRemote::new(2, unavailable);
        let faults = FaultReporter::new();

        let outcomes =
            run_to_completion(Arc::clone(&remote), &faults, fast_policy(5), &[TaskKind::Upload])
                .await;

        assert_eq!(outcomes, vec![Outcome::Succeeded]);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
        assert!(faults.recent().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_report() {
        let remote = FlakyRemote::new(u32::MAX, unavailable);
        let faults = FaultReporter::new();

        let outcomes =
            run_to_completion(Arc::clone(&remote), &faults, fast_policy(3), &[TaskKind::Replace])
                .await;

        assert!(matches!(outcomes.as_slice(), [Outcome::Failed(_)]));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
        let fault = &faults.recent()[0];
        assert!(matches!(
            &fault.kind,
            FaultKind::TaskFailed { operation, .. } if operation == "replace"
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let remote = FlakyRemote::new(1, missing);
        let faults = FaultReporter::new();

        let outcomes =
            run_to_completion(Arc::clone(&remote), &faults, fast_policy(5), &[TaskKind::Upload])
                .await;

        assert!(matches!(outcomes.as_slice(), [Outcome::Failed(_)]));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_every_task_completes_when_queue_closes() {
        let remote = FlakyRemote::new(0, unavailable);
        let faults = FaultReporter::new();

        let outcomes = run_to_completion(
            remote,
            &faults,
            fast_policy(5),
            &[TaskKind::Upload, TaskKind::Delete, TaskKind::Replace],
        )
        .await;

        assert_eq!(outcomes, vec![Outcome::Succeeded; 3]);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_stalled_tasks() {
        let (dispatcher, receiver) = task_queue();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.dispatch(task(TaskKind::Upload, &tx));
        drop(tx);

        let remote = FlakyRemote::stalled();
        let runner = TaskRunner::new(
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            FaultReporter::new(),
            fast_policy(5),
            1,
            Duration::from_millis(20),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runner.run(receiver, shutdown.clone()));

        while remote.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(rx.recv().await, Some(Outcome::Abandoned));
        assert!(!dispatcher.dispatch(task(TaskKind::Delete, &mpsc::unbounded_channel().0)));
    }
}
