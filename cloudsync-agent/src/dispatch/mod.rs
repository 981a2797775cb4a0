//! Task dispatch: the hand-off between change detection and remote IO.
//!
//! Any number of producers (reconciler, engine) share a cloneable
//! [`TaskDispatcher`]; exactly one [`TaskReceiver`] exists per queue and it
//! cannot be cloned, so every task is delivered to a single consumer, in
//! FIFO order. The queue is unbounded and does no deduplication.

pub mod runner;

use crate::model::Task;
use tokio::sync::mpsc;
use tracing::debug;

pub use runner::{RetryPolicy, TaskRunner};

/// Create a task queue
pub fn task_queue() -> (TaskDispatcher, TaskReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (TaskDispatcher { sender }, TaskReceiver { receiver })
}

#[derive(Clone)]
pub struct TaskDispatcher {
    sender: mpsc::UnboundedSender<Task>,
}

impl TaskDispatcher {
    /// Queue a task. Returns `false` when the consumer is gone; the task is
    /// then dropped and its completion reports `Abandoned`.
    pub fn dispatch(&self, task: Task) -> bool {
        match self.sender.send(task) {
            Ok(()) => true,
            Err(mpsc::error::SendError(task)) => {
                debug!(task = %task.id, kind = %task.kind, "Task queue closed, abandoning task");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub struct TaskReceiver {
    receiver: mpsc::UnboundedReceiver<Task>,
}

impl TaskReceiver {
    pub async fn recv(&mut self) -> Option<Task> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Task> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting tasks; queued ones can still be received
    pub fn close(&mut self) {
        self.receiver.close();
    }
}
