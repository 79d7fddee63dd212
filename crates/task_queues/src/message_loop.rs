use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use protocol::QueueId;

use crate::{MessageLoopTaskQueues, SchedulerBackend, Task, TaskQueueError};

const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Handle for posting work to one queue.
#[derive(Clone)]
pub struct TaskRunner {
    queues: Arc<MessageLoopTaskQueues>,
    queue_id: QueueId,
}

impl TaskRunner {
    pub fn new(queues: Arc<MessageLoopTaskQueues>, queue_id: QueueId) -> Self {
        Self { queues, queue_id }
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    pub fn post_task<F>(&self, task: F) -> Result<(), TaskQueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queues.post_task(self.queue_id, Box::new(task) as Task)
    }

    /// Whether the calling thread is currently executing this queue's tasks, either directly
    /// or because the queue is fused into the running one.
    pub fn runs_tasks_on_current_thread(&self) -> bool {
        match MessageLoopTaskQueues::current_queue_id() {
            Some(current) if current == self.queue_id => true,
            Some(current) => self.queues.owns(current, self.queue_id),
            None => false,
        }
    }
}

/// A thread draining one task queue until terminated.
pub struct MessageLoop {
    label: String,
    task_runner: TaskRunner,
    stop_requested: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MessageLoop {
    /// Create a fresh queue in `queues` and spawn a thread that runs it.
    pub fn spawn(queues: Arc<MessageLoopTaskQueues>, label: &str) -> Result<Self, TaskQueueError> {
        let queue_id = queues.create_queue();
        let wakeup = queues.wakeup_receiver(queue_id)?;
        let stop_requested = Arc::new(AtomicBool::new(false));

        let thread_queues = queues.clone();
        let thread_stop = stop_requested.clone();
        let thread_label = label.to_string();
        let thread = thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                log::debug!("[{thread_label}] message loop started");
                while !thread_stop.load(Ordering::Acquire) {
                    thread_queues.run_until_idle(queue_id);
                    match wakeup.recv_timeout(IDLE_WAIT) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("[{thread_label}] message loop exiting");
            })
            .map_err(|error| {
                log::error!("[task_queues] spawning `{label}` failed: {error}");
                TaskQueueError::SpawnFailed {
                    label: label.to_string(),
                }
            })?;

        Ok(Self {
            label: label.to_string(),
            task_runner: TaskRunner::new(queues, queue_id),
            stop_requested,
            thread: Some(thread),
        })
    }

    pub fn task_runner(&self) -> TaskRunner {
        self.task_runner.clone()
    }

    pub fn queue_id(&self) -> QueueId {
        self.task_runner.queue_id
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stop the loop and join its thread. Tasks still queued are left in the queue.
    ///
    /// Returns `false` without touching the queue when the loop was already terminated.
    pub fn terminate(&mut self) -> bool {
        let Some(handle) = self.thread.take() else {
            return false;
        };
        self.stop_requested.store(true, Ordering::Release);
        if let Err(error) = self.task_runner.queues.wake(self.queue_id()) {
            log::warn!("[{}] wake on terminate failed: {error}", self.label);
        }
        handle
            .join()
            .unwrap_or_else(|_| log::error!("[{}] message loop thread panicked", self.label));
        true
    }
}

impl Drop for MessageLoop {
    fn drop(&mut self) {
        self.terminate();
    }
}
