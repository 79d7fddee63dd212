//! Task queues that can be fused into a single FIFO.
//!
//! `SchedulerBackend` is the seam the merge coordinator talks to. `MessageLoopTaskQueues` is the
//! in-process implementation: every queue keeps its own FIFO, and a merged queue's tasks are
//! executed by the owner's loop, interleaved with the owner's tasks in posting order.

mod message_loop;
mod registry;

pub use message_loop::{MessageLoop, TaskRunner};
pub use protocol::QueueId;
pub use registry::MessageLoopTaskQueues;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Operations a merge coordinator needs from whatever owns the real task queues.
///
/// Implementations must be callable from any thread. A failed `unmerge` leaves the fused
/// state untouched.
pub trait SchedulerBackend: Send + Sync {
    /// Whether `owner` already runs the tasks of `subsumed`.
    fn owns(&self, owner: QueueId, subsumed: QueueId) -> bool;

    /// Fuse `subsumed` into `owner`. Returns `false` if the queues cannot be fused.
    fn merge(&self, owner: QueueId, subsumed: QueueId) -> bool;

    /// Split `owner` from whatever queue it currently subsumes.
    fn unmerge(&self, owner: QueueId) -> bool;

    /// Queue whose task is executing on the calling thread, if any.
    fn current_queue_id(&self) -> Option<QueueId> {
        None
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskQueueError {
    #[error("task queue {0:?} does not exist or was disposed")]
    UnknownQueue(QueueId),

    #[error("failed to spawn message loop thread `{label}`")]
    SpawnFailed { label: String },
}
