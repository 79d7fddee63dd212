use std::cell::Cell;
use std::collections::VecDeque;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use protocol::QueueId;
use slotmap::SlotMap;

use crate::{SchedulerBackend, Task, TaskQueueError};

thread_local! {
    static CURRENT_QUEUE: Cell<Option<QueueId>> = const { Cell::new(None) };
}

struct QueuedTask {
    sequence: u64,
    task: Task,
}

struct QueueEntry {
    tasks: VecDeque<QueuedTask>,
    owner_of: Option<QueueId>,
    subsumed_by: Option<QueueId>,
    // bounded(1): a pending wakeup already covers every task posted after it.
    wakeup_sender: Sender<()>,
    wakeup_receiver: Receiver<()>,
}

impl QueueEntry {
    fn new() -> Self {
        let (wakeup_sender, wakeup_receiver) = bounded(1);
        Self {
            tasks: VecDeque::new(),
            owner_of: None,
            subsumed_by: None,
            wakeup_sender,
            wakeup_receiver,
        }
    }

    fn wake(&self) {
        match self.wakeup_sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                panic!("task queue wakeup channel disconnected")
            }
        }
    }

    fn front_sequence(&self) -> Option<u64> {
        self.tasks.front().map(|queued| queued.sequence)
    }
}

#[derive(Default)]
struct Registry {
    queues: SlotMap<QueueId, QueueEntry>,
    next_sequence: u64,
}

impl Registry {
    fn entry(&self, queue_id: QueueId) -> Result<&QueueEntry, TaskQueueError> {
        self.queues
            .get(queue_id)
            .ok_or(TaskQueueError::UnknownQueue(queue_id))
    }

    fn entry_mut(&mut self, queue_id: QueueId) -> Result<&mut QueueEntry, TaskQueueError> {
        self.queues
            .get_mut(queue_id)
            .ok_or(TaskQueueError::UnknownQueue(queue_id))
    }

    /// Queue whose loop executes tasks posted to `queue_id`.
    fn executing_queue(&self, queue_id: QueueId) -> QueueId {
        self.queues
            .get(queue_id)
            .and_then(|entry| entry.subsumed_by)
            .unwrap_or(queue_id)
    }

    fn pop_next(&mut self, queue_id: QueueId) -> Option<Task> {
        let entry = self.queues.get(queue_id)?;
        if entry.subsumed_by.is_some() {
            return None;
        }
        let own_front = entry.front_sequence();
        let subsumed = entry.owner_of;
        let subsumed_front = subsumed
            .and_then(|id| self.queues.get(id))
            .and_then(QueueEntry::front_sequence);

        let source = match (own_front, subsumed_front) {
            (None, None) => return None,
            (Some(_), None) => queue_id,
            (None, Some(_)) => subsumed?,
            (Some(own), Some(other)) => {
                if own <= other {
                    queue_id
                } else {
                    subsumed?
                }
            }
        };
        self.queues
            .get_mut(source)?
            .tasks
            .pop_front()
            .map(|queued| queued.task)
    }
}

/// Process-wide registry of task queues.
///
/// Cheap to share behind an `Arc`; all mutation happens under one internal lock that is never
/// held while a task runs.
#[derive(Default)]
pub struct MessageLoopTaskQueues {
    registry: Mutex<Registry>,
}

impl MessageLoopTaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_queue(&self) -> QueueId {
        let queue_id = self.registry.lock().queues.insert(QueueEntry::new());
        log::debug!("[task_queues] created queue {queue_id:?}");
        queue_id
    }

    /// Remove a queue. Pending tasks are dropped and any merge it takes part in is dissolved.
    pub fn dispose(&self, queue_id: QueueId) -> Result<(), TaskQueueError> {
        let mut registry = self.registry.lock();
        let entry = registry
            .queues
            .remove(queue_id)
            .ok_or(TaskQueueError::UnknownQueue(queue_id))?;
        if let Some(subsumed) = entry.owner_of {
            if let Some(subsumed_entry) = registry.queues.get_mut(subsumed) {
                subsumed_entry.subsumed_by = None;
                subsumed_entry.wake();
            }
        }
        if let Some(owner) = entry.subsumed_by {
            if let Some(owner_entry) = registry.queues.get_mut(owner) {
                owner_entry.owner_of = None;
            }
        }
        log::debug!(
            "[task_queues] disposed queue {queue_id:?} dropping {} pending tasks",
            entry.tasks.len()
        );
        Ok(())
    }

    pub fn post_task(&self, queue_id: QueueId, task: Task) -> Result<(), TaskQueueError> {
        let mut registry = self.registry.lock();
        let sequence = registry.next_sequence;
        registry.next_sequence += 1;
        registry
            .entry_mut(queue_id)?
            .tasks
            .push_back(QueuedTask { sequence, task });
        let executing = registry.executing_queue(queue_id);
        registry.entry(executing)?.wake();
        Ok(())
    }

    pub fn pending_task_count(&self, queue_id: QueueId) -> Result<usize, TaskQueueError> {
        Ok(self.registry.lock().entry(queue_id)?.tasks.len())
    }

    pub(crate) fn wakeup_receiver(
        &self,
        queue_id: QueueId,
    ) -> Result<Receiver<()>, TaskQueueError> {
        Ok(self.registry.lock().entry(queue_id)?.wakeup_receiver.clone())
    }

    pub(crate) fn wake(&self, queue_id: QueueId) -> Result<(), TaskQueueError> {
        self.registry.lock().entry(queue_id)?.wake();
        Ok(())
    }

    /// Run every task currently runnable on `queue_id`'s loop, including tasks of a queue it
    /// subsumes, in fused FIFO order. Tasks posted while draining are run too.
    ///
    /// Returns the number of tasks executed. A queue that is itself subsumed runs nothing.
    pub fn run_until_idle(&self, queue_id: QueueId) -> usize {
        let mut executed = 0;
        loop {
            let next = self.registry.lock().pop_next(queue_id);
            let Some(task) = next else {
                return executed;
            };
            let previous = CURRENT_QUEUE.with(|current| current.replace(Some(queue_id)));
            task();
            CURRENT_QUEUE.with(|current| current.set(previous));
            executed += 1;
        }
    }

    pub fn current_queue_id() -> Option<QueueId> {
        CURRENT_QUEUE.with(Cell::get)
    }
}

impl SchedulerBackend for MessageLoopTaskQueues {
    fn owns(&self, owner: QueueId, subsumed: QueueId) -> bool {
        if owner == subsumed {
            return self.registry.lock().queues.contains_key(owner);
        }
        let registry = self.registry.lock();
        registry
            .queues
            .get(owner)
            .is_some_and(|entry| entry.owner_of == Some(subsumed))
    }

    fn merge(&self, owner: QueueId, subsumed: QueueId) -> bool {
        if owner == subsumed {
            return false;
        }
        let mut registry = self.registry.lock();
        let (Some(owner_entry), Some(subsumed_entry)) =
            (registry.queues.get(owner), registry.queues.get(subsumed))
        else {
            log::warn!("[task_queues] merge refused: {owner:?} or {subsumed:?} is gone");
            return false;
        };
        let busy = owner_entry.owner_of.is_some()
            || owner_entry.subsumed_by.is_some()
            || subsumed_entry.owner_of.is_some()
            || subsumed_entry.subsumed_by.is_some();
        if busy {
            log::warn!("[task_queues] merge refused: {owner:?} or {subsumed:?} already merged");
            return false;
        }

        if let Some(entry) = registry.queues.get_mut(owner) {
            entry.owner_of = Some(subsumed);
            entry.wake();
        }
        if let Some(entry) = registry.queues.get_mut(subsumed) {
            entry.subsumed_by = Some(owner);
        }
        log::debug!("[task_queues] merged {subsumed:?} into {owner:?}");
        true
    }

    fn unmerge(&self, owner: QueueId) -> bool {
        let mut registry = self.registry.lock();
        let Some(subsumed) = registry
            .queues
            .get_mut(owner)
            .and_then(|entry| entry.owner_of.take())
        else {
            return false;
        };
        if let Some(entry) = registry.queues.get_mut(subsumed) {
            entry.subsumed_by = None;
            entry.wake();
        }
        log::debug!("[task_queues] unmerged {subsumed:?} from {owner:?}");
        true
    }

    fn current_queue_id(&self) -> Option<QueueId> {
        Self::current_queue_id()
    }
}
