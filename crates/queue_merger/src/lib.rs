//! Lease-based merging of the platform and raster task queues.
//!
//! While merged, raster work runs on the platform queue in one FIFO with platform work. The
//! merge lasts for a lease counted in frames; the raster context decrements it once per
//! submitted frame and the queues are split again when it runs out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;
use protocol::QueueId;
use task_queues::SchedulerBackend;

const LEASE_UNSET: i64 = -1;

pub struct TaskQueueMerger {
    platform_queue_id: QueueId,
    raster_queue_id: QueueId,
    backend: Arc<dyn SchedulerBackend>,
    // LEASE_UNSET, or frames left. Zero only after a failed unmerge.
    lease_term: AtomicI64,
    is_merged: AtomicBool,
    // Serialises merge/unmerge transitions. Never held while calling into content code.
    transition: Mutex<()>,
}

impl TaskQueueMerger {
    pub fn new(
        platform_queue_id: QueueId,
        raster_queue_id: QueueId,
        backend: Arc<dyn SchedulerBackend>,
    ) -> Self {
        let is_merged = backend.owns(platform_queue_id, raster_queue_id);
        Self {
            platform_queue_id,
            raster_queue_id,
            backend,
            lease_term: AtomicI64::new(LEASE_UNSET),
            is_merged: AtomicBool::new(is_merged),
            transition: Mutex::new(()),
        }
    }

    pub fn platform_queue_id(&self) -> QueueId {
        self.platform_queue_id
    }

    pub fn raster_queue_id(&self) -> QueueId {
        self.raster_queue_id
    }

    /// Fuse the raster queue into the platform queue for `lease_term` frames.
    ///
    /// Already merged: nothing happens, the running lease is kept. If the backend refuses, the
    /// queues stay unmerged and `are_merged` keeps returning `false`.
    pub fn merge_with_lease(&self, lease_term: u32) {
        assert!(lease_term > 0, "lease term must be positive");
        let _transition = self.transition.lock();
        if self.is_merged.load(Ordering::Acquire) {
            return;
        }
        if self
            .backend
            .merge(self.platform_queue_id, self.raster_queue_id)
        {
            self.lease_term
                .store(i64::from(lease_term), Ordering::Release);
            self.is_merged.store(true, Ordering::Release);
            log::debug!("[queue_merger] merged raster into platform, lease {lease_term}");
        } else {
            log::warn!("[queue_merger] backend refused to merge raster into platform");
        }
    }

    /// Merge if not merged yet, then overwrite the lease, shorter or not.
    pub fn merge_and_reset_lease(&self, lease_term: u32) {
        assert!(lease_term > 0, "lease term must be positive");
        let _transition = self.transition.lock();
        if !self.is_merged.load(Ordering::Acquire) {
            if !self
                .backend
                .merge(self.platform_queue_id, self.raster_queue_id)
            {
                log::warn!("[queue_merger] backend refused to merge raster into platform");
                return;
            }
            self.is_merged.store(true, Ordering::Release);
        }
        self.lease_term
            .store(i64::from(lease_term), Ordering::Release);
    }

    /// Raise the lease to `lease_term` if that is longer than what is left. Never shortens it.
    pub fn extend_lease(&self, lease_term: u32) {
        assert!(lease_term > 0, "lease term must be positive");
        let _transition = self.transition.lock();
        if !self.is_merged.load(Ordering::Acquire) {
            return;
        }
        self.lease_term
            .fetch_max(i64::from(lease_term), Ordering::AcqRel);
    }

    /// Count one frame against the lease, unmerging when it runs out.
    ///
    /// If the unmerge fails the queues stay merged with a lease of zero and the next call
    /// retries the unmerge.
    pub fn decrement_lease(&self) {
        if !self.is_merged.load(Ordering::Acquire) {
            return;
        }
        let _transition = self.transition.lock();
        if !self.is_merged.load(Ordering::Acquire) {
            return;
        }
        let lease_term = self.lease_term.load(Ordering::Acquire);
        if lease_term == LEASE_UNSET {
            return;
        }
        debug_assert!(lease_term >= 0, "lease term corrupted: {lease_term}");

        let remaining = if lease_term > 0 {
            lease_term - 1
        } else {
            log::debug!("[queue_merger] retrying unmerge with exhausted lease");
            0
        };
        self.lease_term.store(remaining, Ordering::Release);
        if remaining > 0 {
            return;
        }

        if self.backend.unmerge(self.platform_queue_id) {
            self.lease_term.store(LEASE_UNSET, Ordering::Release);
            self.is_merged.store(false, Ordering::Release);
            log::debug!("[queue_merger] lease expired, queues unmerged");
        } else {
            log::warn!("[queue_merger] unmerge failed, staying merged until next decrement");
        }
    }

    pub fn are_merged(&self) -> bool {
        self.is_merged.load(Ordering::Acquire)
    }

    /// Frames left on the lease, `None` when no unmerge is scheduled.
    pub fn lease(&self) -> Option<u32> {
        u32::try_from(self.lease_term.load(Ordering::Acquire)).ok()
    }

    /// Whether the caller is not on the queue raster work currently executes on.
    pub fn on_wrong_thread(&self) -> bool {
        let expected = if self.are_merged() {
            self.platform_queue_id
        } else {
            self.raster_queue_id
        };
        self.backend.current_queue_id() != Some(expected)
    }
}
