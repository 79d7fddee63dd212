use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use crossbeam_queue::ArrayQueue;
use present_pacer::VsyncSink;
use protocol::{FrameNumber, VsyncBaton, VsyncEvent, VsyncTiming};
use rtrb::{Consumer, PopError, Producer, PushError, RingBuffer};

/// One frame handed from the control context to the raster context.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSubmission<Tree> {
    pub frame_number: FrameNumber,
    pub layer_tree: Tree,
    /// Window the control context built this frame for, when it was driven by a vsync.
    pub vsync: Option<VsyncTiming>,
}

pub struct ControlThreadChannels<Tree> {
    pub layer_tree_producer: LayerTreeProducer<Tree>,
    pub vsync_consumer: ControlVsyncConsumer,
}

pub struct RasterThreadChannels<Tree> {
    pub layer_tree_consumer: LayerTreeConsumer<Tree>,
    pub vsync_producer: Arc<RasterVsyncProducer>,
}

// Single producer (raster side through the pacer), single consumer (control side).
struct SharedVsyncMailbox {
    // Overflow evicts the oldest event and keeps the newest.
    queue: ArrayQueue<VsyncEvent>,
    notify_sender: Sender<()>,
    notify_receiver: Receiver<()>,
    dropped: AtomicU64,
    pushed: AtomicU64,
}

pub struct RasterVsyncProducer {
    shared: Arc<SharedVsyncMailbox>,
}

impl RasterVsyncProducer {
    pub fn push(&self, event: VsyncEvent) {
        let mut pending_event = event;
        loop {
            match self.shared.queue.push(pending_event) {
                Ok(()) => {
                    self.shared.pushed.fetch_add(1, Ordering::Relaxed);
                    match self.shared.notify_sender.try_send(()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(())) => {}
                        Err(TrySendError::Disconnected(())) => {
                            panic!("vsync mailbox notify channel disconnected")
                        }
                    }
                    return;
                }
                Err(returned_event) => {
                    pending_event = returned_event;
                    if let Some(evicted) = self.shared.queue.pop() {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[engine] vsync mailbox full, dropped {}", evicted.baton);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed_events(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }
}

impl VsyncSink for RasterVsyncProducer {
    fn on_vsync(&self, baton: VsyncBaton, timing: VsyncTiming) {
        self.push(VsyncEvent { baton, timing });
    }
}

pub struct ControlVsyncConsumer {
    shared: Arc<SharedVsyncMailbox>,
}

impl ControlVsyncConsumer {
    /// Drain up to `max_items` events into `output`, waiting up to `wait_timeout` if none are
    /// available yet.
    ///
    /// Appends to `output`; the caller clears it.
    pub fn drain_batch_with_wait(
        &self,
        output: &mut Vec<VsyncEvent>,
        max_items: usize,
        wait_timeout: Duration,
    ) {
        if max_items == 0 {
            return;
        }

        let mut drained_count = self.drain_into(output, max_items);
        if drained_count > 0 || wait_timeout.is_zero() {
            return;
        }

        let wait_deadline = Instant::now() + wait_timeout;
        loop {
            let now = Instant::now();
            if now >= wait_deadline {
                return;
            }
            let remaining = wait_deadline.saturating_duration_since(now);
            match self.shared.notify_receiver.recv_timeout(remaining) {
                Ok(()) => {
                    drained_count += self.drain_into(output, max_items - drained_count);
                    if drained_count > 0 {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("vsync mailbox notify channel disconnected")
                }
            }
        }
    }

    fn drain_into(&self, output: &mut Vec<VsyncEvent>, max_items: usize) -> usize {
        let mut drained_count = 0;
        while drained_count < max_items {
            match self.shared.queue.pop() {
                Some(event) => {
                    output.push(event);
                    drained_count += 1;
                }
                None => break,
            }
        }
        drained_count
    }
}

pub struct LayerTreeProducer<Tree> {
    producer: Producer<FrameSubmission<Tree>>,
}

impl<Tree> LayerTreeProducer<Tree> {
    /// Fails with the submission handed back when the raster side is a full ring behind.
    pub fn push(
        &mut self,
        submission: FrameSubmission<Tree>,
    ) -> Result<(), PushError<FrameSubmission<Tree>>> {
        self.producer.push(submission)
    }

    pub fn slots(&self) -> usize {
        self.producer.slots()
    }
}

pub struct LayerTreeConsumer<Tree> {
    consumer: Consumer<FrameSubmission<Tree>>,
}

impl<Tree> LayerTreeConsumer<Tree> {
    pub fn pop(&mut self) -> Result<FrameSubmission<Tree>, PopError> {
        self.consumer.pop()
    }

    pub fn items(&self) -> usize {
        self.consumer.slots()
    }
}

pub fn create_thread_channels<Tree>(
    layer_tree_capacity: usize,
    vsync_capacity: usize,
) -> (ControlThreadChannels<Tree>, RasterThreadChannels<Tree>) {
    assert!(
        layer_tree_capacity > 0,
        "layer tree capacity must be greater than zero"
    );
    assert!(vsync_capacity > 0, "vsync capacity must be greater than zero");

    let (notify_sender, notify_receiver) = bounded(1);
    let shared_mailbox = Arc::new(SharedVsyncMailbox {
        queue: ArrayQueue::new(vsync_capacity),
        notify_sender,
        notify_receiver,
        dropped: AtomicU64::new(0),
        pushed: AtomicU64::new(0),
    });
    let (layer_tree_sender, layer_tree_receiver) = RingBuffer::new(layer_tree_capacity);

    let control_thread_channels = ControlThreadChannels {
        layer_tree_producer: LayerTreeProducer {
            producer: layer_tree_sender,
        },
        vsync_consumer: ControlVsyncConsumer {
            shared: shared_mailbox.clone(),
        },
    };
    let raster_thread_channels = RasterThreadChannels {
        layer_tree_consumer: LayerTreeConsumer {
            consumer: layer_tree_receiver,
        },
        vsync_producer: Arc::new(RasterVsyncProducer {
            shared: shared_mailbox,
        }),
    };

    (control_thread_channels, raster_thread_channels)
}
