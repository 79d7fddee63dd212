use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use engine::{ControlVsyncConsumer, FrameSubmission, LayerTreeConsumer, LayerTreeProducer};
use frame_scheduler::{Canvas, CompositorContext, ExternalViewEmbedder, FrameStats, LayerTree};
use parking_lot::Mutex;
use present_pacer::{Clock, DisplayBackend, PresentationPacer};
use protocol::{FrameNumber, RasterStatus, VsyncBaton, VsyncTiming};
use queue_merger::TaskQueueMerger;
use rtrb::PushError;
use task_queues::{MessageLoop, MessageLoopTaskQueues, TaskQueueError, TaskRunner};

use crate::{ConfigError, PipelineConfig, Rasterizer};

const PLATFORM_LOOP_LABEL: &str = "pipeline.platform";
const RASTER_LOOP_LABEL: &str = "pipeline.raster";

#[derive(thiserror::Error, Debug)]
pub enum ShellError {
    #[error("layer tree ring is full, dropped frame {frame_number:?}")]
    FrameRingFull { frame_number: FrameNumber },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TaskQueue(#[from] TaskQueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShellStats {
    pub frames_submitted: u64,
    pub frames_rasterized: u64,
    pub resubmits: u64,
    pub raster_errors: u64,
    pub frames_yielded: u64,
}

#[derive(Default)]
struct ShellCounters {
    frames_submitted: AtomicU64,
    frames_rasterized: AtomicU64,
    resubmits: AtomicU64,
    raster_errors: AtomicU64,
    frames_yielded: AtomicU64,
}

struct RasterState<Tree> {
    rasterizer: Rasterizer,
    layer_tree_consumer: LayerTreeConsumer<Tree>,
    // Drawn before anything still in the ring.
    resubmitted: Option<FrameSubmission<Tree>>,
    // Window the most recently rasterized frame was built for.
    last_target_vsync: Option<VsyncTiming>,
}

// Locked by every raster task. Right after an unmerge a task may still be running on the
// platform loop while the raster loop picks up the next one.
struct RasterContext<Tree> {
    state: Mutex<RasterState<Tree>>,
    pacer: Arc<PresentationPacer>,
    task_queue_merger: Arc<TaskQueueMerger>,
    raster_runner: TaskRunner,
    counters: ShellCounters,
}

impl<Tree> RasterContext<Tree>
where
    Tree: LayerTree + Send + 'static,
    Tree::Error: Debug,
{
    fn draw_next(self: &Arc<Self>) {
        if self.task_queue_merger.on_wrong_thread() {
            self.counters.frames_yielded.fetch_add(1, Ordering::Relaxed);
            log::debug!("[pipeline] draw task ran off the rasterizing thread, yielding");
            self.post_draw();
            return;
        }

        let mut state = self.state.lock();
        let next = match state.resubmitted.take() {
            Some(submission) => Some(submission),
            None => state.layer_tree_consumer.pop().ok(),
        };
        let Some(mut submission) = next else {
            return;
        };

        match state.rasterizer.draw(&mut submission.layer_tree) {
            Ok(RasterStatus::Success) => {
                self.counters.frames_rasterized.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "[pipeline] rasterized {:?} for {:?}",
                    submission.frame_number,
                    submission.vsync
                );
                if submission.vsync.is_some() {
                    state.last_target_vsync = submission.vsync;
                }
            }
            Ok(RasterStatus::Resubmit) => {
                self.counters.resubmits.fetch_add(1, Ordering::Relaxed);
                log::debug!("[pipeline] resubmitting {:?}", submission.frame_number);
                state.resubmitted = Some(submission);
                drop(state);
                self.post_draw();
            }
            Err(error) => {
                self.counters.raster_errors.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "[pipeline] rasterizing {:?} failed: {error:?}",
                    submission.frame_number
                );
            }
        }
    }

    fn post_draw(self: &Arc<Self>) {
        let raster = Arc::clone(self);
        if let Err(error) = self.raster_runner.post_task(move || raster.draw_next()) {
            log::error!("[pipeline] failed to post draw task: {error}");
        }
    }

    fn process_completions(&self) {
        let _state = self.state.lock();
        self.pacer.process_completions();
    }
}

/// Owns the platform and raster message loops and everything wired between them.
///
/// The thread that calls `submit_frame` and `request_vsync` is the control context. Draws run as
/// tasks on the raster queue, which executes on the platform loop while the queues are merged.
pub struct Shell<Tree> {
    queues: Arc<MessageLoopTaskQueues>,
    platform_loop: MessageLoop,
    raster_loop: MessageLoop,
    raster: Arc<RasterContext<Tree>>,
    layer_tree_producer: Mutex<LayerTreeProducer<Tree>>,
    vsync_consumer: ControlVsyncConsumer,
    last_frame_number: AtomicU64,
}

impl<Tree> Shell<Tree>
where
    Tree: LayerTree + Send + 'static,
    Tree::Error: Debug,
{
    pub fn new(
        config: &PipelineConfig,
        display: Arc<dyn DisplayBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ShellError> {
        config.validate()?;
        let queues = Arc::new(MessageLoopTaskQueues::new());
        let platform_loop = MessageLoop::spawn(queues.clone(), PLATFORM_LOOP_LABEL)?;
        let raster_loop = MessageLoop::spawn(queues.clone(), RASTER_LOOP_LABEL)?;
        let raster_runner = raster_loop.task_runner();

        let task_queue_merger = Arc::new(TaskQueueMerger::new(
            platform_loop.queue_id(),
            raster_loop.queue_id(),
            queues.clone(),
        ));
        let (control_channels, raster_channels) =
            engine::create_thread_channels(config.layer_tree_capacity, config.vsync_capacity);

        let raster = Arc::new_cyclic(|raster: &Weak<RasterContext<Tree>>| {
            let waker_target = raster.clone();
            let waker_runner = raster_runner.clone();
            let pacer = Arc::new(
                PresentationPacer::new(display, raster_channels.vsync_producer, clock)
                    .with_completion_waker(move || {
                        let target = waker_target.clone();
                        let posted = waker_runner.post_task(move || {
                            if let Some(raster) = target.upgrade() {
                                raster.process_completions();
                            }
                        });
                        if let Err(error) = posted {
                            log::warn!("[pipeline] dropping present completion: {error}");
                        }
                    }),
            );

            let mut rasterizer = Rasterizer::new(
                CompositorContext::new(config.frame_scheduler),
                task_queue_merger.clone(),
                pacer.clone(),
            );
            rasterizer.set_ignore_raster_cache(config.ignore_raster_cache);

            RasterContext {
                state: Mutex::new(RasterState {
                    rasterizer,
                    layer_tree_consumer: raster_channels.layer_tree_consumer,
                    resubmitted: None,
                    last_target_vsync: None,
                }),
                pacer,
                task_queue_merger,
                raster_runner,
                counters: ShellCounters::default(),
            }
        });
        log::info!(
            "[pipeline] shell started, merged lease {} frames",
            config.frame_scheduler.merged_lease_frames
        );

        Ok(Self {
            queues,
            platform_loop,
            raster_loop,
            raster,
            layer_tree_producer: Mutex::new(control_channels.layer_tree_producer),
            vsync_consumer: control_channels.vsync_consumer,
            last_frame_number: AtomicU64::new(0),
        })
    }

    pub fn set_view_embedder(&self, view_embedder: Option<Box<dyn ExternalViewEmbedder + Send>>) {
        self.raster.state.lock().rasterizer.set_view_embedder(view_embedder);
    }

    pub fn set_canvas(&self, canvas: Option<Box<dyn Canvas + Send>>) {
        self.raster.state.lock().rasterizer.set_canvas(canvas);
    }

    /// Hand a layer tree to the raster context.
    pub fn submit_frame(
        &self,
        layer_tree: Tree,
        vsync: Option<VsyncTiming>,
    ) -> Result<FrameNumber, ShellError> {
        let frame_number = FrameNumber(self.last_frame_number.fetch_add(1, Ordering::AcqRel))
            .next();
        let submission = FrameSubmission {
            frame_number,
            layer_tree,
            vsync,
        };
        match self.layer_tree_producer.lock().push(submission) {
            Ok(()) => {}
            Err(PushError::Full(_)) => {
                log::warn!("[pipeline] raster context behind, dropping {frame_number:?}");
                return Err(ShellError::FrameRingFull { frame_number });
            }
        }
        self.raster
            .counters
            .frames_submitted
            .fetch_add(1, Ordering::Relaxed);
        self.raster.post_draw();
        Ok(frame_number)
    }

    /// Ask for the vsync window following the next completed present. Timings arrive through
    /// `vsync_consumer`.
    pub fn request_vsync(&self, baton: VsyncBaton) {
        self.raster.pacer.await_vsync(baton);
    }

    pub fn vsync_consumer(&self) -> &ControlVsyncConsumer {
        &self.vsync_consumer
    }

    pub fn raster_task_runner(&self) -> TaskRunner {
        self.raster_loop.task_runner()
    }

    pub fn task_queue_merger(&self) -> &Arc<TaskQueueMerger> {
        &self.raster.task_queue_merger
    }

    pub fn pacer(&self) -> &Arc<PresentationPacer> {
        &self.raster.pacer
    }

    /// Vsync window of the latest rasterized frame that was submitted with one.
    pub fn last_target_vsync(&self) -> Option<VsyncTiming> {
        self.raster.state.lock().last_target_vsync
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.raster.state.lock().rasterizer.frame_stats()
    }

    pub fn stats(&self) -> ShellStats {
        let counters = &self.raster.counters;
        ShellStats {
            frames_submitted: counters.frames_submitted.load(Ordering::Relaxed),
            frames_rasterized: counters.frames_rasterized.load(Ordering::Relaxed),
            resubmits: counters.resubmits.load(Ordering::Relaxed),
            raster_errors: counters.raster_errors.load(Ordering::Relaxed),
            frames_yielded: counters.frames_yielded.load(Ordering::Relaxed),
        }
    }
}

impl<Tree> Drop for Shell<Tree> {
    fn drop(&mut self) {
        self.raster_loop.terminate();
        self.platform_loop.terminate();
        for queue_id in [self.raster_loop.queue_id(), self.platform_loop.queue_id()] {
            if let Err(error) = self.queues.dispose(queue_id) {
                log::warn!("[pipeline] disposing queue on shutdown: {error}");
            }
        }
        log::info!("[pipeline] shell stopped");
    }
}
