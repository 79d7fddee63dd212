use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::RasterStatus;
use queue_merger::TaskQueueMerger;

use crate::{Canvas, ExternalViewEmbedder, FrameSchedulerConfig, LayerTree, RasterCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub frame_count: u64,
    pub last_raster_time: Option<Duration>,
}

/// State that outlives frames: the raster cache and frame instrumentation.
#[derive(Debug)]
pub struct CompositorContext {
    config: FrameSchedulerConfig,
    raster_cache: RasterCache,
    frame_count: u64,
    raster_started_at: Option<Instant>,
    last_raster_time: Option<Duration>,
}

impl CompositorContext {
    pub fn new(config: FrameSchedulerConfig) -> Self {
        assert!(
            config.merged_lease_frames > 0,
            "invalid frame scheduler config: merged_lease_frames must be positive"
        );
        Self {
            config,
            raster_cache: RasterCache::new(),
            frame_count: 0,
            raster_started_at: None,
            last_raster_time: None,
        }
    }

    pub fn config(&self) -> FrameSchedulerConfig {
        self.config
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            frame_count: self.frame_count,
            last_raster_time: self.last_raster_time,
        }
    }

    pub fn raster_cache(&self) -> &RasterCache {
        &self.raster_cache
    }

    /// Begin one raster attempt. The attempt ends when the returned frame is dropped.
    pub fn acquire_frame<'a>(
        &'a mut self,
        canvas: Option<&'a mut dyn Canvas>,
        view_embedder: Option<&'a mut dyn ExternalViewEmbedder>,
        task_queue_merger: Arc<TaskQueueMerger>,
    ) -> ScopedFrame<'a> {
        self.begin_frame();
        ScopedFrame {
            context: self,
            canvas,
            view_embedder,
            task_queue_merger,
        }
    }

    pub fn on_graphics_context_created(&mut self) {
        self.raster_cache.clear();
    }

    pub fn on_graphics_context_destroyed(&mut self) {
        self.raster_cache.clear();
    }

    fn begin_frame(&mut self) {
        if self.config.instrumentation_enabled {
            self.frame_count += 1;
            self.raster_started_at = Some(Instant::now());
        }
    }

    fn end_frame(&mut self) {
        let evicted = self.raster_cache.sweep_after_frame();
        if evicted > 0 {
            log::trace!("[frame_scheduler] raster cache evicted {evicted} entries");
        }
        if self.config.instrumentation_enabled {
            self.last_raster_time = self.raster_started_at.take().map(|start| start.elapsed());
        }
    }
}

impl Default for CompositorContext {
    fn default() -> Self {
        Self::new(FrameSchedulerConfig::default())
    }
}

pub struct ScopedFrame<'a> {
    context: &'a mut CompositorContext,
    canvas: Option<&'a mut dyn Canvas>,
    view_embedder: Option<&'a mut dyn ExternalViewEmbedder>,
    task_queue_merger: Arc<TaskQueueMerger>,
}

impl<'a> ScopedFrame<'a> {
    pub fn raster_cache_mut(&mut self) -> &mut RasterCache {
        &mut self.context.raster_cache
    }

    pub fn canvas_mut(&mut self) -> Option<&mut (dyn Canvas + 'a)> {
        self.canvas.as_deref_mut()
    }

    pub fn task_queue_merger(&self) -> &Arc<TaskQueueMerger> {
        &self.task_queue_merger
    }

    /// One preroll/paint attempt for `layer_tree`.
    ///
    /// Returns `Resubmit` without painting when pending external view operations need the
    /// queues merged and they are not merged yet; the merge is requested before returning.
    pub fn raster<T>(
        &mut self,
        layer_tree: &mut T,
        ignore_raster_cache: bool,
    ) -> Result<RasterStatus, T::Error>
    where
        T: LayerTree + ?Sized,
    {
        layer_tree.preroll(self, ignore_raster_cache)?;

        let lease_frames = self.context.config.merged_lease_frames;
        if let Some(view_embedder) = self.view_embedder.as_deref_mut() {
            if view_embedder.has_pending_view_operations() {
                if self.task_queue_merger.are_merged() {
                    self.task_queue_merger.extend_lease(lease_frames);
                } else {
                    log::debug!(
                        "[frame_scheduler] external views mutated while unmerged, resubmitting"
                    );
                    view_embedder.cancel_frame();
                    self.task_queue_merger.merge_with_lease(lease_frames);
                    return Ok(RasterStatus::Resubmit);
                }
            }
        }

        if let Some(canvas) = self.canvas.as_deref_mut() {
            canvas.clear();
        }
        layer_tree.paint(self, ignore_raster_cache)?;
        Ok(RasterStatus::Success)
    }
}

impl Drop for ScopedFrame<'_> {
    fn drop(&mut self) {
        self.context.end_frame();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use task_queues::{MessageLoopTaskQueues, SchedulerBackend};

    use super::*;
    use crate::RasterCacheKey;

    #[derive(Default)]
    struct RecordingTree {
        prerolls: usize,
        paints: usize,
        painted_onto_canvas: usize,
        fail_paint: bool,
        cache_key: Option<RasterCacheKey>,
    }

    impl LayerTree for RecordingTree {
        type Error = &'static str;

        fn preroll(
            &mut self,
            frame: &mut ScopedFrame<'_>,
            _ignore_raster_cache: bool,
        ) -> Result<(), Self::Error> {
            self.prerolls += 1;
            if let Some(key) = self.cache_key {
                frame.raster_cache_mut().prepare(key);
            }
            Ok(())
        }

        fn paint(
            &mut self,
            frame: &mut ScopedFrame<'_>,
            _ignore_raster_cache: bool,
        ) -> Result<(), Self::Error> {
            if self.fail_paint {
                return Err("paint failed");
            }
            self.paints += 1;
            if frame.canvas_mut().is_some() {
                self.painted_onto_canvas += 1;
            }
            Ok(())
        }
    }

    struct PendingViews {
        pending: bool,
        cancels: usize,
    }

    impl ExternalViewEmbedder for PendingViews {
        fn has_pending_view_operations(&self) -> bool {
            self.pending
        }

        fn cancel_frame(&mut self) {
            self.cancels += 1;
        }
    }

    #[derive(Default)]
    struct CountingCanvas {
        clears: usize,
    }

    impl Canvas for CountingCanvas {
        fn clear(&mut self) {
            self.clears += 1;
        }
    }

    fn merger() -> (Arc<MessageLoopTaskQueues>, Arc<TaskQueueMerger>) {
        let queues = Arc::new(MessageLoopTaskQueues::new());
        let platform = queues.create_queue();
        let raster = queues.create_queue();
        let merger = Arc::new(TaskQueueMerger::new(platform, raster, queues.clone()));
        (queues, merger)
    }

    #[test]
    fn without_embedder_frame_always_succeeds() {
        let (_queues, merger) = merger();
        let mut context = CompositorContext::default();
        let mut canvas = CountingCanvas::default();
        let mut tree = RecordingTree::default();

        let status = context
            .acquire_frame(Some(&mut canvas), None, merger.clone())
            .raster(&mut tree, false);

        assert_eq!(status, Ok(RasterStatus::Success));
        assert_eq!((tree.prerolls, tree.paints), (1, 1));
        assert_eq!(tree.painted_onto_canvas, 1);
        assert_eq!(canvas.clears, 1);
        assert!(!merger.are_merged());
    }

    #[test]
    fn pending_views_while_unmerged_request_merge_and_resubmit() {
        let (queues, merger) = merger();
        let mut context = CompositorContext::default();
        let mut views = PendingViews {
            pending: true,
            cancels: 0,
        };
        let mut canvas = CountingCanvas::default();
        let mut tree = RecordingTree::default();

        let status = context
            .acquire_frame(Some(&mut canvas), Some(&mut views), merger.clone())
            .raster(&mut tree, false);

        assert_eq!(status, Ok(RasterStatus::Resubmit));
        assert_eq!(views.cancels, 1);
        assert_eq!((tree.prerolls, tree.paints), (1, 0));
        assert_eq!(canvas.clears, 0);
        assert!(merger.are_merged());
        assert_eq!(merger.lease(), Some(10));
        assert!(queues.owns(merger.platform_queue_id(), merger.raster_queue_id()));
    }

    #[test]
    fn pending_views_while_merged_extend_lease_and_paint() {
        let (_queues, merger) = merger();
        merger.merge_with_lease(3);
        let mut context = CompositorContext::default();
        let mut views = PendingViews {
            pending: true,
            cancels: 0,
        };
        let mut tree = RecordingTree::default();

        let status = context
            .acquire_frame(None, Some(&mut views), merger.clone())
            .raster(&mut tree, false);

        assert_eq!(status, Ok(RasterStatus::Success));
        assert_eq!(views.cancels, 0);
        assert_eq!(tree.paints, 1);
        assert_eq!(tree.painted_onto_canvas, 0);
        assert_eq!(merger.lease(), Some(10));
    }

    #[test]
    fn merged_lease_longer_than_constant_is_kept() {
        let (_queues, merger) = merger();
        merger.merge_with_lease(25);
        let mut context = CompositorContext::default();
        let mut views = PendingViews {
            pending: true,
            cancels: 0,
        };
        let mut tree = RecordingTree::default();

        let _ = context
            .acquire_frame(None, Some(&mut views), merger.clone())
            .raster(&mut tree, false);

        assert_eq!(merger.lease(), Some(25));
    }

    #[test]
    fn quiet_embedder_does_not_touch_the_merger() {
        let (_queues, merger) = merger();
        let mut context = CompositorContext::default();
        let mut views = PendingViews {
            pending: false,
            cancels: 0,
        };
        let mut tree = RecordingTree::default();

        let status = context
            .acquire_frame(None, Some(&mut views), merger.clone())
            .raster(&mut tree, true);

        assert_eq!(status, Ok(RasterStatus::Success));
        assert!(!merger.are_merged());
        assert_eq!(views.cancels, 0);
    }

    #[test]
    fn paint_errors_pass_through() {
        let (_queues, merger) = merger();
        let mut context = CompositorContext::default();
        let mut tree = RecordingTree {
            fail_paint: true,
            ..RecordingTree::default()
        };

        let status = context
            .acquire_frame(None, None, merger)
            .raster(&mut tree, false);

        assert_eq!(status, Err("paint failed"));
        assert_eq!(tree.prerolls, 1);
    }

    #[test]
    fn resubmitted_attempt_still_ages_the_raster_cache() {
        let (_queues, merger) = merger();
        let mut context = CompositorContext::default();
        let mut tree = RecordingTree {
            cache_key: Some(RasterCacheKey(4)),
            ..RecordingTree::default()
        };
        let _ = context
            .acquire_frame(None, None, merger.clone())
            .raster(&mut tree, false);
        assert_eq!(context.raster_cache().len(), 1);

        let mut views = PendingViews {
            pending: true,
            cancels: 0,
        };
        let mut stale_tree = RecordingTree::default();
        let status = context
            .acquire_frame(None, Some(&mut views), merger)
            .raster(&mut stale_tree, false);

        assert_eq!(status, Ok(RasterStatus::Resubmit));
        assert!(context.raster_cache().is_empty());
    }

    #[test]
    fn instrumentation_counts_frames_only_when_enabled() {
        let (_queues, merger) = merger();
        let mut quiet = CompositorContext::default();
        drop(quiet.acquire_frame(None, None, merger.clone()));
        assert_eq!(quiet.stats(), FrameStats::default());

        let mut instrumented = CompositorContext::new(FrameSchedulerConfig {
            instrumentation_enabled: true,
            ..FrameSchedulerConfig::default()
        });
        drop(instrumented.acquire_frame(None, None, merger.clone()));
        drop(instrumented.acquire_frame(None, None, merger));
        let stats = instrumented.stats();
        assert_eq!(stats.frame_count, 2);
        assert!(stats.last_raster_time.is_some());
    }

    #[test]
    fn graphics_context_changes_clear_the_cache() {
        let (_queues, merger) = merger();
        let mut context = CompositorContext::default();
        let mut tree = RecordingTree {
            cache_key: Some(RasterCacheKey(1)),
            ..RecordingTree::default()
        };
        let _ = context
            .acquire_frame(None, None, merger)
            .raster(&mut tree, false);

        context.on_graphics_context_destroyed();
        assert!(context.raster_cache().is_empty());
    }

    #[test]
    #[should_panic(expected = "merged_lease_frames must be positive")]
    fn zero_lease_config_is_rejected() {
        let _ = CompositorContext::new(FrameSchedulerConfig {
            merged_lease_frames: 0,
            instrumentation_enabled: false,
        });
    }
}
