use std::sync::Arc;

use frame_scheduler::{Canvas, CompositorContext, ExternalViewEmbedder, FrameStats, LayerTree};
use present_pacer::PresentationPacer;
use protocol::RasterStatus;
use queue_merger::TaskQueueMerger;

/// Raster-context owner of the compositor state. One `draw` is one raster attempt.
pub struct Rasterizer {
    compositor: CompositorContext,
    canvas: Option<Box<dyn Canvas + Send>>,
    view_embedder: Option<Box<dyn ExternalViewEmbedder + Send>>,
    task_queue_merger: Arc<TaskQueueMerger>,
    pacer: Arc<PresentationPacer>,
    ignore_raster_cache: bool,
}

impl Rasterizer {
    pub fn new(
        compositor: CompositorContext,
        task_queue_merger: Arc<TaskQueueMerger>,
        pacer: Arc<PresentationPacer>,
    ) -> Self {
        Self {
            compositor,
            canvas: None,
            view_embedder: None,
            task_queue_merger,
            pacer,
            ignore_raster_cache: false,
        }
    }

    pub fn set_canvas(&mut self, canvas: Option<Box<dyn Canvas + Send>>) {
        self.canvas = canvas;
    }

    pub fn set_view_embedder(
        &mut self,
        view_embedder: Option<Box<dyn ExternalViewEmbedder + Send>>,
    ) {
        self.view_embedder = view_embedder;
    }

    pub fn set_ignore_raster_cache(&mut self, ignore_raster_cache: bool) {
        self.ignore_raster_cache = ignore_raster_cache;
    }

    pub fn compositor(&self) -> &CompositorContext {
        &self.compositor
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.compositor.stats()
    }

    /// Rasterize `layer_tree` once.
    ///
    /// A successful frame is queued for presentation and consumes one frame of the merge lease.
    /// On `Resubmit` nothing is presented and the caller owns re-posting the tree.
    pub fn draw<T>(&mut self, layer_tree: &mut T) -> Result<RasterStatus, T::Error>
    where
        T: LayerTree + ?Sized,
    {
        let canvas = self.canvas.as_deref_mut().map(|canvas| canvas as &mut dyn Canvas);
        let view_embedder = self
            .view_embedder
            .as_deref_mut()
            .map(|embedder| embedder as &mut dyn ExternalViewEmbedder);
        let status = self
            .compositor
            .acquire_frame(canvas, view_embedder, self.task_queue_merger.clone())
            .raster(layer_tree, self.ignore_raster_cache)?;

        if status == RasterStatus::Success {
            self.pacer.queue_present();
            self.task_queue_merger.decrement_lease();
        }
        Ok(status)
    }

    pub fn on_graphics_context_created(&mut self) {
        self.compositor.on_graphics_context_created();
    }

    pub fn on_graphics_context_destroyed(&mut self) {
        self.compositor.on_graphics_context_destroyed();
    }
}
