mod compositor;
mod raster_cache;

pub use compositor::{CompositorContext, FrameStats, ScopedFrame};
pub use protocol::RasterStatus;
pub use raster_cache::{RasterCache, RasterCacheKey};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSchedulerConfig {
    /// Frames the queues stay merged after a frame needed ordered scheduling.
    pub merged_lease_frames: u32,
    pub instrumentation_enabled: bool,
}

impl Default for FrameSchedulerConfig {
    fn default() -> Self {
        Self {
            merged_lease_frames: 10,
            instrumentation_enabled: false,
        }
    }
}

/// Content composited outside this pipeline (platform views and similar) that may only be
/// mutated while raster and platform work are strictly ordered.
pub trait ExternalViewEmbedder {
    fn has_pending_view_operations(&self) -> bool;

    /// Throw away whatever was prepared for the current attempt.
    fn cancel_frame(&mut self);
}

pub trait Canvas {
    fn clear(&mut self);
}

/// A frame's content. Errors are passed through the raster step untouched.
pub trait LayerTree {
    type Error;

    fn preroll(
        &mut self,
        frame: &mut ScopedFrame<'_>,
        ignore_raster_cache: bool,
    ) -> Result<(), Self::Error>;

    fn paint(
        &mut self,
        frame: &mut ScopedFrame<'_>,
        ignore_raster_cache: bool,
    ) -> Result<(), Self::Error>;
}
