use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

slotmap::new_key_type! {
    /// Identity of one logical task queue.
    pub struct QueueId;
}

/// Outcome of a single raster attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RasterStatus {
    Success,
    /// The attempt was cancelled; the whole frame must be retried from preroll.
    Resubmit,
}

impl RasterStatus {
    pub fn is_resubmit(self) -> bool {
        matches!(self, RasterStatus::Resubmit)
    }
}

/// Correlation token handed out by the control context when it wants to hear about the next
/// completed present. Zero is reserved as "no baton outstanding".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VsyncBaton(NonZeroU64);

impl VsyncBaton {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for VsyncBaton {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "baton#{}", self.0)
    }
}

/// What the display reports once a present has reached the screen. Times are nanoseconds on
/// the same clock the pacer reads `now` from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationInfo {
    pub presentation_time: u64,
    pub presentation_interval: u64,
}

/// Vsync window delivered to the frame producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsyncTiming {
    pub previous_vsync: u64,
    pub next_vsync: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PresentTraceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub u64);

impl FrameNumber {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Vsync notification as seen by the control context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncEvent {
    pub baton: VsyncBaton,
    pub timing: VsyncTiming,
}
