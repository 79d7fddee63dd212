use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};
use frame_scheduler::{ExternalViewEmbedder, LayerTree, RasterCacheKey, ScopedFrame};
use pipeline::{PipelineConfig, Shell, ShellError, SimulatedDisplay};
use present_pacer::{Clock, MonotonicClock};
use protocol::{VsyncBaton, VsyncEvent, VsyncTiming};

const VSYNC_WAIT: Duration = Duration::from_millis(100);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version, about = "Drive the frame pipeline against a simulated display")]
struct Arguments {
    /// JSON pipeline config. Defaults apply when omitted.
    #[arg(long, short = 'c', value_parser)]
    config: Option<PathBuf>,
    /// Number of frames the control loop submits.
    #[arg(long, short = 'f', default_value_t = 120)]
    frames: u64,
    /// Display refresh interval in milliseconds, overriding the config.
    #[arg(long)]
    interval_ms: Option<u64>,
    /// Every Nth frame mutates a platform view, forcing the queues to merge. 0 disables.
    #[arg(long, default_value_t = 30)]
    platform_view_every: u64,
}

struct DemoTree {
    frame: u64,
}

impl LayerTree for DemoTree {
    type Error = std::convert::Infallible;

    fn preroll(
        &mut self,
        frame: &mut ScopedFrame<'_>,
        ignore_raster_cache: bool,
    ) -> Result<(), Self::Error> {
        if !ignore_raster_cache {
            // Background layer is stable, the overlay changes every few frames.
            frame.raster_cache_mut().prepare(RasterCacheKey(0));
            frame.raster_cache_mut().prepare(RasterCacheKey(1 + self.frame / 8));
        }
        Ok(())
    }

    fn paint(
        &mut self,
        _frame: &mut ScopedFrame<'_>,
        _ignore_raster_cache: bool,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct DemoViews {
    pending: Arc<AtomicBool>,
}

impl ExternalViewEmbedder for DemoViews {
    fn has_pending_view_operations(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn cancel_frame(&mut self) {
        log::debug!("[demo] platform view frame cancelled");
    }
}

fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let arguments = Arguments::parse();

    let mut config = match &arguments.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(interval_ms) = arguments.interval_ms {
        config.presentation_interval_nanos = interval_ms.saturating_mul(1_000_000);
        config.validate()?;
    }

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let display = Arc::new(
        SimulatedDisplay::spawn(clock.clone(), config.presentation_interval_nanos)
            .context("failed to spawn display thread")?,
    );
    let shell: Shell<DemoTree> = Shell::new(&config, display, clock)?;
    let pending_views = Arc::new(AtomicBool::new(false));
    shell.set_view_embedder(Some(Box::new(DemoViews {
        pending: pending_views.clone(),
    })));

    let mut events: Vec<VsyncEvent> = Vec::new();
    let mut vsync: Option<VsyncTiming> = None;
    let mut dropped_frames = 0u64;
    for frame in 0..arguments.frames {
        let mutates_views =
            arguments.platform_view_every > 0 && frame % arguments.platform_view_every == 0;
        pending_views.store(mutates_views, Ordering::Release);

        if !shell.pacer().has_outstanding_baton() {
            let baton = VsyncBaton::new(frame + 1).context("baton overflow")?;
            shell.request_vsync(baton);
        }
        match shell.submit_frame(DemoTree { frame }, vsync) {
            Ok(frame_number) => log::debug!("[demo] submitted {frame_number:?}"),
            Err(ShellError::FrameRingFull { .. }) => dropped_frames += 1,
            Err(error) => return Err(error.into()),
        }

        events.clear();
        shell
            .vsync_consumer()
            .drain_batch_with_wait(&mut events, 4, VSYNC_WAIT);
        match events.last() {
            Some(event) => vsync = Some(event.timing),
            None => log::debug!("[demo] no vsync within {VSYNC_WAIT:?}"),
        }
    }

    let settle_deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        let stats = shell.stats();
        if stats.frames_rasterized + stats.raster_errors >= stats.frames_submitted {
            break;
        }
        if Instant::now() >= settle_deadline {
            log::warn!("[demo] raster context did not settle: {stats:?}");
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let stats = shell.stats();
    log::info!(
        "[demo] submitted {} rasterized {} resubmits {} dropped {} presents {}",
        stats.frames_submitted,
        stats.frames_rasterized,
        stats.resubmits,
        dropped_frames,
        shell.pacer().presents_issued()
    );
    log::info!(
        "[demo] last vsync window {:?}, still merged: {}",
        vsync,
        shell.task_queue_merger().are_merged()
    );
    Ok(())
}
