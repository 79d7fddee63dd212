use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, unbounded};
use present_pacer::{Clock, DisplayBackend, PresentCompletion};
use protocol::{PresentTraceId, PresentationInfo};

/// Display stand-in that takes one refresh interval per present on its own thread.
pub struct SimulatedDisplay {
    present_sender: Option<Sender<(PresentTraceId, PresentCompletion)>>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedDisplay {
    pub fn spawn(clock: Arc<dyn Clock>, presentation_interval_nanos: u64) -> std::io::Result<Self> {
        let (present_sender, present_receiver) =
            unbounded::<(PresentTraceId, PresentCompletion)>();
        let interval = Duration::from_nanos(presentation_interval_nanos);

        let thread = thread::Builder::new()
            .name("pipeline.display".to_string())
            .spawn(move || {
                for (trace_id, completion) in present_receiver.iter() {
                    thread::sleep(interval);
                    let info = PresentationInfo {
                        presentation_time: clock.now(),
                        presentation_interval: presentation_interval_nanos,
                    };
                    log::trace!("[display] presented {trace_id:?} at {}", info.presentation_time);
                    completion.complete(info);
                }
            })?;

        Ok(Self {
            present_sender: Some(present_sender),
            thread: Some(thread),
        })
    }
}

impl DisplayBackend for SimulatedDisplay {
    fn present(&self, trace_id: PresentTraceId, completion: PresentCompletion) {
        let Some(sender) = &self.present_sender else {
            return;
        };
        if sender.send((trace_id, completion)).is_err() {
            log::warn!("[display] display thread gone, dropping present {trace_id:?}");
        }
    }
}

impl Drop for SimulatedDisplay {
    fn drop(&mut self) {
        self.present_sender.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("[display] display thread panicked");
            }
        }
    }
}
