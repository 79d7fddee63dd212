//! Presentation pacing.
//!
//! At most one present is in flight to the display and at most one more is queued behind it.
//! The control context parks a vsync baton with `await_vsync`; the next completed present
//! hands it back together with a predicted vsync window.
//!
//! Threading:
//! - `await_vsync` is called from the control context.
//! - `queue_present` and `process_completions` are called from the raster context. They are
//!   ordered against each other internally, so a host that runs them on two threads for a
//!   while (around a queue merge, say) does not lose a queued present.
//! - `PresentCompletion::complete` is called from whatever thread the display runs on and
//!   only sends on a channel.

mod clock;
mod phase;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use protocol::{PresentTraceId, PresentationInfo, VsyncBaton, VsyncTiming};

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use phase::snap_to_next_phase;

const NO_BATON: u64 = 0;

pub trait DisplayBackend: Send + Sync {
    /// Start presenting the current frame. `completion` must be completed exactly once, from
    /// any thread, when the frame reached the display.
    fn present(&self, trace_id: PresentTraceId, completion: PresentCompletion);
}

pub trait VsyncSink: Send + Sync {
    fn on_vsync(&self, baton: VsyncBaton, timing: VsyncTiming);
}

type CompletionWaker = Arc<dyn Fn() + Send + Sync>;

/// Single-shot continuation handed to the display for one present.
pub struct PresentCompletion {
    trace_id: PresentTraceId,
    sender: Sender<(PresentTraceId, PresentationInfo)>,
    waker: Option<CompletionWaker>,
}

impl PresentCompletion {
    pub fn trace_id(&self) -> PresentTraceId {
        self.trace_id
    }

    pub fn complete(self, info: PresentationInfo) {
        // Unbounded: never blocks the display thread.
        if self.sender.send((self.trace_id, info)).is_err() {
            log::warn!(
                "[present_pacer] completion for {:?} arrived after the pacer was dropped",
                self.trace_id
            );
            return;
        }
        if let Some(waker) = &self.waker {
            waker();
        }
    }
}

pub struct PresentationPacer {
    backend: Arc<dyn DisplayBackend>,
    vsync_sink: Arc<dyn VsyncSink>,
    clock: Arc<dyn Clock>,
    completion_waker: Option<CompletionWaker>,
    completion_sender: Sender<(PresentTraceId, PresentationInfo)>,
    completion_receiver: Receiver<(PresentTraceId, PresentationInfo)>,

    // Shared between the control and raster contexts.
    pending_present_baton: AtomicU64,

    // Held across the in-flight check and the pending update so a completion cannot slip in
    // between them.
    present_transition: Mutex<()>,
    presentation_callback_pending: AtomicBool,
    present_session_pending: AtomicBool,

    next_queue_trace_id: AtomicU64,
    processed_queue_trace_id: AtomicU64,
    next_present_trace_id: AtomicU64,
}

impl PresentationPacer {
    pub fn new(
        backend: Arc<dyn DisplayBackend>,
        vsync_sink: Arc<dyn VsyncSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (completion_sender, completion_receiver) = unbounded();
        Self {
            backend,
            vsync_sink,
            clock,
            completion_waker: None,
            completion_sender,
            completion_receiver,
            pending_present_baton: AtomicU64::new(NO_BATON),
            present_transition: Mutex::new(()),
            presentation_callback_pending: AtomicBool::new(false),
            present_session_pending: AtomicBool::new(false),
            next_queue_trace_id: AtomicU64::new(0),
            processed_queue_trace_id: AtomicU64::new(0),
            next_present_trace_id: AtomicU64::new(0),
        }
    }

    /// Called after every completion is sent, on the display's thread. Typically posts a task
    /// that runs `process_completions` on the raster context.
    pub fn with_completion_waker<F>(mut self, waker: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.completion_waker = Some(Arc::new(waker));
        self
    }

    /// Ask to be told about the next completed present.
    ///
    /// # Panics
    ///
    /// If another baton is still outstanding.
    pub fn await_vsync(&self, baton: VsyncBaton) {
        if let Err(outstanding) = self.pending_present_baton.compare_exchange(
            NO_BATON,
            baton.get(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            log::error!("[present_pacer] await_vsync({baton}) while baton#{outstanding} pending");
            panic!(
                "only one await_vsync may be outstanding: baton#{outstanding} still pending, got {baton}"
            );
        }
    }

    /// Present as soon as the display allows.
    ///
    /// With a present already in flight this only records that another one is wanted. That
    /// lets the next frame's raster work overlap the current presentation while bounding the
    /// backlog to one.
    pub fn queue_present(&self) {
        let queue_trace_id = self.next_queue_trace_id.fetch_add(1, Ordering::AcqRel);
        log::trace!("[present_pacer] queue present #{queue_trace_id}");

        let _transition = self.present_transition.lock();
        if self.presentation_callback_pending.load(Ordering::Acquire) {
            self.present_session_pending.store(true, Ordering::Release);
        } else {
            self.present();
        }
    }

    /// Handle every completion the display has reported so far. Returns how many were handled.
    pub fn process_completions(&self) -> usize {
        let mut handled = 0;
        while let Ok((trace_id, info)) = self.completion_receiver.try_recv() {
            log::trace!("[present_pacer] present {trace_id:?} completed: {info:?}");
            self.on_present_complete(info);
            handled += 1;
        }
        handled
    }

    pub fn is_present_in_flight(&self) -> bool {
        self.presentation_callback_pending.load(Ordering::Acquire)
    }

    pub fn is_present_pending(&self) -> bool {
        self.present_session_pending.load(Ordering::Acquire)
    }

    pub fn has_outstanding_baton(&self) -> bool {
        self.pending_present_baton.load(Ordering::Acquire) != NO_BATON
    }

    pub fn presents_issued(&self) -> u64 {
        self.next_present_trace_id.load(Ordering::Acquire)
    }

    /// Queue requests folded into an issued present so far.
    pub fn queued_presents_processed(&self) -> u64 {
        self.processed_queue_trace_id.load(Ordering::Acquire)
    }

    fn present(&self) {
        let queued = self.next_queue_trace_id.load(Ordering::Acquire);
        self.processed_queue_trace_id
            .fetch_max(queued, Ordering::AcqRel);

        let trace_id = PresentTraceId(self.next_present_trace_id.fetch_add(1, Ordering::AcqRel));
        self.presentation_callback_pending
            .store(true, Ordering::Release);
        self.backend.present(
            trace_id,
            PresentCompletion {
                trace_id,
                sender: self.completion_sender.clone(),
                waker: self.completion_waker.clone(),
            },
        );
    }

    fn on_present_complete(&self, info: PresentationInfo) {
        {
            let _transition = self.present_transition.lock();
            self.presentation_callback_pending
                .store(false, Ordering::Release);
            if self.present_session_pending.swap(false, Ordering::AcqRel) {
                self.present();
            }
        }

        // The sink may park the next baton from inside on_vsync.
        let baton = self.pending_present_baton.swap(NO_BATON, Ordering::AcqRel);
        if let Some(baton) = VsyncBaton::new(baton) {
            let timing = snap_to_next_phase(
                info.presentation_time,
                info.presentation_interval,
                self.clock.now(),
            );
            self.vsync_sink.on_vsync(baton, timing);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct ManualDisplay {
        in_flight: Mutex<Vec<PresentCompletion>>,
        presents: AtomicUsize,
    }

    impl ManualDisplay {
        fn complete_oldest(&self, info: PresentationInfo) {
            let completion = {
                let mut in_flight = self.in_flight.lock();
                assert!(!in_flight.is_empty(), "no present in flight");
                in_flight.remove(0)
            };
            completion.complete(info);
        }

        fn in_flight(&self) -> usize {
            self.in_flight.lock().len()
        }
    }

    impl DisplayBackend for ManualDisplay {
        fn present(&self, _trace_id: PresentTraceId, completion: PresentCompletion) {
            self.presents.fetch_add(1, Ordering::Relaxed);
            self.in_flight.lock().push(completion);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(VsyncBaton, VsyncTiming)>>,
    }

    impl VsyncSink for RecordingSink {
        fn on_vsync(&self, baton: VsyncBaton, timing: VsyncTiming) {
            self.events.lock().push((baton, timing));
        }
    }

    struct Harness {
        display: Arc<ManualDisplay>,
        sink: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
        pacer: PresentationPacer,
    }

    fn harness() -> Harness {
        let display = Arc::new(ManualDisplay::default());
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new(140));
        let pacer = PresentationPacer::new(display.clone(), sink.clone(), clock.clone());
        Harness {
            display,
            sink,
            clock,
            pacer,
        }
    }

    fn baton(raw: u64) -> VsyncBaton {
        VsyncBaton::new(raw).expect("non-zero baton")
    }

    const INFO: PresentationInfo = PresentationInfo {
        presentation_time: 100,
        presentation_interval: 16,
    };

    #[test]
    fn second_present_waits_for_first_completion() {
        let h = harness();

        h.pacer.queue_present();
        h.pacer.queue_present();
        assert_eq!(h.display.in_flight(), 1);
        assert!(h.pacer.is_present_pending());

        h.display.complete_oldest(INFO);
        assert_eq!(h.display.in_flight(), 1, "completion not yet processed");
        assert_eq!(h.pacer.process_completions(), 1);
        assert_eq!(h.display.in_flight(), 1);
        assert_eq!(h.display.presents.load(Ordering::Relaxed), 2);
        assert!(!h.pacer.is_present_pending());

        h.display.complete_oldest(INFO);
        h.pacer.process_completions();
        assert_eq!(h.display.in_flight(), 0);
        assert!(!h.pacer.is_present_in_flight());
    }

    #[test]
    fn queued_presents_collapse_into_one() {
        let h = harness();

        h.pacer.queue_present();
        for _ in 0..4 {
            h.pacer.queue_present();
        }
        h.display.complete_oldest(INFO);
        h.pacer.process_completions();

        assert_eq!(h.pacer.presents_issued(), 2);
        assert_eq!(h.pacer.queued_presents_processed(), 5);
    }

    #[test]
    fn completion_delivers_baton_with_snapped_timing() {
        let h = harness();
        h.pacer.await_vsync(baton(7));
        h.pacer.queue_present();

        h.display.complete_oldest(INFO);
        h.pacer.process_completions();

        let events = h.sink.events.lock().clone();
        assert_eq!(
            events,
            vec![(
                baton(7),
                VsyncTiming {
                    previous_vsync: 132,
                    next_vsync: 148,
                }
            )]
        );
        assert!(!h.pacer.has_outstanding_baton());
    }

    #[test]
    fn completion_without_baton_fires_nothing() {
        let h = harness();
        h.pacer.queue_present();
        h.display.complete_oldest(INFO);
        h.pacer.process_completions();

        assert!(h.sink.events.lock().is_empty());
    }

    #[test]
    fn baton_is_fired_once() {
        let h = harness();
        h.pacer.await_vsync(baton(1));
        h.pacer.queue_present();
        h.pacer.queue_present();

        h.display.complete_oldest(INFO);
        h.pacer.process_completions();
        h.clock.advance(16);
        h.display.complete_oldest(INFO);
        h.pacer.process_completions();

        assert_eq!(h.sink.events.lock().len(), 1);
    }

    #[test]
    fn new_baton_is_accepted_after_completion() {
        let h = harness();
        h.pacer.await_vsync(baton(1));
        h.pacer.queue_present();
        h.display.complete_oldest(INFO);
        h.pacer.process_completions();

        h.pacer.await_vsync(baton(2));
        assert!(h.pacer.has_outstanding_baton());
    }

    #[test]
    #[should_panic(expected = "only one await_vsync may be outstanding")]
    fn second_outstanding_baton_is_rejected() {
        let h = harness();
        h.pacer.await_vsync(baton(1));
        h.pacer.await_vsync(baton(2));
    }

    #[test]
    fn rejected_baton_does_not_overwrite_the_first() {
        let h = harness();
        h.pacer.await_vsync(baton(1));
        let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            h.pacer.await_vsync(baton(2));
        }));
        assert!(second.is_err());

        h.pacer.queue_present();
        h.display.complete_oldest(INFO);
        h.pacer.process_completions();
        assert_eq!(h.sink.events.lock()[0].0, baton(1));
    }

    // Completes every present as soon as it is issued.
    struct ImmediateDisplay;

    impl DisplayBackend for ImmediateDisplay {
        fn present(&self, _trace_id: PresentTraceId, completion: PresentCompletion) {
            completion.complete(INFO);
        }
    }

    #[test]
    fn racing_queue_and_completion_never_strand_a_pending_present() {
        let pacer = Arc::new(PresentationPacer::new(
            Arc::new(ImmediateDisplay),
            Arc::new(RecordingSink::default()),
            Arc::new(ManualClock::new(140)),
        ));
        let done = Arc::new(AtomicBool::new(false));

        let completer = {
            let pacer = pacer.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    pacer.process_completions();
                }
            })
        };
        for _ in 0..20_000 {
            pacer.queue_present();
        }
        done.store(true, Ordering::Release);
        completer.join().expect("completion thread");

        while pacer.process_completions() > 0 {}
        assert!(!pacer.is_present_pending());
        assert!(!pacer.is_present_in_flight());
        assert_eq!(pacer.queued_presents_processed(), 20_000);
    }

    #[test]
    fn completion_waker_runs_on_the_completing_thread() {
        let display = Arc::new(ManualDisplay::default());
        let wakes = Arc::new(AtomicUsize::new(0));
        let wake_counter = wakes.clone();
        let pacer = PresentationPacer::new(
            display.clone(),
            Arc::new(RecordingSink::default()),
            Arc::new(ManualClock::new(0)),
        )
        .with_completion_waker(move || {
            wake_counter.fetch_add(1, Ordering::Relaxed);
        });

        pacer.queue_present();
        let completer = display.clone();
        std::thread::spawn(move || completer.complete_oldest(INFO))
            .join()
            .expect("completion thread");

        assert_eq!(wakes.load(Ordering::Relaxed), 1);
        assert_eq!(pacer.process_completions(), 1);
    }
}
