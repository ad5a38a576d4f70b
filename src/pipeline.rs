//! Capture and detection loops feeding the shared latest-frame slot.
//!
//! The capture loop and the detection loop run on dedicated threads because
//! both V4L2 reads and tract inference are blocking. They are decoupled by a
//! single-slot queue: when detection falls behind, newly captured frames are
//! dropped instead of queueing up, so the published frame never lags far
//! behind the camera.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbImage;
use tokio::sync::watch;

use crate::{nn::Detector, render::draw_detections, sensors::CaptureFn};

/// Reader half of the shared latest-frame slot.
///
/// Publishing replaces the whole `Arc`, so readers always observe a complete
/// frame, and `changed()` lets stream encoders suspend until a new frame
/// arrives instead of polling.
pub type FrameReceiver = watch::Receiver<Option<Arc<RgbImage>>>;

type FrameSender = watch::Sender<Option<Arc<RgbImage>>>;

/// Pause between capture attempts to cap CPU usage.
const CAPTURE_PAUSE: Duration = Duration::from_millis(10);

/// How long the detection loop waits for a frame before re-checking the
/// running flag.
const QUEUE_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Create the bounded single-slot frame queue between capture and detection.
pub fn frame_queue() -> (Sender<RgbImage>, Receiver<RgbImage>) {
    bounded(1)
}

/// Non-blocking enqueue into the single-slot queue.
///
/// The frame is dropped silently when the slot is already taken; the capture
/// loop must never block on a slow consumer.
pub fn offer_frame(queue: &Sender<RgbImage>, frame: RgbImage) {
    if let Err(TrySendError::Full(_)) = queue.try_send(frame) {
        log::trace!("Detection busy, dropping frame");
    }
}

/// Handle to the running live pipeline.
pub struct Pipeline {
    frames: FrameReceiver,
    capture: JoinHandle<()>,
    detect: JoinHandle<()>,
}

impl Pipeline {
    /// Subscribe to the latest annotated (or raw) frame.
    pub fn frames(&self) -> FrameReceiver {
        self.frames.clone()
    }

    /// Wait for both worker threads to finish. Only meaningful after the
    /// running flag has been cleared.
    pub fn join(self) {
        self.capture.join().ok();
        self.detect.join().ok();
    }
}

/// Spawn the capture and detection threads.
///
/// Both loops run until `running` is cleared. The detector is invoked on
/// every `detect_every`-th frame only; the frames in between pass through
/// unannotated so the stream keeps the full camera rate.
pub fn start(
    capture_fn: CaptureFn,
    detector: Arc<dyn Detector>,
    detect_every: u64,
    running: Arc<AtomicBool>,
) -> Pipeline {
    let (queue_tx, queue_rx) = frame_queue();
    let (slot_tx, slot_rx) = watch::channel(None);

    let running_ = Arc::clone(&running);
    let capture = thread::spawn(move || capture_loop(capture_fn, queue_tx, running_));

    let detect =
        thread::spawn(move || detection_loop(queue_rx, slot_tx, detector, detect_every, running));

    Pipeline {
        frames: slot_rx,
        capture,
        detect,
    }
}

fn capture_loop(capture_fn: CaptureFn, queue: Sender<RgbImage>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match capture_fn() {
            // Read failures are retried on the next iteration
            None => {}
            Some(frame) => offer_frame(&queue, frame),
        }
        thread::sleep(CAPTURE_PAUSE);
    }

    // Dropping the capture closure releases the device
    log::info!("Camera released");
}

fn detection_loop(
    queue: Receiver<RgbImage>,
    slot: FrameSender,
    detector: Arc<dyn Detector>,
    detect_every: u64,
    running: Arc<AtomicBool>,
) {
    // A zero interval would divide by zero below; treat it as "every frame"
    let detect_every = detect_every.max(1);
    let mut counter: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let frame = match queue.recv_timeout(QUEUE_RECV_TIMEOUT) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let published = if counter % detect_every == 0 {
            match detector.detect(&frame) {
                Ok(detections) => draw_detections(frame, &detections),
                Err(err) => {
                    // An inference failure ends the loop; the stream keeps
                    // serving the last published frame.
                    log::error!("Inference failed: {err:#}");
                    break;
                }
            }
        } else {
            frame
        };

        slot.send_replace(Some(Arc::new(published)));
        counter += 1;
    }
}
