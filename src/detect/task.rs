//! Background detection thread sharing the camera through the gate.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tracing::{debug, error, info, warn};

use super::{DetectionReport, DetectionSink, FaceDetector, Rgb565Image};
use crate::config::DetectionConfig;
use crate::error::CaptureError;
use crate::format::FormatRequest;
use crate::gate::{CameraGate, GateToken};
use crate::session::{CaptureSession, Frame};
use crate::stats::DetectionCounters;

/// Monotonic origin for frames the driver did not timestamp.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

const PAUSE_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub resolution: Option<(u32, u32)>,
    pub buffer_count: u32,
    pub min_interval: Duration,
    pub backoff: Duration,
    pub acquire_timeout: Duration,
    pub frames_per_session: u32,
    pub stop_timeout: Duration,
    pub score_threshold: f32,
}

impl DetectionSettings {
    pub fn new(config: &DetectionConfig, resolution: Option<(u32, u32)>) -> Self {
        Self {
            resolution,
            buffer_count: config.buffer_count,
            min_interval: Duration::from_millis(config.min_interval_ms),
            backoff: Duration::from_millis(config.backoff_ms),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            frames_per_session: config.frames_per_session,
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            score_threshold: config.score_threshold,
        }
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self::new(&DetectionConfig::default(), None)
    }
}

/// Why a detection session gave the camera back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    /// Someone is waiting on the gate.
    Yield,
    /// Per-session frame budget used up.
    Budget,
}

/// Handle to the running detection thread.
pub struct DetectionTask {
    stop: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
    counters: Arc<DetectionCounters>,
    stop_timeout: Duration,
}

impl DetectionTask {
    /// Spawn the detection thread.
    pub fn start(
        gate: Arc<CameraGate>,
        settings: DetectionSettings,
        detector: Box<dyn FaceDetector>,
        sinks: Vec<Box<dyn DetectionSink>>,
        counters: Arc<DetectionCounters>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel();
        let stop_timeout = settings.stop_timeout;
        Lazy::force(&EPOCH);

        let mut worker = Worker {
            gate,
            settings,
            detector,
            sinks,
            counters: Arc::clone(&counters),
            stop: Arc::clone(&stop),
            window: FpsWindow::new(),
        };

        counters.set_running(true);
        let thread = thread::Builder::new()
            .name("face_detect".to_string())
            .spawn(move || {
                info!("Face detection task started");
                worker.run();
                worker.counters.set_running(false);
                info!("Face detection task stopped");
                // receiver may already be gone
                let _ = done_tx.send(());
            });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                counters.set_running(false);
                return Err(e);
            }
        };

        Ok(Self {
            stop,
            done,
            thread: Some(thread),
            counters,
            stop_timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn counters(&self) -> &Arc<DetectionCounters> {
        &self.counters
    }

    /// Signal the thread and wait up to `timeout` for it to release the camera.
    ///
    /// Returns `true` once the thread has confirmed it stopped. Calling this
    /// again after that is a no-op.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        self.stop.store(true, Ordering::Release);

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    error!("Face detection thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Face detection task did not stop in time");
                self.thread = Some(thread);
                false
            }
        }
    }
}

impl Drop for DetectionTask {
    fn drop(&mut self) {
        self.stop(self.stop_timeout);
    }
}

/// Frames and face-bearing frames over the current one-second window.
struct FpsWindow {
    started: Instant,
    frames: u32,
    with_faces: u32,
}

impl FpsWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            with_faces: 0,
        }
    }

    /// Count a frame; returns (fps, frames with faces) when a window closes.
    fn tick(&mut self, faces: usize) -> Option<(f64, u32)> {
        self.frames += 1;
        if faces > 0 {
            self.with_faces += 1;
        }
        let elapsed = self.started.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let fps = self.frames as f64 / elapsed.as_secs_f64();
        let summary = (fps, self.with_faces);
        *self = Self::new();
        Some(summary)
    }
}

struct Worker {
    gate: Arc<CameraGate>,
    settings: DetectionSettings,
    detector: Box<dyn FaceDetector>,
    sinks: Vec<Box<dyn DetectionSink>>,
    counters: Arc<DetectionCounters>,
    stop: Arc<AtomicBool>,
    window: FpsWindow,
}

impl Worker {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleep for `duration` in short slices so a stop request is noticed.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }

    fn run(&mut self) {
        while !self.stopping() {
            let mut token = match self.gate.acquire(self.settings.acquire_timeout) {
                Ok(token) => token,
                Err(_) => {
                    self.counters.record_busy();
                    debug!("Camera busy, detection backing off");
                    self.pause(self.settings.backoff);
                    continue;
                }
            };

            let outcome = self.session(&mut token);
            token.release();

            match outcome {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Budget) => {}
                Ok(SessionEnd::Yield) => self.let_waiters_in(),
                Err(e) => {
                    self.counters.record_error();
                    error!(error = %e, "Detection session failed");
                    self.pause(self.settings.backoff);
                }
            }
        }
    }

    /// Stay off the gate until the contenders that made us yield got it.
    fn let_waiters_in(&self) {
        let deadline = Instant::now() + self.settings.backoff;
        while self.gate.has_waiters() && !self.stopping() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn session(&mut self, token: &mut GateToken) -> Result<SessionEnd, CaptureError> {
        let state = token.state()?;
        let format = state.ensure_format(&FormatRequest::detection(self.settings.resolution))?;
        let mut session =
            CaptureSession::start(state.device(), format, self.settings.buffer_count, "detect")?;
        self.counters.record_session();

        let mut processed = 0u32;
        let mut next_due = Instant::now();
        loop {
            session.next_frame(|frame| self.process(&frame))?;
            processed += 1;

            if let Some(end) = self.interrupted(processed) {
                return Ok(end);
            }
            if processed >= self.settings.frames_per_session {
                return Ok(SessionEnd::Budget);
            }

            if !self.settings.min_interval.is_zero() {
                next_due += self.settings.min_interval;
                let now = Instant::now();
                if next_due > now {
                    self.pause(next_due - now);
                    if let Some(end) = self.interrupted(processed) {
                        return Ok(end);
                    }
                } else {
                    next_due = now;
                }
            }
        }
    }

    /// A stop request or a waiting contender ends the session early.
    fn interrupted(&self, processed: u32) -> Option<SessionEnd> {
        if self.stopping() {
            return Some(SessionEnd::Stopped);
        }
        if self.gate.has_waiters() {
            debug!(processed, "Yielding camera to waiting request");
            return Some(SessionEnd::Yield);
        }
        None
    }

    fn process(&mut self, frame: &Frame<'_>) {
        let (width, height) = (frame.format.width, frame.format.height);
        let Some(image) = Rgb565Image::new(frame.data, width, height) else {
            warn!(len = frame.data.len(), width, height, "Short detection frame, skipping");
            return;
        };

        let threshold = self.settings.score_threshold;
        let faces: Vec<_> = self
            .detector
            .detect(&image)
            .into_iter()
            .filter(|face| face.score >= threshold)
            .collect();

        let ts = if frame.timestamp.is_zero() {
            EPOCH.elapsed()
        } else {
            frame.timestamp
        };
        let report = DetectionReport {
            ts: ts.as_micros() as u64,
            width,
            height,
            faces,
        };
        for sink in &mut self.sinks {
            sink.publish(&report);
        }

        self.counters.record_frame(report.faces.len());
        if let Some((fps, with_faces)) = self.window.tick(report.faces.len()) {
            self.counters.set_fps(fps);
            info!("Face detection FPS: {:.1}, faces detected: {}", fps, with_faces);
        }
    }
}
