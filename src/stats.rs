//! Session, stream and detection statistics

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters kept by one capture session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Complete frames handed to the consumer
    pub frames: u64,

    /// Buffers returned without the done flag and re-queued unread
    pub incomplete: u64,

    /// Dequeues retried after an interrupt
    pub interrupted: u64,
}

/// Statistics for one MJPEG stream response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Frames encoded and written to the client
    pub frames_sent: u64,

    /// Frames dropped due to encoder errors
    pub frames_dropped: u64,

    /// Frames sent although the encode ran past its budget
    pub frames_slow: u64,

    /// Incomplete buffers skipped by the session
    pub incomplete_buffers: u64,

    /// Total JPEG payload bytes sent
    pub bytes_sent: u64,

    /// Wall time from stream-on to teardown
    pub duration_ms: u64,
}

impl StreamStats {
    /// Average frame rate over the whole stream
    pub fn fps(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        self.frames_sent as f64 * 1000.0 / self.duration_ms as f64
    }

    /// Average payload bitrate in kbps
    pub fn bitrate_kbps(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        // bits per millisecond == kbit per second
        self.bytes_sent as f64 * 8.0 / self.duration_ms as f64
    }

    /// Fraction of frames lost to encoder errors
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_sent + self.frames_dropped;
        if total == 0 {
            return 0.0;
        }
        self.frames_dropped as f64 / total as f64
    }
}

/// Live counters updated by the detection thread
#[derive(Debug, Default)]
pub struct DetectionCounters {
    running: AtomicBool,
    sessions: AtomicU64,
    frames: AtomicU64,
    faces: AtomicU64,
    busy: AtomicU64,
    errors: AtomicU64,
    /// Frames per second over the last logging window, stored as bits
    fps_bits: AtomicU64,
}

impl DetectionCounters {
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn record_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self, faces: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.faces.fetch_add(faces as u64, Ordering::Relaxed);
    }

    pub fn record_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DetectionStats {
        DetectionStats {
            running: self.is_running(),
            sessions: self.sessions.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            faces: self.faces.load(Ordering::Relaxed),
            busy_backoffs: self.busy.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            fps: f64::from_bits(self.fps_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time view of [`DetectionCounters`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub running: bool,

    /// Capture sessions opened by the detector
    pub sessions: u64,

    /// Frames run through the detector
    pub frames: u64,

    /// Faces reported across all frames
    pub faces: u64,

    /// Gate acquisitions that timed out and backed off
    pub busy_backoffs: u64,

    /// Sessions that ended with an error
    pub errors: u64,

    pub fps: f64,
}
