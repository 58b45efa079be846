//! JPEG capture and streaming on top of the shared camera.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::CameraConfig;
use crate::error::CaptureError;
use crate::format::{FormatRequest, StreamFormat};
use crate::gate::{CameraGate, GateToken};
use crate::session::{capture_single, CaptureSession, Flow};
use crate::stats::StreamStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    /// Desired resolution; `None` keeps the device default.
    pub resolution: Option<(u32, u32)>,
    pub stream_buffers: u32,
    pub capture_buffers: u32,
    pub lock_timeout: Duration,
    pub jpeg_quality: u8,
    pub encode_timeout: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self::from(&CameraConfig::default())
    }
}

impl From<&CameraConfig> for CameraSettings {
    fn from(config: &CameraConfig) -> Self {
        Self {
            resolution: config.resolution(),
            stream_buffers: config.stream_buffers,
            capture_buffers: config.capture_buffers,
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            jpeg_quality: config.jpeg_quality,
            encode_timeout: Duration::from_millis(config.encode_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub device: String,
    pub busy: bool,
    pub waiting: usize,
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Summary of the most recently finished MJPEG stream
    pub last_stream: Option<StreamStats>,
}

pub struct Camera {
    gate: Arc<CameraGate>,
    settings: CameraSettings,
    last_stream: Mutex<Option<StreamStats>>,
}

impl Camera {
    pub fn new(gate: Arc<CameraGate>, settings: CameraSettings) -> Self {
        Self {
            gate,
            settings,
            last_stream: Mutex::new(None),
        }
    }

    pub fn gate(&self) -> &Arc<CameraGate> {
        &self.gate
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    fn request(&self) -> FormatRequest {
        FormatRequest::streaming(self.settings.resolution)
    }

    /// Acquire the gate and make sure format and encoder are ready.
    fn acquire_ready(&self) -> Result<(GateToken, StreamFormat), CaptureError> {
        let mut token = self.gate.acquire(self.settings.lock_timeout)?;
        let state = token.state()?;
        let format = state.ensure_format(&self.request())?;
        state.ensure_encoder(self.settings.jpeg_quality, self.settings.encode_timeout)?;
        Ok((token, format))
    }

    /// Negotiate the streaming format and build the encoder ahead of the
    /// first request.
    pub fn prepare(&self) -> Result<StreamFormat, CaptureError> {
        let (_token, format) = self.acquire_ready()?;
        info!(device = self.gate.device_name(), format = %format, "Camera ready");
        Ok(format)
    }

    /// Capture and encode a single frame.
    pub fn capture_jpeg(&self) -> Result<Vec<u8>, CaptureError> {
        let (mut token, format) = self.acquire_ready()?;
        let (device, encoder) = token.state()?.device_and_encoder();
        let encoder = encoder.ok_or_else(|| CaptureError::Negotiation {
            reason: "encoder unavailable".to_string(),
        })?;

        let jpeg = capture_single(device, format, self.settings.capture_buffers, |frame| {
            encoder.encode(frame.data).map(<[u8]>::to_vec)
        })??;
        token.release();
        Ok(jpeg)
    }

    /// Stream encoded frames into `sink` until it returns [`Flow::Stop`] or
    /// the device fails.
    ///
    /// `started` runs once the session is streaming, before the first frame.
    /// Frames the encoder rejects are dropped and counted.
    pub fn stream_jpeg(
        &self,
        started: impl FnOnce(StreamFormat),
        mut sink: impl FnMut(&[u8]) -> Flow,
    ) -> Result<StreamStats, CaptureError> {
        let (mut token, format) = self.acquire_ready()?;
        let (device, encoder) = token.state()?.device_and_encoder();
        let encoder = encoder.ok_or_else(|| CaptureError::Negotiation {
            reason: "encoder unavailable".to_string(),
        })?;

        let mut session = CaptureSession::start(device, format, self.settings.stream_buffers, "stream")?;
        started(format);

        let started_at = Instant::now();
        let slow_before = encoder.slow_frames();
        let mut stats = StreamStats::default();
        let result = session.run(|frame| match encoder.encode(frame.data) {
            Ok(jpeg) => {
                stats.frames_sent += 1;
                stats.bytes_sent += jpeg.len() as u64;
                sink(jpeg)
            }
            Err(e) => {
                stats.frames_dropped += 1;
                warn!(sequence = frame.sequence, error = %e, "Dropping frame");
                Flow::Continue
            }
        });
        stats.incomplete_buffers = session.stats().incomplete;
        session.teardown();
        drop(session);
        stats.frames_slow = encoder.slow_frames() - slow_before;
        stats.duration_ms = started_at.elapsed().as_millis() as u64;
        *self.last_stream.lock() = Some(stats.clone());
        token.release();

        info!(
            frames_sent = stats.frames_sent,
            frames_dropped = stats.frames_dropped,
            frames_slow = stats.frames_slow,
            incomplete = stats.incomplete_buffers,
            "MJPEG stream ended: {:.1} fps, {:.0} kbps, {:.1}% dropped",
            stats.fps(),
            stats.bitrate_kbps(),
            stats.drop_rate() * 100.0
        );
        match result {
            Ok(_) => Ok(stats),
            Err(e) => {
                error!(error = %e, "MJPEG stream aborted by device error");
                Err(e)
            }
        }
    }

    pub fn status(&self) -> CameraStatus {
        let format = self.gate.current_format();
        CameraStatus {
            device: self.gate.device_name().to_string(),
            busy: self.gate.is_held(),
            waiting: self.gate.waiting(),
            format: format.map(|f| f.pixel_format.to_string()),
            width: format.map(|f| f.width),
            height: format.map(|f| f.height),
            last_stream: self.last_stream.lock().clone(),
        }
    }
}
