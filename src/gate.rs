//! Exclusive access to the camera.
//!
//! The gate owns the device along with the negotiated format and the encoder
//! context. Acquiring it moves that state into a [`GateToken`]; releasing the
//! token (explicitly or by dropping it) moves it back and wakes one waiter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use crate::device::CaptureDevice;
use crate::encoder::EncoderContext;
use crate::error::CaptureError;
use crate::format::{negotiate, FormatRequest, StreamFormat};

/// Everything that may only be touched while holding the gate.
pub struct CameraState {
    device: Box<dyn CaptureDevice>,
    format: Option<StreamFormat>,
    encoder: Option<EncoderContext>,
    published: Arc<RwLock<Option<StreamFormat>>>,
}

impl std::fmt::Debug for CameraState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraState")
            .field("device", &self.device.name())
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl CameraState {
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    pub fn device(&mut self) -> &mut dyn CaptureDevice {
        self.device.as_mut()
    }

    /// Reuse the negotiated format if it satisfies `request`, otherwise
    /// negotiate again. A format change discards the encoder context.
    pub fn ensure_format(&mut self, request: &FormatRequest) -> Result<StreamFormat, CaptureError> {
        if let Some(format) = self.format.filter(|f| request.satisfied_by(f)) {
            return Ok(format);
        }

        let format = negotiate(self.device.as_mut(), request)?;
        if self.format != Some(format) {
            if self.encoder.take().is_some() {
                debug!(format = %format, "Format changed, dropping encoder context");
            }
            info!(format = %format, "Negotiated camera format");
        }
        self.format = Some(format);
        *self.published.write() = Some(format);
        Ok(format)
    }

    /// Build the encoder for the current format unless one already matches.
    pub fn ensure_encoder(&mut self, quality: u8, timeout: Duration) -> Result<(), CaptureError> {
        let format = self.format.ok_or_else(|| CaptureError::Negotiation {
            reason: "no format negotiated".to_string(),
        })?;
        let reusable = self
            .encoder
            .as_ref()
            .is_some_and(|enc| enc.format() == format && enc.quality() == quality.clamp(1, 100));
        if !reusable {
            self.encoder = None;
            self.encoder = Some(EncoderContext::configure(format, quality, timeout)?);
            debug!(format = %format, quality, "Encoder configured");
        }
        Ok(())
    }

    /// Split borrow of the device and the encoder for a capture session.
    pub fn device_and_encoder(&mut self) -> (&mut dyn CaptureDevice, Option<&mut EncoderContext>) {
        (self.device.as_mut(), self.encoder.as_mut())
    }
}

pub struct CameraGate {
    slot: Mutex<Option<CameraState>>,
    available: Condvar,
    waiting: AtomicUsize,
    format: Arc<RwLock<Option<StreamFormat>>>,
    device_name: String,
}

impl CameraGate {
    pub fn new(device: Box<dyn CaptureDevice>) -> Arc<Self> {
        let format = Arc::new(RwLock::new(None));
        let device_name = device.name().to_string();
        let state = CameraState {
            device,
            format: None,
            encoder: None,
            published: Arc::clone(&format),
        };
        Arc::new(Self {
            slot: Mutex::new(Some(state)),
            available: Condvar::new(),
            waiting: AtomicUsize::new(0),
            format,
            device_name,
        })
    }

    /// Wait up to `timeout` for exclusive access.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<GateToken, CaptureError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        if slot.is_none() {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            while slot.is_none() {
                if self.available.wait_until(&mut slot, deadline).timed_out() {
                    break;
                }
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }

        match slot.take() {
            Some(state) => Ok(GateToken {
                gate: Arc::clone(self),
                state: Some(state),
            }),
            None => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Camera gate acquire timed out");
                Err(CaptureError::Busy)
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Number of callers currently blocked in [`CameraGate::acquire`].
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn has_waiters(&self) -> bool {
        self.waiting() > 0
    }

    /// Last negotiated format, readable without holding the gate.
    pub fn current_format(&self) -> Option<StreamFormat> {
        *self.format.read()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn put_back(&self, state: CameraState) {
        *self.slot.lock() = Some(state);
        self.available.notify_one();
    }
}

/// Proof of exclusive access. Dropping it releases the gate.
pub struct GateToken {
    gate: Arc<CameraGate>,
    state: Option<CameraState>,
}

impl std::fmt::Debug for GateToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateToken")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl GateToken {
    pub fn state(&mut self) -> Result<&mut CameraState, CaptureError> {
        self.state.as_mut().ok_or(CaptureError::Released)
    }

    pub fn is_released(&self) -> bool {
        self.state.is_none()
    }

    /// Give the camera back. Further calls are no-ops.
    pub fn release(&mut self) {
        if let Some(state) = self.state.take() {
            self.gate.put_back(state);
        }
    }
}

impl Drop for GateToken {
    fn drop(&mut self) {
        self.release();
    }
}
