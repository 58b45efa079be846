//! Shared single-camera service: MJPEG streaming, still capture and
//! background face detection.
//!
//! All three consumers contend for one [`CameraGate`]. Whoever holds it runs
//! a [`CaptureSession`] that owns the mapped V4L2 buffers for its lifetime
//! and tears them down on every exit path.
//!
//! # Example
//!
//! ```no_run
//! use facecam::{Camera, CameraGate, CameraSettings, SimulatedDevice};
//!
//! let gate = CameraGate::new(Box::new(SimulatedDevice::default()));
//! let camera = Camera::new(gate, CameraSettings::default());
//! let jpeg = camera.capture_jpeg()?;
//! assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
//! # Ok::<(), facecam::CaptureError>(())
//! ```

pub mod camera;
pub mod config;
pub mod detect;
pub mod device;
pub mod encoder;
pub mod error;
pub mod format;
pub mod gate;
pub mod mjpeg;
pub mod pool;
pub mod session;
pub mod stats;
pub mod web;

// Re-exports for convenience
pub use camera::{Camera, CameraSettings};
pub use config::{Config, ConfigError};
pub use detect::{DetectionReport, DetectionSettings, DetectionTask, FaceDetector, SkinToneDetector};
pub use device::{CaptureDevice, SimConfig, SimulatedDevice};
pub use encoder::{EncodeError, EncoderContext};
pub use error::{CaptureError, DeviceError};
pub use format::{FormatRequest, PixelFormat, StreamFormat};
pub use gate::{CameraGate, GateToken};
pub use session::{CaptureSession, Flow, Frame};
pub use stats::{DetectionCounters, StreamStats};
