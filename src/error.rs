//! Error types shared by the capture layers.

use std::io;

use thiserror::Error;

use crate::encoder::EncodeError;

/// Failure reported by a single ioctl-style device call.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The call was interrupted before completing; retrying is safe.
    #[error("interrupted")]
    Interrupted,

    #[error("timed out waiting for a filled buffer")]
    Timeout,

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op} rejected: {reason}")]
    InvalidState { op: &'static str, reason: &'static str },
}

impl DeviceError {
    /// Wraps an OS error, folding `EINTR` into [`DeviceError::Interrupted`].
    pub fn io(op: &'static str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::Interrupted => Self::Interrupted,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io { op, source },
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Session-level failure. Nothing below this type escapes a capture session.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera busy")]
    Busy,

    #[error("camera access token already released")]
    Released,

    #[error("failed to query device format: {0}")]
    FormatQuery(#[source] DeviceError),

    #[error("format negotiation failed: {reason}")]
    Negotiation { reason: String },

    #[error("unable to allocate buffers: {reason}")]
    Resources { reason: String },

    #[error("device error during {stage}: {source}")]
    Protocol {
        stage: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("buffer {index} is {reason}")]
    BufferState { index: u32, reason: &'static str },

    #[error("encoder error: {0}")]
    Encoder(#[from] EncodeError),

    #[error("capture session ended without a frame")]
    NoFrame,
}

impl CaptureError {
    pub(crate) fn protocol(stage: &'static str, source: DeviceError) -> Self {
        Self::Protocol { stage, source }
    }

    pub(crate) fn resources(reason: impl Into<String>) -> Self {
        Self::Resources {
            reason: reason.into(),
        }
    }

    /// Short plain-text reason suitable for an HTTP error body.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Busy => "Camera busy",
            Self::Released => "Camera released",
            Self::FormatQuery(_) | Self::Negotiation { .. } => "Unsupported camera format",
            Self::Resources { .. } => "Unable to alloc buffers",
            Self::Protocol { .. } | Self::BufferState { .. } => "Camera error",
            Self::Encoder(EncodeError::NotSupported(_)) => "Format not supported by encoder",
            Self::Encoder(_) => "JPEG encode failed",
            Self::NoFrame => "No frame captured",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_eintr_maps_to_interrupted() {
        let err = DeviceError::io("VIDIOC_DQBUF", io::Error::from(io::ErrorKind::Interrupted));
        assert!(err.is_interrupted());

        let err = DeviceError::io("VIDIOC_DQBUF", io::Error::from(io::ErrorKind::WouldBlock));
        assert_matches!(err, DeviceError::Timeout);

        let err = DeviceError::io("VIDIOC_QBUF", io::Error::from(io::ErrorKind::InvalidInput));
        assert_matches!(err, DeviceError::Io { op: "VIDIOC_QBUF", .. });
    }

    #[test]
    fn test_reasons_are_short() {
        assert_eq!(CaptureError::Busy.reason(), "Camera busy");
        assert_eq!(
            CaptureError::resources("zero buffers granted").reason(),
            "Unable to alloc buffers"
        );
        assert_eq!(
            CaptureError::protocol("dequeue", DeviceError::Timeout).reason(),
            "Camera error"
        );
    }
}
