//! Pixel formats and format negotiation with the capture device.

use std::fmt;

use tracing::{debug, info, warn};

use crate::device::CaptureDevice;
use crate::error::CaptureError;

/// Pixel layout delivered by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Native 10-bit Bayer from the sensor, before the ISP.
    Raw10,
    /// 16-bit little-endian RGB 5:6:5 (`RGBP`).
    Rgb565,
    /// 24-bit packed RGB (`RGB3`).
    Rgb24,
    /// Planar YUV 4:2:2 (`422P`).
    Yuv422p,
    /// 8-bit luma only (`GREY`).
    Grey,
    /// Compressed frames passed straight through (`JPEG`/`MJPG`).
    Jpeg,
    /// Anything else the driver reports.
    Other([u8; 4]),
}

impl PixelFormat {
    pub fn from_fourcc(code: [u8; 4]) -> Self {
        match &code {
            b"BG10" | b"GB10" | b"BA10" | b"RG10" => Self::Raw10,
            b"RGBP" => Self::Rgb565,
            b"RGB3" => Self::Rgb24,
            b"422P" => Self::Yuv422p,
            b"GREY" => Self::Grey,
            b"JPEG" | b"MJPG" => Self::Jpeg,
            _ => Self::Other(code),
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Raw10 => *b"BG10",
            Self::Rgb565 => *b"RGBP",
            Self::Rgb24 => *b"RGB3",
            Self::Yuv422p => *b"422P",
            Self::Grey => *b"GREY",
            Self::Jpeg => *b"JPEG",
            Self::Other(code) => code,
        }
    }

    /// Bits per pixel for uncompressed layouts.
    pub fn bits_per_pixel(self) -> Option<u32> {
        match self {
            Self::Raw10 | Self::Rgb565 | Self::Yuv422p => Some(16),
            Self::Rgb24 => Some(24),
            Self::Grey => Some(8),
            Self::Jpeg | Self::Other(_) => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// Negotiated resolution and pixel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl StreamFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_valid(&self) -> bool {
        self.pixel_count() > 0
    }

    /// Bytes in one uncompressed frame, if the layout has a fixed size.
    pub fn frame_len(&self) -> Option<usize> {
        let w = self.width as usize;
        let h = self.height as usize;
        match self.pixel_format {
            // chroma planes are half width, rounded up
            PixelFormat::Yuv422p => Some(w * h + 2 * w.div_ceil(2) * h),
            other => other
                .bits_per_pixel()
                .map(|bpp| w * h * bpp as usize / 8),
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)
    }
}

/// What a session needs from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRequest {
    /// Desired resolution; `None` keeps the device's.
    pub resolution: Option<(u32, u32)>,
    /// Candidate formats in order of preference.
    pub preferences: Vec<PixelFormat>,
    /// Fail instead of falling back to the device's current format.
    pub strict: bool,
}

impl FormatRequest {
    /// ISP output for the JPEG path: RGB565, then YUV422P, else whatever the device has.
    pub fn streaming(resolution: Option<(u32, u32)>) -> Self {
        Self {
            resolution,
            preferences: vec![PixelFormat::Rgb565, PixelFormat::Yuv422p],
            strict: false,
        }
    }

    /// The detector only consumes RGB565.
    pub fn detection(resolution: Option<(u32, u32)>) -> Self {
        Self {
            resolution,
            preferences: vec![PixelFormat::Rgb565],
            strict: true,
        }
    }

    fn resolution_matches(&self, format: &StreamFormat) -> bool {
        self.resolution
            .map_or(true, |(w, h)| format.width == w && format.height == h)
    }

    /// Whether an already negotiated format can be reused without touching the device.
    pub fn satisfied_by(&self, format: &StreamFormat) -> bool {
        format.is_valid()
            && self.resolution_matches(format)
            && self.preferences.contains(&format.pixel_format)
    }
}

/// Select a working format on `device`.
///
/// Reads the current format first; if that fails the session cannot start.
/// Each preference is then tried via set-format and the first one the driver
/// actually applies wins. When none applies, a non-strict request keeps the
/// format the device already reports.
pub fn negotiate(
    device: &mut dyn CaptureDevice,
    request: &FormatRequest,
) -> Result<StreamFormat, CaptureError> {
    let current = device.get_format().map_err(CaptureError::FormatQuery)?;
    debug!(current = %current, "Device format");

    if request.preferences.first() == Some(&current.pixel_format)
        && request.resolution_matches(&current)
        && current.is_valid()
    {
        return Ok(current);
    }

    let (width, height) = request
        .resolution
        .unwrap_or((current.width, current.height));

    for &pixel_format in &request.preferences {
        let candidate = StreamFormat::new(width, height, pixel_format);
        match device.set_format(&candidate) {
            Ok(applied) if applied.pixel_format == pixel_format && applied.is_valid() => {
                info!(format = %applied, "Switched camera stream format");
                return Ok(applied);
            }
            Ok(applied) => {
                debug!(requested = %candidate, applied = %applied, "Driver substituted format");
            }
            Err(e) => {
                debug!(requested = %candidate, error = %e, "Set format refused");
            }
        }
    }

    if request.strict {
        return Err(CaptureError::Negotiation {
            reason: format!(
                "device refused {:?} (currently {})",
                request.preferences, current
            ),
        });
    }

    // Re-read: a refused set-format may still have disturbed the driver state.
    let fallback = device.get_format().map_err(CaptureError::FormatQuery)?;
    if !fallback.is_valid() {
        return Err(CaptureError::Negotiation {
            reason: format!("device reports empty frame size ({fallback})"),
        });
    }
    warn!(format = %fallback, "No preferred format accepted, keeping device format");
    Ok(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimConfig, SimulatedDevice};
    use assert_matches::assert_matches;

    fn device(initial: PixelFormat) -> SimulatedDevice {
        SimulatedDevice::new(SimConfig {
            initial_format: StreamFormat::new(1920, 1080, initial),
            ..SimConfig::default()
        })
    }

    #[test]
    fn test_fourcc_round_trip_for_known_codes() {
        for code in [*b"RGBP", *b"RGB3", *b"422P", *b"GREY", *b"JPEG", *b"BG10"] {
            assert_eq!(PixelFormat::from_fourcc(code).fourcc(), code);
        }
        assert_eq!(PixelFormat::from_fourcc(*b"MJPG"), PixelFormat::Jpeg);
        assert_eq!(
            PixelFormat::from_fourcc(*b"NV12"),
            PixelFormat::Other(*b"NV12")
        );
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(
            StreamFormat::new(640, 480, PixelFormat::Rgb565).frame_len(),
            Some(640 * 480 * 2)
        );
        assert_eq!(
            StreamFormat::new(3, 2, PixelFormat::Yuv422p).frame_len(),
            Some(6 + 2 * 2 * 2)
        );
        assert_eq!(StreamFormat::new(640, 480, PixelFormat::Jpeg).frame_len(), None);
    }

    #[test]
    fn test_switches_raw_sensor_to_rgb565_at_requested_size() {
        let mut dev = device(PixelFormat::Raw10);
        let fmt = negotiate(&mut dev, &FormatRequest::streaming(Some((640, 480)))).unwrap();
        assert_eq!(fmt, StreamFormat::new(640, 480, PixelFormat::Rgb565));
    }

    #[test]
    fn test_falls_back_to_yuv_when_rgb_refused() {
        let mut dev = device(PixelFormat::Raw10);
        dev.handle().inject(|f| f.rejected_formats = vec![PixelFormat::Rgb565]);
        let fmt = negotiate(&mut dev, &FormatRequest::streaming(None)).unwrap();
        assert_eq!(fmt.pixel_format, PixelFormat::Yuv422p);
        assert_eq!((fmt.width, fmt.height), (1920, 1080));
    }

    #[test]
    fn test_keeps_device_format_when_everything_refused() {
        let mut dev = device(PixelFormat::Raw10);
        dev.handle().inject(|f| {
            f.rejected_formats = vec![PixelFormat::Rgb565, PixelFormat::Yuv422p]
        });
        let fmt = negotiate(&mut dev, &FormatRequest::streaming(None)).unwrap();
        assert_eq!(fmt.pixel_format, PixelFormat::Raw10);
    }

    #[test]
    fn test_strict_request_fails_when_refused() {
        let mut dev = device(PixelFormat::Raw10);
        dev.handle().inject(|f| f.rejected_formats = vec![PixelFormat::Rgb565]);
        let err = negotiate(&mut dev, &FormatRequest::detection(None)).unwrap_err();
        assert_matches!(err, CaptureError::Negotiation { .. });
    }

    #[test]
    fn test_query_failure_aborts() {
        let mut dev = device(PixelFormat::Rgb565);
        dev.handle().inject(|f| f.fail_get_format = true);
        let err = negotiate(&mut dev, &FormatRequest::streaming(None)).unwrap_err();
        assert_matches!(err, CaptureError::FormatQuery(_));
    }

    #[test]
    fn test_no_set_format_when_already_preferred() {
        let mut dev = device(PixelFormat::Rgb565);
        let handle = dev.handle();
        let fmt = negotiate(&mut dev, &FormatRequest::streaming(None)).unwrap();
        assert_eq!(fmt.pixel_format, PixelFormat::Rgb565);
        assert_eq!(handle.counters().set_format_calls, 0);
    }

    #[test]
    fn test_satisfied_by() {
        let req = FormatRequest::streaming(Some((640, 480)));
        assert!(req.satisfied_by(&StreamFormat::new(640, 480, PixelFormat::Yuv422p)));
        assert!(!req.satisfied_by(&StreamFormat::new(320, 240, PixelFormat::Rgb565)));
        assert!(!req.satisfied_by(&StreamFormat::new(640, 480, PixelFormat::Raw10)));

        let det = FormatRequest::detection(None);
        assert!(!det.satisfied_by(&StreamFormat::new(640, 480, PixelFormat::Yuv422p)));
        assert!(!det.satisfied_by(&StreamFormat::new(0, 480, PixelFormat::Rgb565)));
    }
}
