//! JPEG encoding of raw capture frames.

use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;
use tracing::warn;

use crate::format::{PixelFormat, StreamFormat};

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("pixel format {0} not supported by the encoder")]
    NotSupported(PixelFormat),

    #[error("frame size {width}x{height} is empty")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("frame holds {got} bytes, expected {expected}")]
    ShortBuffer { expected: usize, got: usize },

    #[error(transparent)]
    Jpeg(#[from] image::ImageError),
}

/// Raw layout the encoder consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderInput {
    Rgb565,
    Rgb888,
    Yuv422,
    Gray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaSubsampling {
    Yuv444,
    Yuv422,
    Gray,
}

impl EncoderInput {
    pub fn for_format(format: PixelFormat) -> Option<(Self, ChromaSubsampling)> {
        match format {
            PixelFormat::Rgb565 => Some((Self::Rgb565, ChromaSubsampling::Yuv422)),
            PixelFormat::Rgb24 => Some((Self::Rgb888, ChromaSubsampling::Yuv444)),
            PixelFormat::Yuv422p => Some((Self::Yuv422, ChromaSubsampling::Yuv422)),
            PixelFormat::Grey => Some((Self::Gray, ChromaSubsampling::Gray)),
            PixelFormat::Raw10 | PixelFormat::Jpeg | PixelFormat::Other(_) => None,
        }
    }
}

/// Encoder bound to one negotiated format.
///
/// The output buffer is allocated once and overwritten from the start on
/// every call, so a failed encode leaves nothing behind for the next one.
/// An encode that runs past the time budget still returns its payload; it
/// is logged and counted in [`EncoderContext::slow_frames`].
#[derive(Debug)]
pub struct EncoderContext {
    format: StreamFormat,
    input: EncoderInput,
    subsampling: ChromaSubsampling,
    quality: u8,
    timeout: Duration,
    slow_frames: u64,
    output: Vec<u8>,
    scratch: Vec<u8>,
}

impl EncoderContext {
    pub fn configure(format: StreamFormat, quality: u8, timeout: Duration) -> Result<Self, EncodeError> {
        let (input, subsampling) = EncoderInput::for_format(format.pixel_format)
            .ok_or(EncodeError::NotSupported(format.pixel_format))?;
        if !format.is_valid() {
            return Err(EncodeError::InvalidDimensions {
                width: format.width,
                height: format.height,
            });
        }

        let bpp = format.pixel_format.bits_per_pixel().unwrap_or(24) as usize;
        let worst_case = format.pixel_count() * bpp / 8;
        let scratch = match input {
            EncoderInput::Rgb565 | EncoderInput::Yuv422 => Vec::with_capacity(format.pixel_count() * 3),
            EncoderInput::Rgb888 | EncoderInput::Gray => Vec::new(),
        };

        Ok(Self {
            format,
            input,
            subsampling,
            quality: quality.clamp(1, 100),
            timeout,
            slow_frames: 0,
            output: Vec::with_capacity(worst_case),
            scratch,
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn input(&self) -> EncoderInput {
        self.input
    }

    pub fn subsampling(&self) -> ChromaSubsampling {
        self.subsampling
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn output_capacity(&self) -> usize {
        self.output.capacity()
    }

    /// Encodes that finished after the time budget since configuration.
    pub fn slow_frames(&self) -> u64 {
        self.slow_frames
    }

    /// Compress one frame. The returned slice is valid until the next call.
    pub fn encode(&mut self, src: &[u8]) -> Result<&[u8], EncodeError> {
        self.output.clear();
        let started = Instant::now();

        let expected = self.format.frame_len().unwrap_or(0);
        if src.len() < expected {
            return Err(EncodeError::ShortBuffer {
                expected,
                got: src.len(),
            });
        }
        let src = &src[..expected];
        let (w, h) = (self.format.width, self.format.height);

        let (pixels, color) = match self.input {
            EncoderInput::Rgb565 => {
                rgb565_to_rgb(src, &mut self.scratch);
                (self.scratch.as_slice(), ExtendedColorType::Rgb8)
            }
            EncoderInput::Yuv422 => {
                yuv422p_to_rgb(src, w as usize, h as usize, &mut self.scratch);
                (self.scratch.as_slice(), ExtendedColorType::Rgb8)
            }
            EncoderInput::Rgb888 => (src, ExtendedColorType::Rgb8),
            EncoderInput::Gray => (src, ExtendedColorType::L8),
        };

        let mut encoder = JpegEncoder::new_with_quality(&mut self.output, self.quality);
        encoder.encode(pixels, w, h, color)?;

        let elapsed = started.elapsed();
        if elapsed > self.timeout {
            self.slow_frames += 1;
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.timeout.as_millis() as u64,
                frames_slow = self.slow_frames,
                "JPEG encode over budget"
            );
        }
        Ok(&self.output)
    }
}

fn rgb565_to_rgb(src: &[u8], dst: &mut Vec<u8>) {
    dst.clear();
    for px in src.chunks_exact(2) {
        let value = u16::from_le_bytes([px[0], px[1]]);
        let r = ((value >> 11) & 0x1f) as u8;
        let g = ((value >> 5) & 0x3f) as u8;
        let b = (value & 0x1f) as u8;
        dst.extend_from_slice(&[(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]);
    }
}

/// Planar 4:2:2 (full-range BT.601) to packed RGB.
fn yuv422p_to_rgb(src: &[u8], width: usize, height: usize, dst: &mut Vec<u8>) {
    dst.clear();
    let cw = width.div_ceil(2);
    let (y_plane, chroma) = src.split_at(width * height);
    let (u_plane, v_plane) = chroma.split_at(cw * height);

    for row in 0..height {
        for col in 0..width {
            let y = y_plane[row * width + col] as f32;
            let c = row * cw + col / 2;
            let u = u_plane[c] as f32 - 128.0;
            let v = v_plane[c] as f32 - 128.0;
            let r = y + 1.402 * v;
            let g = y - 0.344_136 * u - 0.714_136 * v;
            let b = y + 1.772 * u;
            dst.extend_from_slice(&[
                r.clamp(0.0, 255.0) as u8,
                g.clamp(0.0, 255.0) as u8,
                b.clamp(0.0, 255.0) as u8,
            ]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    const BUDGET: Duration = Duration::from_secs(5);

    fn solid_frame(format: &StreamFormat, byte: u8) -> Vec<u8> {
        vec![byte; format.frame_len().unwrap()]
    }

    #[test]
    fn test_solid_rgb565_compresses() {
        let format = StreamFormat::new(640, 480, PixelFormat::Rgb565);
        let mut ctx = EncoderContext::configure(format, 75, BUDGET).unwrap();
        assert_eq!(ctx.output_capacity(), 640 * 480 * 2);

        let frame: Vec<u8> = std::iter::repeat(0xF800u16.to_le_bytes())
            .take(640 * 480)
            .flatten()
            .collect();
        let jpeg = ctx.encode(&frame).unwrap();
        assert!(!jpeg.is_empty());
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(jpeg.len() < frame.len());
    }

    #[rstest]
    #[case(PixelFormat::Rgb565, EncoderInput::Rgb565, ChromaSubsampling::Yuv422)]
    #[case(PixelFormat::Rgb24, EncoderInput::Rgb888, ChromaSubsampling::Yuv444)]
    #[case(PixelFormat::Yuv422p, EncoderInput::Yuv422, ChromaSubsampling::Yuv422)]
    #[case(PixelFormat::Grey, EncoderInput::Gray, ChromaSubsampling::Gray)]
    fn test_supported_formats_encode(
        #[case] pixel_format: PixelFormat,
        #[case] input: EncoderInput,
        #[case] subsampling: ChromaSubsampling,
    ) {
        let format = StreamFormat::new(63, 17, pixel_format);
        let mut ctx = EncoderContext::configure(format, 75, BUDGET).unwrap();
        assert_eq!(ctx.input(), input);
        assert_eq!(ctx.subsampling(), subsampling);

        let jpeg = ctx.encode(&solid_frame(&format, 0x80)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[rstest]
    #[case(PixelFormat::Raw10)]
    #[case(PixelFormat::Jpeg)]
    #[case(PixelFormat::Other(*b"NV12"))]
    fn test_unsupported_formats_rejected(#[case] pixel_format: PixelFormat) {
        let format = StreamFormat::new(640, 480, pixel_format);
        assert_matches!(
            EncoderContext::configure(format, 75, BUDGET),
            Err(EncodeError::NotSupported(f)) if f == pixel_format
        );
    }

    #[test]
    fn test_short_buffer_does_not_poison_next_call() {
        let format = StreamFormat::new(32, 32, PixelFormat::Grey);
        let mut ctx = EncoderContext::configure(format, 90, BUDGET).unwrap();
        assert_matches!(
            ctx.encode(&[0u8; 10]),
            Err(EncodeError::ShortBuffer { expected: 1024, got: 10 })
        );
        let first = ctx.encode(&solid_frame(&format, 200)).unwrap().to_vec();
        let second = ctx.encode(&solid_frame(&format, 200)).unwrap();
        assert_eq!(first.as_slice(), second);
    }

    #[test]
    fn test_empty_frame_size_rejected() {
        let format = StreamFormat::new(0, 480, PixelFormat::Rgb565);
        assert_matches!(
            EncoderContext::configure(format, 75, BUDGET),
            Err(EncodeError::InvalidDimensions { width: 0, .. })
        );
    }

    #[test]
    fn test_over_budget_encode_keeps_payload() {
        let format = StreamFormat::new(320, 240, PixelFormat::Rgb565);
        let mut ctx = EncoderContext::configure(format, 75, Duration::from_nanos(1)).unwrap();
        let noise: Vec<u8> = (0..format.frame_len().unwrap())
            .map(|i| (i * 7919 % 251) as u8)
            .collect();

        let jpeg = ctx.encode(&noise).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(ctx.slow_frames(), 1);

        assert!(!ctx.encode(&noise).unwrap().is_empty());
        assert_eq!(ctx.slow_frames(), 2);
    }

    #[test]
    fn test_within_budget_not_counted_slow() {
        let format = StreamFormat::new(16, 16, PixelFormat::Grey);
        let mut ctx = EncoderContext::configure(format, 75, BUDGET).unwrap();
        ctx.encode(&solid_frame(&format, 0)).unwrap();
        assert_eq!(ctx.slow_frames(), 0);
    }

    #[test]
    fn test_rgb565_expansion() {
        let mut out = Vec::new();
        rgb565_to_rgb(&[0xFF, 0xFF, 0x00, 0xF8], &mut out);
        assert_eq!(out, vec![255, 255, 255, 255, 0, 0]);
    }

    #[test]
    fn test_yuv_grey_maps_to_grey() {
        let mut out = Vec::new();
        // 2x1: Y=[100,100], U=[128], V=[128]
        yuv422p_to_rgb(&[100, 100, 128, 128], 2, 1, &mut out);
        assert_eq!(out, vec![100; 6]);
    }
}
