//! Face detection on RGB565 frames and report fan-out.

mod skin;
mod task;

pub use skin::SkinToneDetector;
pub use task::{DetectionSettings, DetectionTask};

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub score: f32,
}

/// Result of one processed frame, in the published JSON layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    /// Frame timestamp in microseconds.
    pub ts: u64,
    pub width: u32,
    pub height: u32,
    pub faces: Vec<Detection>,
}

impl DetectionReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Borrowed little-endian RGB565 frame.
#[derive(Debug, Clone, Copy)]
pub struct Rgb565Image<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
}

impl<'a> Rgb565Image<'a> {
    /// `None` if `data` is too short for the given size.
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Option<Self> {
        let needed = width as usize * height as usize * 2;
        (data.len() >= needed && needed > 0).then_some(Self {
            data,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// 8-bit RGB of the pixel at (`x`, `y`).
    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * 2;
        let value = u16::from_le_bytes([self.data[offset], self.data[offset + 1]]);
        let r = ((value >> 11) & 0x1f) as u8;
        let g = ((value >> 5) & 0x3f) as u8;
        let b = (value & 0x1f) as u8;
        [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
    }
}

/// Face detection model.
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &Rgb565Image<'_>) -> Vec<Detection>;
}

/// Consumer of detection reports, e.g. an MQTT publisher.
pub trait DetectionSink: Send {
    fn publish(&mut self, report: &DetectionReport);
}

/// Writes each report with faces to the debug log as JSON.
#[derive(Debug, Default)]
pub struct LogSink;

impl DetectionSink for LogSink {
    fn publish(&mut self, report: &DetectionReport) {
        if report.faces.is_empty() {
            return;
        }
        match report.to_json() {
            Ok(json) => debug!(target: "face_events", "{json}"),
            Err(e) => debug!(error = %e, "Failed to serialize detection report"),
        }
    }
}

pub type SharedReport = Arc<RwLock<Option<DetectionReport>>>;

/// Keeps the most recent report for the HTTP API.
#[derive(Debug, Clone, Default)]
pub struct LatestReportSink {
    latest: SharedReport,
}

impl LatestReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> SharedReport {
        Arc::clone(&self.latest)
    }
}

impl DetectionSink for LatestReportSink {
    fn publish(&mut self, report: &DetectionReport) {
        *self.latest.write() = Some(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_layout() {
        let report = DetectionReport {
            ts: 1_500_000,
            width: 320,
            height: 240,
            faces: vec![Detection {
                x: 10,
                y: 20,
                w: 30,
                h: 40,
                score: 0.5,
            }],
        };
        assert_eq!(
            report.to_json().unwrap(),
            r#"{"ts":1500000,"width":320,"height":240,"faces":[{"x":10,"y":20,"w":30,"h":40,"score":0.5}]}"#
        );
    }

    #[test]
    fn test_rgb565_image_bounds() {
        let data = [0x00, 0xF8, 0xE0, 0x07];
        assert!(Rgb565Image::new(&data, 2, 2).is_none());
        let image = Rgb565Image::new(&data, 2, 1).unwrap();
        assert_eq!(image.rgb(0, 0), [255, 0, 0]);
        assert_eq!(image.rgb(1, 0), [0, 255, 0]);
    }

    #[test]
    fn test_latest_sink_overwrites() {
        let mut sink = LatestReportSink::new();
        let shared = sink.shared();
        assert!(shared.read().is_none());
        for ts in [1, 2] {
            sink.publish(&DetectionReport {
                ts,
                width: 1,
                height: 1,
                faces: Vec::new(),
            });
        }
        assert_eq!(shared.read().as_ref().map(|r| r.ts), Some(2));
    }
}
