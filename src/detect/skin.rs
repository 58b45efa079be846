use super::{Detection, FaceDetector, Rgb565Image};

/// Finds the bounding box of skin-coloured pixels on a sparse grid.
///
/// Uses the RGB skin rule for uniform daylight (Kovac et al.). Reports at
/// most one region, scored by how densely the box is filled with skin.
#[derive(Debug, Clone)]
pub struct SkinToneDetector {
    /// Sample every `step`-th pixel in both directions.
    step: u32,
    /// Fewer skin samples than this is noise.
    min_samples: usize,
}

impl Default for SkinToneDetector {
    fn default() -> Self {
        Self {
            step: 4,
            min_samples: 16,
        }
    }
}

impl SkinToneDetector {
    pub fn new(step: u32, min_samples: usize) -> Self {
        Self {
            step: step.max(1),
            min_samples: min_samples.max(1),
        }
    }
}

fn is_skin([r, g, b]: [u8; 3]) -> bool {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    r > 95 && g > 40 && b > 20 && max - min > 15 && r.abs_diff(g) > 15 && r > g && r > b
}

impl FaceDetector for SkinToneDetector {
    fn detect(&mut self, image: &Rgb565Image<'_>) -> Vec<Detection> {
        let mut hits = 0usize;
        let (mut x0, mut y0) = (u32::MAX, u32::MAX);
        let (mut x1, mut y1) = (0u32, 0u32);

        for y in (0..image.height()).step_by(self.step as usize) {
            for x in (0..image.width()).step_by(self.step as usize) {
                if is_skin(image.rgb(x, y)) {
                    hits += 1;
                    x0 = x0.min(x);
                    y0 = y0.min(y);
                    x1 = x1.max(x);
                    y1 = y1.max(y);
                }
            }
        }

        if hits < self.min_samples {
            return Vec::new();
        }

        let cols = (x1 - x0) / self.step + 1;
        let rows = (y1 - y0) / self.step + 1;
        let density = hits as f32 / (cols * rows) as f32;
        let right = (x1 + self.step).min(image.width());
        let bottom = (y1 + self.step).min(image.height());

        vec![Detection {
            x: x0 as i32,
            y: y0 as i32,
            w: (right - x0) as i32,
            h: (bottom - y0) as i32,
            score: density.min(1.0),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKIN: u16 = 0xDB2E; // ~ (220, 100, 112)
    const BLUE: u16 = 0x001F;

    fn frame(width: u32, height: u32, paint: impl Fn(u32, u32) -> u16) -> Vec<u8> {
        (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .flat_map(|(x, y)| paint(x, y).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_skin_rule() {
        assert!(is_skin([220, 100, 112]));
        assert!(!is_skin([0, 0, 255]));
        assert!(!is_skin([128, 128, 128]));
    }

    #[test]
    fn test_no_skin_no_detection() {
        let data = frame(64, 48, |_, _| BLUE);
        let image = Rgb565Image::new(&data, 64, 48).unwrap();
        assert!(SkinToneDetector::default().detect(&image).is_empty());
    }

    #[test]
    fn test_patch_is_boxed() {
        let data = frame(64, 48, |x, y| {
            if (16..48).contains(&x) && (8..40).contains(&y) {
                SKIN
            } else {
                BLUE
            }
        });
        let image = Rgb565Image::new(&data, 64, 48).unwrap();
        let found = SkinToneDetector::default().detect(&image);
        assert_eq!(found.len(), 1);
        let face = found[0];
        assert_eq!((face.x, face.y), (16, 8));
        assert_eq!((face.w, face.h), (32, 32));
        assert!((face.score - 1.0).abs() < f32::EPSILON);
    }
}
