//! Test doubles for the face engine: synthetic photos and a detector that
//! boxes textured patches on a flat background.

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;
use std::time::Duration;
use veriface_core::detector::DetectorError;
use veriface_core::{BoundingBox, FaceDetector, FaceMatcher, MatcherConfig};

const BACKGROUND: u8 = 128;
const SIZE: u32 = 240;

/// One box around all non-background pixels, none for a blank image.
pub struct PatchDetector;

impl FaceDetector for PatchDetector {
    fn name(&self) -> &str {
        "patch"
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, px) in image.enumerate_pixels() {
            if px.0[0] == BACKGROUND {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        Ok(bounds
            .map(|(x0, y0, x1, y1)| BoundingBox {
                x: x0 as f32,
                y: y0 as f32,
                width: (x1 - x0 + 1) as f32,
                height: (y1 - y0 + 1) as f32,
                confidence: 0.99,
            })
            .into_iter()
            .collect())
    }
}

/// Sleeps before reporting no faces.
pub struct SlowDetector(pub Duration);

impl FaceDetector for SlowDetector {
    fn name(&self) -> &str {
        "slow"
    }

    fn detect(&mut self, _: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        std::thread::sleep(self.0);
        Ok(Vec::new())
    }
}

pub fn matcher_with(detector: impl FaceDetector + 'static) -> FaceMatcher {
    FaceMatcher::new(Box::new(detector), MatcherConfig::default())
}

fn png(img: GrayImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("PNG encoding into memory");
    bytes
}

/// A 160 px patch of random 8×8 blocks; same seed, same photo.
pub fn face_png(seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = GrayImage::from_pixel(SIZE, SIZE, Luma([BACKGROUND]));
    for by in (0..160).step_by(8) {
        for bx in (0..160).step_by(8) {
            let v: u8 = match rng.gen() {
                BACKGROUND => 0,
                v => v,
            };
            for y in by..by + 8 {
                for x in bx..bx + 8 {
                    img.put_pixel(40 + x, 40 + y, Luma([v]));
                }
            }
        }
    }
    png(img)
}

pub fn blank_png() -> Vec<u8> {
    png(GrayImage::from_pixel(SIZE, SIZE, Luma([BACKGROUND])))
}
