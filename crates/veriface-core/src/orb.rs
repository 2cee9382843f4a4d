//! ORB descriptor extraction (oriented FAST keypoints + rotated BRIEF).
//!
//! Keypoints are found with FAST-9 on a scale pyramid, ranked by the Harris
//! corner response, oriented by intensity centroid, and described with 256
//! binary intensity comparisons on the smoothed level image.

use crate::image_ops::{self, pixel_clamped};
use crate::types::{Descriptor, FaceError, ImageSide};
use image::imageops;
use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Bresenham circle of radius 3 used by FAST.
const FAST_CIRCLE: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1),
    (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1),
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];
const FAST_ARC: usize = 9;

const HARRIS_K: f64 = 0.04;
const HARRIS_BLOCK_RADIUS: i32 = 3;

const BRIEF_PAIRS: usize = Descriptor::BITS;
const BRIEF_SEED: u64 = 0x0AB5_EED5;
const BRIEF_SMOOTH_SIGMA: f32 = 2.0;

/// Keypoint ranking used before the per-level quota cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreType {
    Harris,
    Fast,
}

/// ORB parameters. Defaults are tuned for small face crops: low edge and
/// FAST thresholds so 100–200 px regions still yield features.
#[derive(Debug, Clone)]
pub struct OrbConfig {
    pub n_features: usize,
    pub scale_factor: f32,
    pub n_levels: usize,
    pub edge_threshold: u32,
    pub first_level: usize,
    pub patch_size: u32,
    pub fast_threshold: u8,
    pub score: ScoreType,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            n_features: 1000,
            scale_factor: 1.2,
            n_levels: 8,
            edge_threshold: 15,
            first_level: 0,
            patch_size: 31,
            fast_threshold: 10,
            score: ScoreType::Harris,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyPoint {
    /// Position in level-0 (input image) coordinates.
    pub x: f32,
    pub y: f32,
    pub level: usize,
    /// Orientation in radians.
    pub angle: f32,
    pub response: f32,
}

/// Descriptors extracted from one face region, in keypoint order.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl DescriptorSet {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

pub struct OrbExtractor {
    config: OrbConfig,
    pattern: Vec<[i32; 4]>,
}

impl Default for OrbExtractor {
    fn default() -> Self {
        Self::new(OrbConfig::default())
    }
}

impl OrbExtractor {
    pub fn new(config: OrbConfig) -> Self {
        let pattern = brief_pattern(config.patch_size);
        Self { config, pattern }
    }

    pub fn config(&self) -> &OrbConfig {
        &self.config
    }

    /// Extract and enforce a minimum descriptor count.
    pub fn extract_at_least(
        &self,
        image: &GrayImage,
        required: usize,
        side: ImageSide,
    ) -> Result<DescriptorSet, FaceError> {
        let set = self.extract(image);
        if set.len() < required {
            return Err(FaceError::InsufficientFeatures {
                side,
                found: set.len(),
                required,
            });
        }
        Ok(set)
    }

    /// Detect keypoints on every pyramid level and compute their descriptors.
    pub fn extract(&self, image: &GrayImage) -> DescriptorSet {
        let cfg = &self.config;
        let border = cfg.edge_threshold.max(4);
        let min_side = 2 * border + 1;
        let quotas = level_quotas(cfg.n_features, cfg.n_levels, cfg.scale_factor);

        let mut set = DescriptorSet::default();
        for (level, &quota) in quotas.iter().enumerate() {
            let scale = cfg.scale_factor.powi(level as i32 - cfg.first_level as i32);
            let w = (image.width() as f32 / scale).round() as u32;
            let h = (image.height() as f32 / scale).round() as u32;
            if w < min_side || h < min_side || quota == 0 {
                continue;
            }

            let level_img = if w == image.width() && h == image.height() {
                image.clone()
            } else {
                image_ops::downscale(image, w, h)
            };

            let corners = self.level_keypoints(&level_img, border, quota);
            if corners.is_empty() {
                continue;
            }

            let smoothed = imageops::blur(&level_img, BRIEF_SMOOTH_SIGMA);
            for (x, y, response) in corners {
                let angle = intensity_centroid_angle(&level_img, x, y, (cfg.patch_size / 2) as i32);
                let descriptor = self.describe(&smoothed, x, y, angle);
                set.keypoints.push(KeyPoint {
                    x: x as f32 * scale,
                    y: y as f32 * scale,
                    level,
                    angle,
                    response,
                });
                set.descriptors.push(descriptor);
            }
        }

        tracing::trace!(
            width = image.width(),
            height = image.height(),
            descriptors = set.len(),
            "extracted ORB descriptors"
        );
        set
    }

    /// FAST corners for one level, ranked and cut to `quota`.
    fn level_keypoints(&self, level: &GrayImage, border: u32, quota: usize) -> Vec<(i32, i32, f32)> {
        let mut corners = fast_corners(level, self.config.fast_threshold, border);
        corners.sort_by(|a, b| b.2.total_cmp(&a.2));

        match self.config.score {
            ScoreType::Fast => corners.truncate(quota),
            ScoreType::Harris => {
                corners.truncate(quota.saturating_mul(2));
                for c in corners.iter_mut() {
                    c.2 = harris_response(level, c.0, c.1) as f32;
                }
                corners.sort_by(|a, b| b.2.total_cmp(&a.2));
                corners.truncate(quota);
            }
        }
        corners
    }

    fn describe(&self, smoothed: &GrayImage, x: i32, y: i32, angle: f32) -> Descriptor {
        let (sin, cos) = angle.sin_cos();
        let rotate = |px: i32, py: i32| -> (i32, i32) {
            let rx = cos * px as f32 - sin * py as f32;
            let ry = sin * px as f32 + cos * py as f32;
            (x + rx.round() as i32, y + ry.round() as i32)
        };

        let mut bytes = [0u8; 32];
        for (i, &[x1, y1, x2, y2]) in self.pattern.iter().enumerate() {
            let (ax, ay) = rotate(x1, y1);
            let (bx, by) = rotate(x2, y2);
            if pixel_clamped(smoothed, ax, ay) < pixel_clamped(smoothed, bx, by) {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        Descriptor(bytes)
    }
}

/// Split `n_features` across levels as a geometric series with ratio
/// `1 / scale_factor`, the remainder going to the last level.
fn level_quotas(n_features: usize, n_levels: usize, scale_factor: f32) -> Vec<usize> {
    if n_levels == 0 {
        return Vec::new();
    }
    let factor = 1.0 / scale_factor;
    if n_levels == 1 || (1.0 - factor).abs() < f32::EPSILON {
        let even = n_features / n_levels;
        let mut quotas = vec![even; n_levels];
        quotas[n_levels - 1] += n_features - even * n_levels;
        return quotas;
    }

    let mut desired = n_features as f32 * (1.0 - factor) / (1.0 - factor.powi(n_levels as i32));
    let mut quotas = Vec::with_capacity(n_levels);
    let mut assigned = 0usize;
    for _ in 0..n_levels - 1 {
        let q = desired.round() as usize;
        quotas.push(q);
        assigned += q;
        desired *= factor;
    }
    quotas.push(n_features.saturating_sub(assigned));
    quotas
}

/// FAST-9 segment test score, or `None` when `(x, y)` is not a corner.
///
/// The score is the sum of absolute differences beyond the threshold over the
/// brighter or darker ring pixels, whichever is larger.
fn fast_score(img: &GrayImage, x: i32, y: i32, threshold: u8) -> Option<f32> {
    let center = pixel_clamped(img, x, y) as i32;
    let t = threshold as i32;

    let mut ring = [0i32; 16];
    for (slot, &(dx, dy)) in ring.iter_mut().zip(FAST_CIRCLE.iter()) {
        *slot = pixel_clamped(img, x + dx, y + dy) as i32;
    }

    let state = |v: i32| -> i8 {
        if v > center + t {
            1
        } else if v < center - t {
            -1
        } else {
            0
        }
    };

    let mut run = 0usize;
    let mut run_state = 0i8;
    let mut is_corner = false;
    for i in 0..16 + FAST_ARC - 1 {
        let s = state(ring[i % 16]);
        if s != 0 && s == run_state {
            run += 1;
        } else {
            run_state = s;
            run = usize::from(s != 0);
        }
        if run >= FAST_ARC {
            is_corner = true;
            break;
        }
    }
    if !is_corner {
        return None;
    }

    let bright: i32 = ring.iter().map(|&v| (v - center - t).max(0)).sum();
    let dark: i32 = ring.iter().map(|&v| (center - v - t).max(0)).sum();
    Some(bright.max(dark) as f32)
}

/// FAST corners inside `border`, after 3×3 non-maximum suppression.
fn fast_corners(img: &GrayImage, threshold: u8, border: u32) -> Vec<(i32, i32, f32)> {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let b = border as i32;
    if w <= 2 * b || h <= 2 * b {
        return Vec::new();
    }

    let stride = w as usize;
    let mut scores = vec![0.0f32; (w * h) as usize];
    for y in b..h - b {
        for x in b..w - b {
            if let Some(s) = fast_score(img, x, y, threshold) {
                scores[y as usize * stride + x as usize] = s;
            }
        }
    }

    let mut corners = Vec::new();
    for y in b..h - b {
        for x in b..w - b {
            let s = scores[y as usize * stride + x as usize];
            if s <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'neighbours: for dy in -1..=1 {
                for dx in -1..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let n = scores[(y + dy) as usize * stride + (x + dx) as usize];
                    // Ties go to the earlier pixel in raster order.
                    let earlier = dy < 0 || (dy == 0 && dx < 0);
                    if n > s || (earlier && n == s) {
                        is_max = false;
                        break 'neighbours;
                    }
                }
            }
            if is_max {
                corners.push((x, y, s));
            }
        }
    }
    corners
}

/// Harris corner response over a 7×7 window of Sobel gradients.
fn harris_response(img: &GrayImage, x: i32, y: i32) -> f64 {
    let p = |px: i32, py: i32| pixel_clamped(img, px, py) as f64;

    let (mut a, mut b, mut c) = (0.0f64, 0.0f64, 0.0f64);
    for wy in y - HARRIS_BLOCK_RADIUS..=y + HARRIS_BLOCK_RADIUS {
        for wx in x - HARRIS_BLOCK_RADIUS..=x + HARRIS_BLOCK_RADIUS {
            let gx = (p(wx + 1, wy - 1) + 2.0 * p(wx + 1, wy) + p(wx + 1, wy + 1))
                - (p(wx - 1, wy - 1) + 2.0 * p(wx - 1, wy) + p(wx - 1, wy + 1));
            let gy = (p(wx - 1, wy + 1) + 2.0 * p(wx, wy + 1) + p(wx + 1, wy + 1))
                - (p(wx - 1, wy - 1) + 2.0 * p(wx, wy - 1) + p(wx + 1, wy - 1));
            a += gx * gx;
            b += gy * gy;
            c += gx * gy;
        }
    }
    a * b - c * c - HARRIS_K * (a + b) * (a + b)
}

/// Orientation of the patch from its first-order intensity moments.
fn intensity_centroid_angle(img: &GrayImage, x: i32, y: i32, radius: i32) -> f32 {
    let (mut m01, mut m10) = (0.0f32, 0.0f32);
    let r2 = radius * radius;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let v = pixel_clamped(img, x + dx, y + dy) as f32;
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}

/// Fixed BRIEF sampling pattern: point pairs drawn from an isotropic Gaussian
/// (sigma = patch_size / 5) clipped to the patch. Seeded, so every extractor
/// with the same patch size produces comparable descriptors.
fn brief_pattern(patch_size: u32) -> Vec<[i32; 4]> {
    let half = (patch_size / 2) as i32;
    let sigma = patch_size as f32 / 5.0;
    let mut rng = StdRng::seed_from_u64(BRIEF_SEED);

    let mut gaussian = move || -> i32 {
        // Box-Muller; `1 - u` keeps the log argument in (0, 1].
        let u1: f32 = 1.0 - rng.gen::<f32>();
        let u2: f32 = rng.gen::<f32>();
        let z = (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos();
        ((z * sigma).round() as i32).clamp(-half, half)
    };

    let mut pattern = Vec::with_capacity(BRIEF_PAIRS);
    while pattern.len() < BRIEF_PAIRS {
        let pair = [gaussian(), gaussian(), gaussian(), gaussian()];
        if pair[0] != pair[2] || pair[1] != pair[3] {
            pattern.push(pair);
        }
    }
    pattern
}
