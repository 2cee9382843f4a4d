use image::GrayImage;
use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, 0.0 when disjoint.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Integer pixel rectangle, always inside the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A detected face ready for descriptor extraction.
///
/// `crop` is grayscale and histogram-equalized. When the raw detection was
/// smaller than the minimum dimension the crop has been upscaled and
/// `enhanced` is set.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    pub padded: PixelRect,
    pub crop: GrayImage,
    pub enhanced: bool,
}

impl FaceRegion {
    pub fn area(&self) -> f32 {
        self.bbox.area()
    }
}

/// Which input of an operation an outcome refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSide {
    /// The enrolled or document photo (first argument of `compare`).
    Reference,
    /// The freshly captured photo (second argument of `compare`).
    Live,
    Both,
    /// The only image of a single-image operation.
    Single,
}

impl fmt::Display for ImageSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageSide::Reference => "reference",
            ImageSide::Live => "live",
            ImageSide::Both => "reference and live",
            ImageSide::Single => "submitted",
        })
    }
}

/// Classified failure of a face operation.
///
/// A face mismatch is not represented here: it is a successful comparison
/// with `matched == false`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FaceError {
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("no face detected in {side} image")]
    NoFaceDetected { side: ImageSide },
    #[error("multiple faces detected in {side} image ({count})")]
    MultipleFacesDetected { side: ImageSide, count: usize },
    #[error("insufficient features in {side} image: found {found}, need at least {required}")]
    InsufficientFeatures {
        side: ImageSide,
        found: usize,
        required: usize,
    },
    #[error("face comparison failed: {0}")]
    Comparison(String),
}

impl FaceError {
    /// Stable classification code exposed to callers.
    pub fn code(&self) -> &'static str {
        match self {
            FaceError::Decode(_) => "DECODE_ERROR",
            FaceError::NoFaceDetected { side } => match side {
                ImageSide::Reference => "NO_FACE_REFERENCE",
                ImageSide::Live => "NO_FACE_LIVE",
                ImageSide::Both => "NO_FACE_BOTH",
                ImageSide::Single => "NO_FACE",
            },
            FaceError::MultipleFacesDetected { side, .. } => match side {
                ImageSide::Reference => "MULTIPLE_FACES_REFERENCE",
                ImageSide::Live => "MULTIPLE_FACES_LIVE",
                ImageSide::Both | ImageSide::Single => "MULTIPLE_FACES",
            },
            FaceError::InsufficientFeatures { .. } => "INSUFFICIENT_FEATURES",
            FaceError::Comparison(_) => "COMPARISON_ERROR",
        }
    }

    /// Whether the caller can fix this by submitting a different photo.
    pub fn is_user_actionable(&self) -> bool {
        !matches!(self, FaceError::Comparison(_))
    }
}

impl Serialize for FaceError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

/// 256-bit binary feature descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    pub const BITS: usize = 256;

    /// Number of differing bits.
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    pub fn bit(&self, index: usize) -> bool {
        (self.0[index / 8] >> (index % 8)) & 1 == 1
    }
}

/// Outcome of comparing two photographs.
#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Percentage of ratio-test survivors relative to the smaller set, 0–100.
    pub confidence: f32,
    pub good_matches: usize,
    pub total_features: usize,
    pub error: Option<FaceError>,
    pub message: String,
    /// k-NN strategy that produced the verdict.
    pub strategy: Option<&'static str>,
}

impl MatchResult {
    /// Build a legitimate verdict from ratio-test counts.
    pub fn verdict(
        good_matches: usize,
        total_features: usize,
        threshold_percent: f32,
        strategy: &'static str,
    ) -> Self {
        let ratio = good_matches as f32 / total_features.max(1) as f32;
        let confidence = (ratio * 100.0).min(100.0);
        let matched = confidence >= threshold_percent;

        Self {
            matched,
            confidence,
            good_matches,
            total_features,
            error: None,
            message: format!(
                "Face {} detected with {confidence:.1}% confidence",
                if matched { "match" } else { "mismatch" }
            ),
            strategy: Some(strategy),
        }
    }

    /// Non-matching result carrying a classified failure.
    pub fn failed(error: FaceError) -> Self {
        Self {
            matched: false,
            confidence: 0.0,
            good_matches: 0,
            total_features: 0,
            message: error.to_string(),
            error: Some(error),
            strategy: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of single-image quality validation.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub is_valid: bool,
    pub reason: String,
    pub face_count: usize,
    pub largest_face_area: Option<f32>,
    pub error: Option<FaceError>,
}

impl QualityReport {
    pub fn invalid(error: FaceError, face_count: usize) -> Self {
        Self {
            is_valid: false,
            reason: error.to_string(),
            face_count,
            largest_face_area: None,
            error: Some(error),
        }
    }
}
