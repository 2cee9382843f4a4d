//! Face similarity: detection, region selection, descriptor extraction and
//! the ratio-test verdict.

use crate::detector::{locate_faces, FaceDetector};
use crate::image_ops;
use crate::knn::{count_good_matches, MatchStrategies};
use crate::orb::{DescriptorSet, OrbConfig, OrbExtractor};
use crate::types::{FaceError, FaceRegion, ImageSide, MatchResult, QualityReport};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Neighbours requested per query descriptor; the ratio test needs two.
const KNN_K: usize = 2;

/// What to do when an image contains more than one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiFacePolicy {
    /// Classify as `MultipleFacesDetected`.
    #[default]
    Reject,
    /// Use the largest face; ties go to the earlier detection.
    Largest,
}

impl FromStr for MultiFacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "largest" => Ok(Self::Largest),
            other => Err(format!("unknown multi-face policy '{other}' (expected reject|largest)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Minimum confidence (percent) for a match.
    pub match_threshold_percent: f32,
    /// Lowe ratio: accept when `d1 < ratio * d2`.
    pub ratio: f32,
    /// Minimum raw detection area (px²) for a usable photo.
    pub min_face_area: f32,
    pub min_descriptors_compare: usize,
    pub min_descriptors_validate: usize,
    pub multi_face: MultiFacePolicy,
    pub orb: OrbConfig,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            match_threshold_percent: 15.0,
            ratio: 0.7,
            min_face_area: 1000.0,
            min_descriptors_compare: 5,
            min_descriptors_validate: 10,
            multi_face: MultiFacePolicy::Reject,
            orb: OrbConfig::default(),
        }
    }
}

/// Owns one detector backend plus extraction and matching state.
///
/// Not `Sync`: detectors take `&mut self`. Give each worker thread its own.
pub struct FaceMatcher {
    detector: Box<dyn FaceDetector>,
    orb: OrbExtractor,
    strategies: MatchStrategies,
    config: MatcherConfig,
}

impl FaceMatcher {
    pub fn new(detector: Box<dyn FaceDetector>, config: MatcherConfig) -> Self {
        Self {
            detector,
            orb: OrbExtractor::new(config.orb.clone()),
            strategies: MatchStrategies::default(),
            config,
        }
    }

    /// Replace the k-NN strategy chain.
    pub fn with_strategies(mut self, strategies: MatchStrategies) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Check a single photo is usable: decodable, exactly one face, large
    /// enough.
    pub fn validate_quality(&mut self, image_bytes: &[u8]) -> QualityReport {
        let image = match image_ops::decode(image_bytes) {
            Ok(img) => img,
            Err(e) => return QualityReport::invalid(e, 0),
        };

        let regions = locate_faces(self.detector.as_mut(), &image);
        match regions.len() {
            0 => return QualityReport::invalid(FaceError::NoFaceDetected { side: ImageSide::Single }, 0),
            1 => {}
            n => {
                return QualityReport::invalid(
                    FaceError::MultipleFacesDetected { side: ImageSide::Single, count: n },
                    n,
                )
            }
        }

        let area = regions[0].area();
        if area < self.config.min_face_area {
            tracing::debug!(area, min = self.config.min_face_area, "face below minimum area");
            return QualityReport {
                is_valid: false,
                reason: "Face too small or unclear".into(),
                face_count: 1,
                largest_face_area: Some(area),
                error: None,
            };
        }

        QualityReport {
            is_valid: true,
            reason: "Face detected successfully".into(),
            face_count: 1,
            largest_face_area: Some(area),
            error: None,
        }
    }

    /// Single-image pipeline with the stricter validation floor.
    pub fn describe(&mut self, image_bytes: &[u8]) -> Result<DescriptorSet, FaceError> {
        let image = image_ops::decode(image_bytes)?;
        let regions = locate_faces(self.detector.as_mut(), &image);
        let region = self.select_face(regions, ImageSide::Single)?;
        self.orb
            .extract_at_least(&region.crop, self.config.min_descriptors_validate, ImageSide::Single)
    }

    /// Compare a reference photo against a live capture.
    ///
    /// Failures are returned as a non-matching result carrying the
    /// classified error; a mismatch is a normal verdict.
    pub fn compare(&mut self, reference: &[u8], live: &[u8]) -> MatchResult {
        match self.try_compare(reference, live) {
            Ok(result) => {
                tracing::info!(
                    matched = result.matched,
                    confidence = result.confidence,
                    good = result.good_matches,
                    total = result.total_features,
                    strategy = result.strategy,
                    "face comparison complete"
                );
                result
            }
            Err(e) => {
                tracing::info!(code = e.code(), error = %e, "face comparison failed");
                MatchResult::failed(e)
            }
        }
    }

    /// Ratio-test verdict for two already extracted descriptor sets.
    pub fn score(&self, reference: &DescriptorSet, live: &DescriptorSet) -> MatchResult {
        match self
            .strategies
            .knn_match(&reference.descriptors, &live.descriptors, KNN_K)
        {
            Ok((strategy, matches)) => {
                let good = count_good_matches(&matches, self.config.ratio);
                let total = reference.len().min(live.len());
                MatchResult::verdict(good, total, self.config.match_threshold_percent, strategy)
            }
            Err(e) => MatchResult::failed(FaceError::Comparison(e.to_string())),
        }
    }

    fn try_compare(&mut self, reference: &[u8], live: &[u8]) -> Result<MatchResult, FaceError> {
        let ref_img = decode_side(reference, ImageSide::Reference)?;
        let live_img = decode_side(live, ImageSide::Live)?;

        let ref_regions = locate_faces(self.detector.as_mut(), &ref_img);
        let live_regions = locate_faces(self.detector.as_mut(), &live_img);
        if ref_regions.is_empty() && live_regions.is_empty() {
            return Err(FaceError::NoFaceDetected { side: ImageSide::Both });
        }

        let ref_face = self.select_face(ref_regions, ImageSide::Reference)?;
        let live_face = self.select_face(live_regions, ImageSide::Live)?;

        let min = self.config.min_descriptors_compare;
        let ref_set = self.orb.extract_at_least(&ref_face.crop, min, ImageSide::Reference)?;
        let live_set = self.orb.extract_at_least(&live_face.crop, min, ImageSide::Live)?;
        tracing::debug!(
            reference = ref_set.len(),
            live = live_set.len(),
            ref_enhanced = ref_face.enhanced,
            live_enhanced = live_face.enhanced,
            "extracted descriptors"
        );

        let result = self.score(&ref_set, &live_set);
        match result.error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Apply the multi-face policy to one image's detections.
    fn select_face(&self, regions: Vec<FaceRegion>, side: ImageSide) -> Result<FaceRegion, FaceError> {
        select_face(regions, side, self.config.multi_face)
    }
}

fn decode_side(bytes: &[u8], side: ImageSide) -> Result<GrayImage, FaceError> {
    image_ops::decode(bytes).map_err(|e| match e {
        FaceError::Decode(msg) => FaceError::Decode(format!("{side} image: {msg}")),
        other => other,
    })
}

fn select_face(
    regions: Vec<FaceRegion>,
    side: ImageSide,
    policy: MultiFacePolicy,
) -> Result<FaceRegion, FaceError> {
    let count = regions.len();
    match (count, policy) {
        (0, _) => Err(FaceError::NoFaceDetected { side }),
        (1, _) => regions.into_iter().next().ok_or(FaceError::NoFaceDetected { side }),
        (_, MultiFacePolicy::Reject) => Err(FaceError::MultipleFacesDetected { side, count }),
        (_, MultiFacePolicy::Largest) => {
            // Strictly greater keeps the earliest detection on ties.
            let mut best: Option<FaceRegion> = None;
            for region in regions {
                if best.as_ref().map_or(true, |b| region.area() > b.area()) {
                    best = Some(region);
                }
            }
            best.ok_or(FaceError::NoFaceDetected { side })
        }
    }
}
