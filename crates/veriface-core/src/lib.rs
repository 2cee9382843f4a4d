//! veriface-core: face similarity pipeline.
//!
//! Detects faces (SCRFD via ONNX Runtime, or any [`FaceDetector`] backend),
//! extracts ORB binary descriptors from the face region and scores two
//! descriptor sets with a k-NN ratio test.

pub mod detector;
pub mod image_ops;
pub mod knn;
pub mod matcher;
pub mod orb;
pub mod types;

pub use detector::{locate_faces, FaceDetector, ScrfdDetector};
pub use knn::{BruteForceMatcher, KnnMatcher, LshMatcher, MatchStrategies};
pub use matcher::{FaceMatcher, MatcherConfig, MultiFacePolicy};
pub use orb::{DescriptorSet, OrbConfig, OrbExtractor};
pub use types::{
    BoundingBox, Descriptor, FaceError, FaceRegion, ImageSide, MatchResult, QualityReport,
};

/// Default directory holding the SCRFD ONNX model.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/veriface/models")
}
