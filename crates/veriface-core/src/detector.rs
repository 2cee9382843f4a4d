//! Face detection: pluggable backend trait, SCRFD ONNX backend, and the
//! region policy that turns raw boxes into extractor-ready crops.

use crate::image_ops;
use crate::types::{BoundingBox, FaceRegion, PixelRect};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Region policy ---
const PADDING_MIN_PX: u32 = 5;
/// Padding is `min(w, h) / PADDING_DIVISOR` when larger than the minimum.
const PADDING_DIVISOR: u32 = 10;
/// Raw detections smaller than this in either dimension are upscaled.
const MIN_FACE_DIM: u32 = 80;
const ENHANCED_SIZE: u32 = 120;

// --- SCRFD ---
const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place det_10g.onnx in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detection backend.
///
/// Implementations may hold mutable inference state, hence `&mut self`.
pub trait FaceDetector: Send {
    /// Short backend name for logs and status output.
    fn name(&self) -> &str;

    /// Detect faces in a grayscale image. Boxes are in image coordinates,
    /// sorted by descending confidence.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Run detection and apply the region policy to every box.
///
/// Backend failures are logged and reported as "no faces"; they never escape.
pub fn locate_faces(detector: &mut dyn FaceDetector, image: &GrayImage) -> Vec<FaceRegion> {
    let boxes = match detector.detect(image) {
        Ok(boxes) => boxes,
        Err(e) => {
            tracing::warn!(backend = detector.name(), error = %e, "face detection failed");
            return Vec::new();
        }
    };

    let regions: Vec<FaceRegion> = boxes
        .into_iter()
        .filter_map(|bbox| region_from_box(image, bbox))
        .collect();

    tracing::debug!(
        backend = detector.name(),
        faces = regions.len(),
        enhanced = regions.iter().filter(|r| r.enhanced).count(),
        "located faces"
    );
    regions
}

/// Pad, crop, optionally upscale and equalize one detection.
///
/// Returns `None` when the box does not overlap the image.
pub fn region_from_box(image: &GrayImage, bbox: BoundingBox) -> Option<FaceRegion> {
    let (img_w, img_h) = image.dimensions();

    let left = bbox.x.max(0.0).floor() as u32;
    let top = bbox.y.max(0.0).floor() as u32;
    let right = ((bbox.x + bbox.width).min(img_w as f32)).round().max(0.0) as u32;
    let bottom = ((bbox.y + bbox.height).min(img_h as f32)).round().max(0.0) as u32;
    if left >= img_w || top >= img_h || right <= left || bottom <= top {
        return None;
    }
    let w = right - left;
    let h = bottom - top;

    let pad = PADDING_MIN_PX.max(w.min(h) / PADDING_DIVISOR);
    let px = left.saturating_sub(pad);
    let py = top.saturating_sub(pad);
    let padded = PixelRect {
        x: px,
        y: py,
        width: (w + 2 * pad).min(img_w - px),
        height: (h + 2 * pad).min(img_h - py),
    };

    let mut crop = image_ops::crop(image, padded);
    let enhanced = w < MIN_FACE_DIM || h < MIN_FACE_DIM;
    if enhanced {
        crop = image_ops::upscale(&crop, ENHANCED_SIZE);
        tracing::debug!(w, h, target = ENHANCED_SIZE, "upscaled small face");
    }
    image_ops::equalize_histogram(&mut crop);

    Some(FaceRegion {
        bbox,
        padded,
        crop,
        enhanced,
    })
}

/// Letterbox mapping between model input space and the source image.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD-based face detector (ONNX Runtime).
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride (score, bbox) output indices for strides [8, 16, 32].
    outputs: [(usize, usize); 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::info!(path = model_path, ?names, ?outputs, "loaded SCRFD model");

        Ok(Self { session, outputs })
    }

    /// Letterbox the image into a normalized NCHW tensor.
    fn preprocess(image: &GrayImage) -> (Array4<f32>, Letterbox) {
        let (w, h) = image.dimensions();
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / w as f32).min(size / h as f32);

        let new_w = ((w as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((h as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let pad_x = (SCRFD_INPUT_SIZE - new_w) / 2;
        let pad_y = (SCRFD_INPUT_SIZE - new_h) / 2;

        let resized = image_ops::downscale(image, new_w, new_h);

        // Padding is zero after normalization, so start from zeros.
        let n = SCRFD_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
        for (x, y, px) in resized.enumerate_pixels() {
            let v = (px.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = v;
            }
        }

        let letterbox = Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        };
        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn name(&self) -> &str {
        "scrfd"
    }

    fn detect(&mut self, image: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = Self::preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.outputs[slot];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, deltas) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, deltas, stride, &letterbox));
        }

        Ok(suppress(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Map (score, bbox) output tensors per stride, by name when the export uses
/// `score_8`/`bbox_8` naming, positionally otherwise.
fn map_outputs(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<(usize, usize)>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode boxes above the confidence threshold for one stride.
fn decode_stride(scores: &[f32], deltas: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let d = deltas.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * s;
            let cy = (cell / grid) as f32 * s;

            let (x1, y1) = letterbox.to_source(cx - d[0] * s, cy - d[1] * s);
            let (x2, y2) = letterbox.to_source(cx + d[2] * s, cy + d[3] * s);

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; result is sorted by confidence.
fn suppress(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf }
    }

    struct FixedDetector(Vec<BoundingBox>);

    impl FaceDetector for FixedDetector {
        fn name(&self) -> &str {
            "fixed"
        }
        fn detect(&mut self, _: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    impl FaceDetector for BrokenDetector {
        fn name(&self) -> &str {
            "broken"
        }
        fn detect(&mut self, _: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Err(DetectorError::InferenceFailed("boom".into()))
        }
    }

    #[test]
    fn test_suppress_overlapping() {
        let boxes = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let kept = suppress(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_empty() {
        assert!(suppress(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_map_outputs_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_outputs(&names), [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_map_outputs_positional() {
        let names: Vec<String> = (0..9).map(|i: usize| (440 + i).to_string()).collect();
        assert_eq!(map_outputs(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_stride_maps_through_letterbox() {
        let grid = SCRFD_INPUT_SIZE as usize / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut deltas = vec![0.0f32; anchors * 4];

        // Anchor at cell (2, 1): center (64, 32) in model space.
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        deltas[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };
        let boxes = decode_stride(&scores, &deltas, 32, &lb);
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert!((b.x - 16.0).abs() < 1e-4, "x = {}", b.x);
        assert!((b.y - 0.0).abs() < 1e-4, "y = {}", b.y);
        assert!((b.width - 32.0).abs() < 1e-4);
        assert!((b.height - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_letterbox() {
        let image = GrayImage::from_pixel(320, 160, Luma([200u8]));
        let (tensor, lb) = ScrfdDetector::preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert!((lb.pad_y - 160.0).abs() < 1e-6);
        // Padding rows normalize to zero, content rows do not.
        assert_eq!(tensor[[0, 0, 10, 10]], 0.0);
        let expected = (200.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 2, 320, 320]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_region_padding_large_face() {
        let image = GrayImage::from_pixel(400, 400, Luma([90u8]));
        let region = region_from_box(&image, make_bbox(100.0, 120.0, 150.0, 200.0, 0.9)).unwrap();
        // pad = max(5, 150 / 10) = 15
        assert_eq!(region.padded, PixelRect { x: 85, y: 105, width: 180, height: 230 });
        assert!(!region.enhanced);
        assert_eq!(region.crop.dimensions(), (180, 230));
    }

    #[test]
    fn test_region_padding_clamped_at_edges() {
        let image = GrayImage::from_pixel(100, 100, Luma([90u8]));
        let region = region_from_box(&image, make_bbox(2.0, 0.0, 96.0, 98.0, 0.9)).unwrap();
        assert_eq!(region.padded.x, 0);
        assert_eq!(region.padded.y, 0);
        assert!(region.padded.x + region.padded.width <= 100);
        assert!(region.padded.y + region.padded.height <= 100);
    }

    #[test]
    fn test_region_small_face_enhanced() {
        let image = GrayImage::from_pixel(200, 200, Luma([90u8]));
        let region = region_from_box(&image, make_bbox(50.0, 50.0, 40.0, 60.0, 0.9)).unwrap();
        assert!(region.enhanced);
        assert_eq!(region.crop.dimensions(), (ENHANCED_SIZE, ENHANCED_SIZE));
        // pad = max(5, 40 / 10) = 5
        assert_eq!(region.padded, PixelRect { x: 45, y: 45, width: 50, height: 70 });
    }

    #[test]
    fn test_region_outside_image() {
        let image = GrayImage::from_pixel(50, 50, Luma([0u8]));
        assert!(region_from_box(&image, make_bbox(60.0, 10.0, 20.0, 20.0, 0.9)).is_none());
        assert!(region_from_box(&image, make_bbox(-40.0, 10.0, 20.0, 20.0, 0.9)).is_none());
    }

    #[test]
    fn test_locate_faces_swallows_backend_errors() {
        let image = GrayImage::from_pixel(50, 50, Luma([0u8]));
        assert!(locate_faces(&mut BrokenDetector, &image).is_empty());
    }

    #[test]
    fn test_locate_faces_keeps_order() {
        let image = GrayImage::from_pixel(300, 300, Luma([10u8]));
        let mut det = FixedDetector(vec![
            make_bbox(10.0, 10.0, 100.0, 100.0, 0.95),
            make_bbox(150.0, 150.0, 30.0, 30.0, 0.7),
        ]);
        let regions = locate_faces(&mut det, &image);
        assert_eq!(regions.len(), 2);
        assert!(!regions[0].enhanced);
        assert!(regions[1].enhanced);
    }
}
