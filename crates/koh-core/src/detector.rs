//! Face detectors.
//!
//! [`ScrfdDetector`] runs an SCRFD ONNX model (anchor-free, strides 8/16/32)
//! on a letterboxed copy of the image and maps the surviving boxes back to
//! integer pixel rectangles. [`FullFrameDetector`] reports the whole image
//! as one face, for corpora that already hold tight crops.

use crate::engine::FaceDetector;
use crate::types::{FaceImage, FaceRect};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Float box in source image coordinates, before rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScoredBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl ScoredBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Round outward and clip to the image. `None` if nothing remains.
    fn to_rect(self, width: u32, height: u32) -> Option<FaceRect> {
        let x1 = self.x1.floor().clamp(0.0, width as f32) as u32;
        let y1 = self.y1.floor().clamp(0.0, height as f32) as u32;
        let x2 = self.x2.ceil().clamp(0.0, width as f32) as u32;
        let y2 = self.y2.ceil().clamp(0.0, height as f32) as u32;
        (x2 > x1 && y2 > y1).then(|| FaceRect::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// Scale and padding applied when fitting the image into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, input: usize) -> Self {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (input as f32 - new_w) / 2.0,
            pad_y: (input as f32 - new_h) / 2.0,
        }
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// SCRFD detector session. Only the score and bbox heads are read.
pub struct ScrfdDetector {
    session: Session,
    /// `(score_idx, bbox_idx)` per stride.
    heads: [(usize, usize); 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs score and bbox outputs for 3 strides, model has {}",
                output_names.len()
            )));
        }
        let heads = head_indices(&output_names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?heads,
            "loaded SCRFD model"
        );

        Ok(Self { session, heads })
    }

    fn preprocess(image: &FaceImage) -> (Array4<f32>, Letterbox) {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let lb = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let new_w = ((width as f32 * lb.scale).round() as usize).min(SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * lb.scale).round() as usize).min(SCRFD_INPUT_SIZE);
        let off_x = lb.pad_x.floor() as usize;
        let off_y = lb.pad_y.floor() as usize;

        // Padding normalizes to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        let inv = 1.0 / lb.scale;

        for y in 0..new_h {
            let sy = ((y as f32 + 0.5) * inv - 0.5).max(0.0);
            let y0 = (sy.floor() as usize).min(height - 1);
            let y1 = (y0 + 1).min(height - 1);
            let fy = sy - sy.floor();
            let (r0, r1) = (image.row(y0 as u32), image.row(y1 as u32));

            for x in 0..new_w {
                let sx = ((x as f32 + 0.5) * inv - 0.5).max(0.0);
                let x0 = (sx.floor() as usize).min(width - 1);
                let x1 = (x0 + 1).min(width - 1);
                let fx = sx - sx.floor();

                let top = r0[x0] as f32 * (1.0 - fx) + r0[x1] as f32 * fx;
                let bottom = r1[x0] as f32 * (1.0 - fx) + r1[x1] as f32 * fx;
                let value = (top * (1.0 - fy) + bottom * fy - SCRFD_MEAN) / SCRFD_STD;

                // Grayscale replicated into all three channels.
                for c in 0..3 {
                    tensor[[0, c, off_y + y, off_x + x]] = value;
                }
            }
        }

        (tensor, lb)
    }
}

impl FaceDetector for ScrfdDetector {
    /// Rectangles sorted by descending detector score.
    fn detect(&mut self, image: &FaceImage) -> Result<Vec<FaceRect>, DetectorError> {
        let (input, lb) = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in SCRFD_STRIDES.iter().zip(&self.heads) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, bboxes, stride, &lb, SCRFD_SCORE_THRESHOLD));
        }

        let kept = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = kept.len(), "SCRFD detection");
        Ok(kept
            .into_iter()
            .filter_map(|b| b.to_rect(image.width(), image.height()))
            .collect())
    }
}

/// Map stride slots to output tensors by name (`score_8`, `bbox_8`, ...),
/// falling back to the usual export order: scores 0-2, bboxes 3-5.
fn head_indices(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut named = [(0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => named[slot] = (s, b),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    named
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    lb: &Letterbox,
    threshold: f32,
) -> Vec<ScoredBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > threshold)
        .filter_map(|i| {
            let d = bboxes.get(i * 4..i * 4 + 4)?;
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * s;
            let cy = (cell / grid_w) as f32 * s;
            let (x1, y1) = lb.unmap(cx - d[0] * s, cy - d[1] * s);
            let (x2, y2) = lb.unmap(cx + d[2] * s, cy + d[3] * s);
            Some(ScoredBox { x1, y1, x2, y2, score: scores[i] })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by score.
fn nms(mut boxes: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<ScoredBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &ScoredBox, b: &ScoredBox) -> f32 {
    let inter = ScoredBox {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
        score: 0.0,
    }
    .area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Treats every image as a single face filling the frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&mut self, image: &FaceImage) -> Result<Vec<FaceRect>, DetectorError> {
        Ok(vec![image.bounds()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sbox(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> ScoredBox {
        ScoredBox { x1, y1, x2, y2, score }
    }

    #[test]
    fn test_iou() {
        let a = sbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = sbox(5.0, 0.0, 15.0, 10.0, 1.0);
        let c = sbox(20.0, 20.0, 30.0, 30.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                sbox(5.0, 5.0, 105.0, 105.0, 0.8),
                sbox(200.0, 200.0, 250.0, 250.0, 0.7),
                sbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|b| b.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert_eq!(lb.scale, 2.0);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_maps_to_source_coordinates() {
        // One confident anchor at cell (1, 0) of stride 32.
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        let cells = (SCRFD_INPUT_SIZE / 32) * (SCRFD_INPUT_SIZE / 32) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let mut bboxes = vec![0.0f32; cells * 4];
        scores[2] = 0.9;
        bboxes[8..12].copy_from_slice(&[0.5, -3.0, 1.5, 4.0]);

        let boxes = decode_stride(&scores, &bboxes, 32, &lb, 0.5);

        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        // Anchor at (32, 0) in model space; distances scaled by the stride.
        assert!((b.x1 - 8.0).abs() < 1e-4, "{b:?}");
        assert!((b.y1 - 8.0).abs() < 1e-4, "{b:?}");
        assert!((b.x2 - 40.0).abs() < 1e-4, "{b:?}");
        assert!((b.y2 - 24.0).abs() < 1e-4, "{b:?}");
    }

    #[test]
    fn test_scored_box_to_rect_clips() {
        assert_eq!(
            sbox(-4.2, 3.5, 20.1, 9.0, 1.0).to_rect(16, 16),
            Some(FaceRect::new(0, 3, 16, 6))
        );
        assert_eq!(sbox(20.0, 20.0, 30.0, 30.0, 1.0).to_rect(16, 16), None);
    }

    #[test]
    fn test_head_indices() {
        let named: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(head_indices(&named), [(1, 0), (3, 2), (5, 4)]);

        let numeric: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(head_indices(&numeric), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_preprocess_uniform_image() {
        let img = FaceImage::filled(320, 240, 128).unwrap();
        let (tensor, lb) = ScrfdDetector::preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);

        let expected = (128.0 - SCRFD_MEAN) / SCRFD_STD;
        let inside = lb.pad_y as usize + 10;
        assert!((tensor[[0, 0, inside, 10]] - expected).abs() < 1e-6);
        assert_eq!(tensor[[0, 2, inside, 10]], tensor[[0, 0, inside, 10]]);
        // Letterbox band stays at the normalized mean.
        assert_eq!(tensor[[0, 0, 0, 10]], 0.0);
    }

    #[test]
    fn test_full_frame_detector() {
        let img = FaceImage::filled(7, 5, 0).unwrap();
        assert_eq!(
            FullFrameDetector.detect(&img).unwrap(),
            vec![FaceRect::new(0, 0, 7, 5)]
        );
    }

    #[test]
    fn test_load_missing_model() {
        let err = ScrfdDetector::load(Path::new("/nonexistent/det_10g.onnx")).err();
        assert!(matches!(err, Some(DetectorError::ModelNotFound(_))));
    }
}
