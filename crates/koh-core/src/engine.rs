//! Recognition engine facade.
//!
//! Detection and recognition are pluggable behind [`FaceDetector`] and
//! [`FaceModel`]. [`RecognitionEngine`] turns whole images into face crops
//! and crops plus labels into training calls.

use crate::detector::DetectorError;
use crate::types::{FaceImage, FaceImageError, FaceRect, Identity};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("face {width}x{height} is too small for the model")]
    FaceTooSmall { width: u32, height: u32 },
    #[error("model backend: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("crop: {0}")]
    Crop(#[from] FaceImageError),
    #[error("prediction requested before the model was trained")]
    ModelNotTrained,
    #[error("{labels} labels for {faces} faces")]
    LengthMismatch { labels: usize, faces: usize },
}

/// Locates faces in a grayscale image.
pub trait FaceDetector: Send {
    /// Zero or more face rectangles. Order and overlap policy are the
    /// detector's own.
    fn detect(&mut self, image: &FaceImage) -> Result<Vec<FaceRect>, DetectorError>;
}

/// Labeled face recognizer. Training only ever adds samples.
pub trait FaceModel: Send {
    /// Add every `(face, label)` pair. Called with non-empty, equal-length
    /// slices.
    fn train(&mut self, faces: &[FaceImage], labels: &[Identity]) -> Result<(), ModelError>;

    /// Closest label and its distance, or `None` when nothing was trained.
    fn predict(&self, face: &FaceImage) -> Result<Option<(Identity, f64)>, ModelError>;

    /// Number of samples trained so far.
    fn sample_count(&self) -> usize;

    /// Smallest width and height the model can train on or score.
    fn min_face_side(&self) -> u32 {
        1
    }
}

/// A detected face and its crop.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub rect: FaceRect,
    pub face: FaceImage,
}

pub struct RecognitionEngine {
    detector: Box<dyn FaceDetector>,
    model: Box<dyn FaceModel>,
}

impl RecognitionEngine {
    pub fn new(detector: Box<dyn FaceDetector>, model: Box<dyn FaceModel>) -> Self {
        Self { detector, model }
    }

    /// Face rectangles clamped to the image; rectangles entirely outside
    /// are dropped. Detector order is preserved.
    pub fn detect(&mut self, image: &FaceImage) -> Result<Vec<FaceRect>, EngineError> {
        let rects = self.detector.detect(image)?;
        Ok(rects
            .iter()
            .filter_map(|r| r.clamp_to(image.width(), image.height()))
            .collect())
    }

    /// Detect and crop every face.
    pub fn detect_faces(&mut self, image: &FaceImage) -> Result<Vec<DetectedFace>, EngineError> {
        self.detect(image)?
            .into_iter()
            .map(|rect| {
                let face = image.crop(&rect)?;
                Ok(DetectedFace { rect, face })
            })
            .collect()
    }

    /// Whether `face` is large enough for the model.
    pub fn accepts(&self, face: &FaceImage) -> bool {
        let min = self.model.min_face_side();
        face.width() >= min && face.height() >= min
    }

    pub fn train_one(&mut self, identity: &Identity, face: &FaceImage) -> Result<(), EngineError> {
        self.model
            .train(std::slice::from_ref(face), std::slice::from_ref(identity))?;
        tracing::debug!(identity = %identity, samples = self.model.sample_count(), "trained face");
        Ok(())
    }

    /// Train on parallel slices. An empty batch is a no-op.
    pub fn train_many(
        &mut self,
        identities: &[Identity],
        faces: &[FaceImage],
    ) -> Result<(), EngineError> {
        if identities.len() != faces.len() {
            return Err(EngineError::LengthMismatch {
                labels: identities.len(),
                faces: faces.len(),
            });
        }
        if faces.is_empty() {
            tracing::debug!("empty training batch; nothing to do");
            return Ok(());
        }
        self.model.train(faces, identities)?;
        tracing::info!(
            batch = faces.len(),
            samples = self.model.sample_count(),
            "trained face batch"
        );
        Ok(())
    }

    pub fn predict(&self, face: &FaceImage) -> Result<(Identity, f64), EngineError> {
        self.model.predict(face)?.ok_or(EngineError::ModelNotTrained)
    }

    /// `confidence < threshold`. Equal to the threshold is not a match:
    /// confidence is a distance, and the threshold is exclusive.
    pub fn is_match(confidence: f64, threshold: f64) -> bool {
        confidence < threshold
    }

    pub fn is_trained(&self) -> bool {
        self.model.sample_count() > 0
    }

    pub fn sample_count(&self) -> usize {
        self.model.sample_count()
    }
}
