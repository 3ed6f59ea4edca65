//! Identity lifecycle coordinator.
//!
//! [`Recognizer`] ties the corpus, the pending queue and the engine
//! together: detect, predict, accept or correct, then commit (train and
//! persist). It takes `&mut self` for every mutation, so one instance is
//! one serialization point; share it behind a single owner thread or lock.

use crate::codec::{self, CodecError};
use crate::config::{Config, DetectorKind};
use crate::detector::{FullFrameDetector, ScrfdDetector};
use crate::engine::{EngineError, FaceDetector, RecognitionEngine};
use crate::lbph::LbphModel;
use crate::queue::{QueueError, TrainingQueue};
use crate::store::{ImageStore, StoreError};
use crate::types::{FaceImage, Identity, PredictionResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
    #[error("image {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
}

/// Snapshot of corpus, queue and model sizes.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub faces_dir: PathBuf,
    pub identities: usize,
    pub records: usize,
    pub pending: Vec<Identity>,
    pub trained_samples: usize,
}

pub struct Recognizer {
    store: ImageStore,
    queue: TrainingQueue,
    engine: RecognitionEngine,
    confidence_threshold: f64,
}

impl Recognizer {
    pub fn new(store: ImageStore, engine: RecognitionEngine, confidence_threshold: f64) -> Self {
        Self {
            store,
            queue: TrainingQueue::new(),
            engine,
            confidence_threshold,
        }
    }

    /// Build the store, detector and an empty LBPH model from `config`.
    ///
    /// Fails if the configured detector model cannot be loaded.
    pub fn from_config(config: &Config) -> Result<Self, RecognizerError> {
        let store = config.store();

        let detector: Box<dyn FaceDetector> = match config.detector {
            DetectorKind::Scrfd => {
                let path = config.scrfd_model_path();
                let detector = ScrfdDetector::load(&path).map_err(EngineError::from)?;
                Box::new(detector)
            }
            DetectorKind::FullFrame => Box::new(FullFrameDetector),
        };
        tracing::info!(detector = ?config.detector, faces_dir = %config.faces_dir.display(), "recognizer configured");

        let engine = RecognitionEngine::new(detector, Box::new(LbphModel::new()));
        Ok(Self::new(store, engine, config.confidence_threshold))
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn queue(&self) -> &TrainingQueue {
        &self.queue
    }

    pub fn engine(&self) -> &RecognitionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut RecognitionEngine {
        &mut self.engine
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Train on every face found in the corpus, in one batch.
    pub fn bulk_train_from_store(&mut self) -> Result<usize, RecognizerError> {
        let store = self.store.clone();
        self.train_from(&store)
    }

    /// Train on a directory that follows the corpus naming convention.
    pub fn bulk_train_from_dir(&mut self, dir: &Path) -> Result<usize, RecognizerError> {
        let seed = self.store.at(dir);
        self.train_from(&seed)
    }

    fn train_from(&mut self, store: &ImageStore) -> Result<usize, RecognizerError> {
        // One listing for the whole pass; files appearing later are not seen.
        let records = store.records()?;
        tracing::info!(dir = %store.root().display(), records = records.len(), "training from corpus");

        let mut labels = Vec::new();
        let mut faces = Vec::new();
        for record in &records {
            let image = match codec::load_grayscale(&record.path) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(path = %record.path.display(), error = %e, "skipping unreadable corpus image");
                    continue;
                }
            };
            let detected = match self.engine.detect_faces(&image) {
                Ok(detected) => detected,
                Err(e) => {
                    tracing::warn!(path = %record.path.display(), error = %e, "skipping corpus image, detection failed");
                    continue;
                }
            };
            if detected.is_empty() {
                tracing::debug!(path = %record.path.display(), "no face in corpus image");
            }
            for d in detected {
                if !self.engine.accepts(&d.face) {
                    tracing::warn!(
                        path = %record.path.display(),
                        rect = ?d.rect,
                        "skipping face crop too small for the model"
                    );
                    continue;
                }
                labels.push(record.identity.clone());
                faces.push(d.face);
            }
        }

        self.engine.train_many(&labels, &faces)?;
        tracing::info!(faces = faces.len(), images = records.len(), "corpus training done");
        Ok(faces.len())
    }

    /// Detect every face and predict each one, in detection order. Crops
    /// too small for the model are skipped.
    pub fn predict_in_image(
        &mut self,
        image: &FaceImage,
    ) -> Result<Vec<PredictionResult>, RecognizerError> {
        let detected = self.engine.detect_faces(image)?;
        let mut results = Vec::with_capacity(detected.len());
        for d in detected {
            if !self.engine.accepts(&d.face) {
                tracing::warn!(rect = ?d.rect, "skipping face crop too small for the model");
                continue;
            }
            let (identity, confidence) = self.engine.predict(&d.face)?;
            tracing::debug!(identity = %identity, confidence, rect = ?d.rect, "prediction");
            results.push(PredictionResult {
                face: d.face,
                rect: d.rect,
                identity,
                confidence,
            });
        }
        Ok(results)
    }

    pub fn predict_in_file(
        &mut self,
        path: &Path,
    ) -> Result<Vec<PredictionResult>, RecognizerError> {
        let image = codec::load_grayscale(path).map_err(|source| RecognizerError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        self.predict_in_image(&image)
    }

    /// Whether `result` clears the configured threshold.
    pub fn is_positive(&self, result: &PredictionResult) -> bool {
        RecognitionEngine::is_match(result.confidence, self.confidence_threshold)
    }

    /// Queue the predicted face under its predicted identity.
    pub fn accept(&mut self, result: PredictionResult) {
        tracing::info!(identity = %result.identity, confidence = result.confidence, "prediction accepted");
        self.queue.enqueue(result.identity, result.face);
    }

    /// Queue a face under an identity the caller vouches for.
    pub fn queue_face(&mut self, identity: Identity, face: FaceImage) {
        self.queue.enqueue(identity, face);
    }

    /// Relabel a pending face before commit. Returns the renamed record, if
    /// the old identity had one on disk.
    pub fn correct(
        &mut self,
        old: &Identity,
        new: &Identity,
    ) -> Result<Option<PathBuf>, RecognizerError> {
        Ok(self.queue.reidentify(old, new, &self.store)?)
    }

    /// Train on the pending face of `identity`, then save it to the corpus.
    ///
    /// If training fails the face goes back to the queue and nothing is
    /// written. If saving fails after training, the model keeps the sample;
    /// the error is returned and logged as a partial commit.
    pub fn commit(&mut self, identity: &Identity) -> Result<PathBuf, RecognizerError> {
        let face = self.queue.dequeue(identity)?;

        if let Err(e) = self.engine.train_one(identity, &face) {
            self.queue.enqueue(identity.clone(), face);
            return Err(e.into());
        }

        match self.store.save(identity, &face) {
            Ok(path) => {
                tracing::info!(identity = %identity, path = %path.display(), "committed face");
                Ok(path)
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "partial commit: trained but not saved");
                Err(e.into())
            }
        }
    }

    /// Persist a prediction's crop under its predicted identity, without
    /// training.
    pub fn save_prediction(&self, result: &PredictionResult) -> Result<PathBuf, RecognizerError> {
        Ok(self.store.save(&result.identity, &result.face)?)
    }

    pub fn status(&self) -> Result<Status, RecognizerError> {
        let records = self.store.records()?;
        let mut ids: Vec<&Identity> = records.iter().map(|r| &r.identity).collect();
        ids.dedup();
        Ok(Status {
            faces_dir: self.store.root().to_path_buf(),
            identities: ids.len(),
            records: records.len(),
            pending: self.queue.identities(),
            trained_samples: self.engine.sample_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{FixedDetector, RecordingModel};
    use crate::engine::FaceModel;
    use crate::types::FaceRect;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn face(value: u8) -> FaceImage {
        FaceImage::filled(8, 8, value).unwrap()
    }

    fn recognizer(dir: &Path, detector: FixedDetector, model: RecordingModel) -> Recognizer {
        let store = ImageStore::new(dir).with_extension("png");
        let engine = RecognitionEngine::new(Box::new(detector), Box::new(model));
        Recognizer::new(store, engine, 50.0)
    }

    fn whole(size: u32) -> FixedDetector {
        FixedDetector(vec![FaceRect::new(0, 0, size, size)])
    }

    #[test]
    fn test_commit_trains_then_persists() {
        let dir = tempfile::tempdir().unwrap();
        let model = RecordingModel::default();
        let mut rec = recognizer(dir.path(), whole(8), model.clone());
        rec.store().save(&id("7"), &face(1)).unwrap();

        rec.queue_face(id("7"), face(77));
        let path = rec.commit(&id("7")).unwrap();

        assert_eq!(path, dir.path().join("identity7.001.png"));
        let samples = model.samples.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0, id("7"));
        assert_eq!(samples[0].1, face(77));
        drop(samples);
        assert!(matches!(
            rec.queue().peek(&id("7")),
            Err(QueueError::NotPending(_))
        ));
    }

    #[test]
    fn test_commit_without_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recognizer(dir.path(), whole(8), RecordingModel::default());
        assert!(matches!(
            rec.commit(&id("1")),
            Err(RecognizerError::Queue(QueueError::NotPending(_)))
        ));
    }

    #[test]
    fn test_failed_training_writes_nothing_and_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let model = RecordingModel {
            fail_training: true,
            ..Default::default()
        };
        let mut rec = recognizer(dir.path(), whole(8), model);
        rec.queue_face(id("7"), face(5));

        assert!(matches!(rec.commit(&id("7")), Err(RecognizerError::Engine(_))));
        assert!(rec.store().records().unwrap().is_empty());
        assert_eq!(rec.queue().peek(&id("7")).unwrap(), &face(5));
    }

    #[test]
    fn test_failed_save_keeps_training() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the corpus directory should be.
        let blocked = dir.path().join("faces");
        std::fs::write(&blocked, b"").unwrap();
        let model = RecordingModel::default();
        let mut rec = recognizer(&blocked, whole(8), model.clone());
        rec.queue_face(id("7"), face(5));

        assert!(matches!(rec.commit(&id("7")), Err(RecognizerError::Store(_))));
        assert_eq!(model.sample_count(), 1);
        assert!(!rec.queue().contains(&id("7")));
    }

    #[test]
    fn test_predict_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recognizer(dir.path(), whole(8), RecordingModel::default());
        let err = rec.predict_in_image(&face(0)).unwrap_err();
        assert!(matches!(err, RecognizerError::Engine(EngineError::ModelNotTrained)));
    }

    #[test]
    fn test_predict_keeps_detection_order() {
        let dir = tempfile::tempdir().unwrap();
        let detector = FixedDetector(vec![FaceRect::new(4, 0, 4, 4), FaceRect::new(0, 0, 4, 4)]);
        let mut rec = recognizer(dir.path(), detector, RecordingModel::default());
        rec.engine_mut().train_one(&id("dark"), &face(0)).unwrap();
        rec.engine_mut().train_one(&id("light"), &face(255)).unwrap();

        // Left half dark, right half light.
        let image = FaceImage::from_fn(8, 4, |x, _| if x < 4 { 0 } else { 255 }).unwrap();
        let results = rec.predict_in_image(&image).unwrap();

        let ids: Vec<&str> = results.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(ids, vec!["light", "dark"]);
        assert_eq!(results[0].rect, FaceRect::new(4, 0, 4, 4));
        assert_eq!(results[0].confidence, 0.0);
        assert!(rec.is_positive(&results[0]));
    }

    #[test]
    fn test_is_positive_uses_threshold_strictly() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recognizer(dir.path(), whole(8), RecordingModel::default());
        let mut result = PredictionResult {
            face: face(0),
            rect: FaceRect::new(0, 0, 8, 8),
            identity: id("1"),
            confidence: 50.0,
        };
        assert!(!rec.is_positive(&result));
        result.confidence = 49.999;
        assert!(rec.is_positive(&result));
    }

    #[test]
    fn test_accept_correct_commit_flow() {
        let dir = tempfile::tempdir().unwrap();
        let model = RecordingModel::default();
        let mut rec = recognizer(dir.path(), whole(8), model.clone());
        rec.engine_mut().train_one(&id("3"), &face(100)).unwrap();

        let results = rec.predict_in_image(&face(90)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].identity, id("3"));

        // Reviewer says it's actually 4.
        rec.accept(results.into_iter().next().unwrap());
        assert!(rec.correct(&id("3"), &id("4")).unwrap().is_none());
        let path = rec.commit(&id("4")).unwrap();

        assert_eq!(path, dir.path().join("identity4.000.png"));
        assert!(rec.queue().is_empty());
        let samples = model.samples.lock().unwrap();
        assert_eq!(samples.last().unwrap().0, id("4"));
    }

    #[test]
    fn test_correct_unknown_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recognizer(dir.path(), whole(8), RecordingModel::default());
        assert!(matches!(
            rec.correct(&id("1"), &id("2")),
            Err(RecognizerError::Queue(QueueError::NotPending(_)))
        ));
    }

    #[test]
    fn test_bulk_train_skips_bad_files_and_batches() {
        let dir = tempfile::tempdir().unwrap();
        let seed = ImageStore::new(dir.path()).with_extension("png");
        seed.save(&id("1"), &face(10)).unwrap();
        seed.save(&id("1"), &face(20)).unwrap();
        seed.save(&id("2"), &face(200)).unwrap();
        std::fs::write(dir.path().join("identityX.abc.png"), b"").unwrap();
        std::fs::write(dir.path().join("identity3.000.png"), b"not an image").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let model = RecordingModel::default();
        let mut rec = recognizer(dir.path(), whole(8), model.clone());
        let trained = rec.bulk_train_from_store().unwrap();

        assert_eq!(trained, 3);
        let labels: Vec<Identity> = model.samples.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        assert_eq!(labels, vec![id("1"), id("1"), id("2")]);
        assert_eq!(rec.predict_in_image(&face(195)).unwrap()[0].identity, id("2"));
    }

    #[test]
    fn test_bulk_train_crops_every_detected_face() {
        let dir = tempfile::tempdir().unwrap();
        let seed = ImageStore::new(dir.path()).with_extension("png");
        seed.save(&id("5"), &FaceImage::filled(8, 4, 60).unwrap()).unwrap();

        let detector = FixedDetector(vec![FaceRect::new(0, 0, 4, 4), FaceRect::new(4, 0, 4, 4)]);
        let model = RecordingModel::default();
        let mut rec = recognizer(dir.path(), detector, model.clone());

        assert_eq!(rec.bulk_train_from_store().unwrap(), 2);
        let samples = model.samples.lock().unwrap();
        assert!(samples.iter().all(|(l, f)| l == &id("5") && f.width() == 4));
    }

    /// Left crop is usable; the right one is clamped to a 2px sliver.
    fn edge_sliver_detector() -> FixedDetector {
        FixedDetector(vec![FaceRect::new(0, 0, 6, 8), FaceRect::new(6, 0, 10, 8)])
    }

    fn lbph_recognizer(dir: &Path) -> Recognizer {
        let store = ImageStore::new(dir).with_extension("png");
        let engine = RecognitionEngine::new(
            Box::new(edge_sliver_detector()),
            Box::new(LbphModel::with_grid(2, 2)),
        );
        Recognizer::new(store, engine, 50.0)
    }

    fn textured(seed: u32) -> FaceImage {
        FaceImage::from_fn(8, 8, |x, y| ((x * 37 + y * 11 + seed * 53) % 256) as u8).unwrap()
    }

    #[test]
    fn test_bulk_train_skips_crops_too_small_for_model() {
        let dir = tempfile::tempdir().unwrap();
        let seed = ImageStore::new(dir.path()).with_extension("png");
        for (i, name) in ["1", "2", "3"].into_iter().enumerate() {
            seed.save(&id(name), &textured(i as u32)).unwrap();
        }

        let mut rec = lbph_recognizer(dir.path());
        assert_eq!(rec.bulk_train_from_store().unwrap(), 3);
        assert_eq!(rec.engine().sample_count(), 3);

        let results = rec.predict_in_image(&textured(1)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].identity, id("2"));
    }

    #[test]
    fn test_predict_skips_crops_too_small_for_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = lbph_recognizer(dir.path());
        let image = textured(0);
        let face = image.crop(&FaceRect::new(0, 0, 6, 8)).unwrap();
        rec.engine_mut().train_one(&id("7"), &face).unwrap();

        let results = rec.predict_in_image(&image).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rect, FaceRect::new(0, 0, 6, 8));
        assert_eq!(results[0].identity, id("7"));
        assert!(results[0].confidence.abs() < 1e-9);
    }

    #[test]
    fn test_bulk_train_empty_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let model = RecordingModel::default();
        let mut rec = recognizer(&dir.path().join("missing"), whole(8), model.clone());
        assert_eq!(rec.bulk_train_from_store().unwrap(), 0);
        assert_eq!(model.sample_count(), 0);
    }

    #[test]
    fn test_bulk_train_from_other_dir() {
        let corpus = tempfile::tempdir().unwrap();
        let seed_dir = tempfile::tempdir().unwrap();
        ImageStore::new(seed_dir.path())
            .with_extension("png")
            .save(&id("9"), &face(30))
            .unwrap();

        let model = RecordingModel::default();
        let mut rec = recognizer(corpus.path(), whole(8), model.clone());
        assert_eq!(rec.bulk_train_from_dir(seed_dir.path()).unwrap(), 1);
        assert!(rec.store().records().unwrap().is_empty());
    }

    #[test]
    fn test_save_prediction_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recognizer(dir.path(), whole(8), RecordingModel::default());
        let result = PredictionResult {
            face: face(9),
            rect: FaceRect::new(0, 0, 8, 8),
            identity: id("12"),
            confidence: 3.0,
        };
        let path = rec.save_prediction(&result).unwrap();
        assert_eq!(path, dir.path().join("identity12.000.png"));

        rec.queue_face(id("13"), face(1));
        let status = rec.status().unwrap();
        assert_eq!(status.identities, 1);
        assert_eq!(status.records, 1);
        assert_eq!(status.pending, vec![id("13")]);
        assert_eq!(status.trained_samples, 0);
    }
}
