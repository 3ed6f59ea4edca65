//! koh-core: face corpus bookkeeping and recognition.
//!
//! Labeled face images live in one flat directory named
//! `identity<ID>.<SEQ>.<EXT>`. Faces waiting for confirmation sit in a
//! training queue; committing one trains the model and appends it to the
//! corpus. Detection (SCRFD via ONNX Runtime) and recognition (LBPH) sit
//! behind traits so either can be swapped.

pub mod codec;
pub mod config;
pub mod detector;
pub mod engine;
pub mod lbph;
pub mod queue;
pub mod recognizer;
pub mod store;
pub mod types;

pub use config::{BusKind, Config, DetectorKind};
pub use engine::{FaceDetector, FaceModel, RecognitionEngine};
pub use queue::TrainingQueue;
pub use recognizer::{Recognizer, RecognizerError, Status};
pub use store::ImageStore;
pub use types::{FaceImage, FaceRect, Identity, PredictionResult};
