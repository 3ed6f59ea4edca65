use crate::store::{ImageStore, DEFAULT_EXTENSION, DEFAULT_PADDING, DEFAULT_PREFIX};
use std::path::PathBuf;

/// File name of the SCRFD detection model inside `model_dir`.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

/// Which detector the recognizer is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    /// SCRFD ONNX model from `model_dir`.
    Scrfd,
    /// Whole image is one face; for pre-cropped corpora.
    FullFrame,
}

impl DetectorKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scrfd" => Some(Self::Scrfd),
            "full-frame" | "fullframe" | "none" => Some(Self::FullFrame),
            _ => None,
        }
    }
}

/// Message bus `kohd` serves on and the CLI talks to (`KOH_BUS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl BusKind {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Self::System,
            _ => Self::Session,
        }
    }

    pub fn from_env() -> Self {
        std::env::var("KOH_BUS")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

/// Recognizer configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Corpus directory (default: `$XDG_DATA_HOME/koh/faces`).
    pub faces_dir: PathBuf,
    /// Record file name prefix (default: `identity`).
    pub file_prefix: String,
    /// Zero-padding width of the sequence field (default: 3).
    pub sequence_padding: usize,
    /// Extension, and so format, of newly saved records (default: `jpg`).
    pub image_extension: String,
    /// A prediction matches when its confidence is strictly below this.
    pub confidence_threshold: f64,
    /// Cap on stored records per identity. `None` keeps everything.
    pub max_images_per_identity: Option<usize>,
    pub detector: DetectorKind,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            faces_dir: data_dir.join("faces"),
            file_prefix: DEFAULT_PREFIX.to_string(),
            sequence_padding: DEFAULT_PADDING,
            image_extension: DEFAULT_EXTENSION.to_string(),
            confidence_threshold: 100.0,
            max_images_per_identity: None,
            detector: DetectorKind::Scrfd,
            model_dir: data_dir.join("models"),
        }
    }
}

impl Config {
    /// Load configuration from `KOH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let detector = match std::env::var("KOH_DETECTOR") {
            Ok(v) => DetectorKind::parse(&v).unwrap_or_else(|| {
                tracing::warn!(value = %v, "unknown KOH_DETECTOR; using scrfd");
                DetectorKind::Scrfd
            }),
            Err(_) => defaults.detector,
        };

        Self {
            faces_dir: env_path("KOH_FACES_DIR").unwrap_or(defaults.faces_dir),
            file_prefix: std::env::var("KOH_FILE_PREFIX").unwrap_or(defaults.file_prefix),
            sequence_padding: env_parse("KOH_SEQUENCE_PADDING", defaults.sequence_padding),
            image_extension: std::env::var("KOH_IMAGE_EXTENSION")
                .unwrap_or(defaults.image_extension),
            confidence_threshold: env_parse(
                "KOH_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            ),
            max_images_per_identity: std::env::var("KOH_MAX_IMAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0),
            detector,
            model_dir: env_path("KOH_MODEL_DIR").unwrap_or(defaults.model_dir),
        }
    }

    /// Corpus store with the configured naming and cap.
    pub fn store(&self) -> ImageStore {
        ImageStore::new(&self.faces_dir)
            .with_prefix(self.file_prefix.clone())
            .with_padding(self.sequence_padding)
            .with_extension(self.image_extension.clone())
            .with_max_images(self.max_images_per_identity)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("koh")
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
