//! On-disk face corpus.
//!
//! A flat directory with one file per stored face, named
//! `<prefix><identity>.<sequence>.<ext>`, e.g. `identity7.002.jpg`. The
//! sequence is zero-padded to a fixed width and scoped per identity. The
//! next sequence for an identity is always `max(existing) + 1`, or `0`.
//!
//! This module is the only place that formats or parses record names.
//! Files that don't follow the convention are skipped during scans.

use crate::codec::{self, CodecError};
use crate::types::{FaceImage, Identity, IdentityError};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_PREFIX: &str = "identity";
pub const DEFAULT_PADDING: usize = 3;
pub const DEFAULT_EXTENSION: &str = "jpg";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no stored image for identity {0}")]
    NotFound(Identity),
    #[error("no stored image {identity} #{sequence}")]
    SequenceNotFound { identity: Identity, sequence: u32 },
    #[error("sequence numbers exhausted for identity {0}")]
    SequenceExhausted(Identity),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
}

/// Why a file name is not a corpus record. Logged during scans, never
/// returned from store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordNameError {
    #[error("missing prefix {0:?}")]
    MissingPrefix(String),
    #[error("expected <prefix><identity>.<sequence>.<ext>")]
    Shape,
    #[error("bad identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("bad sequence {0:?}")]
    Sequence(String),
}

/// Parsed form of a record file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordName {
    pub identity: Identity,
    pub sequence: u32,
    pub extension: String,
}

impl RecordName {
    pub fn parse(file_name: &str, prefix: &str) -> Result<Self, RecordNameError> {
        let rest = file_name
            .strip_prefix(prefix)
            .ok_or_else(|| RecordNameError::MissingPrefix(prefix.to_string()))?;

        let mut parts = rest.split('.');
        let (Some(id), Some(seq), Some(ext), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RecordNameError::Shape);
        };
        if ext.is_empty() {
            return Err(RecordNameError::Shape);
        }

        let identity = Identity::new(id)?;
        // Digits only: `u32::from_str` would also take a leading '+'.
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RecordNameError::Sequence(seq.to_string()));
        }
        let sequence = seq
            .parse()
            .map_err(|_| RecordNameError::Sequence(seq.to_string()))?;

        Ok(Self {
            identity,
            sequence,
            extension: ext.to_string(),
        })
    }

    pub fn format(&self, prefix: &str, padding: usize) -> String {
        format!(
            "{prefix}{}.{:0padding$}.{}",
            self.identity, self.sequence, self.extension
        )
    }
}

/// A parsed record found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub identity: Identity,
    pub sequence: u32,
    pub path: PathBuf,
}

/// Numbered face image files under one root directory.
///
/// Not safe against concurrent writers for the same identity: the
/// sequence scan and the write are separate steps. Callers serialize.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
    prefix: String,
    padding: usize,
    extension: String,
    max_images: Option<usize>,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            padding: DEFAULT_PADDING,
            extension: DEFAULT_EXTENSION.to_string(),
            max_images: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Keep at most `max` records per identity; older ones are pruned on save.
    pub fn with_max_images(mut self, max: Option<usize>) -> Self {
        self.max_images = max;
        self
    }

    /// Same naming rules, different directory.
    pub fn at(&self, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..self.clone()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a record with this identity and sequence gets when saved.
    pub fn path_for(&self, identity: &Identity, sequence: u32) -> PathBuf {
        let name = RecordName {
            identity: identity.clone(),
            sequence,
            extension: self.extension.clone(),
        };
        self.root.join(name.format(&self.prefix, self.padding))
    }

    /// One listing of the root, parsed and sorted by (identity, sequence).
    ///
    /// A missing root is an empty corpus.
    pub fn records(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(&self.root, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.io_err(&self.root, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::debug!(path = %path.display(), "skipping non-UTF-8 file name");
                continue;
            };

            match RecordName::parse(file_name, &self.prefix) {
                Ok(name) => records.push(StoredRecord {
                    identity: name.identity,
                    sequence: name.sequence,
                    path,
                }),
                Err(RecordNameError::MissingPrefix(_)) => {
                    tracing::debug!(file = file_name, "ignoring unrelated file");
                }
                Err(e) => {
                    tracing::warn!(file = file_name, error = %e, "skipping malformed corpus file");
                }
            }
        }

        records.sort_by(|a, b| {
            (&a.identity, a.sequence, &a.path).cmp(&(&b.identity, b.sequence, &b.path))
        });
        Ok(records)
    }

    /// Records of one identity, lowest sequence first.
    pub fn records_for(&self, identity: &Identity) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| &r.identity == identity)
            .collect())
    }

    /// Distinct identities with at least one record.
    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let mut ids: Vec<Identity> = self.records()?.into_iter().map(|r| r.identity).collect();
        ids.dedup();
        Ok(ids)
    }

    /// `max(existing) + 1`, or `0` when the identity has no records.
    pub fn next_sequence_number(&self, identity: &Identity) -> Result<u32, StoreError> {
        match self.records_for(identity)?.iter().map(|r| r.sequence).max() {
            None => Ok(0),
            Some(max) => max
                .checked_add(1)
                .ok_or_else(|| StoreError::SequenceExhausted(identity.clone())),
        }
    }

    /// Write `image` as the next record of `identity` and return its path.
    pub fn save(&self, identity: &Identity, image: &FaceImage) -> Result<PathBuf, StoreError> {
        let path = self.write_next(identity, image)?;
        self.enforce_cap(identity)?;
        Ok(path)
    }

    /// Move the latest record of `old` to `new`, storing `image` as its content.
    ///
    /// The new record is written and synced before the old one is removed,
    /// so a crash in between leaves a duplicate rather than nothing.
    pub fn rename(
        &self,
        old: &Identity,
        new: &Identity,
        image: &FaceImage,
    ) -> Result<PathBuf, StoreError> {
        let latest = self
            .records_for(old)?
            .pop()
            .ok_or_else(|| StoreError::NotFound(old.clone()))?;

        let path = self.write_next(new, image)?;
        std::fs::remove_file(&latest.path).map_err(|e| self.io_err(&latest.path, e))?;
        tracing::info!(
            from = %latest.path.display(),
            to = %path.display(),
            "re-identified stored image"
        );

        self.enforce_cap(new)?;
        Ok(path)
    }

    /// Remove the record `identity`/`sequence`, whatever its extension.
    pub fn delete(&self, identity: &Identity, sequence: u32) -> Result<(), StoreError> {
        let record = self
            .records_for(identity)?
            .into_iter()
            .find(|r| r.sequence == sequence)
            .ok_or_else(|| StoreError::SequenceNotFound {
                identity: identity.clone(),
                sequence,
            })?;
        std::fs::remove_file(&record.path).map_err(|e| self.io_err(&record.path, e))?;
        tracing::debug!(path = %record.path.display(), "deleted stored image");
        Ok(())
    }

    fn write_next(&self, identity: &Identity, image: &FaceImage) -> Result<PathBuf, StoreError> {
        std::fs::create_dir_all(&self.root).map_err(|e| self.io_err(&self.root, e))?;

        let sequence = self.next_sequence_number(identity)?;
        let path = self.path_for(identity, sequence);
        codec::save_grayscale_new(image, &path).map_err(|source| StoreError::Codec {
            path: path.clone(),
            source,
        })?;

        tracing::info!(identity = %identity, sequence, path = %path.display(), "saved face image");
        Ok(path)
    }

    fn enforce_cap(&self, identity: &Identity) -> Result<(), StoreError> {
        let Some(max) = self.max_images else {
            return Ok(());
        };
        let records = self.records_for(identity)?;
        let excess = records.len().saturating_sub(max);
        for record in records.iter().take(excess) {
            std::fs::remove_file(&record.path).map_err(|e| self.io_err(&record.path, e))?;
            tracing::info!(
                identity = %identity,
                sequence = record.sequence,
                max,
                "pruned oldest face image"
            );
        }
        Ok(())
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
