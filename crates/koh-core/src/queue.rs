//! Pending faces awaiting commit, at most one per identity.

use crate::store::{ImageStore, StoreError};
use crate::types::{FaceImage, Identity};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("no pending face for identity {0}")]
    NotPending(Identity),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
pub struct TrainingQueue {
    pending: HashMap<Identity, FaceImage>,
}

impl TrainingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pending face for `identity`, returning the one it replaces.
    pub fn enqueue(&mut self, identity: Identity, image: FaceImage) -> Option<FaceImage> {
        let replaced = self.pending.insert(identity.clone(), image);
        if replaced.is_some() {
            tracing::debug!(identity = %identity, "replaced pending face");
        }
        replaced
    }

    pub fn peek(&self, identity: &Identity) -> Result<&FaceImage, QueueError> {
        self.pending
            .get(identity)
            .ok_or_else(|| QueueError::NotPending(identity.clone()))
    }

    pub fn dequeue(&mut self, identity: &Identity) -> Result<FaceImage, QueueError> {
        self.pending
            .remove(identity)
            .ok_or_else(|| QueueError::NotPending(identity.clone()))
    }

    /// Move the pending face of `old` to `new`, replacing whatever `new` had.
    ///
    /// If `old` already has a record in `store`, its latest record is renamed
    /// to `new` as well and the new path is returned. The queue is only
    /// touched once the store step succeeded.
    pub fn reidentify(
        &mut self,
        old: &Identity,
        new: &Identity,
        store: &ImageStore,
    ) -> Result<Option<PathBuf>, QueueError> {
        let image = self.peek(old)?;
        if old == new {
            return Ok(None);
        }

        let renamed = if store.records_for(old)?.is_empty() {
            None
        } else {
            Some(store.rename(old, new, image)?)
        };

        if let Some(image) = self.pending.remove(old) {
            self.pending.insert(new.clone(), image);
        }
        tracing::info!(from = %old, to = %new, "re-identified pending face");
        Ok(renamed)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.pending.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Identities with a pending face, sorted.
    pub fn identities(&self) -> Vec<Identity> {
        let mut ids: Vec<Identity> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }
}
