//! Turns one image into index entries.

use std::sync::Arc;

use serde::Serialize;

use crate::faces::extractor::{ExtractError, FeatureExtractor};
use crate::faces::naming;
use crate::faces::snapshot::IndexEntry;
use crate::faces::store::{StoreError, VectorStore};

/// Error type for ingesting a single image
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid source key: {0:?}")]
    InvalidSourceKey(String),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Store(e) if e.is_retryable())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The extractor found nothing. The store was not touched.
    NoFaceDetected,
    Indexed {
        identifiers: Vec<String>,
        /// Faces found before truncation to the per-image cap.
        detected: usize,
    },
}

pub struct IngestWorker {
    store: Arc<VectorStore>,
    extractor: Arc<dyn FeatureExtractor>,
    max_faces_per_image: usize,
}

impl IngestWorker {
    pub fn new(
        store: Arc<VectorStore>,
        extractor: Arc<dyn FeatureExtractor>,
        max_faces_per_image: usize,
    ) -> Self {
        Self {
            store,
            extractor,
            max_faces_per_image,
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Extract every face in `image` and append them to the store as one
    /// batch, named `<source_key>_face_1..n`.
    pub fn ingest(&self, source_key: &str, image: &[u8]) -> Result<IngestOutcome, IngestError> {
        if !naming::is_valid_source_key(source_key) {
            return Err(IngestError::InvalidSourceKey(source_key.to_string()));
        }

        let mut vectors = self.extractor.extract(image)?;
        let detected = vectors.len();

        if detected == 0 {
            log::info!("no face detected in {source_key}");
            return Ok(IngestOutcome::NoFaceDetected);
        }

        if detected > self.max_faces_per_image {
            log::warn!(
                "{source_key}: {detected} faces detected, keeping the first {}",
                self.max_faces_per_image
            );
            vectors.truncate(self.max_faces_per_image);
        }

        let entries: Vec<IndexEntry> = vectors
            .into_iter()
            .enumerate()
            .map(|(i, vector)| {
                IndexEntry::new(naming::face_identifier(source_key, i), source_key, vector)
            })
            .collect();
        let identifiers: Vec<String> = entries.iter().map(|e| e.identifier.clone()).collect();

        if let Err(err) = self.store.append_batch(entries) {
            if let StoreError::Write(_) = err {
                // The blob may or may not hold the batch; resync with it.
                if let Err(reload_err) = self.store.reload() {
                    log::error!("failed to reload index after write error: {reload_err}");
                }
            }
            return Err(err.into());
        }

        log::info!("indexed {} face(s) from {source_key}", identifiers.len());

        Ok(IngestOutcome::Indexed {
            identifiers,
            detected,
        })
    }
}
