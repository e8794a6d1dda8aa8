//! Durable, append-only face index.
//!
//! Writers are serialized by `writer`. Each append builds the next snapshot
//! off to the side, persists it, and only then publishes it by swapping the
//! `Arc` held in `current`. A failed write therefore leaves the published
//! snapshot untouched, and readers holding an older `Arc` keep a consistent
//! view.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, RwLock};

use crate::faces::codec::{self, CodecError};
use crate::faces::snapshot::{IndexEntry, Snapshot};
use crate::faces::vector::FeatureVector;
use crate::storage::StorageManager;

/// Blob key of the index inside its storage namespace.
pub const INDEX_KEY: &str = "faces.bin";

/// Errors raised by the vector store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Persisted index could not be decoded. Fatal at startup.
    #[error("face index is corrupt: {0}")]
    Corrupt(#[source] CodecError),

    #[error("face index was built with a different extractor model")]
    ModelMismatch,

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("failed to read face index: {0}")]
    Read(#[source] io::Error),

    /// Persisting failed; the append was not committed.
    #[error("failed to persist face index: {0}")]
    Write(#[source] io::Error),

    #[error("failed to encode face index: {0}")]
    Encode(#[source] CodecError),

    #[error("identifier {0:?} already exists in the index")]
    DuplicateIdentifier(String),

    #[error("invalid entry {identifier:?}: {reason}")]
    InvalidEntry { identifier: String, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CodecError> for StoreError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ModelMismatch => StoreError::ModelMismatch,
            CodecError::DimensionMismatch { expected, got } => {
                StoreError::DimensionMismatch { expected, got }
            }
            other => StoreError::Corrupt(other),
        }
    }
}

impl StoreError {
    /// Errors that may succeed if the same append is retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Write(_))
    }
}

pub struct VectorStore {
    blob: Arc<dyn StorageManager>,
    key: String,
    model_id: [u8; 32],
    dimensions: usize,
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl VectorStore {
    /// Load the index from `blob`, starting empty when nothing was persisted
    /// yet.
    pub fn load(
        blob: Arc<dyn StorageManager>,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, StoreError> {
        Self::load_key(blob, INDEX_KEY, model_id, dimensions)
    }

    fn load_key(
        blob: Arc<dyn StorageManager>,
        key: &str,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, StoreError> {
        let snapshot = match blob.read(key) {
            Ok(bytes) => {
                let snapshot = codec::decode(&bytes, &model_id, dimensions)?;
                log::info!("Loaded {} face vectors from {key}", snapshot.len());
                snapshot
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::info!("No existing face index, starting fresh");
                Snapshot::empty(dimensions)
            }
            Err(err) => return Err(StoreError::Read(err)),
        };

        Ok(Self {
            blob,
            key: key.to_string(),
            model_id,
            dimensions,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_id(&self) -> &[u8; 32] {
        &self.model_id
    }

    /// Consistent point-in-time view.
    pub fn snapshot_view(&self) -> Result<Arc<Snapshot>, StoreError> {
        self.current
            .read()
            .map(|guard| Arc::clone(&*guard))
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.snapshot_view().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a single entry and persist.
    pub fn append(
        &self,
        identifier: &str,
        source_key: &str,
        vector: FeatureVector,
    ) -> Result<(), StoreError> {
        self.append_batch(vec![IndexEntry::new(identifier, source_key, vector)])
            .map(|_| ())
    }

    /// Append all `entries` atomically and persist. Returns the new entry
    /// count.
    ///
    /// Either every entry becomes visible together or none does.
    pub fn append_batch(&self, entries: Vec<IndexEntry>) -> Result<usize, StoreError> {
        let _writer = self
            .writer
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;

        let base = self.snapshot_view()?;
        if entries.is_empty() {
            return Ok(base.len());
        }

        self.validate(&base, &entries)?;

        let next = base.with_appended(entries);
        let bytes = codec::encode(&next, &self.model_id).map_err(StoreError::Encode)?;
        self.blob.write(&self.key, &bytes).map_err(StoreError::Write)?;

        let len = next.len();
        let mut current = self
            .current
            .write()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        *current = Arc::new(next);

        log::debug!("face index now holds {len} vectors");
        Ok(len)
    }

    /// Re-read the persisted blob and replace the in-memory snapshot.
    ///
    /// Used to resynchronise after a write error left the on-disk state in
    /// doubt.
    pub fn reload(&self) -> Result<usize, StoreError> {
        let _writer = self
            .writer
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;

        let snapshot = match self.blob.read(&self.key) {
            Ok(bytes) => codec::decode(&bytes, &self.model_id, self.dimensions)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Snapshot::empty(self.dimensions),
            Err(err) => return Err(StoreError::Read(err)),
        };

        let len = snapshot.len();
        let mut current = self
            .current
            .write()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        *current = Arc::new(snapshot);
        Ok(len)
    }

    fn validate(&self, base: &Snapshot, entries: &[IndexEntry]) -> Result<(), StoreError> {
        let existing = base.identifier_set();
        let mut incoming: HashSet<&str> = HashSet::with_capacity(entries.len());

        for entry in entries {
            if entry.identifier.is_empty() {
                return Err(StoreError::InvalidEntry {
                    identifier: entry.identifier.clone(),
                    reason: "identifier is empty".to_string(),
                });
            }
            if entry.identifier.len() > u16::MAX as usize || entry.source_key.len() > u16::MAX as usize {
                return Err(StoreError::InvalidEntry {
                    identifier: entry.identifier.clone(),
                    reason: "identifier or source key is too long".to_string(),
                });
            }
            if entry.vector.len() != self.dimensions {
                return Err(StoreError::DimensionMismatch {
                    expected: self.dimensions,
                    got: entry.vector.len(),
                });
            }
            if !entry.vector.is_finite() {
                return Err(StoreError::InvalidEntry {
                    identifier: entry.identifier.clone(),
                    reason: "vector contains non-finite values".to_string(),
                });
            }
            if existing.contains(entry.identifier.as_str())
                || !incoming.insert(entry.identifier.as_str())
            {
                return Err(StoreError::DuplicateIdentifier(entry.identifier.clone()));
            }
        }

        Ok(())
    }
}
