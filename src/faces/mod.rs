//! Face index: durable vector store, ingestion and similarity search.
//!
//! This module provides:
//! - Binary index format with checksums (`codec`)
//! - Copy-on-write store with serialized, persist-then-publish appends
//! - Pluggable feature extraction (external command or fastembed)
//! - Threshold + top-K ranking over a consistent snapshot

pub mod clip;
pub mod codec;
pub mod extractor;
pub mod ingest;
pub mod naming;
pub mod search;
pub mod snapshot;
pub mod store;
pub mod vector;

pub use extractor::{CommandExtractor, ExtractError, FeatureExtractor};
pub use ingest::{IngestError, IngestOutcome, IngestWorker};
pub use search::{Match, SearchEngine, SearchError, SearchOutcome, SearchParams};
pub use snapshot::{IndexEntry, Snapshot};
pub use store::{StoreError, VectorStore};
pub use vector::{FeatureVector, Metric};

/// Default maximum distance for a match (dlib convention)
pub const DEFAULT_THRESHOLD: f32 = 0.6;
/// Default number of matches returned
pub const DEFAULT_TOP_K: usize = 7;
/// Default cap on faces indexed from one image
pub const DEFAULT_MAX_FACES_PER_IMAGE: usize = 10;
