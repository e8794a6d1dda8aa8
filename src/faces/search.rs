//! Similarity search over the face index.
//!
//! Linear scan: distances to every stored vector are computed on the rayon
//! pool, then filtered by threshold and ordered sequentially so results are
//! deterministic regardless of scheduling.

use std::cmp::Ordering;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::faces::extractor::{ExtractError, FeatureExtractor};
use crate::faces::snapshot::Snapshot;
use crate::faces::store::{StoreError, VectorStore};
use crate::faces::vector::{FeatureVector, Metric};
use crate::faces::{DEFAULT_THRESHOLD, DEFAULT_TOP_K};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("query has {got} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid search parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Maximum accepted distance; smaller is stricter.
    pub threshold: f32,
    pub top_k: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            top_k: DEFAULT_TOP_K,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub identifier: String,
    pub source_key: String,
    pub distance: f32,
}

/// Result of an image query. "No face in the query" is kept apart from
/// "no stored face is close enough".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "matches", rename_all = "snake_case")]
pub enum SearchOutcome {
    NoFaceDetected,
    Matches(Vec<Match>),
}

impl SearchOutcome {
    pub fn matches(&self) -> &[Match] {
        match self {
            SearchOutcome::NoFaceDetected => &[],
            SearchOutcome::Matches(matches) => matches,
        }
    }
}

pub struct SearchEngine {
    store: Arc<VectorStore>,
    extractor: Arc<dyn FeatureExtractor>,
    metric: Metric,
}

impl SearchEngine {
    pub fn new(store: Arc<VectorStore>, extractor: Arc<dyn FeatureExtractor>, metric: Metric) -> Self {
        Self {
            store,
            extractor,
            metric,
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Extract the query face from `image` and rank stored faces against
    /// it. Only the first detected face is used.
    pub fn search_image(
        &self,
        image: &[u8],
        params: &SearchParams,
    ) -> Result<SearchOutcome, SearchError> {
        validate_params(params)?;

        let vectors = self.extractor.extract(image)?;
        let Some(query) = vectors.into_iter().next() else {
            return Ok(SearchOutcome::NoFaceDetected);
        };

        self.search_vector(&query, params).map(SearchOutcome::Matches)
    }

    /// Rank stored faces against an already extracted vector.
    pub fn search_vector(
        &self,
        query: &FeatureVector,
        params: &SearchParams,
    ) -> Result<Vec<Match>, SearchError> {
        validate_params(params)?;

        if query.len() != self.store.dimensions() {
            return Err(SearchError::DimensionMismatch {
                expected: self.store.dimensions(),
                got: query.len(),
            });
        }

        let snapshot = self.store.snapshot_view()?;
        Ok(rank(&snapshot, query, self.metric, params))
    }
}

fn validate_params(params: &SearchParams) -> Result<(), SearchError> {
    if !params.threshold.is_finite() || params.threshold < 0.0 {
        return Err(SearchError::InvalidParams(format!(
            "threshold must be a non-negative number, got {}",
            params.threshold
        )));
    }
    Ok(())
}

/// Distances from `query` to every entry, keeping `distance <= threshold`,
/// sorted ascending with ties broken by identifier, truncated to `top_k`.
pub fn rank(snapshot: &Snapshot, query: &[f32], metric: Metric, params: &SearchParams) -> Vec<Match> {
    if params.top_k == 0 || snapshot.is_empty() {
        return Vec::new();
    }

    let mut hits: Vec<(f32, usize)> = snapshot
        .entries()
        .par_iter()
        .enumerate()
        .filter_map(|(idx, entry)| {
            let distance = metric.distance(query, &entry.vector);
            // NaN fails this comparison and is dropped.
            (distance <= params.threshold).then_some((distance, idx))
        })
        .collect();

    let entries = snapshot.entries();
    hits.sort_by(|a, b| match a.0.total_cmp(&b.0) {
        Ordering::Equal => entries[a.1].identifier.cmp(&entries[b.1].identifier),
        other => other,
    });
    hits.truncate(params.top_k);

    hits.into_iter()
        .map(|(distance, idx)| Match {
            identifier: entries[idx].identifier.clone(),
            source_key: entries[idx].source_key.clone(),
            distance,
        })
        .collect()
}
