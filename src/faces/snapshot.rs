//! Point-in-time contents of the face index.

use std::collections::HashSet;

use crate::faces::vector::FeatureVector;

/// One stored face.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// `<source_key>_face_<n>`, unique within a snapshot
    pub identifier: String,
    /// Key of the source image in image storage
    pub source_key: String,
    pub vector: FeatureVector,
}

impl IndexEntry {
    pub fn new(
        identifier: impl Into<String>,
        source_key: impl Into<String>,
        vector: impl Into<FeatureVector>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            source_key: source_key.into(),
            vector: vector.into(),
        }
    }
}

/// Immutable view of the whole index.
///
/// Identifier and vector are stored together in each entry, so the two can
/// never be observed out of step. Entries keep insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    dimensions: usize,
    entries: Vec<IndexEntry>,
}

impl Snapshot {
    /// Create a new empty snapshot for vectors of `dimensions` length.
    pub fn empty(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: Vec::new(),
        }
    }

    pub(crate) fn from_entries(dimensions: usize, entries: Vec<IndexEntry>) -> Self {
        Self {
            dimensions,
            entries,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|e| e.identifier.as_str())
    }

    pub fn get(&self, identifier: &str) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.identifier == identifier)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.get(identifier).is_some()
    }

    /// Source key recorded for `identifier`.
    pub fn source_key_of(&self, identifier: &str) -> Option<&str> {
        self.get(identifier).map(|e| e.source_key.as_str())
    }

    /// True when any entry was produced from `source_key`.
    pub fn has_source(&self, source_key: &str) -> bool {
        self.entries.iter().any(|e| e.source_key == source_key)
    }

    pub(crate) fn identifier_set(&self) -> HashSet<&str> {
        self.identifiers().collect()
    }

    /// New snapshot with `entries` appended. `self` is left untouched.
    pub(crate) fn with_appended(&self, entries: Vec<IndexEntry>) -> Snapshot {
        let mut next = Vec::with_capacity(self.entries.len() + entries.len());
        next.extend(self.entries.iter().cloned());
        next.extend(entries);
        Snapshot {
            dimensions: self.dimensions,
            entries: next,
        }
    }
}
