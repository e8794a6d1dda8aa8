//! Feature vectors and the distance functions used to compare them.

use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A face embedding produced by the extractor.
///
/// Immutable once built; clones share the same allocation, so snapshots can
/// be copied without duplicating vector data.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureVector(Arc<[f32]>);

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values.into())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl Deref for FeatureVector {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Distance function used for ranking. Lower is more similar for both.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// L2 distance, the usual convention for face embeddings (0.6 is the
    /// customary match threshold for 128-d dlib encodings).
    #[default]
    Euclidean,
    /// `1 - cos(a, b)`, in `[0, 2]`.
    Cosine,
}

impl Metric {
    /// Distance between two vectors of equal length.
    ///
    /// Callers validate dimensions up front; mismatched lengths yield
    /// `f32::INFINITY` so such a pair can never pass a threshold.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        match self {
            Metric::Euclidean => euclidean_distance(a, b),
            Metric::Cosine => cosine_distance(a, b),
        }
    }
}

/// Euclidean distance with f64 accumulation.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Cosine distance. Zero vectors are maximally distant (2.0).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }

    let similarity = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    (1.0 - similarity) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_known_values() {
        assert_eq!(euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert_eq!(euclidean_distance(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_euclidean_is_symmetric() {
        let a = [0.3, -1.2, 4.5];
        let b = [2.0, 0.1, -0.7];
        assert_eq!(euclidean_distance(&a, &b), euclidean_distance(&b, &a));
    }

    #[test]
    fn test_cosine_known_values() {
        let d = cosine_distance(&[1.0, 0.0], &[1.0, 0.0]);
        assert!(d.abs() < 1e-6);

        let d = cosine_distance(&[1.0, 0.0], &[0.0, 1.0]);
        assert!((d - 1.0).abs() < 1e-6);

        let d = cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((d - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 2.0);
    }

    #[test]
    fn test_metric_dimension_mismatch_is_infinite() {
        assert_eq!(Metric::Euclidean.distance(&[1.0], &[1.0, 2.0]), f32::INFINITY);
        assert_eq!(Metric::Cosine.distance(&[1.0], &[1.0, 2.0]), f32::INFINITY);
    }

    #[test]
    fn test_metric_serde_names() {
        assert_eq!(serde_json::to_string(&Metric::Euclidean).unwrap(), "\"euclidean\"");
        let m: Metric = serde_json::from_str("\"cosine\"").unwrap();
        assert_eq!(m, Metric::Cosine);
    }

    #[test]
    fn test_feature_vector_finite() {
        assert!(FeatureVector::new(vec![1.0, 2.0]).is_finite());
        assert!(!FeatureVector::new(vec![1.0, f32::NAN]).is_finite());
    }
}
