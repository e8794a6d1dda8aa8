use std::sync::Arc;

use super::{png, store_in, vec_on, StubExtractor, DIMS};
use crate::faces::{
    FeatureVector, IndexEntry, Metric, SearchEngine, SearchError, SearchOutcome, SearchParams,
};

fn engine_with(entries: Vec<IndexEntry>, metric: Metric) -> (tempfile::TempDir, SearchEngine) {
    let dir = tempfile::tempdir().unwrap();
    let extractor = Arc::new(StubExtractor::new(DIMS).with_faces(&png(0), vec![vec_on(0, 0.0)]));
    let store = store_in(dir.path(), &extractor);
    store.append_batch(entries).unwrap();
    (dir, SearchEngine::new(store, extractor, metric))
}

fn ids(outcome: &SearchOutcome) -> Vec<&str> {
    outcome.matches().iter().map(|m| m.identifier.as_str()).collect()
}

#[test]
fn test_threshold_keeps_only_close_faces() {
    let entries = [0.1, 0.5, 0.59, 0.61, 0.9]
        .iter()
        .enumerate()
        .map(|(i, d)| IndexEntry::new(format!("p{i}.jpg_face_1"), format!("p{i}.jpg"), vec_on(0, *d)))
        .collect();
    let (_dir, engine) = engine_with(entries, Metric::Euclidean);

    let params = SearchParams {
        threshold: 0.6,
        top_k: 10,
    };
    let outcome = engine.search_image(&png(0), &params).unwrap();

    assert_eq!(ids(&outcome), vec!["p0.jpg_face_1", "p1.jpg_face_1", "p2.jpg_face_1"]);
    let distances: Vec<f32> = outcome.matches().iter().map(|m| m.distance).collect();
    assert!((distances[0] - 0.1).abs() < 1e-6);
    assert!((distances[2] - 0.59).abs() < 1e-6);
    assert!(outcome.matches().iter().all(|m| m.distance <= 0.6));
}

#[test]
fn test_top_k_limits_and_sorts() {
    let entries = (0..10)
        .rev()
        .map(|i| {
            IndexEntry::new(
                format!("s{i}.jpg_face_1"),
                format!("s{i}.jpg"),
                vec_on(0, 0.01 * (i + 1) as f32),
            )
        })
        .collect();
    let (_dir, engine) = engine_with(entries, Metric::Euclidean);

    let outcome = engine.search_image(&png(0), &SearchParams::default()).unwrap();
    let matches = outcome.matches();
    assert_eq!(matches.len(), 7);
    assert!(matches.windows(2).all(|w| w[0].distance <= w[1].distance));
    assert_eq!(matches[0].identifier, "s0.jpg_face_1");
    assert_eq!(matches[0].source_key, "s0.jpg");

    let few = engine
        .search_image(
            &png(0),
            &SearchParams {
                threshold: 0.6,
                top_k: 3,
            },
        )
        .unwrap();
    assert_eq!(ids(&few), vec!["s0.jpg_face_1", "s1.jpg_face_1", "s2.jpg_face_1"]);
}

#[test]
fn test_equal_distances_order_by_identifier() {
    let entries = ["c.jpg", "a.jpg", "b.jpg"]
        .iter()
        .map(|key| IndexEntry::new(format!("{key}_face_1"), *key, vec_on(1, 0.3)))
        .collect();
    let (_dir, engine) = engine_with(entries, Metric::Euclidean);

    let outcome = engine.search_image(&png(0), &SearchParams::default()).unwrap();
    assert_eq!(ids(&outcome), vec!["a.jpg_face_1", "b.jpg_face_1", "c.jpg_face_1"]);
}

#[test]
fn test_empty_index_and_no_face_are_different() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = Arc::new(
        StubExtractor::new(DIMS)
            .with_faces(&png(0), vec![vec_on(0, 1.0)])
            .with_faces(&png(1), vec![]),
    );
    let store = store_in(dir.path(), &extractor);
    let engine = SearchEngine::new(store, extractor, Metric::Euclidean);

    let empty = engine.search_image(&png(0), &SearchParams::default()).unwrap();
    assert_eq!(empty, SearchOutcome::Matches(vec![]));

    let no_face = engine.search_image(&png(1), &SearchParams::default()).unwrap();
    assert_eq!(no_face, SearchOutcome::NoFaceDetected);
    assert_ne!(empty, no_face);
}

#[test]
fn test_cosine_ignores_magnitude() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = Arc::new(StubExtractor::new(DIMS).with_faces(&png(0), vec![vec_on(2, 1.0)]));
    let store = store_in(dir.path(), &extractor);
    store
        .append_batch(vec![
            IndexEntry::new("far.jpg_face_1", "far.jpg", vec_on(2, 40.0)),
            IndexEntry::new("other.jpg_face_1", "other.jpg", vec_on(3, 1.0)),
        ])
        .unwrap();

    let cosine = SearchEngine::new(store.clone(), extractor.clone(), Metric::Cosine);
    let outcome = cosine.search_image(&png(0), &SearchParams::default()).unwrap();
    assert_eq!(ids(&outcome), vec!["far.jpg_face_1"]);
    assert!(outcome.matches()[0].distance.abs() < 1e-6);

    // the same vector is far away in euclidean terms
    let euclidean = SearchEngine::new(store, extractor, Metric::Euclidean);
    let outcome = euclidean.search_image(&png(0), &SearchParams::default()).unwrap();
    assert!(outcome.matches().is_empty());
}

#[test]
fn test_query_dimension_mismatch() {
    let (_dir, engine) = engine_with(vec![], Metric::Euclidean);

    let err = engine
        .search_vector(&FeatureVector::new(vec![0.0; DIMS + 1]), &SearchParams::default())
        .unwrap_err();
    assert!(matches!(
        err,
        SearchError::DimensionMismatch { expected: DIMS, got } if got == DIMS + 1
    ));
}

#[test]
fn test_search_sees_later_appends() {
    let dir = tempfile::tempdir().unwrap();
    let extractor = Arc::new(StubExtractor::new(DIMS));
    let store = store_in(dir.path(), &extractor);
    let engine = SearchEngine::new(store.clone(), extractor, Metric::Euclidean);
    let query = FeatureVector::new(vec_on(0, 0.0));

    assert!(engine.search_vector(&query, &SearchParams::default()).unwrap().is_empty());

    store
        .append("late.jpg_face_1", "late.jpg", FeatureVector::new(vec_on(0, 0.2)))
        .unwrap();

    let matches = engine.search_vector(&query, &SearchParams::default()).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].identifier, "late.jpg_face_1");
}
