use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tower::ServiceExt;

use super::{png, running_service, test_paths, vec_on, wait_for, StubExtractor, DIMS};
use crate::{app::FaceService, web::router};

const BOUNDARY: &str = "faceidx-test-boundary";

/// `(field name, file name, bytes)` parts as a multipart/form-data body.
fn multipart_body(parts: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, file_name, bytes) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn post_multipart(uri: &str, parts: &[(&str, &str, &[u8])]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_of(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn app_router(service: FaceService) -> Router {
    router(Arc::new(RwLock::new(service)), 10 * 1024 * 1024)
}

/// A known face stored under a real source image, plus one face-less image
/// and one image with a face nobody else has.
fn seeded_service(dir: &tempfile::TempDir) -> (FaceService, String) {
    let extractor = Arc::new(
        StubExtractor::new(DIMS)
            .with_faces(&png(0), vec![vec_on(0, 1.0)])
            .with_faces(&png(1), vec![])
            .with_faces(&png(2), vec![vec_on(3, 5.0)]),
    );
    let service = running_service(&test_paths(dir), extractor);
    let (_, outcome) = service.ingest_now("alice.png", png(0).as_slice()).unwrap();
    let crate::faces::IngestOutcome::Indexed { identifiers, .. } = outcome else {
        panic!("seed image was not indexed");
    };
    (service, identifiers[0].clone())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_image_finds_match() {
    let dir = tempfile::tempdir().unwrap();
    let (service, identifier) = seeded_service(&dir);
    let app = app_router(service);

    let response = app
        .oneshot(post_multipart(
            "/api/v1/check-image",
            &[("file", "query.png", png(0).as_slice())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_of(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "Found 1 matching face(s)");
    assert_eq!(body["matches"][0]["identifier"], identifier.as_str());
    assert_eq!(body["matches"][0]["distance"], 0.0);
    assert!(body["matches"][0]["image_b64"]
        .as_str()
        .is_some_and(|b64| !b64.is_empty()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_image_no_face_and_no_match() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _) = seeded_service(&dir);
    let app = app_router(service);

    let response = app
        .clone()
        .oneshot(post_multipart(
            "/api/v1/check-image",
            &[("file", "blank.png", png(1).as_slice())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert_eq!(body["status"], "no_face");
    assert_eq!(body["matches"], serde_json::json!([]));

    let response = app
        .oneshot(post_multipart(
            "/api/v1/check-image?threshold=0.5&top_k=3",
            &[("file", "stranger.png", png(2).as_slice())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert_eq!(body["status"], "not_found");
    assert_eq!(body["message"], "No matching faces found");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_image_rejects_bad_input() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _) = seeded_service(&dir);
    let app = app_router(service);

    let response = app
        .clone()
        .oneshot(post_multipart(
            "/api/v1/check-image",
            &[("file", "notes.txt", &b"plain text"[..])],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_of(response).await["error"].is_string());

    let response = app
        .clone()
        .oneshot(post_multipart(
            "/api/v1/check-image",
            &[("other", "query.png", png(0).as_slice())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post_multipart(
            "/api/v1/check-image?threshold=-1",
            &[("file", "query.png", png(0).as_slice())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_multiple_reports_each_file() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _) = seeded_service(&dir);
    let app = Arc::new(RwLock::new(service));
    let routes = router(app.clone(), 10 * 1024 * 1024);

    let response = routes
        .oneshot(post_multipart(
            "/api/v1/upload-image/upload-multiple",
            &[
                ("files", "bob.png", png(2).as_slice()),
                ("files", "readme.txt", &b"not an image"[..]),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_of(response).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["total_processed"], 2);
    assert_eq!(body["successful_uploads"][0]["filename"], "bob.png");
    assert_eq!(body["failed_uploads"][0]["filename"], "readme.txt");

    let source_key = body["successful_uploads"][0]["source_key"]
        .as_str()
        .unwrap()
        .to_string();
    let indexed = tokio::task::block_in_place(|| {
        wait_for(|| {
            let app = app.blocking_read();
            app.store()
                .snapshot_view()
                .map(|s| s.has_source(&source_key))
                .unwrap_or(false)
        })
    });
    assert!(indexed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_image_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let (service, identifier) = seeded_service(&dir);
    let app = app_router(service);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/v1/images/{identifier}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

    let response = app
        .oneshot(get("/api/v1/images/missing.png_face_1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stats_and_task_queue() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _) = seeded_service(&dir);
    let app = app_router(service);

    let response = app.clone().oneshot(get("/api/v1/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert_eq!(body["entries"], 1);
    assert_eq!(body["source_images"], 1);
    assert_eq!(body["stored_images"], 1);
    assert_eq!(body["dimensions"], DIMS);
    assert_eq!(body["model"], "stub");

    let response = app.oneshot(get("/api/task_queue")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert!(body["queue"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_task_status_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let (service, _) = seeded_service(&dir);
    let submission = service.submit("carol.png", png(2).as_slice()).unwrap();
    let app = app_router(service);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/task_queue/{}", submission.task_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_of(response).await;
    assert_eq!(body["task_id"], submission.task_id.to_string());
    assert!(!body["status"].is_null());

    let response = app.oneshot(get("/api/task_queue/unknown")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
