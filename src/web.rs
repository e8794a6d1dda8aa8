use crate::{
    app::{service::Stats, task_runner::QueueDump, AppError, FaceService},
    eid::Eid,
    faces::SearchOutcome,
};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::{signal, sync::RwLock};
use tower_http::cors::CorsLayer;

#[derive(Clone)]
struct SharedState {
    app: Arc<RwLock<FaceService>>,
}

/// HTTP routes over a running service.
pub fn router(app: Arc<RwLock<FaceService>>, max_upload_bytes: usize) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/v1/check-image", post(check_image))
        .route("/api/v1/upload-image/upload-multiple", post(upload_multiple))
        .route("/api/v1/images/:identifier", get(image))
        .route("/api/v1/stats", get(stats))
        .route("/api/task_queue", get(task_queue))
        .route("/api/task_queue/:task_id", get(task_status))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal(app: Arc<RwLock<FaceService>>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let mut app = app.write().await;
    app.shutdown();

    // join on queue thread handle
    log::warn!("waiting for queues to stop");
    tokio::task::block_in_place(|| app.wait_task_queue_finish());
}

async fn start_app(app: FaceService) -> anyhow::Result<()> {
    let listen_addr = app.config().listen_addr.clone();
    let max_upload_bytes = app.config().max_upload_bytes;

    let app = Arc::new(RwLock::new(app));
    let signal = shutdown_signal(app.clone());
    let router = router(app, max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(listen_addr.as_str()).await?;
    log::info!("listening on {listen_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await?;
    Ok(())
}

pub fn start_daemon(mut app: FaceService) -> anyhow::Result<()> {
    app.start_queue();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(app).await })
}

// Make our own error that wraps `AppError`.
#[derive(Debug)]
struct HttpError(AppError);

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            err if err.is_client_error() => StatusCode::BAD_REQUEST,
            _ => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

// This enables using `?` on functions that return `Result<_, AppError>` and
// its sources inside handlers.
impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> HttpError {
    HttpError(AppError::BadRequest(format!("malformed upload: {err}")))
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckImageQuery {
    pub threshold: Option<f32>,
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MatchResponse {
    pub identifier: String,
    pub source_key: String,
    pub distance: f32,
    /// Display JPEG of the source image
    pub image_b64: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckImageResponse {
    /// `success`, `not_found` or `no_face`
    pub status: &'static str,
    pub message: String,
    pub matches: Vec<MatchResponse>,
}

async fn check_image(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<CheckImageQuery>,
    mut multipart: Multipart,
) -> Result<Json<CheckImageResponse>, HttpError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some("file") {
            upload = Some(field.bytes().await.map_err(multipart_error)?);
            break;
        }
    }
    let bytes = upload.ok_or_else(|| AppError::BadRequest("missing `file` field".to_string()))?;

    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        let params = app.search_params(query.threshold, query.top_k);

        let matches = match app.search(&bytes, &params)? {
            SearchOutcome::NoFaceDetected => {
                return Ok(Json(CheckImageResponse {
                    status: "no_face",
                    message: "No face detected in the uploaded image".to_string(),
                    matches: vec![],
                }))
            }
            SearchOutcome::Matches(matches) => matches,
        };

        if matches.is_empty() {
            return Ok(Json(CheckImageResponse {
                status: "not_found",
                message: "No matching faces found".to_string(),
                matches: vec![],
            }));
        }

        let matches: Vec<MatchResponse> = matches
            .into_iter()
            .map(|m| {
                let image_b64 = match app.display_image(&m.source_key) {
                    Ok(jpeg) => Some(STANDARD.encode(jpeg)),
                    Err(err) => {
                        log::warn!("no display image for {}: {err}", m.identifier);
                        None
                    }
                };
                MatchResponse {
                    identifier: m.identifier,
                    source_key: m.source_key,
                    distance: m.distance,
                    image_b64,
                }
            })
            .collect();

        Ok(Json(CheckImageResponse {
            status: "success",
            message: format!("Found {} matching face(s)", matches.len()),
            matches,
        }))
    })
}

#[derive(Debug, Serialize)]
pub struct SuccessfulUpload {
    pub filename: String,
    pub source_key: String,
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct FailedUpload {
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub successful_uploads: Vec<SuccessfulUpload>,
    pub failed_uploads: Vec<FailedUpload>,
    pub total_processed: usize,
}

async fn upload_multiple(
    State(state): State<Arc<SharedState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, HttpError> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("files") {
            continue;
        }
        let filename = field.file_name().unwrap_or("image").to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        files.push((filename, bytes));
    }

    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();

        let mut successful_uploads = Vec::new();
        let mut failed_uploads = Vec::new();
        let total_processed = files.len();

        for (filename, bytes) in files {
            match app.submit(&filename, &bytes) {
                Ok(submission) => successful_uploads.push(SuccessfulUpload {
                    filename,
                    source_key: submission.source_key,
                    task_id: submission.task_id.to_string(),
                }),
                Err(err) => {
                    log::warn!("upload of {filename} rejected: {err}");
                    failed_uploads.push(FailedUpload {
                        filename,
                        error: err.to_string(),
                    })
                }
            }
        }

        Ok(Json(UploadResponse {
            status: "completed",
            successful_uploads,
            failed_uploads,
            total_processed,
        }))
    })
}

async fn image(
    State(state): State<Arc<SharedState>>,
    Path(identifier): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let app = state.app.clone();

    let jpeg = tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.image_for(&identifier)
    })?;

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg))
}

async fn stats(State(state): State<Arc<SharedState>>) -> Result<Json<Stats>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.stats().map(Json).map_err(Into::into)
    })
}

async fn task_queue(State(state): State<Arc<SharedState>>) -> Result<Json<QueueDump>, HttpError> {
    let app = state.app.read().await;
    Ok(Json(app.queue_dump()))
}

async fn task_status(
    State(state): State<Arc<SharedState>>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let app = state.app.read().await;
    let id = Eid::from(task_id.as_str());
    let status = app
        .task_status(&id)
        .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    Ok(Json(json!({ "task_id": id, "status": status })))
}
