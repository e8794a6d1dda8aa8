use crate::faces::{ExtractError, IngestError, SearchError, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task queue is not running")]
    QueueClosed,

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Errors caused by the client's input rather than by the service.
    pub fn is_client_error(&self) -> bool {
        match self {
            AppError::BadRequest(_) => true,
            AppError::Ingest(IngestError::Extract(ExtractError::ImageDecode(_)))
            | AppError::Ingest(IngestError::InvalidSourceKey(_))
            | AppError::Search(SearchError::Extract(ExtractError::ImageDecode(_)))
            | AppError::Search(SearchError::InvalidParams(_))
            | AppError::Search(SearchError::DimensionMismatch { .. }) => true,
            _ => false,
        }
    }
}
