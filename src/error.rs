//! Error types shared by the storage layer and the HTTP surface
//!
//! `StoreError` is what a storage backend reports. `DocumentError` is what a
//! client sees: every variant renders as a JSON body `{code, message}` with
//! the matching HTTP status. Unmatched routes are handled separately by the
//! default service in `api` and never produce one of these bodies.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};

use crate::extract::ExtractError;

/// Errors raised by a `DocumentStore` backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key {key} not found in bucket {bucket}")]
    NotFound { bucket: String, key: String },

    #[error("backend responded with status {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid document metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("stream aborted: {0}")]
    Aborted(String),

    #[error("document exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

impl StoreError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Errors returned to HTTP clients
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("{0}")]
    MissingParameter(String),

    #[error("{0}")]
    ResourceNotFound(String),

    #[error("{0}")]
    InternalError(String),
}

/// JSON body of every structured error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl DocumentError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            DocumentError::MissingParameter(_) => "MissingParameter",
            DocumentError::ResourceNotFound(_) => "ResourceNotFound",
            DocumentError::InternalError(_) => "InternalError",
        }
    }
}

impl ResponseError for DocumentError {
    fn status_code(&self) -> StatusCode {
        match self {
            DocumentError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            DocumentError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            DocumentError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        })
    }
}

impl From<StoreError> for DocumentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key, .. } => {
                DocumentError::ResourceNotFound(format!("key {} not found.", key))
            }
            other => DocumentError::InternalError(other.to_string()),
        }
    }
}

impl From<ExtractError> for DocumentError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Store(store) => store.into(),
            other => DocumentError::InternalError(other.to_string()),
        }
    }
}
