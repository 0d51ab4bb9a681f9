use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors surfaced by [`crate::queue`] operations that reach the HTTP edge.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue entry already present for key {0}")]
    Duplicate(String),
}

/// Errors from a Scout Service RPC. Every variant is treated as a failed scout
/// by the dispatcher — the caller never unwinds on these, it only records the
/// failure and lets the entry continue its lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ScoutError {
    #[error("scout request transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("scout service returned non-success status {0}")]
    Status(StatusCode),
}

/// Errors from fetching or parsing the geofence feature collection.
#[derive(Debug, thiserror::Error)]
pub enum GeofenceError {
    #[error("geofence fetch transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("geofence source returned non-success status {0}")]
    Status(StatusCode),
    #[error("geofence source has no url configured")]
    NoUrlConfigured,
}

/// Errors from loading or parsing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level error returned by HTTP handlers. A handler never panics on a
/// malformed request; anything unexpected collapses to `Internal` and a 500
/// rather than unwinding the server.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, "handler_error");
        }
        (status, self.to_string()).into_response()
    }
}
