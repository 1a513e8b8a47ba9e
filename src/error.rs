use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures while turning an extended key or descriptor into addresses.
///
/// A derivation call either returns the whole requested batch or one of
/// these; partial batches never escape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeriveError {
    #[error("Invalid extended key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid descriptor format at position {position}: {reason}")]
    InvalidDescriptorFormat { position: usize, reason: String },

    #[error("Hardened derivation is not possible from a public key: {0}")]
    HardenedDerivationUnsupported(String),

    #[error("Unsupported descriptor type: {0}")]
    UnsupportedDescriptorType(String),

    #[error("Derivation failed: {0}")]
    DerivationFailed(String),
}

impl DeriveError {
    pub fn invalid_descriptor(position: usize, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptorFormat {
            position,
            reason: reason.into(),
        }
    }
}

/// Failures from the balance API adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Rate limited by balance API after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },

    #[error("Network error: {0}")]
    Network(String),

    /// Non-success status or an unreadable body. `status` is `None` when the
    /// response came back 200 but could not be parsed.
    #[error("Balance API error: {message}")]
    Api { status: Option<u16>, message: String },
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification transport error: {0}")]
    Transport(String),

    #[error("Notification rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Errors surfaced by the monitor's operator-facing operations.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Derive(#[from] DeriveError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            MonitorError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            MonitorError::AlreadyExists(_) => (StatusCode::CONFLICT, self.to_string()),
            MonitorError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            MonitorError::Derive(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            MonitorError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
