//! Error handling for the relay server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Source could not be opened within the startup window (or is not registered)
    #[error("Source {source_id} unreachable: {reason}")]
    SourceUnreachable { source_id: String, reason: String },

    /// Process ceiling reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Tier name is not in the policy table
    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    /// One-shot frame capture failed or timed out
    #[error("Capture failed for {source_id}: {reason}")]
    CaptureFailed { source_id: String, reason: String },

    /// Detection call exceeded its deadline
    #[error("Detection timeout: {0}")]
    DetectionTimeout(String),

    /// Detection collaborator returned an error
    #[error("Detection collaborator error: {0}")]
    DetectionCollaborator(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (duplicate registration)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unreachable(source_id: &str, reason: impl Into<String>) -> Self {
        Error::SourceUnreachable {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn capture_failed(source_id: &str, reason: impl Into<String>) -> Self {
        Error::CaptureFailed {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Taxonomy name reported to clients as `error_kind`
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SourceUnreachable { .. } => "SourceUnreachable",
            Error::ResourceExhausted(_) => "ResourceExhausted",
            Error::UnknownTier(_) => "UnknownTier",
            Error::CaptureFailed { .. } => "CaptureFailed",
            Error::DetectionTimeout(_) => "DetectionTimeout",
            Error::DetectionCollaborator(_) => "DetectionCollaboratorError",
            Error::NotFound(_) => "NotFound",
            Error::Validation(_) => "Validation",
            Error::Conflict(_) => "Conflict",
            Error::Config(_) => "Config",
            Error::Serialization(_) => "Serialization",
            Error::Http(_) => "Http",
            Error::Io(_) => "Io",
            Error::Internal(_) => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::SourceUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Error::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::UnknownTier(_) => StatusCode::BAD_REQUEST,
            Error::CaptureFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::DetectionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::DetectionCollaborator(_) => StatusCode::BAD_GATEWAY,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_kind = self.kind();
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_kind = %error_kind,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "success": false,
            "error_kind": error_kind,
            "message": message
        }));

        (status, body).into_response()
    }
}
