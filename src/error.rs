// Error handling module
// Defines the session error taxonomy and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the identity provider, the backend and the orchestrator
///
/// Storage failures are not part of this enum: the secure store swallows them.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport-level failure (timeout, connection refused, DNS)
    #[error("Network error: {0}")]
    Network(String),

    /// Bad credentials, expired session or a token the provider rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Provider identity exists but the backend has no matching record
    #[error("Account not found: {0}")]
    MissingBackendProfile(String),

    /// Operation requires a signed-in user
    #[error("Not signed in")]
    NotSignedIn,

    /// Non-success response from the backend API
    #[error("Backend error: {status} - {message}")]
    Backend { status: u16, message: String },

    /// Request validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Coarse classification used by the orchestrator to pick a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry at the caller's discretion; the session survives
    Transient,
    /// Surface to the user; no automatic retry
    Authentication,
    /// Fatal to the session; forces sign-out
    Consistency,
    /// Caller supplied bad input
    Client,
    Internal,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Network(_) => ErrorKind::Transient,
            SessionError::Backend { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::Transient
            }
            SessionError::Backend { .. } => ErrorKind::Client,
            SessionError::Authentication(_) | SessionError::NotSignedIn => {
                ErrorKind::Authentication
            }
            SessionError::MissingBackendProfile(_) => ErrorKind::Consistency,
            SessionError::Validation(_) => ErrorKind::Client,
            SessionError::Config(_) | SessionError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure is network-class and must not end the session
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            SessionError::Internal(anyhow::anyhow!("Malformed response: {}", error))
        } else {
            SessionError::Network(error.to_string())
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            SessionError::Network(msg) => (StatusCode::BAD_GATEWAY, "network_error", msg),
            SessionError::Authentication(msg) => (StatusCode::UNAUTHORIZED, "auth_error", msg),
            SessionError::MissingBackendProfile(msg) => {
                (StatusCode::CONFLICT, "missing_profile", msg)
            }
            SessionError::NotSignedIn => (
                StatusCode::UNAUTHORIZED,
                "not_signed_in",
                "Not signed in".to_string(),
            ),
            SessionError::Backend { status, message } => {
                let status_code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status_code, "backend_error", message)
            }
            SessionError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            SessionError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            SessionError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
