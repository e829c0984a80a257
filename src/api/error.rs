//! Error type shared by the HTTP pipeline and the account operations.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Input rejected before any network call.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Connection, TLS, timeout, or body read failure.
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// 401 that survived the refresh-and-retry cycle.
    #[error("Not authorized: {message}")]
    Unauthorized { message: String },

    /// Any other non-2xx response.
    #[error("Request failed ({status}): {message}")]
    Status { status: StatusCode, message: String },

    #[error("Login did not return tokens")]
    IncompleteCredentials,

    #[error("Unable to determine user id for account deletion")]
    MissingUserId,

    #[error("No refresh token stored; log in again")]
    MissingRefreshToken,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }

    /// Status code of a server-side failure, if there was a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status(),
            _ => None,
        }
    }
}
