use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No branch mapping found for channel: {0}")]
    NoBranchMapping(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid update: {0}")]
    Verification(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream provider error: {0}")]
    Upstream(String),

    #[error("Upstream provider timed out")]
    UpstreamTimeout,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Infrastructure failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServerError::Upstream(_)
                | ServerError::UpstreamTimeout
                | ServerError::Cache(_)
        ) || matches!(
            self,
            ServerError::Storage(e) if !matches!(e, StorageError::NotFound(_) | StorageError::InvalidKey(_))
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::NoBranchMapping(_) => StatusCode::NOT_FOUND,
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::Verification(_) => StatusCode::BAD_REQUEST,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServerError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ServerError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServerError::Storage(StorageError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            ServerError::Storage(_)
            | ServerError::Cache(_)
            | ServerError::Signing(_)
            | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(retryable = self.is_retryable(), "request failed: {}", self);
            match self {
                ServerError::Upstream(_) | ServerError::UpstreamTimeout => {
                    "Upstream service unavailable".to_string()
                }
                _ => "Internal server error".to_string(),
            }
        } else {
            tracing::warn!("request rejected: {}", self);
            match self {
                // Storage paths stay out of client-facing messages
                ServerError::Storage(StorageError::InvalidKey(_)) => "Invalid path".to_string(),
                ServerError::Storage(_) => "Not found".to_string(),
                other => other.to_string(),
            }
        };

        (status, message).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
