//! Error types for the Cygni client

use serde::Deserialize;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error code the orchestrator sends when a worker's lease is gone
pub const LEASE_LOST: &str = "LEASE_LOST";

/// Errors that can occur when using the Cygni client
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        status: u16,
        message: String,
        /// Machine-readable code for invariant and lease errors
        code: Option<String>,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: Option<String>,
}

impl ClientError {
    /// Create an API error from a status code and the raw response body
    pub fn api_error(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => Self::ApiError {
                status,
                message: parsed.error,
                code: parsed.code,
            },
            Err(_) => Self::ApiError {
                status,
                message: body,
                code: None,
            },
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::ApiError { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// The resource's state does not allow the request
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// The worker no longer holds the build's lease and must stop reporting
    pub fn is_lease_lost(&self) -> bool {
        self.code() == Some(LEASE_LOST)
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(status) if (400..500).contains(&status))
    }

    /// Check if this error is a server error (5xx status), or the request
    /// never got an answer
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(_) => true,
            Self::ApiError { status, .. } => *status >= 500,
            Self::ParseError(_) => false,
        }
    }
}
