//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::repository::StoreError;
use crate::service::ServiceError;

/// Code sent with 409 responses to workers whose lease is gone
pub const LEASE_LOST: &str = "LEASE_LOST";

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict {
        code: Option<&'static str>,
        message: String,
    },
    /// Invariant violation, always with a machine-readable code
    Unprocessable {
        code: &'static str,
        message: String,
    },
    BadGateway(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, None, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, None, msg),
            ApiError::Conflict { code, message } => (StatusCode::CONFLICT, code, message),
            ApiError::Unprocessable { code, message } => {
                (StatusCode::UNPROCESSABLE_ENTITY, Some(code), message)
            }
            ApiError::BadGateway(msg) => {
                tracing::warn!("Upstream failure: {}", msg);
                (StatusCode::BAD_GATEWAY, None, msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = match code {
            Some(code) => serde_json::json!({ "error": message, "code": code }),
            None => serde_json::json!({ "error": message }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            ServiceError::Validation(msg) => ApiError::BadRequest(msg),
            ServiceError::InvalidState(message) => ApiError::Conflict {
                code: None,
                message,
            },
            ServiceError::Invariant { code, message } => ApiError::Unprocessable { code, message },
            e @ ServiceError::LeaseLost(_) => ApiError::Conflict {
                code: Some(LEASE_LOST),
                message: e.to_string(),
            },
            ServiceError::Infrastructure(e) => ApiError::BadGateway(e.to_string()),
            ServiceError::Store(StoreError::Conflict(message)) => ApiError::Conflict {
                code: None,
                message,
            },
            ServiceError::Store(e) => ApiError::InternalError(e.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterError;
    use crate::service::error::codes;
    use uuid::Uuid;

    fn status_of(err: ServiceError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_service_errors_map_to_status_codes() {
        assert_eq!(
            status_of(ServiceError::Validation("commit_sha is required".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ServiceError::NotFound("build x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ServiceError::InvalidState("canary finished".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ServiceError::invariant(codes::TRAFFIC_WEIGHTS_INVALID, "sum is 90")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(ServiceError::LeaseLost(Uuid::nil())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ServiceError::Infrastructure(AdapterError::Timeout(
                std::time::Duration::from_secs(5)
            ))),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_invariant_carries_code() {
        let err = ApiError::from(ServiceError::invariant(
            codes::CANARY_ALREADY_ACTIVE,
            "deployment already has an active canary",
        ));
        assert!(matches!(
            err,
            ApiError::Unprocessable { code: codes::CANARY_ALREADY_ACTIVE, .. }
        ));
    }
}
