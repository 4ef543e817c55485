//! API error types and response formatting.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, JobError};

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// An error crossing the HTTP boundary.
///
/// Wraps the crate error and maps its taxonomy kind onto an HTTP status;
/// the body always carries the same structured descriptor that failed jobs
/// store.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    /// HTTP status for the wrapped error's kind.
    pub fn status_code(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::ConnectFailed | ErrorKind::AuthFailed | ErrorKind::CommandFailed => {
                StatusCode::BAD_GATEWAY
            }
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::DriverInternal | ErrorKind::System => match &self.0 {
                Error::JobNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `failed`
    pub status: String,
    /// Structured error descriptor
    pub error: JobError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            status: "failed".to_string(),
            error: self.0.into_descriptor(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        let err = ApiError(Error::validation("bad"));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = ApiError(Error::Auth("missing key".to_string()));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let err = ApiError(Error::NoCapacity {
            host: "10.0.0.1".to_string(),
            attempts: 3,
        });
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError(Error::JobNotFound("x".to_string()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn body_carries_failed_status_and_kind() {
        let err = ApiError(Error::NoCapacity {
            host: "10.0.0.3".to_string(),
            attempts: 3,
        });
        let body = ErrorResponse {
            status: "failed".to_string(),
            error: err.0.into_descriptor(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "no_capacity");
    }
}
