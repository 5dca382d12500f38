//! HTTP error responses
//!
//! Maps the crate error kinds onto status codes and a structured JSON body
//! with request tracking. Rate-limit refusals carry a `Retry-After` header.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Top-level error response with request tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code (UNAUTHENTICATED, INVALID_ARGUMENT, ...).
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub details: Vec<String>,
}

/// A crate error bound to the request that raised it.
#[derive(Debug)]
pub struct ApiError {
    pub error: Error,
    pub request_id: String,
}

impl ApiError {
    pub fn new(request_id: impl Into<String>, error: Error) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Unauthenticated => StatusCode::UNAUTHORIZED,
        Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
        Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
        // Monetary refusals are client-correctable requests, not conflicts.
        Error::InsufficientFunds | Error::DailyLimitExceeded(_) => StatusCode::BAD_REQUEST,
        Error::FailedPrecondition(_) | Error::AlreadyExists(_) => StatusCode::CONFLICT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::ResourceExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);

        let (message, details) = match &self.error {
            Error::Internal(detail) => {
                tracing::error!(request_id = %self.request_id, detail, "internal error");
                ("internal error".to_string(), Vec::new())
            }
            Error::InvalidArgument { message, details } => (message.clone(), details.clone()),
            other => (other.to_string(), Vec::new()),
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id,
            error: ErrorBody {
                code: self.error.code().to_string(),
                message,
                details,
            },
        });

        let mut response = (status, body).into_response();
        if let Error::ResourceExhausted { retry_after_secs } = self.error {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(&Error::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&Error::PermissionDenied("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&Error::AlreadyExists("dup".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::FailedPrecondition("phase".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::InsufficientFunds),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::ResourceExhausted {
                retry_after_secs: 3
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_for(&Error::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&Error::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rate_limit_response_has_retry_after() {
        let response = ApiError::new(
            "req-1",
            Error::ResourceExhausted {
                retry_after_secs: 7,
            },
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "7"
        );
    }

    #[test]
    fn validation_details_survive_serialization() {
        let body = ErrorBody {
            code: "INVALID_ARGUMENT".to_string(),
            message: "bad input".to_string(),
            details: vec!["stake must be positive".to_string()],
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("stake must be positive"));

        // Empty details are omitted entirely.
        let body = ErrorBody {
            code: "NOT_FOUND".to_string(),
            message: "missing".to_string(),
            details: Vec::new(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("details"));
    }
}
