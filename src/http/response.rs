//! Structured HTTP responses for guard errors.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::error::GuardError;

impl GuardError {
    /// Status code and machine-readable error code for this error.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            GuardError::RateLimitExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED"),
            GuardError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            GuardError::Clock(_) => (StatusCode::SERVICE_UNAVAILABLE, "RATE_LIMITER_UNAVAILABLE"),
            GuardError::Config(_) | GuardError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();

        let (message, details) = match &self {
            GuardError::RateLimitExceeded(e) => (e.to_string(), serde_json::to_value(e).ok()),
            GuardError::PayloadTooLarge(e) => (e.to_string(), serde_json::to_value(e).ok()),
            GuardError::Clock(_) => ("Rate limiting is temporarily unavailable".to_string(), None),
            GuardError::Config(_) | GuardError::Io(_) => {
                error!(error = %self, "Request failed");
                ("Internal server error".to_string(), None)
            }
        };

        let body = json!({
            "success": false,
            "error": {
                "code": code,
                "message": message,
                "details": details,
            }
        });

        let mut response = (status, Json(body)).into_response();
        if let GuardError::RateLimitExceeded(e) = &self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(e.reset_in));
        }
        response
    }
}
