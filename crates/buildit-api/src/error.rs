//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<buildit_core::Error> for ApiError {
    fn from(err: buildit_core::Error) -> Self {
        match err {
            buildit_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            buildit_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            buildit_core::Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            buildit_core::Error::Forbidden(msg) => ApiError::Forbidden(msg),
            buildit_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<buildit_config::ConfigError> for ApiError {
    fn from(err: buildit_config::ConfigError) -> Self {
        match err {
            buildit_config::ConfigError::Io(e) => ApiError::Internal(e.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_map_to_status() {
        let cases = [
            (buildit_core::Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (buildit_core::Error::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (buildit_core::Error::Conflict("x".into()), StatusCode::CONFLICT),
            (buildit_core::Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (buildit_core::Error::Cancelled, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_config_errors_are_bad_requests() {
        let err = buildit_config::parse_item("project \"a\" { disabled 3 }").unwrap_err();
        assert_eq!(
            ApiError::from(err).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
