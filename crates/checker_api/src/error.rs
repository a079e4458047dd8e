//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use checker_core::CheckerError;

/// API-level error mapped to a status code and a JSON `{"error": ...}`
/// body.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<CheckerError> for ApiError {
    fn from(err: CheckerError) -> Self {
        match err {
            CheckerError::TaskNotFound => Self::NotFound("Task not found".into()),
            CheckerError::InvalidApiKey => Self::Unauthorized(err.to_string()),
            CheckerError::KeyExpired | CheckerError::QuotaExhausted => {
                Self::Forbidden(err.to_string())
            }
            CheckerError::LockUnavailable(_) => Self::ServiceUnavailable(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            Self::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checker_errors_map_to_statuses() {
        assert!(matches!(
            ApiError::from(CheckerError::TaskNotFound),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(CheckerError::InvalidApiKey),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from(CheckerError::QuotaExhausted),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            ApiError::from(CheckerError::Config("x".into())),
            ApiError::Internal(_)
        ));
    }
}
