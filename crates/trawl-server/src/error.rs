use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use trawl_core::error::AppError;

use crate::dto::ErrorResponse;

/// Wrapper so we can implement `IntoResponse` for `AppError`.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::UnsupportedPlatform(_) => (StatusCode::BAD_REQUEST, "unsupported_platform"),
            AppError::SerializationError(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            AppError::JobNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::RateLimitExceeded => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::CacheError(_) => (StatusCode::SERVICE_UNAVAILABLE, "cache_error"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_kind();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.0.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawl_core::Platform;
    use uuid::Uuid;

    #[test]
    fn client_errors_map_to_4xx() {
        let cases = [
            (AppError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                AppError::UnsupportedPlatform(Platform::Tiktok),
                StatusCode::BAD_REQUEST,
            ),
            (AppError::JobNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (AppError::RateLimitExceeded, StatusCode::TOO_MANY_REQUESTS),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }

    #[test]
    fn unexpected_errors_are_500() {
        let resp = ApiError(AppError::Generic("boom".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
