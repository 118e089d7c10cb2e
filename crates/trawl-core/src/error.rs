use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::job::Platform;

/// Application-wide error types for Trawl.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    /// HTTP request failed (non-success status, bad body).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request or job timed out.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The target platform answered with a rate-limit response.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// The platform extractor could not produce items.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// Result cache backend failed.
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Content store failed to persist an item.
    #[error("Store error: {0}")]
    StoreError(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Caller supplied an invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No extractor is registered for the platform.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(Platform),

    /// No active or recently finished job has this id.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The source answered in a way that retrying cannot change (e.g. HTTP 404).
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if the error must not be retried by the orchestrator.
    ///
    /// Extractors opt out of retries by returning [`AppError::Permanent`] or
    /// [`AppError::InvalidRequest`]; every other error is retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AppError::Permanent(_) | AppError::InvalidRequest(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerializationError(err.to_string())
    }
}
