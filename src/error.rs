//! Error types for the Petalguard service.

use serde::Serialize;
use thiserror::Error;

/// Main error type for Petalguard operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller exceeded its rate limit
    #[error("{0}")]
    RateLimitExceeded(RateLimitExceeded),

    /// The declared request body is larger than the route allows
    #[error("{0}")]
    PayloadTooLarge(PayloadTooLarge),

    /// The system clock could not be read
    #[error("Clock error: {0}")]
    Clock(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GuardError {
    fn from(err: config::ConfigError) -> Self {
        GuardError::Config(err.to_string())
    }
}

impl From<RateLimitExceeded> for GuardError {
    fn from(err: RateLimitExceeded) -> Self {
        GuardError::RateLimitExceeded(err)
    }
}

impl From<PayloadTooLarge> for GuardError {
    fn from(err: PayloadTooLarge) -> Self {
        GuardError::PayloadTooLarge(err)
    }
}

/// Details of a rejected request, with the metadata a client needs to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct RateLimitExceeded {
    /// Human readable message
    #[serde(skip)]
    pub message: String,
    /// Policy ceiling that was hit
    pub limit: u64,
    /// Policy window in milliseconds
    #[serde(rename = "windowMs")]
    pub window_ms: u64,
    /// Seconds until the caller may retry
    #[serde(rename = "resetIn")]
    pub reset_in: u64,
    /// Operation class the request was classified as
    #[serde(rename = "type")]
    pub class: String,
}

impl RateLimitExceeded {
    pub fn new(limit: u64, window_ms: u64, reset_in: u64, class: &str) -> Self {
        Self {
            message: format!("Rate limit exceeded. Try again in {} seconds", reset_in),
            limit,
            window_ms,
            reset_in,
            class: class.to_string(),
        }
    }
}

/// Details of a body that exceeds its size bucket.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct PayloadTooLarge {
    #[serde(skip)]
    pub message: String,
    /// Bucket name, e.g. `5mb`
    #[serde(rename = "maxSize")]
    pub max_size: String,
    /// Declared `Content-Length`
    #[serde(rename = "actualSize")]
    pub actual_size: u64,
    /// Bucket threshold in bytes
    pub limit: u64,
}

impl PayloadTooLarge {
    pub fn new(max_size: &str, actual_size: u64, limit: u64) -> Self {
        Self {
            message: format!("Payload too large. Maximum allowed: {}", max_size),
            max_size: max_size.to_string(),
            actual_size,
            limit,
        }
    }
}

/// Result type alias for Petalguard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
