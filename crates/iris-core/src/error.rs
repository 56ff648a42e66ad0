use thiserror::Error;

/// Application-wide error types for Iris.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (fetching an image).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Every bypass strategy and URL variant was exhausted without a usable body.
    #[error("Download failed for {locator}: all {attempts} attempts exhausted")]
    DownloadFailed { locator: String, attempts: u64 },

    /// Downloaded payload is below the minimum plausible image size.
    #[error("Corrupt image: {size} bytes is below the {min} byte minimum")]
    CorruptImage { size: usize, min: usize },

    /// Circuit breaker rejected the call without performing I/O.
    #[error("Circuit open for '{target}'. Retry after {retry_after_secs} seconds")]
    CircuitOpen {
        target: String,
        retry_after_secs: u64,
    },

    /// Vision API call failed.
    #[error("Vision error (HTTP {status_code}): {message}")]
    VisionError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// The vision model declined to analyze the image.
    #[error("AI refusal: {0}")]
    AiRefusal(String),

    /// A tier ran but produced no usable content.
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Shared cache/counter store operation failed.
    #[error("Store error: {0}")]
    StoreError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::VisionError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should trip the circuit breaker.
    ///
    /// Refusals and corrupt payloads are content problems, not target-host
    /// health problems, so they never count against the circuit.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::DownloadFailed { .. } => true,
            AppError::VisionError {
                status_code,
                retryable,
                ..
            } => *status_code == 429 || *status_code >= 500 || *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }
}
