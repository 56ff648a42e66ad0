use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{ExtractionResult, FetchedImage, TableScan, VisionReply};

/// Obtains raw image bytes for a locator, trying whatever strategies the
/// implementation supports before giving up.
pub trait ImageFetcher: Send + Sync + Clone {
    fn fetch(&self, locator: &str) -> impl Future<Output = Result<FetchedImage, AppError>> + Send;
}

/// Local OCR engine: image bytes in, recognized text out.
///
/// CPU-bound library call, not a service; implementations may block the
/// worker for the duration of recognition.
pub trait OcrEngine: Send + Sync + Clone {
    fn recognize(&self, image: &[u8]) -> Result<String, AppError>;
}

/// Structural table detection: find a grid layout in the image and emit a
/// normalized pipe table when one is present.
pub trait TableDetector: Send + Sync + Clone {
    fn detect(&self, image: &[u8]) -> Result<TableScan, AppError>;
}

/// External vision-capable chat-completion backend.
pub trait VisionModel: Send + Sync + Clone {
    /// Model identifier, used for AI-call cache keys.
    fn model(&self) -> &str;

    fn describe(
        &self,
        image: &[u8],
        prompt: &str,
    ) -> impl Future<Output = Result<VisionReply, AppError>> + Send;
}

/// Shared key-value cache for expensive tier outputs.
///
/// Deployments back this with a networked store so concurrent workers see
/// the same entries; tests and single-process runs use
/// [`MemoryCacheStore`](crate::store::MemoryCacheStore).
pub trait CacheStore: Send + Sync + Clone {
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<ExtractionResult>, AppError>> + Send;

    fn set(
        &self,
        key: &str,
        value: &ExtractionResult,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Shared counter store used by the circuit breaker.
///
/// Counters are plain unsigned integers keyed by string; `expire` attaches
/// a rolling-window deadline after which the key reads as absent.
pub trait CounterStore: Send + Sync + Clone {
    fn increment(&self, key: &str) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn put(&self, key: &str, value: u64) -> impl Future<Output = Result<(), AppError>> + Send;

    fn expire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A vision backend that is never configured.
///
/// Stands in for the generic parameter when the pipeline runs in the
/// OCR-plus-table-detection mode.
#[derive(Debug, Clone)]
pub struct NullVision;

impl VisionModel for NullVision {
    fn model(&self) -> &str {
        "none"
    }

    async fn describe(&self, _image: &[u8], _prompt: &str) -> Result<VisionReply, AppError> {
        Err(AppError::ExtractionFailed(
            "no vision backend configured".into(),
        ))
    }
}
