//! Core of the Iris tiered image-content extraction pipeline.
//!
//! Turns an image reference discovered while scraping forum content into
//! structured text/table content: a circuit-breaker-guarded fetch, a
//! three-tier extraction pipeline (OCR → table detection → AI vision),
//! pure quality-gated escalation, and a content-keyed result cache.
//!
//! This crate holds the types, trait seams, and orchestration; the
//! concrete HTTP/OCR/vision implementations live in `iris-client`.

pub mod cache;
pub mod circuit_breaker;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod quality;
pub mod retry;
pub mod store;
pub mod testutil;
pub mod traits;

pub use cache::{CacheConfig, ResultCache, TtlClass};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
pub use error::AppError;
pub use models::{
    ContentType, ExtractedContent, ExtractionResult, FetchMethod, FetchedImage, ImageReference,
    ProcessingResult, TableScan, VisionReply, compute_hash,
};
pub use pipeline::ExtractionPipeline;
pub use quality::{ConfidenceLevel, QualityAssessment, QualityAssessor, QualityConfig};
pub use retry::RetryPolicy;
pub use store::{MemoryCacheStore, MemoryCounterStore};
pub use traits::{
    CacheStore, CounterStore, ImageFetcher, NullVision, OcrEngine, TableDetector, VisionModel,
};
