pub mod fetcher;
pub mod ocr;
pub mod tables;
pub mod vision;

pub use fetcher::{BypassFetcher, FetchConfig, FetchStats};
pub use ocr::OcrsEngine;
pub use tables::{GridTableDetector, TableDetectConfig};
pub use vision::OpenAiVision;
