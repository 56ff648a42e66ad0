//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::{Arc, Mutex};

use crate::error::AppError;
use crate::models::{FetchMethod, FetchedImage, TableScan, VisionReply};
use crate::traits::{ImageFetcher, OcrEngine, TableDetector, VisionModel};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that returns a configurable queue of responses.
#[derive(Clone)]
pub struct MockFetcher {
    /// Each call pops the first element. If empty, returns a default
    /// 2000-byte payload.
    responses: Arc<Mutex<Vec<Result<FetchedImage, AppError>>>>,
}

impl MockFetcher {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![Ok(FetchedImage {
                bytes,
                method: FetchMethod::BasicHttp,
            })])),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![Err(error)])),
        }
    }

    pub fn with_responses(responses: Vec<Result<FetchedImage, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
        }
    }
}

impl ImageFetcher for MockFetcher {
    async fn fetch(&self, _locator: &str) -> Result<FetchedImage, AppError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(FetchedImage {
                bytes: vec![0u8; 2000],
                method: FetchMethod::BasicHttp,
            })
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockOcr
// ---------------------------------------------------------------------------

/// Mock OCR engine returning fixed text (or a fixed error).
#[derive(Clone)]
pub struct MockOcr {
    text: Arc<Mutex<Result<String, String>>>,
}

impl MockOcr {
    pub fn new(text: &str) -> Self {
        Self {
            text: Arc::new(Mutex::new(Ok(text.to_string()))),
        }
    }

    pub fn with_error(message: &str) -> Self {
        Self {
            text: Arc::new(Mutex::new(Err(message.to_string()))),
        }
    }
}

impl OcrEngine for MockOcr {
    fn recognize(&self, _image: &[u8]) -> Result<String, AppError> {
        match &*self.text.lock().unwrap() {
            Ok(text) => Ok(text.clone()),
            Err(message) => Err(AppError::ExtractionFailed(message.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// MockTables
// ---------------------------------------------------------------------------

/// Mock table detector with a fixed scan outcome.
#[derive(Clone)]
pub struct MockTables {
    scan: Arc<Mutex<Result<TableScan, String>>>,
}

impl MockTables {
    /// Detector that finds no grid at all.
    pub fn none() -> Self {
        Self {
            scan: Arc::new(Mutex::new(Ok(TableScan::default()))),
        }
    }

    pub fn with_table(markdown: &str) -> Self {
        Self {
            scan: Arc::new(Mutex::new(Ok(TableScan {
                tables_found: 1,
                markdown: markdown.to_string(),
            }))),
        }
    }

    pub fn with_error(message: &str) -> Self {
        Self {
            scan: Arc::new(Mutex::new(Err(message.to_string()))),
        }
    }
}

impl TableDetector for MockTables {
    fn detect(&self, _image: &[u8]) -> Result<TableScan, AppError> {
        match &*self.scan.lock().unwrap() {
            Ok(scan) => Ok(scan.clone()),
            Err(message) => Err(AppError::ExtractionFailed(message.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// MockVision
// ---------------------------------------------------------------------------

/// Mock vision backend that records prompts and pops queued replies.
#[derive(Clone)]
pub struct MockVision {
    replies: Arc<Mutex<Vec<Result<VisionReply, AppError>>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    call_count: Arc<Mutex<u32>>,
}

impl MockVision {
    pub fn new(content: &str) -> Self {
        Self::with_replies(vec![Ok(reply(content))])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_replies(vec![Err(error)])
    }

    pub fn with_replies(replies: Vec<Result<VisionReply, AppError>>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies)),
            prompts: Arc::new(Mutex::new(Vec::new())),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> u32 {
        *self.call_count.lock().unwrap()
    }
}

impl VisionModel for MockVision {
    fn model(&self) -> &str {
        "test-vision"
    }

    async fn describe(&self, _image: &[u8], prompt: &str) -> Result<VisionReply, AppError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        *self.call_count.lock().unwrap() += 1;
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            Ok(reply("default reply"))
        } else {
            replies.remove(0)
        }
    }
}

/// Build a successful vision reply for tests.
pub fn reply(content: &str) -> VisionReply {
    VisionReply {
        content: content.to_string(),
        model: "test-vision".to_string(),
        tokens_used: 42,
    }
}
