use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Tier labels carried on every result envelope.
pub mod tier {
    pub const OCR: &str = "Tier 1 (OCR)";
    pub const TABLE: &str = "Tier 2 (Table Detection)";
    pub const VISION: &str = "Tier 3 (AI Vision)";
    pub const BASIC: &str = "Basic (Image URL Only)";
    pub const FETCH_FAILED: &str = "Fetch Failed";
}

/// An image discovered while scraping forum content.
///
/// The locator is either an absolute URL or an inline `data:` payload.
/// Content tags are hints harvested from the surrounding post (alt text,
/// nearby headings) and steer the vision prompt and escalation decisions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ImageReference {
    pub locator: String,
    pub content_tags: Vec<String>,
}

impl ImageReference {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            content_tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.content_tags = tags;
        self
    }

    /// Inline payloads are never re-identified across calls, so they
    /// bypass the result cache entirely.
    pub fn is_inline(&self) -> bool {
        self.locator.starts_with("data:")
    }

    /// Decode an inline `data:image/...;base64,...` locator into raw bytes.
    pub fn decode_inline(&self) -> Result<Vec<u8>, AppError> {
        let payload = self
            .locator
            .split_once("base64,")
            .map(|(_, rest)| rest)
            .ok_or_else(|| {
                AppError::ExtractionFailed("inline locator is not base64-encoded".into())
            })?;
        BASE64
            .decode(payload.trim())
            .map_err(|e| AppError::ExtractionFailed(format!("invalid inline image payload: {e}")))
    }

    /// Last path segment of the locator, used for placeholder notes.
    pub fn basename(&self) -> String {
        if self.is_inline() {
            return "inline image".to_string();
        }
        url::Url::parse(&self.locator)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(|p| p.to_string()))
            })
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.locator.clone())
    }
}

/// Bypass strategy used for a successful or attempted download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FetchMethod {
    BasicHttp,
    OauthHttp,
    SessionSpoofing,
    ProxySimulation,
}

impl FetchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMethod::BasicHttp => "basic_http",
            FetchMethod::OauthHttp => "oauth_http",
            FetchMethod::SessionSpoofing => "session_spoofing",
            FetchMethod::ProxySimulation => "proxy_simulation",
        }
    }
}

impl std::fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw bytes returned by the fetch orchestrator, tagged with the
/// strategy that finally worked.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub method: FetchMethod,
}

/// One download attempt, emitted to the log stream and the stats counter.
/// Never persisted beyond that.
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    pub method: FetchMethod,
    pub url: String,
    pub success: bool,
    pub byte_size: usize,
    pub latency_ms: u64,
}

/// Broad content category, used by the quality assessor's multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Table,
    Chart,
    EnhancedText,
    PlainText,
    Other,
}

/// What a tier actually extracted from the image.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractedContent {
    /// Pipe-delimited table with a header separator row.
    Table { markdown: String },
    /// Prose description of a chart or graph.
    ChartDescription { text: String },
    /// Model-enhanced transcription (headings, structure preserved).
    EnhancedText { text: String },
    /// Raw OCR transcription.
    PlainText { text: String },
    /// Nothing usable was extracted; note identifies the image.
    Placeholder { note: String },
}

impl ExtractedContent {
    pub fn content_type(&self) -> ContentType {
        match self {
            ExtractedContent::Table { .. } => ContentType::Table,
            ExtractedContent::ChartDescription { .. } => ContentType::Chart,
            ExtractedContent::EnhancedText { .. } => ContentType::EnhancedText,
            ExtractedContent::PlainText { .. } => ContentType::PlainText,
            ExtractedContent::Placeholder { .. } => ContentType::Other,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            ExtractedContent::Table { markdown } => markdown,
            ExtractedContent::ChartDescription { text }
            | ExtractedContent::EnhancedText { text }
            | ExtractedContent::PlainText { text } => text,
            ExtractedContent::Placeholder { note } => note,
        }
    }
}

/// Uniform envelope wrapping every tier's output, so callers are
/// tier-agnostic.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExtractionResult {
    pub content: ExtractedContent,
    pub processing_tier: String,
    pub model_used: Option<String>,
    pub tokens_used: u32,
    pub success: bool,
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn ok(content: ExtractedContent, tier: &str) -> Self {
        Self {
            content,
            processing_tier: tier.to_string(),
            model_used: None,
            tokens_used: 0,
            success: true,
            error: None,
        }
    }

    pub fn failed(tier: &str, note: String, error: String) -> Self {
        Self {
            content: ExtractedContent::Placeholder { note },
            processing_tier: tier.to_string(),
            model_used: None,
            tokens_used: 0,
            success: false,
            error: Some(error),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, tokens: u32) -> Self {
        self.model_used = Some(model.into());
        self.tokens_used = tokens;
        self
    }
}

/// Final answer handed back to the content-ingestion job.
///
/// Best-effort by contract: a degraded result with `success == false` is
/// returned instead of an error for everything except a circuit-open.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub extracted_content: String,
    pub extracted_content_type: ContentType,
    pub processing_tier: String,
    pub model_used: Option<String>,
    pub tokens_used: u32,
    pub error: Option<String>,
}

impl From<ExtractionResult> for ProcessingResult {
    fn from(result: ExtractionResult) -> Self {
        Self {
            success: result.success,
            extracted_content: result.content.text().to_string(),
            extracted_content_type: result.content.content_type(),
            processing_tier: result.processing_tier,
            model_used: result.model_used,
            tokens_used: result.tokens_used,
            error: result.error,
        }
    }
}

/// Reply from the vision backend: raw text plus usage accounting.
#[derive(Debug, Clone)]
pub struct VisionReply {
    pub content: String,
    pub model: String,
    pub tokens_used: u32,
}

/// Result of the structural table scan (Tier 2).
#[derive(Debug, Clone, Default)]
pub struct TableScan {
    pub tables_found: usize,
    pub markdown: String,
}

// ---------------------------------------------------------------------------
// Pure classification rules
// ---------------------------------------------------------------------------

const CHART_VOCABULARY: &[&str] = &[
    "chart", "graph", "plot", "axis", "axes", "bar ", "pie ", "trend", "curve",
];

const REFUSAL_MARKERS: &[&str] = &[
    "i'm sorry",
    "i am sorry",
    "i cannot assist",
    "i can't assist",
    "i cannot analyze",
    "i can't analyze",
    "unable to analyze",
    "unable to process this image",
    "cannot help with",
];

/// Classify a vision reply into a content variant.
///
/// Rules are applied in order:
/// 1. A line containing pipes plus a pipe-and-dash separator line ⇒ table.
/// 2. Chart/graph vocabulary anywhere in the reply ⇒ chart description.
/// 3. Everything else ⇒ enhanced text.
pub fn classify_reply(reply: &str) -> ExtractedContent {
    if looks_like_pipe_table(reply) {
        return ExtractedContent::Table {
            markdown: reply.to_string(),
        };
    }
    let lower = reply.to_lowercase();
    if CHART_VOCABULARY.iter().any(|w| lower.contains(w)) {
        return ExtractedContent::ChartDescription {
            text: reply.to_string(),
        };
    }
    ExtractedContent::EnhancedText {
        text: reply.to_string(),
    }
}

fn looks_like_pipe_table(text: &str) -> bool {
    let mut saw_pipe_row = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.matches('|').count() >= 2 {
            if trimmed.contains('-')
                && trimmed
                    .chars()
                    .all(|c| matches!(c, '|' | '-' | ':' | ' '))
            {
                // Separator row only counts when a data row preceded it.
                if saw_pipe_row {
                    return true;
                }
            } else {
                saw_pipe_row = true;
            }
        }
    }
    false
}

/// True if a vision reply is a refusal rather than an analysis.
///
/// Refusals must never be cached: a transient decline would otherwise
/// poison later lookups for the same image.
pub fn is_refusal(reply: &str) -> bool {
    let lower = reply.to_lowercase();
    REFUSAL_MARKERS.iter().any(|m| lower.contains(m))
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
