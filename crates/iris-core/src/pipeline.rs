//! Tiered extraction pipeline: fetch → (OCR | table scan | AI vision) →
//! quality gate → cache → uniform result envelope.
//!
//! Generic over all external dependencies via traits, enabling dependency
//! injection and testability without real HTTP, OCR models, or vision
//! calls. Within one job the tiers run strictly sequentially; every
//! failure short of a circuit-open degrades the result instead of
//! propagating.

use crate::cache::{ResultCache, TtlClass};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::error::AppError;
use crate::models::{
    ExtractedContent, ExtractionResult, ImageReference, ProcessingResult, classify_reply,
    is_refusal, tier,
};
use crate::quality::{QualityAssessor, estimate_ocr_confidence};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::traits::{
    CacheStore, CounterStore, ImageFetcher, OcrEngine, TableDetector, VisionModel,
};

/// Cache tier id for the full-pipeline result.
const PIPELINE_TIER_ID: &str = "pipeline";

/// Build the vision prompt from the reference's content tags.
///
/// Pure so prompt changes are testable without a live model.
pub fn vision_prompt(content_tags: &[String]) -> String {
    let mut prompt = String::from(
        "Extract the content of this image. If it shows a table, reproduce it \
         as a pipe-delimited Markdown table with a header separator row. If it \
         shows a chart or graph, describe what it depicts, including axis \
         labels and the overall trend. Otherwise transcribe all visible text, \
         preserving headings and structure. Respond with the content only, no \
         commentary.",
    );
    if !content_tags.is_empty() {
        prompt.push_str("\n\nContext from the surrounding post: ");
        prompt.push_str(&content_tags.join(", "));
        prompt.push('.');
    }
    prompt
}

/// Orchestrates the full extraction pipeline for one image reference.
pub struct ExtractionPipeline<F, O, T, V, S, C>
where
    F: ImageFetcher,
    O: OcrEngine,
    T: TableDetector,
    V: VisionModel,
    S: CacheStore,
    C: CounterStore,
{
    fetcher: F,
    ocr: O,
    tables: T,
    vision: Option<V>,
    breaker: CircuitBreaker<C>,
    cache: ResultCache<S>,
    assessor: QualityAssessor,
    vision_retry: RetryPolicy,
}

impl<F, O, T, V, S, C> ExtractionPipeline<F, O, T, V, S, C>
where
    F: ImageFetcher,
    O: OcrEngine,
    T: TableDetector,
    V: VisionModel,
    S: CacheStore,
    C: CounterStore,
{
    /// Pipeline without a vision backend: Tier 1 and Tier 2 only.
    pub fn new(
        fetcher: F,
        ocr: O,
        tables: T,
        breaker: CircuitBreaker<C>,
        cache: ResultCache<S>,
    ) -> Self {
        Self {
            fetcher,
            ocr,
            tables,
            vision: None,
            breaker,
            cache,
            assessor: QualityAssessor::default(),
            vision_retry: RetryPolicy::default(),
        }
    }

    /// Pipeline with a vision backend: goes straight to Tier 3.
    pub fn with_vision(
        fetcher: F,
        ocr: O,
        tables: T,
        vision: V,
        breaker: CircuitBreaker<C>,
        cache: ResultCache<S>,
    ) -> Self {
        Self {
            fetcher,
            ocr,
            tables,
            vision: Some(vision),
            breaker,
            cache,
            assessor: QualityAssessor::default(),
            vision_retry: RetryPolicy::default(),
        }
    }

    pub fn with_assessor(mut self, assessor: QualityAssessor) -> Self {
        self.assessor = assessor;
        self
    }

    pub fn with_vision_retry(mut self, policy: RetryPolicy) -> Self {
        self.vision_retry = policy;
        self
    }

    /// Process one image reference into a best-effort result.
    ///
    /// Exactly one final result is returned per invocation. Everything
    /// except a circuit-open is recovered locally and reported through
    /// the `success`/`error` fields of the result.
    pub async fn process(&self, image: &ImageReference) -> Result<ProcessingResult, AppError> {
        // Inline payloads are decoded locally and never cached.
        if image.is_inline() {
            let bytes = match image.decode_inline() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "Inline image payload could not be decoded");
                    return Ok(self.placeholder(image, Some(e.to_string())).into());
                }
            };
            return Ok(self.extract(&bytes, image).await.into());
        }

        let key = ResultCache::<S>::extraction_key(&image.locator, PIPELINE_TIER_ID);
        match self.cache.get(&key).await {
            Ok(Some(hit)) => {
                tracing::info!(locator = %image.locator, tier = %hit.processing_tier, "Pipeline cache hit");
                return Ok(hit.into());
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Cache lookup failed, processing fresh"),
        }

        let fetched = match self
            .breaker
            .call(|| self.fetcher.fetch(&image.locator))
            .await
        {
            Ok(fetched) => fetched,
            Err(open @ CircuitBreakerError::Open { .. }) => {
                // The only error that crosses the pipeline boundary.
                return Err(open.into_app_error());
            }
            Err(CircuitBreakerError::Inner(e)) => {
                tracing::warn!(locator = %image.locator, error = %e, "Fetch exhausted all strategies");
                return Ok(ExtractionResult::failed(
                    tier::FETCH_FAILED,
                    format!("[image: {}]", image.basename()),
                    e.to_string(),
                )
                .into());
            }
        };

        tracing::debug!(
            locator = %image.locator,
            method = %fetched.method,
            bytes = fetched.bytes.len(),
            "Image fetched"
        );

        let result = self.extract(&fetched.bytes, image).await;
        // Full-pipeline results always take the long class, whichever tier
        // produced them.
        if let Err(e) = self.cache.put(&key, &result, TtlClass::Long).await {
            tracing::warn!(error = %e, "Cache write failed");
        }
        Ok(result.into())
    }

    /// Run the tiers against raw bytes and wrap the outcome.
    async fn extract(&self, bytes: &[u8], image: &ImageReference) -> ExtractionResult {
        match &self.vision {
            // Empirically the vision tier is more reliable than the local
            // tiers for forum content, so its presence short-circuits them.
            Some(vision) => self.vision_tier(vision, bytes, image).await,
            None => self.local_tiers(bytes, image),
        }
    }

    async fn vision_tier(
        &self,
        vision: &V,
        bytes: &[u8],
        image: &ImageReference,
    ) -> ExtractionResult {
        let prompt = vision_prompt(&image.content_tags);

        // Raw AI-call results get their own key so a reply survives even
        // when the surrounding pipeline entry is absent. Inline payloads
        // stay uncached.
        let ai_key = (!image.is_inline())
            .then(|| ResultCache::<S>::ai_key(vision.model(), &prompt, &image.locator));
        if let Some(key) = &ai_key {
            match self.cache.get(key).await {
                Ok(Some(hit)) => {
                    tracing::debug!(locator = %image.locator, "AI-call cache hit");
                    return hit;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "AI-call cache lookup failed"),
            }
        }

        let reply = retry_with_backoff(&self.vision_retry, || vision.describe(bytes, &prompt)).await;

        match reply {
            Ok(reply) if is_refusal(&reply.content) => {
                tracing::warn!(locator = %image.locator, model = %reply.model, "Vision model refused");
                self.placeholder(image, Some(AppError::AiRefusal(reply.content).to_string()))
            }
            Ok(reply) => {
                let content = classify_reply(&reply.content);
                tracing::info!(
                    locator = %image.locator,
                    model = %reply.model,
                    tokens = reply.tokens_used,
                    "Vision extraction complete"
                );
                let result = ExtractionResult::ok(content, tier::VISION)
                    .with_model(reply.model, reply.tokens_used);
                if let Some(key) = &ai_key
                    && let Err(e) = self.cache.put(key, &result, TtlClass::Long).await
                {
                    tracing::warn!(error = %e, "AI-call cache write failed");
                }
                result
            }
            Err(e) => {
                tracing::warn!(locator = %image.locator, error = %e, "Vision tier failed");
                self.placeholder(image, Some(e.to_string()))
            }
        }
    }

    fn local_tiers(&self, bytes: &[u8], image: &ImageReference) -> ExtractionResult {
        // Tier 1: OCR over a contrast-enhanced copy.
        let (ocr_text, ocr_assessment) = match self.ocr.recognize(bytes) {
            Ok(text) => {
                let word_count = text.split_whitespace().count();
                let confidence = estimate_ocr_confidence(&text);
                let assessment =
                    self.assessor
                        .ocr_quality(text.trim().len(), word_count, confidence);
                tracing::debug!(
                    chars = text.trim().len(),
                    words = word_count,
                    confidence,
                    score = assessment.quality_score,
                    "Tier 1 complete"
                );
                (Some(text), assessment)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Tier 1 OCR failed");
                (None, self.assessor.ocr_quality(0, 0, 0.0))
            }
        };

        // Tier 2: structural table scan.
        let (scan, table_assessment) = match self.tables.detect(bytes) {
            Ok(scan) => {
                let assessment = self.assessor.table_quality(scan.tables_found, &scan.markdown);
                tracing::debug!(
                    tables = scan.tables_found,
                    score = assessment.quality_score,
                    "Tier 2 complete"
                );
                (Some(scan), assessment)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Tier 2 table scan failed");
                (None, self.assessor.table_quality(0, ""))
            }
        };

        // Precedence: table result, then OCR text, then placeholder.
        if table_assessment.is_acceptable
            && let Some(scan) = scan
        {
            return ExtractionResult::ok(
                ExtractedContent::Table {
                    markdown: scan.markdown,
                },
                tier::TABLE,
            );
        }

        if ocr_assessment.is_acceptable
            && let Some(text) = ocr_text
        {
            return ExtractionResult::ok(ExtractedContent::PlainText { text }, tier::OCR);
        }

        tracing::info!(
            locator = %image.locator,
            ocr_score = ocr_assessment.quality_score,
            table_score = table_assessment.quality_score,
            "No tier produced acceptable content, degrading to placeholder"
        );
        self.placeholder(image, None)
    }

    fn placeholder(&self, image: &ImageReference, error: Option<String>) -> ExtractionResult {
        let note = format!("[image: {}]", image.basename());
        match error {
            Some(error) => ExtractionResult::failed(tier::BASIC, note, error),
            None => ExtractionResult::ok(ExtractedContent::Placeholder { note }, tier::BASIC),
        }
    }
}
