//! Content-keyed cache for expensive tier outputs.
//!
//! Keys are stable SHA-256 hashes of canonicalized inputs, so any worker
//! that derives the same (locator, tier) pair reads the same entry.
//! Writes are idempotent; last-writer-wins is acceptable because content
//! for a given key is treated as effectively deterministic.

use std::time::Duration;

use crate::error::AppError;
use crate::models::{ExtractedContent, ExtractionResult, compute_hash, is_refusal};
use crate::traits::CacheStore;

/// TTL class for a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// General-purpose results.
    Short,
    /// Expensive results: vision replies and full-pipeline outputs.
    Long,
}

/// TTL durations for the two classes.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub short_ttl: Duration,
    pub long_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            short_ttl: Duration::from_secs(24 * 60 * 60),
            long_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Cache wrapper enforcing the write policy: failures and AI refusals are
/// never stored, and expensive tiers always take the long TTL class.
#[derive(Clone)]
pub struct ResultCache<S: CacheStore> {
    store: S,
    config: CacheConfig,
}

impl<S: CacheStore> ResultCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: CacheConfig::default(),
        }
    }

    pub fn with_config(store: S, config: CacheConfig) -> Self {
        Self { store, config }
    }

    /// Key for a per-tier or full-pipeline result.
    pub fn extraction_key(locator: &str, tier_id: &str) -> String {
        format!("extract:{}", compute_hash(&format!("{locator}|{tier_id}")))
    }

    /// Key for a raw AI-call result.
    pub fn ai_key(model: &str, prompt: &str, locator: &str) -> String {
        format!(
            "ai:{}",
            compute_hash(&format!("{model}|{prompt}|{locator}"))
        )
    }

    pub async fn get(&self, key: &str) -> Result<Option<ExtractionResult>, AppError> {
        let hit = self.store.get(key).await?;
        if hit.is_some() {
            tracing::debug!(key, "Cache hit");
        }
        Ok(hit)
    }

    /// Write a result unless it represents a negative outcome.
    ///
    /// The caller picks the TTL class: full-pipeline and AI-call results
    /// are always [`TtlClass::Long`] regardless of the tier that produced
    /// them. Returns true when the entry was actually written.
    pub async fn put(
        &self,
        key: &str,
        result: &ExtractionResult,
        class: TtlClass,
    ) -> Result<bool, AppError> {
        if !result.success {
            tracing::debug!(key, "Skipping cache write for failed result");
            return Ok(false);
        }
        if matches!(result.content, ExtractedContent::Placeholder { .. }) {
            tracing::debug!(key, "Skipping cache write for placeholder");
            return Ok(false);
        }
        if is_refusal(result.content.text()) {
            tracing::debug!(key, "Skipping cache write for AI refusal");
            return Ok(false);
        }

        let ttl = match class {
            TtlClass::Short => self.config.short_ttl,
            TtlClass::Long => self.config.long_ttl,
        };
        self.store.set(key, result, ttl).await?;
        Ok(true)
    }
}
