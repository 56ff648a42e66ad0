//! Quality assessment and escalation decisions.
//!
//! Everything here is a pure function of its inputs: no network, no
//! randomness, no global state. The weight constants are undocumented
//! heuristic tunables inherited from production traffic, so they live in
//! [`QualityConfig`] as defaults rather than hard-coded behavior.

use crate::models::{ContentType, tier};

/// Score thresholds and scoring weights.
#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// Score at or above which a result is considered high confidence.
    pub high_threshold: f64,
    /// Score at or above which a result is acceptable (no escalation).
    pub medium_threshold: f64,
    /// Score below which a result needs human review.
    pub low_threshold: f64,
    /// Absolute floor; below this a tier is treated as failed.
    pub minimum_threshold: f64,

    /// OCR score weights: text length, word count, confidence.
    pub ocr_length_weight: f64,
    pub ocr_word_weight: f64,
    pub ocr_confidence_weight: f64,

    /// Content tags that always force escalation to the vision tier.
    pub complex_content_tags: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.90,
            medium_threshold: 0.70,
            low_threshold: 0.50,
            minimum_threshold: 0.30,
            ocr_length_weight: 0.3,
            ocr_word_weight: 0.3,
            ocr_confidence_weight: 0.4,
            complex_content_tags: [
                "chart",
                "graph",
                "diagram",
                "plot",
                "formula",
                "equation",
                "pivot",
                "scatter",
                "histogram",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Banded confidence derived from a quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
    Failed,
}

/// Derived accept/escalate decision for one tier output. Never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityAssessment {
    pub quality_score: f64,
    pub confidence_level: ConfidenceLevel,
    pub is_acceptable: bool,
    pub needs_fallback: bool,
}

impl QualityAssessment {
    pub fn needs_human_review(&self, config: &QualityConfig) -> bool {
        self.quality_score < config.low_threshold
    }
}

/// Pure scoring functions that turn tier outputs into accept/escalate
/// decisions.
#[derive(Debug, Clone, Default)]
pub struct QualityAssessor {
    config: QualityConfig,
}

impl QualityAssessor {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    fn assess(&self, score: f64) -> QualityAssessment {
        let score = score.clamp(0.0, 1.0);
        let confidence_level = if score >= self.config.high_threshold {
            ConfidenceLevel::High
        } else if score >= self.config.medium_threshold {
            ConfidenceLevel::Medium
        } else if score >= self.config.low_threshold {
            ConfidenceLevel::Low
        } else if score >= self.config.minimum_threshold {
            ConfidenceLevel::VeryLow
        } else {
            ConfidenceLevel::Failed
        };
        let is_acceptable = score >= self.config.medium_threshold;
        QualityAssessment {
            quality_score: score,
            confidence_level,
            is_acceptable,
            needs_fallback: !is_acceptable,
        }
    }

    /// Score an OCR output from its length, word count, and confidence.
    ///
    /// `0.3 * min(len/100, 1) + 0.3 * min(words/20, 1) + 0.4 * confidence`
    /// with the default weights.
    pub fn ocr_quality(
        &self,
        text_length: usize,
        word_count: usize,
        confidence: f64,
    ) -> QualityAssessment {
        let length_component = (text_length as f64 / 100.0).min(1.0);
        let word_component = (word_count as f64 / 20.0).min(1.0);
        let score = self.config.ocr_length_weight * length_component
            + self.config.ocr_word_weight * word_component
            + self.config.ocr_confidence_weight * confidence.clamp(0.0, 1.0);
        self.assess(score)
    }

    /// Score a structural table scan.
    pub fn table_quality(&self, tables_found: usize, markdown: &str) -> QualityAssessment {
        let score = if tables_found > 0 && !markdown.trim().is_empty() {
            0.9
        } else if tables_found > 0 {
            0.6
        } else {
            0.0
        };
        self.assess(score)
    }

    /// Score a final result from its tier, content type, and length.
    pub fn final_quality(
        &self,
        content: &str,
        content_type: ContentType,
        processing_tier: &str,
    ) -> QualityAssessment {
        let base: f64 = match processing_tier {
            t if t == tier::VISION => 0.9,
            t if t == tier::TABLE => 0.7,
            t if t == tier::OCR => 0.5,
            _ => 0.3,
        };
        let multiplier = match content_type {
            ContentType::Table => 1.1,
            ContentType::Chart => 1.2,
            ContentType::EnhancedText => 1.15,
            ContentType::PlainText => 1.0,
            ContentType::Other => 0.8,
        };
        let length_penalty = if content.len() < 20 { 0.8 } else { 1.0 };
        self.assess((base * multiplier * length_penalty).min(1.0))
    }

    /// Decide whether to escalate past the cheap tiers.
    ///
    /// Escalates when every prior tier is unacceptable, when any content
    /// tag names complex content, or when the mean prior score falls
    /// below the acceptance threshold.
    pub fn should_escalate(&self, prior: &[QualityAssessment], content_tags: &[String]) -> bool {
        if !prior.is_empty() && prior.iter().all(|a| !a.is_acceptable) {
            return true;
        }
        for tag in content_tags {
            let tag = tag.to_lowercase();
            if self
                .config
                .complex_content_tags
                .iter()
                .any(|c| tag.contains(c.as_str()))
            {
                return true;
            }
        }
        if prior.is_empty() {
            return false;
        }
        let mean = prior.iter().map(|a| a.quality_score).sum::<f64>() / prior.len() as f64;
        mean < self.config.medium_threshold
    }
}

/// Estimate OCR confidence when the engine exposes no native score.
///
/// Weighted blend of signals that distinguish real prose from line noise:
/// plausible average word length, ratio of common short words, ratio of
/// alphanumeric characters, sentence-like capitalization/punctuation, and
/// a length bonus.
pub fn estimate_ocr_confidence(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();
    let word_count = words.len();

    let avg_len = words.iter().map(|w| w.len()).sum::<usize>() as f64 / word_count as f64;
    let avg_len_signal = if (3.0..=8.0).contains(&avg_len) {
        1.0
    } else if (2.0..=10.0).contains(&avg_len) {
        0.5
    } else {
        0.0
    };

    const COMMON_WORDS: &[&str] = &[
        "the", "a", "an", "and", "or", "of", "to", "in", "is", "it", "for", "on", "with", "as",
    ];
    let common = words
        .iter()
        .filter(|w| COMMON_WORDS.contains(&w.to_lowercase().as_str()))
        .count();
    let common_signal = ((common as f64 / word_count as f64) * 4.0).min(1.0);

    let total_chars = trimmed.chars().count();
    let alnum = trimmed
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .count();
    let alnum_signal = alnum as f64 / total_chars as f64;

    let starts_capitalized = trimmed
        .chars()
        .next()
        .is_some_and(|c| c.is_uppercase() || c.is_numeric());
    let has_terminator = trimmed.contains(['.', '!', '?']);
    let sentence_signal = match (starts_capitalized, has_terminator) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.5,
        (false, false) => 0.0,
    };

    let length_bonus = (trimmed.len() as f64 / 200.0).min(1.0);

    0.25 * avg_len_signal
        + 0.20 * common_signal
        + 0.25 * alnum_signal
        + 0.15 * sentence_signal
        + 0.15 * length_bonus
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessor() -> QualityAssessor {
        QualityAssessor::default()
    }

    #[test]
    fn ocr_quality_matches_weighted_formula() {
        // 0.3*1.0 + 0.3*1.0 + 0.4*0.85 = 0.94
        let a = assessor().ocr_quality(150, 30, 0.85);
        assert!((a.quality_score - 0.94).abs() < 1e-9);
        assert!(a.is_acceptable);
        assert_eq!(a.confidence_level, ConfidenceLevel::High);
    }

    #[test]
    fn ocr_quality_is_monotone_in_each_input() {
        let q = assessor();
        for (lo, hi) in [(10, 80), (50, 100), (90, 400)] {
            assert!(
                q.ocr_quality(lo, 10, 0.5).quality_score
                    <= q.ocr_quality(hi, 10, 0.5).quality_score
            );
        }
        for (lo, hi) in [(1, 5), (10, 19), (15, 50)] {
            assert!(
                q.ocr_quality(80, lo, 0.5).quality_score
                    <= q.ocr_quality(80, hi, 0.5).quality_score
            );
        }
        for (lo, hi) in [(0.0, 0.3), (0.4, 0.6), (0.7, 1.0)] {
            assert!(
                q.ocr_quality(80, 10, lo).quality_score <= q.ocr_quality(80, 10, hi).quality_score
            );
        }
    }

    #[test]
    fn table_quality_bands() {
        let q = assessor();
        let full = q.table_quality(1, "| a | b |\n| --- | --- |");
        assert!((full.quality_score - 0.9).abs() < 1e-9);
        assert!(full.is_acceptable);

        let empty = q.table_quality(2, "   ");
        assert!((empty.quality_score - 0.6).abs() < 1e-9);
        assert!(!empty.is_acceptable);

        let none = q.table_quality(0, "");
        assert_eq!(none.quality_score, 0.0);
        assert_eq!(none.confidence_level, ConfidenceLevel::Failed);
    }

    #[test]
    fn final_quality_applies_tier_base_and_multipliers() {
        let q = assessor();
        let long_text = "a".repeat(40);

        // Tier 3 chart: 0.9 * 1.2 = 1.08, capped at 1.0.
        let chart = q.final_quality(&long_text, ContentType::Chart, tier::VISION);
        assert!((chart.quality_score - 1.0).abs() < 1e-9);

        // Tier 1 plain text: 0.5 * 1.0 = 0.5.
        let plain = q.final_quality(&long_text, ContentType::PlainText, tier::OCR);
        assert!((plain.quality_score - 0.5).abs() < 1e-9);
        assert!(!plain.is_acceptable);

        // Short content takes the 0.8 penalty.
        let short = q.final_quality("tiny", ContentType::PlainText, tier::OCR);
        assert!((short.quality_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn should_escalate_when_all_priors_unacceptable() {
        let q = assessor();
        let bad = q.ocr_quality(5, 1, 0.1);
        assert!(q.should_escalate(&[bad, bad], &[]));
    }

    #[test]
    fn should_escalate_on_complex_content_tag() {
        let q = assessor();
        let good = q.ocr_quality(150, 30, 0.9);
        assert!(q.should_escalate(&[good], &["revenue chart".to_string()]));
        assert!(q.should_escalate(&[good], &["Pivot Table".to_string()]));
    }

    #[test]
    fn should_escalate_on_low_mean_score() {
        let q = assessor();
        let good = q.ocr_quality(150, 30, 0.9); // ~0.96
        let bad = q.ocr_quality(5, 1, 0.0); // ~0.03
        // One acceptable result, but mean < 0.70.
        assert!(q.should_escalate(&[good, bad], &[]));
    }

    #[test]
    fn should_not_escalate_for_strong_priors_and_plain_tags() {
        let q = assessor();
        let good = q.ocr_quality(150, 30, 0.9);
        assert!(!q.should_escalate(&[good, good], &["screenshot".to_string()]));
    }

    #[test]
    fn confidence_estimate_rates_prose_above_noise() {
        let prose = "The quarterly report shows a steady rise in subscriptions. \
                     Most of the growth came from the new referral program.";
        let noise = "q z x v b n m zz xq";
        assert!(estimate_ocr_confidence(prose) > 0.6);
        assert!(estimate_ocr_confidence(noise) < 0.4);
        assert_eq!(estimate_ocr_confidence("   "), 0.0);
    }

    #[test]
    fn confidence_estimate_stays_in_unit_range() {
        for text in ["a", "Hello world.", &"word ".repeat(500)] {
            let c = estimate_ocr_confidence(text);
            assert!((0.0..=1.0).contains(&c), "confidence {c} out of range");
        }
    }
}
