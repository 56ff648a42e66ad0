//! Local OCR backed by the pure-Rust `ocrs` engine.
//!
//! The engine is loaded once per process and reused for every call:
//! `ocrs::OcrEngine` is `Send + Sync` and recognition takes `&self`, so a
//! `OnceLock` is enough.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use iris_core::error::AppError;
use iris_core::traits::OcrEngine;

/// Global cached engine, initialized on first recognition.
static OCR_ENGINE: OnceLock<ocrs::OcrEngine> = OnceLock::new();

const DETECTION_MODEL: &str = "text-detection.rten";
const RECOGNITION_MODEL: &str = "text-recognition.rten";

/// OCR engine reading `.rten` model files from a local directory.
#[derive(Debug, Clone)]
pub struct OcrsEngine {
    model_dir: PathBuf,
}

impl OcrsEngine {
    /// `model_dir` must contain `text-detection.rten` and
    /// `text-recognition.rten`.
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn models_present(&self) -> bool {
        self.model_dir.join(DETECTION_MODEL).is_file()
            && self.model_dir.join(RECOGNITION_MODEL).is_file()
    }

    fn engine(&self) -> Result<&'static ocrs::OcrEngine, AppError> {
        if let Some(engine) = OCR_ENGINE.get() {
            return Ok(engine);
        }

        let engine = build_engine(&self.model_dir)?;
        // If another thread won the init race its engine is equivalent.
        let _ = OCR_ENGINE.set(engine);
        OCR_ENGINE
            .get()
            .ok_or_else(|| AppError::ExtractionFailed("Failed to cache OCR engine".to_string()))
    }
}

fn build_engine(model_dir: &Path) -> Result<ocrs::OcrEngine, AppError> {
    let detection_model = rten::Model::load_file(model_dir.join(DETECTION_MODEL))
        .map_err(|e| AppError::ExtractionFailed(format!("Failed to load detection model: {e}")))?;
    let recognition_model = rten::Model::load_file(model_dir.join(RECOGNITION_MODEL)).map_err(
        |e| AppError::ExtractionFailed(format!("Failed to load recognition model: {e}")),
    )?;

    ocrs::OcrEngine::new(ocrs::OcrEngineParams {
        detection_model: Some(detection_model),
        recognition_model: Some(recognition_model),
        ..Default::default()
    })
    .map_err(|e| AppError::ExtractionFailed(format!("Failed to create OCR engine: {e}")))
}

impl OcrEngine for OcrsEngine {
    fn recognize(&self, image: &[u8]) -> Result<String, AppError> {
        let started = Instant::now();
        let engine = self.engine()?;

        let img = image::load_from_memory(image)
            .map_err(|e| AppError::ExtractionFailed(format!("Failed to decode image: {e}")))?;
        // Screenshots of text benefit from a contrast push before
        // recognition.
        let rgb = img.grayscale().adjust_contrast(32.0).to_rgb8();
        let (width, height) = rgb.dimensions();

        let source = ocrs::ImageSource::from_bytes(rgb.as_raw(), (width, height))
            .map_err(|e| AppError::ExtractionFailed(format!("Failed to convert image: {e}")))?;
        let input = engine
            .prepare_input(source)
            .map_err(|e| AppError::ExtractionFailed(format!("Failed to prepare input: {e}")))?;
        let text = engine
            .get_text(&input)
            .map_err(|e| AppError::ExtractionFailed(format!("Failed to extract text: {e}")))?;

        tracing::debug!(
            chars = text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "OCR pass complete"
        );
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_present_is_false_for_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = OcrsEngine::new(dir.path());
        assert!(!engine.models_present());
    }

    #[test]
    fn recognize_without_models_reports_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = OcrsEngine::new(dir.path());
        let mut png = Vec::new();
        image::RgbImage::from_pixel(64, 64, image::Rgb([255, 255, 255]))
            .write_to(
                &mut std::io::Cursor::new(&mut png),
                image::ImageFormat::Png,
            )
            .unwrap();
        match engine.recognize(&png) {
            Err(AppError::ExtractionFailed(_)) => {}
            other => panic!("expected ExtractionFailed, got {other:?}"),
        }
    }
}
