//! OpenAI-compatible vision chat-completion client.
//!
//! Works with any OpenAI-compatible API, including:
//! - OpenAI directly (`https://api.openai.com/v1`)
//! - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
//!
//! The image is downscaled to the vision model's sweet spot, inlined as a
//! base64 PNG data URI, and sent alongside the prompt as a multimodal user
//! message.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::imageops::FilterType;
use iris_core::error::AppError;
use iris_core::models::VisionReply;
use iris_core::traits::VisionModel;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_VISION_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.1;

/// Downscale targets. Past these sizes the model sees no extra detail and
/// the request just burns tokens.
const MAX_SHORT_SIDE: u32 = 768;
const MAX_LONG_SIDE: u32 = 2000;

/// Vision-capable chat-completion client.
#[derive(Clone)]
pub struct OpenAiVision {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiVision {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_VISION_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let mut client = Self::build(&self.api_key, &self.model, &self.base_url, timeout)?;
        client.max_tokens = self.max_tokens;
        client.temperature = self.temperature;
        Ok(client)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        })
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
    detail: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Target dimensions keeping aspect ratio within the model's size band.
/// Returns `None` when the image is already small enough.
fn downscale_dims(width: u32, height: u32) -> Option<(u32, u32)> {
    let (short, long) = if width <= height {
        (width, height)
    } else {
        (height, width)
    };
    let scale = (MAX_SHORT_SIDE as f64 / short as f64).min(MAX_LONG_SIDE as f64 / long as f64);
    if scale >= 1.0 {
        return None;
    }
    Some((
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    ))
}

/// Decode, downscale if oversized, and re-encode as a PNG data URI.
fn image_data_uri(image: &[u8]) -> Result<String, AppError> {
    let img = image::load_from_memory(image)
        .map_err(|e| AppError::ExtractionFailed(format!("Failed to decode image: {e}")))?;

    let img = match downscale_dims(img.width(), img.height()) {
        Some((w, h)) => img.resize_exact(w, h, FilterType::Triangle),
        None => img,
    };

    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| AppError::ExtractionFailed(format!("Failed to encode image: {e}")))?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(&png)))
}

impl VisionModel for OpenAiVision {
    fn model(&self) -> &str {
        &self.model
    }

    async fn describe(&self, image: &[u8], prompt: &str) -> Result<VisionReply, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let data_uri = image_data_uri(image)?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: prompt.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_uri,
                            detail: "high".to_string(),
                        },
                    },
                ],
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {}", e))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();

            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status_code, body));

            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }

            return Err(AppError::VisionError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse vision response: {}", e)))?;

        let tokens_used = chat_response
            .usage
            .as_ref()
            .map(|u| u.total_tokens)
            .unwrap_or(0);
        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::VisionError {
                message: "Empty response from vision model".into(),
                status_code: 200,
                retryable: false,
            })?;

        Ok(VisionReply {
            content,
            model: self.model.clone(),
            tokens_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_images_are_not_downscaled() {
        assert_eq!(downscale_dims(640, 480), None);
        assert_eq!(downscale_dims(768, 2000), None);
    }

    #[test]
    fn tall_screenshots_scale_by_the_long_side() {
        // 800×4000: short-side scale would be 0.96 but the long side
        // forces 0.5.
        assert_eq!(downscale_dims(800, 4000), Some((400, 2000)));
    }

    #[test]
    fn wide_images_scale_by_the_short_side() {
        let (w, h) = downscale_dims(3000, 1536).unwrap();
        assert_eq!(h, 768);
        assert_eq!(w, 1500);
    }

    #[test]
    fn data_uri_has_png_prefix_and_decodes_back() {
        let mut png = Vec::new();
        image::RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]))
            .write_to(
                &mut std::io::Cursor::new(&mut png),
                image::ImageFormat::Png,
            )
            .unwrap();
        let uri = image_data_uri(&png).unwrap();
        let payload = uri.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = BASE64.decode(payload).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 4));
    }

    #[test]
    fn garbage_bytes_are_rejected_before_any_request() {
        let err = image_data_uri(b"not an image").unwrap_err();
        assert!(matches!(err, AppError::ExtractionFailed(_)));
    }

    #[test]
    fn content_parts_serialize_to_the_openai_wire_shape() {
        let part = ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "data:image/png;base64,AAAA".to_string(),
                detail: "high".to_string(),
            },
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "image_url");
        assert_eq!(json["image_url"]["detail"], "high");

        let text = ContentPart::Text {
            text: "Describe".to_string(),
        };
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "Describe");
    }
}
