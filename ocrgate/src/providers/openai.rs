use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{OcrError, ProviderErrorKind, Result};
use crate::models::{
    BoundingBox, OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth, TextBlock,
};

use super::{http, image_dimensions, require, CallStats, OcrProvider};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

/// The model returns no per-line scores; this constant is a heuristic, not a measurement.
const HEURISTIC_CONFIDENCE: f64 = 0.85;

const EXPECTED_OUTPUT_TOKENS: u64 = 500;

const OCR_PROMPT: &str = "Extract all text from this image. Respond with a JSON object \
{\"text\": string, \"language\": ISO 639-1 code, \"lines\": [{\"text\": string, \"handwritten\": boolean}]} \
listing lines in natural reading order. Do not add explanations.";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ExtractedText {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    lines: Vec<ExtractedLine>,
}

#[derive(Debug, Deserialize)]
struct ExtractedLine {
    text: String,
    #[serde(default)]
    handwritten: bool,
}

/// GPT-4o style vision model used as an OCR engine.
#[derive(Debug)]
pub struct OpenAiVisionProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    capabilities: ProviderCapabilities,
    stats: CallStats,
}

impl OpenAiVisionProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = require(&config.api_key, "API key")?.to_string();

        let base_url = config
            .base_url
            .as_deref()
            .map(http::trim_base_url)
            .unwrap_or_else(|| OPENAI_BASE_URL.to_string());

        Ok(Self {
            name: config.name.clone(),
            client: http::build_client(&config.name, config.timeout_secs)?,
            api_key,
            base_url,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            capabilities: config.resolved_capabilities(),
            stats: CallStats::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn token_cost(&self, tokens: u64) -> f64 {
        let per_1k = self.capabilities.cost_per_1k_tokens.unwrap_or(0.0);
        self.capabilities.cost_per_request + per_1k * tokens as f64 / 1000.0
    }

    async fn recognize(&self, request: &OcrRequest) -> Result<OcrResult> {
        let started = Instant::now();
        let data_url = format!(
            "data:{};base64,{}",
            request.mime_type(),
            STANDARD.encode(request.image())
        );

        let mut prompt = OCR_PROMPT.to_string();
        if let Some(language) = request.language() {
            prompt.push_str(&format!(" The expected language is '{language}'."));
        }

        let chat = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text { text: prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_url,
                            detail: "high".to_string(),
                        },
                    },
                ],
            }],
            max_tokens: 4096,
            response_format: ResponseFormat {
                kind: "json_object".to_string(),
            },
        };

        debug!(provider = %self.name, model = %self.model, "Sending vision OCR request");
        let response = http::send(
            &self.name,
            self.client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&chat),
        )
        .await?;
        let body: ChatResponse = http::parse_json(&self.name, response).await?;

        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| {
                OcrError::provider(
                    &self.name,
                    ProviderErrorKind::InvalidResponse,
                    "No response from API",
                )
            })?;

        let (blocks, language) = parse_content(&content);
        let tokens = body
            .usage
            .map(|u| u.total_tokens)
            .unwrap_or_else(|| estimate_request_tokens(request.image()));

        Ok(OcrResult::from_blocks(
            &self.name,
            blocks,
            language.as_deref(),
            started.elapsed(),
            self.token_cost(tokens),
        )
        .with_metadata("model", self.model.clone())
        .with_metadata("tokens", tokens)
        .with_metadata("confidence_source", "heuristic"))
    }
}

/// Accepts the requested JSON shape, falling back to treating the reply as plain text.
fn parse_content(content: &str) -> (Vec<TextBlock>, Option<String>) {
    let zero = BoundingBox::default();
    match serde_json::from_str::<ExtractedText>(content) {
        Ok(extracted) => {
            let language = extracted.language.clone();
            let blocks: Vec<TextBlock> = if extracted.lines.is_empty() {
                extracted
                    .text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| TextBlock::new(l, HEURISTIC_CONFIDENCE, zero))
                    .collect()
            } else {
                extracted
                    .lines
                    .into_iter()
                    .filter(|l| !l.text.trim().is_empty())
                    .map(|l| {
                        TextBlock::new(l.text.trim(), HEURISTIC_CONFIDENCE, zero)
                            .handwritten(l.handwritten)
                    })
                    .collect()
            };
            let blocks = blocks
                .into_iter()
                .map(|b| b.with_language(language.as_deref()))
                .collect();
            (blocks, language)
        }
        Err(_) => {
            let blocks = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| TextBlock::new(l, HEURISTIC_CONFIDENCE, zero))
                .collect();
            (blocks, None)
        }
    }
}

/// Vision token count for a high-detail image: 85 base plus 170 per 512px tile
/// after fitting into 2048x2048 and scaling the short side to 768.
pub(crate) fn estimate_image_tokens(width: u32, height: u32) -> u64 {
    if width == 0 || height == 0 {
        return 85;
    }
    let (mut w, mut h) = (width as f64, height as f64);
    let fit = (2048.0 / w.max(h)).min(1.0);
    w *= fit;
    h *= fit;
    let shrink = (768.0 / w.min(h)).min(1.0);
    w *= shrink;
    h *= shrink;
    let tiles = (w / 512.0).ceil() * (h / 512.0).ceil();
    85 + 170 * tiles as u64
}

fn estimate_request_tokens(image: &[u8]) -> u64 {
    let (width, height) = image_dimensions(image).unwrap_or((1024, 1024));
    estimate_image_tokens(width, height) + EXPECTED_OUTPUT_TOKENS
}

#[async_trait]
impl OcrProvider for OpenAiVisionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn process_image(
        &self,
        request: &OcrRequest,
        cancel: &CancellationToken,
    ) -> Result<OcrResult> {
        let result = http::cancellable(cancel, self.recognize(request)).await;
        self.stats.record(&result);
        result
    }

    fn record_failure(&self, error: &OcrError) {
        self.stats.record_error(error);
    }

    async fn check_health(&self) -> ProviderHealth {
        http::probe(
            &self.name,
            &self.stats,
            self.client
                .get(format!("{}/models", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key)),
        )
        .await
    }

    async fn cost_estimate(&self, _size_bytes: u64, request: &OcrRequest) -> f64 {
        self.token_cost(estimate_request_tokens(request.image()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn config(api_key: Option<&str>) -> ProviderConfig {
        let mut config = ProviderConfig::new("openai", ProviderKind::OpenAi);
        config.api_key = api_key.map(String::from);
        config
    }

    #[test]
    fn test_requires_api_key() {
        let result = OpenAiVisionProvider::new(&config(None));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key required"));
    }

    #[test]
    fn test_defaults() {
        let provider = OpenAiVisionProvider::new(&config(Some("sk-test"))).unwrap();
        assert_eq!(provider.base_url(), "https://api.openai.com/v1");
        assert_eq!(provider.model(), "gpt-4o");
    }

    #[test]
    fn test_custom_base_url_and_model() {
        let mut config = config(Some("sk-test"));
        config.base_url = Some("https://proxy.example.com/v1/".to_string());
        config.model = Some("gpt-4o-mini".to_string());
        let provider = OpenAiVisionProvider::new(&config).unwrap();
        assert_eq!(provider.base_url(), "https://proxy.example.com/v1");
        assert_eq!(provider.model(), "gpt-4o-mini");
    }

    #[test]
    fn test_parse_structured_content() {
        let (blocks, language) = parse_content(
            r#"{"text": "Dear Sir\nthanks", "language": "fr",
                "lines": [{"text": "Dear Sir", "handwritten": false},
                          {"text": "thanks", "handwritten": true}]}"#,
        );
        assert_eq!(language.as_deref(), Some("fr"));
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1].is_handwritten);
        assert_eq!(blocks[0].confidence, HEURISTIC_CONFIDENCE);
        assert_eq!(blocks[0].language, "fr");
    }

    #[test]
    fn test_parse_plain_text_fallback() {
        let (blocks, language) = parse_content("INVOICE 42\n\nTotal: 10 EUR\n");
        assert!(language.is_none());
        let texts: Vec<&str> = blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["INVOICE 42", "Total: 10 EUR"]);
    }

    #[test]
    fn test_estimate_image_tokens() {
        // 1024x1024 -> 768x768 -> 2x2 tiles
        assert_eq!(estimate_image_tokens(1024, 1024), 85 + 170 * 4);
        // 4096x2048 -> 2048x1024 -> 1536x768 -> 3x2 tiles
        assert_eq!(estimate_image_tokens(4096, 2048), 85 + 170 * 6);
        // small images are not upscaled
        assert_eq!(estimate_image_tokens(300, 200), 85 + 170);
    }

    #[tokio::test]
    async fn test_cost_estimate_uses_token_pricing() {
        let provider = OpenAiVisionProvider::new(&config(Some("sk-test"))).unwrap();
        let request = OcrRequest::new(vec![0u8; 64]);
        let cost = provider.cost_estimate(64, &request).await;
        let expected_tokens = 85 + 170 * 4 + EXPECTED_OUTPUT_TOKENS;
        assert!((cost - 0.005 * expected_tokens as f64 / 1000.0).abs() < 1e-12);
    }
}
