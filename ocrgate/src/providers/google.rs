use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{OcrError, ProviderErrorKind, Result};
use crate::models::{
    BoundingBox, OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth, TextBlock,
};

use super::{http, require, CallStats, OcrProvider};

const GOOGLE_VISION_BASE_URL: &str = "https://vision.googleapis.com";

/// Applied when the API omits block confidence, which it does for some models.
const DEFAULT_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext {
    language_hints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchAnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    full_text_annotation: Option<TextAnnotation>,
    #[serde(default)]
    error: Option<RpcStatus>,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    property: Option<TextProperty>,
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextProperty {
    #[serde(default)]
    detected_languages: Vec<DetectedLanguage>,
    #[serde(default)]
    detected_break: Option<DetectedBreak>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectedLanguage {
    language_code: String,
}

#[derive(Debug, Deserialize)]
struct DetectedBreak {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Block {
    #[serde(default)]
    property: Option<TextProperty>,
    #[serde(default)]
    bounding_box: Option<BoundingPoly>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

/// Zero coordinates are omitted on the wire.
#[derive(Debug, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
}

#[derive(Debug, Deserialize)]
struct Paragraph {
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Debug, Deserialize)]
struct Word {
    #[serde(default)]
    symbols: Vec<Symbol>,
}

#[derive(Debug, Deserialize)]
struct Symbol {
    #[serde(default)]
    text: String,
    #[serde(default)]
    property: Option<TextProperty>,
}

/// Google Cloud Vision `images:annotate` with document text detection.
#[derive(Debug)]
pub struct GoogleVisionProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    capabilities: ProviderCapabilities,
    stats: CallStats,
}

impl GoogleVisionProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = require(&config.api_key, "API key")?.to_string();

        Ok(Self {
            name: config.name.clone(),
            client: http::build_client(&config.name, config.timeout_secs)?,
            api_key,
            base_url: config
                .base_url
                .as_deref()
                .map(http::trim_base_url)
                .unwrap_or_else(|| GOOGLE_VISION_BASE_URL.to_string()),
            capabilities: config.resolved_capabilities(),
            stats: CallStats::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn annotate_url(&self) -> String {
        format!("{}/v1/images:annotate", self.base_url)
    }

    async fn recognize(&self, request: &OcrRequest) -> Result<OcrResult> {
        let started = Instant::now();
        let body = AnnotateImageRequest {
            image: ImageContent {
                content: STANDARD.encode(request.image()),
            },
            features: vec![Feature {
                kind: "DOCUMENT_TEXT_DETECTION".to_string(),
            }],
            image_context: request.language().map(|language| ImageContext {
                language_hints: vec![language.to_string()],
            }),
        };

        debug!(provider = %self.name, "Sending annotate request");
        let response = http::send(
            &self.name,
            self.client
                .post(self.annotate_url())
                .query(&[("key", self.api_key.as_str())])
                .json(&json!({ "requests": [body] })),
        )
        .await?;
        let batch: BatchAnnotateResponse = http::parse_json(&self.name, response).await?;

        let annotated = batch.responses.into_iter().next().ok_or_else(|| {
            OcrError::provider(
                &self.name,
                ProviderErrorKind::InvalidResponse,
                "Empty annotate response",
            )
        })?;

        if let Some(status) = annotated.error {
            return Err(OcrError::provider(
                &self.name,
                rpc_kind(status.code),
                format!("Vision API error {}: {}", status.code, status.message),
            ));
        }

        // No annotation means no text was found, not a failure.
        let (blocks, language) = annotated
            .full_text_annotation
            .map(to_blocks)
            .unwrap_or_default();

        Ok(OcrResult::from_blocks(
            &self.name,
            blocks,
            language.as_deref(),
            started.elapsed(),
            self.capabilities.cost_per_request,
        ))
    }
}

/// google.rpc.Code to our error taxonomy.
fn rpc_kind(code: i32) -> ProviderErrorKind {
    match code {
        3 | 11 => ProviderErrorKind::MalformedImage,
        4 => ProviderErrorKind::Timeout,
        7 | 16 => ProviderErrorKind::Auth,
        8 => ProviderErrorKind::Quota,
        13 | 14 => ProviderErrorKind::Server,
        _ => ProviderErrorKind::InvalidResponse,
    }
}

fn first_language(property: Option<&TextProperty>) -> Option<String> {
    property
        .and_then(|p| p.detected_languages.first())
        .map(|l| l.language_code.clone())
}

fn block_text(block: &Block) -> String {
    let mut text = String::new();
    for paragraph in &block.paragraphs {
        for word in &paragraph.words {
            for symbol in &word.symbols {
                text.push_str(&symbol.text);
                let separator = symbol
                    .property
                    .as_ref()
                    .and_then(|p| p.detected_break.as_ref())
                    .map(|b| match b.kind.as_str() {
                        "SPACE" | "SURE_SPACE" => " ",
                        "EOL_SURE_SPACE" | "LINE_BREAK" => "\n",
                        "HYPHEN" => "-\n",
                        _ => "",
                    })
                    .unwrap_or("");
                text.push_str(separator);
            }
        }
    }
    text.trim().to_string()
}

fn to_blocks(annotation: TextAnnotation) -> (Vec<TextBlock>, Option<String>) {
    let language = annotation
        .pages
        .iter()
        .find_map(|p| first_language(p.property.as_ref()));

    let mut blocks = Vec::new();
    for page in &annotation.pages {
        let page_language = first_language(page.property.as_ref());
        for block in &page.blocks {
            let text = block_text(block);
            if text.is_empty() {
                continue;
            }
            let points: Vec<(f64, f64)> = block
                .bounding_box
                .as_ref()
                .map(|poly| poly.vertices.iter().map(|v| (v.x, v.y)).collect())
                .unwrap_or_default();
            let block_language = first_language(block.property.as_ref()).or(page_language.clone());
            blocks.push(
                TextBlock::new(
                    text,
                    block.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                    BoundingBox::from_points(&points),
                )
                .with_language(block_language.as_deref()),
            );
        }
    }

    (blocks, language)
}

#[async_trait]
impl OcrProvider for GoogleVisionProvider {
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

    /// An empty batch costs nothing but still exercises the key.
    async fn check_health(&self) -> ProviderHealth {
        http::probe(
            &self.name,
            &self.stats,
            self.client
                .post(self.annotate_url())
                .query(&[("key", self.api_key.as_str())])
                .json(&json!({ "requests": [] })),
        )
        .await
    }
}
