use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, multipart, Client};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ProviderConfig, UploadMode};
use crate::error::{OcrError, ProviderErrorKind, Result};
use crate::models::{
    BoundingBox, OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth, TextBlock,
};

use super::{http, require, CallStats, OcrProvider};

/// Used for blocks synthesized from bare text, which carry no measured score.
const FALLBACK_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Deserialize)]
struct PaddleResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    text_blocks: Vec<PaddleBlock>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    processing_time: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaddleBlock {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    bounding_box: Option<PaddleBox>,
    #[serde(default)]
    is_handwritten: bool,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaddleBox {
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
}

/// Client for a self-hosted PaddleOCR-style HTTP server.
#[derive(Debug)]
pub struct PaddleOcrProvider {
    name: String,
    client: Client,
    base_url: String,
    upload_mode: UploadMode,
    capabilities: ProviderCapabilities,
    stats: CallStats,
}

impl PaddleOcrProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let base_url = require(&config.base_url, "Service base URL")?;

        Ok(Self {
            name: config.name.clone(),
            client: http::build_client(&config.name, config.timeout_secs)?,
            base_url: http::trim_base_url(base_url),
            upload_mode: config.upload_mode,
            capabilities: config.resolved_capabilities(),
            stats: CallStats::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn recognize(&self, request: &OcrRequest) -> Result<OcrResult> {
        let started = Instant::now();
        let mime_type = request.mime_type();

        let builder = match self.upload_mode {
            UploadMode::Multipart => {
                let file_name = request
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("image.{}", request.extension()));
                let part = multipart::Part::bytes(request.image().to_vec())
                    .file_name(file_name)
                    .mime_str(&mime_type)
                    .map_err(|e| OcrError::Validation(format!("Invalid MIME type: {e}")))?;
                let mut form = multipart::Form::new().part("image", part);
                if let Some(language) = request.language() {
                    form = form.text("language", language.to_string());
                }
                self.client
                    .post(format!("{}/ocr", self.base_url))
                    .multipart(form)
            }
            UploadMode::Raw => {
                let mut builder = self
                    .client
                    .post(format!("{}/ocr-bytes", self.base_url))
                    .header(CONTENT_TYPE, mime_type)
                    .body(request.image().clone());
                if let Some(language) = request.language() {
                    builder = builder.query(&[("language", language)]);
                }
                builder
            }
        };

        debug!(provider = %self.name, mode = ?self.upload_mode, "Sending PaddleOCR request");
        let response = http::send(&self.name, builder).await?;
        let body: PaddleResponse = http::parse_json(&self.name, response).await?;

        if let Some(error) = body.error.as_deref().filter(|e| !e.trim().is_empty()) {
            return Err(OcrError::provider(
                &self.name,
                ProviderErrorKind::InvalidResponse,
                format!("Service reported error: {error}"),
            ));
        }

        let language = body.language.clone();
        let vendor_time = body.processing_time;
        let blocks = to_blocks(body);

        let mut result = OcrResult::from_blocks(
            &self.name,
            blocks,
            language.as_deref(),
            started.elapsed(),
            self.capabilities.cost_per_request,
        );
        if let Some(seconds) = vendor_time {
            result = result.with_metadata("vendor_processing_time_secs", seconds);
        }
        Ok(result)
    }
}

fn to_blocks(body: PaddleResponse) -> Vec<TextBlock> {
    if body.text_blocks.is_empty() {
        // Text-only answers become one block per non-empty line.
        let confidence = body.confidence.unwrap_or(FALLBACK_CONFIDENCE);
        return body
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                TextBlock::new(line, confidence, BoundingBox::default())
                    .with_language(body.language.as_deref())
            })
            .collect();
    }

    let fallback_confidence = body.confidence.unwrap_or(FALLBACK_CONFIDENCE);
    body.text_blocks
        .into_iter()
        .filter(|b| !b.text.trim().is_empty())
        .map(|b| {
            let bbox = b
                .bounding_box
                .map(|r| BoundingBox::new(r.x, r.y, r.width, r.height))
                .unwrap_or_default();
            TextBlock::new(b.text, b.confidence.unwrap_or(fallback_confidence), bbox)
                .handwritten(b.is_handwritten)
                .with_language(b.language.as_deref().or(body.language.as_deref()))
        })
        .collect()
}

#[async_trait]
impl OcrProvider for PaddleOcrProvider {
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

    /// The readiness endpoint must answer 2xx; anything else is unhealthy.
    async fn check_health(&self) -> ProviderHealth {
        let started = Instant::now();
        let outcome = http::send(
            &self.name,
            self.client.get(format!("{}/health", self.base_url)),
        )
        .await;
        let elapsed = started.elapsed();
        let success_rate = self.stats.success_rate();

        match outcome {
            Ok(_) => ProviderHealth::healthy(elapsed, success_rate),
            Err(OcrError::Provider {
                kind: ProviderErrorKind::Quota,
                message,
                ..
            }) => ProviderHealth::degraded(elapsed, success_rate, message),
            Err(e) => ProviderHealth::unhealthy(elapsed, success_rate, e.to_string()),
        }
    }

    fn estimated_processing_time(&self, size_bytes: u64) -> Duration {
        // CPU-bound on the server: roughly linear in payload size.
        let per_mib = size_bytes as f64 / (1024.0 * 1024.0);
        let base = self.capabilities.avg_response_time_ms as f64;
        Duration::from_millis((base * (1.0 + 0.25 * per_mib)).round() as u64)
    }
}
