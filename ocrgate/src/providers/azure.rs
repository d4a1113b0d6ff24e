use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::{OcrError, ProviderErrorKind, Result};
use crate::models::{
    BoundingBox, OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth, TextBlock,
};

use super::{http, require, CallStats, OcrProvider};

const READ_API_PATH: &str = "vision/v3.2/read";
const KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadOperation {
    status: String,
    #[serde(default)]
    analyze_result: Option<AnalyzeResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    #[serde(default)]
    read_results: Vec<ReadPage>,
}

#[derive(Debug, Deserialize)]
struct ReadPage {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    lines: Vec<ReadLine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadLine {
    text: String,
    #[serde(default)]
    bounding_box: Vec<f64>,
    #[serde(default)]
    appearance: Option<Appearance>,
    #[serde(default)]
    words: Vec<ReadWord>,
}

#[derive(Debug, Deserialize)]
struct Appearance {
    style: AppearanceStyle,
}

#[derive(Debug, Deserialize)]
struct AppearanceStyle {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ReadWord {
    #[serde(default)]
    confidence: Option<f64>,
}

/// Azure Computer Vision Read API: submit the image, then poll the operation.
#[derive(Debug)]
pub struct AzureReadProvider {
    name: String,
    client: Client,
    endpoint: String,
    api_key: String,
    poll_interval: Duration,
    max_polls: u32,
    capabilities: ProviderCapabilities,
    stats: CallStats,
}

impl AzureReadProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let endpoint = require(&config.base_url, "Endpoint")?;
        let api_key = require(&config.api_key, "API key")?.to_string();
        url::Url::parse(endpoint)
            .map_err(|e| OcrError::Configuration(format!("Invalid endpoint '{endpoint}': {e}")))?;

        let poll_interval_ms = config.poll_interval_ms.max(1);
        let max_polls = ((config.timeout_secs * 1000) / poll_interval_ms).max(1);

        Ok(Self {
            name: config.name.clone(),
            client: http::build_client(&config.name, config.timeout_secs)?,
            endpoint: http::trim_base_url(endpoint),
            api_key,
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_polls: u32::try_from(max_polls).unwrap_or(u32::MAX),
            capabilities: config.resolved_capabilities(),
            stats: CallStats::default(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn submit(&self, request: &OcrRequest) -> Result<String> {
        let mut builder = self
            .client
            .post(format!("{}/{READ_API_PATH}/analyze", self.endpoint))
            .header(KEY_HEADER, &self.api_key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(request.image().clone());
        if let Some(language) = request.language() {
            builder = builder.query(&[("language", language)]);
        }

        let response = http::send(&self.name, builder).await?;
        response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                OcrError::provider(
                    &self.name,
                    ProviderErrorKind::InvalidResponse,
                    "Missing Operation-Location header",
                )
            })
    }

    async fn poll(&self, operation_url: &str) -> Result<AnalyzeResult> {
        for attempt in 1..=self.max_polls {
            let response = http::send(
                &self.name,
                self.client.get(operation_url).header(KEY_HEADER, &self.api_key),
            )
            .await?;
            let operation: ReadOperation = http::parse_json(&self.name, response).await?;

            match operation.status.as_str() {
                "succeeded" => {
                    return operation.analyze_result.ok_or_else(|| {
                        OcrError::provider(
                            &self.name,
                            ProviderErrorKind::InvalidResponse,
                            "Operation succeeded without analyzeResult",
                        )
                    });
                }
                "failed" => {
                    return Err(OcrError::provider(
                        &self.name,
                        ProviderErrorKind::Server,
                        "Read operation failed",
                    ));
                }
                status => {
                    debug!(provider = %self.name, attempt, status, "Read operation pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        warn!(provider = %self.name, polls = self.max_polls, "Read operation did not finish");
        Err(OcrError::provider(
            &self.name,
            ProviderErrorKind::Timeout,
            format!("Read operation not finished after {} polls", self.max_polls),
        ))
    }

    async fn recognize(&self, request: &OcrRequest) -> Result<OcrResult> {
        let started = Instant::now();
        let operation_url = self.submit(request).await?;
        debug!(provider = %self.name, operation = %operation_url, "Read operation submitted");

        let analyzed = self.poll(&operation_url).await?;
        let pages = analyzed.read_results.len();
        let (blocks, language) = to_blocks(analyzed);

        Ok(OcrResult::from_blocks(
            &self.name,
            blocks,
            language.as_deref(),
            started.elapsed(),
            self.capabilities.cost_per_request,
        )
        .with_metadata("pages", pages))
    }
}

fn to_blocks(analyzed: AnalyzeResult) -> (Vec<TextBlock>, Option<String>) {
    let language = analyzed
        .read_results
        .iter()
        .find_map(|p| p.language.clone());

    let blocks = analyzed
        .read_results
        .into_iter()
        .flat_map(|page| {
            let page_language = page.language.clone();
            page.lines.into_iter().map(move |line| {
                let points: Vec<(f64, f64)> = line
                    .bounding_box
                    .chunks_exact(2)
                    .map(|p| (p[0], p[1]))
                    .collect();
                let handwritten = line
                    .appearance
                    .as_ref()
                    .is_some_and(|a| a.style.name == "handwriting");
                TextBlock::new(
                    line.text,
                    line_confidence(&line.words),
                    BoundingBox::from_points(&points),
                )
                .handwritten(handwritten)
                .with_language(page_language.as_deref())
            })
        })
        .filter(|b| !b.text.trim().is_empty())
        .collect();

    (blocks, language)
}

/// Lines carry no score of their own; use the mean of their words.
fn line_confidence(words: &[ReadWord]) -> f64 {
    let scores: Vec<f64> = words.iter().filter_map(|w| w.confidence).collect();
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

#[async_trait]
impl OcrProvider for AzureReadProvider {
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

    /// Looks up a nonexistent operation: 404 proves the endpoint and key work.
    async fn check_health(&self) -> ProviderHealth {
        http::probe(
            &self.name,
            &self.stats,
            self.client
                .get(format!(
                    "{}/{READ_API_PATH}/analyzeResults/{}",
                    self.endpoint,
                    uuid::Uuid::nil()
                ))
                .header(KEY_HEADER, &self.api_key),
        )
        .await
    }
}
