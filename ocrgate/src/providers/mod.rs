//! OCR provider adapters
//!
//! Every backend sits behind the [`OcrProvider`] trait so the rest of the
//! service never sees vendor wire formats:
//! - `TextractProvider`: AWS Textract over SigV4-signed JSON
//! - `AzureReadProvider`: Azure Computer Vision Read (submit, then poll)
//! - `GoogleVisionProvider`: Google Cloud Vision `images:annotate`
//! - `OpenAiVisionProvider`: GPT-4o style chat completions with an image part
//! - `PaddleOcrProvider`: self-hosted PaddleOCR-style HTTP server
//!
//! Adapters only map requests and responses. Retries, fallback and batching
//! policy live in the dispatcher; the trait's default methods cover the
//! capability pre-check, latency estimate and sequential batch loop.
//!
//! A provider whose configuration is incomplete (missing key, missing
//! endpoint) is built as [`UnavailableProvider`] instead of failing startup.

mod azure;
mod google;
pub(crate) mod http;
mod openai;
mod paddle;
mod textract;

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{OcrError, Result};
use crate::models::{OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth};

pub use azure::AzureReadProvider;
pub use google::GoogleVisionProvider;
pub use openai::OpenAiVisionProvider;
pub use paddle::PaddleOcrProvider;
pub use textract::TextractProvider;

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Uniform contract implemented by every OCR backend.
#[async_trait]
pub trait OcrProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &ProviderCapabilities;

    /// `false` when the provider was registered without usable configuration.
    fn is_configured(&self) -> bool {
        true
    }

    async fn process_image(
        &self,
        request: &OcrRequest,
        cancel: &CancellationToken,
    ) -> Result<OcrResult>;

    /// Sequential batch; a failing image yields a failed result in its slot.
    async fn process_batch(
        &self,
        requests: &[OcrRequest],
        cancel: &CancellationToken,
    ) -> Vec<OcrResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let started = Instant::now();
            let result = match self.process_image(request, cancel).await {
                Ok(result) => result,
                Err(e) => OcrResult::failed(self.name(), e.to_string(), started.elapsed()),
            };
            results.push(result);
        }
        results
    }

    async fn check_health(&self) -> ProviderHealth;

    /// Accounts for a call the dispatcher abandoned (attempt timeout) before
    /// `process_image` could record its outcome.
    fn record_failure(&self, _error: &OcrError) {}

    async fn cost_estimate(&self, _size_bytes: u64, _request: &OcrRequest) -> f64 {
        self.capabilities().cost_per_request
    }

    fn can_process(&self, request: &OcrRequest) -> bool {
        check_capabilities(self.capabilities(), request).is_ok()
    }

    /// Average latency plus 10% for every started MiB beyond the first.
    fn estimated_processing_time(&self, size_bytes: u64) -> Duration {
        let base = self.capabilities().avg_response_time_ms as f64;
        let extra_mib = size_bytes.saturating_sub(1).saturating_div(BYTES_PER_MIB);
        Duration::from_millis((base * (1.0 + 0.1 * extra_mib as f64)).round() as u64)
    }

    fn reliability_score(&self) -> f64 {
        self.capabilities().reliability_score
    }

    fn quality_score(&self) -> f64 {
        self.capabilities().quality_score
    }
}

/// Explains why `caps` cannot serve `request`, if it cannot.
pub fn check_capabilities(caps: &ProviderCapabilities, request: &OcrRequest) -> Result<()> {
    let max_bytes = caps.max_image_size_bytes();
    if request.size_bytes() > max_bytes {
        return Err(OcrError::Validation(format!(
            "Image of {} bytes exceeds provider limit of {} MB",
            request.size_bytes(),
            caps.max_image_size_mb
        )));
    }
    if request.requires_language_detection() && !caps.supports_language_detection {
        return Err(OcrError::Validation(
            "Language detection not supported".to_string(),
        ));
    }
    if request.requires_handwriting() && !caps.supports_handwriting {
        return Err(OcrError::Validation(
            "Handwriting recognition not supported".to_string(),
        ));
    }
    if request.requires_table_detection() && !caps.supports_table_detection {
        return Err(OcrError::Validation(
            "Table detection not supported".to_string(),
        ));
    }
    if request.requires_form_detection() && !caps.supports_form_detection {
        return Err(OcrError::Validation("Form detection not supported".to_string()));
    }
    if let Some(language) = request.language() {
        if !caps.supports_language(language) {
            return Err(OcrError::Validation(format!(
                "Language '{language}' not supported"
            )));
        }
    }
    Ok(())
}

/// Per-adapter call counters feeding `success_rate` and `last_error` in health.
#[derive(Debug, Default)]
pub struct CallStats {
    successes: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl CallStats {
    pub fn record<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.record_error(e),
        }
    }

    pub fn record_error(&self, error: &OcrError) {
        // Cancellation says nothing about the provider.
        if matches!(error, OcrError::Cancelled) {
            return;
        }
        self.failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some((error.to_string(), Utc::now()));
        }
    }

    /// 1.0 until the first call completes.
    pub fn success_rate(&self) -> f64 {
        let ok = self.successes.load(Ordering::Relaxed);
        let failed = self.failures.load(Ordering::Relaxed);
        let total = ok + failed;
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    pub fn last_error(&self) -> Option<(String, DateTime<Utc>)> {
        self.last_error.lock().ok().and_then(|last| last.clone())
    }
}

/// Stand-in for a provider that could not be constructed from configuration.
#[derive(Debug, Clone)]
pub struct UnavailableProvider {
    name: String,
    capabilities: ProviderCapabilities,
    reason: String,
}

impl UnavailableProvider {
    pub fn new(name: impl Into<String>, capabilities: ProviderCapabilities, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities,
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[async_trait]
impl OcrProvider for UnavailableProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    fn is_configured(&self) -> bool {
        false
    }

    async fn process_image(
        &self,
        _request: &OcrRequest,
        _cancel: &CancellationToken,
    ) -> Result<OcrResult> {
        Err(OcrError::Configuration(self.reason.clone()))
    }

    async fn check_health(&self) -> ProviderHealth {
        ProviderHealth::unhealthy(Duration::ZERO, 0.0, self.reason.clone())
    }
}

/// Builds the adapter for `config`, degrading to [`UnavailableProvider`] when
/// the configuration is incomplete.
pub fn build_provider(config: &ProviderConfig) -> Arc<dyn OcrProvider> {
    let built: Result<Arc<dyn OcrProvider>> = match config.kind {
        ProviderKind::Paddle => {
            PaddleOcrProvider::new(config).map(|p| Arc::new(p) as Arc<dyn OcrProvider>)
        }
        ProviderKind::OpenAi => {
            OpenAiVisionProvider::new(config).map(|p| Arc::new(p) as Arc<dyn OcrProvider>)
        }
        ProviderKind::Azure => {
            AzureReadProvider::new(config).map(|p| Arc::new(p) as Arc<dyn OcrProvider>)
        }
        ProviderKind::Google => {
            GoogleVisionProvider::new(config).map(|p| Arc::new(p) as Arc<dyn OcrProvider>)
        }
        ProviderKind::Textract => {
            TextractProvider::new(config).map(|p| Arc::new(p) as Arc<dyn OcrProvider>)
        }
    };

    match built {
        Ok(provider) => {
            info!(provider = %config.name, kind = %config.kind, "OCR provider initialized");
            provider
        }
        Err(e) => {
            let reason = format!("{} OCR backend unavailable: {e}", config.name);
            warn!("{}", reason);
            Arc::new(UnavailableProvider::new(
                config.name.clone(),
                config.resolved_capabilities(),
                reason,
            ))
        }
    }
}

/// Pixel dimensions read from the image header, without decoding pixels.
pub(crate) fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

pub(crate) fn require<'a>(value: &'a Option<String>, what: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OcrError::Configuration(format!("{what} required")))
}
