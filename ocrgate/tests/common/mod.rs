// Shared helpers for the integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ocrgate::config::{Config, ProviderKind};
use ocrgate::models::{
    BoundingBox, OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth, TextBlock,
};
use ocrgate::{OcrError, OcrProvider, ProviderErrorKind, Result};

static INIT: Once = Once::new();

/// Initialize tracing subscriber once for tests
pub fn init_test_logger() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A real PNG of the given size, so header inspection finds its dimensions.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::new(width, height);
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Config with no providers and retry delays short enough for tests.
pub fn test_config(max_retries: u32) -> Config {
    let mut config = Config {
        providers: vec![],
        ..Config::default()
    };
    config.dispatch.max_retries = max_retries;
    config.dispatch.retry_delay_ms = 5;
    config.dispatch.max_retry_delay_ms = 20;
    config.dispatch.attempt_timeout_secs = 5;
    config.dispatch.request_deadline_secs = 30;
    config.dispatch.batch_concurrency = 1;
    config.server.api_keys = vec![];
    config
}

/// In-memory provider with a scripted failure sequence.
///
/// Each call pops the next scripted failure; once the script is empty calls
/// succeed with `"<name>:<first 32 image bytes as text>"`. Images equal to the
/// poisoned payload always fail with a server error.
pub struct ScriptedProvider {
    name: String,
    capabilities: ProviderCapabilities,
    failures: Mutex<VecDeque<ProviderErrorKind>>,
    poisoned: Option<Vec<u8>>,
    calls: AtomicUsize,
    probes: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str, capabilities: ProviderCapabilities) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            failures: Mutex::new(VecDeque::new()),
            poisoned: None,
            calls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn with_kind(name: &str, kind: ProviderKind) -> Self {
        Self::new(name, kind.default_capabilities())
    }

    pub fn failing_first(self, failures: &[ProviderErrorKind]) -> Self {
        *self.failures.lock().unwrap() = failures.iter().copied().collect();
        self
    }

    pub fn poisoned_by(mut self, image: &[u8]) -> Self {
        self.poisoned = Some(image.to_vec());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl OcrProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn process_image(
        &self,
        request: &OcrRequest,
        _cancel: &CancellationToken,
    ) -> Result<OcrResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.poisoned.as_deref() == Some(request.image().as_ref()) {
            return Err(OcrError::provider(
                &self.name,
                ProviderErrorKind::Server,
                "cannot read this image",
            ));
        }
        if let Some(kind) = self.failures.lock().unwrap().pop_front() {
            return Err(OcrError::provider(&self.name, kind, "scripted failure"));
        }

        let image = request.image();
        let preview = &image[..image.len().min(32)];
        let text = format!("{}:{}", self.name, String::from_utf8_lossy(preview));
        Ok(OcrResult::from_blocks(
            &self.name,
            vec![
                TextBlock::new(text, 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
                TextBlock::new("second line", 0.7, BoundingBox::new(0.0, 12.0, 10.0, 10.0)),
            ],
            request.language(),
            Duration::from_millis(2),
            self.capabilities.cost_per_request,
        ))
    }

    async fn check_health(&self) -> ProviderHealth {
        self.probes.fetch_add(1, Ordering::SeqCst);
        ProviderHealth::healthy(Duration::from_millis(1), 1.0)
    }
}

/// Matches requests whose raw body contains `needle`.
///
/// Unlike `body_string_contains` this works on multipart bodies carrying
/// binary image data, which are not valid UTF-8.
pub struct BodyContainsBytes(pub Vec<u8>);

impl BodyContainsBytes {
    pub fn new(needle: impl AsRef<[u8]>) -> Self {
        Self(needle.as_ref().to_vec())
    }
}

impl wiremock::Match for BodyContainsBytes {
    fn matches(&self, request: &wiremock::Request) -> bool {
        !self.0.is_empty() && request.body.windows(self.0.len()).any(|w| w == self.0.as_slice())
    }
}

// Re-export commonly used crates for convenience
pub use serial_test::serial;
pub use tempfile;
pub use wiremock;
