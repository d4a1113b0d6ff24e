use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;

use crate::error::{OcrError, Result};
use crate::models::ProviderCapabilities;

fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_opt<T: std::str::FromStr>(var: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Ignoring.", val, var, e);
                None
            }
        },
        Err(_) => None,
    }
}

fn env_non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub selection: SelectionWeights,
    pub health: HealthConfig,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Empty disables bearer authentication on the OCR routes.
    pub api_keys: Vec<String>,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl std::str::FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" | "constant" => Ok(Self::Fixed),
            "exponential" | "exp" => Ok(Self::Exponential),
            _ => Err(format!("Unknown backoff kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Extra attempts per candidate after the first one.
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub attempt_timeout_secs: u64,
    pub request_deadline_secs: u64,
    /// 1 processes batches sequentially.
    pub batch_concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SelectionWeights {
    pub reliability: f64,
    pub quality: f64,
    pub cost: f64,
    pub latency: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            reliability: 0.4,
            quality: 0.3,
            cost: 0.15,
            latency: 0.15,
        }
    }
}

impl SelectionWeights {
    /// Weights rescaled to sum to 1.
    pub fn normalized(&self) -> Result<Self> {
        let parts = [self.reliability, self.quality, self.cost, self.latency];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(OcrError::Configuration(
                "Selection weights must be finite and non-negative".to_string(),
            ));
        }
        let sum: f64 = parts.iter().sum();
        if sum <= 0.0 {
            return Err(OcrError::Configuration(
                "At least one selection weight must be positive".to_string(),
            ));
        }
        Ok(Self {
            reliability: self.reliability / sum,
            quality: self.quality / sum,
            cost: self.cost / sum,
            latency: self.latency / sum,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub ttl_secs: u64,
    pub refresh_interval_secs: u64,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "paddle")]
    Paddle,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "textract")]
    Textract,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Paddle => "paddle",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Azure => "azure",
            ProviderKind::Google => "google",
            ProviderKind::Textract => "textract",
        }
    }

    /// Built-in capability table. The reliability and quality figures are
    /// starting points meant to be overridden per deployment.
    pub fn default_capabilities(&self) -> ProviderCapabilities {
        match self {
            ProviderKind::Textract => ProviderCapabilities {
                supports_language_detection: false,
                supports_handwriting: true,
                supports_table_detection: true,
                supports_form_detection: true,
                max_image_size_mb: 10.0,
                supported_languages: ["en", "es", "it", "pt", "fr", "de"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                cost_per_request: 0.0015,
                cost_per_1k_tokens: None,
                avg_response_time_ms: 2000,
                reliability_score: 0.95,
                quality_score: 0.92,
            },
            ProviderKind::Azure => ProviderCapabilities {
                supports_language_detection: true,
                supports_handwriting: true,
                supports_table_detection: false,
                supports_form_detection: false,
                max_image_size_mb: 50.0,
                supported_languages: Vec::new(),
                cost_per_request: 0.001,
                cost_per_1k_tokens: None,
                avg_response_time_ms: 1500,
                reliability_score: 0.93,
                quality_score: 0.9,
            },
            ProviderKind::Google => ProviderCapabilities {
                supports_language_detection: true,
                supports_handwriting: true,
                supports_table_detection: false,
                supports_form_detection: false,
                max_image_size_mb: 20.0,
                supported_languages: Vec::new(),
                cost_per_request: 0.0015,
                cost_per_1k_tokens: None,
                avg_response_time_ms: 1200,
                reliability_score: 0.94,
                quality_score: 0.91,
            },
            ProviderKind::OpenAi => ProviderCapabilities {
                supports_language_detection: true,
                supports_handwriting: true,
                supports_table_detection: true,
                supports_form_detection: true,
                max_image_size_mb: 20.0,
                supported_languages: Vec::new(),
                cost_per_request: 0.0,
                cost_per_1k_tokens: Some(0.005),
                avg_response_time_ms: 4000,
                reliability_score: 0.9,
                quality_score: 0.88,
            },
            ProviderKind::Paddle => ProviderCapabilities {
                supports_language_detection: false,
                supports_handwriting: false,
                supports_table_detection: false,
                supports_form_detection: false,
                max_image_size_mb: 10.0,
                supported_languages: ["en", "ch", "zh", "ja", "ko", "fr", "de"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                cost_per_request: 0.0,
                cost_per_1k_tokens: None,
                avg_response_time_ms: 800,
                reliability_score: 0.85,
                quality_score: 0.8,
            },
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the self-hosted adapter uploads images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// `POST /ocr` with a multipart `image` field.
    #[default]
    Multipart,
    /// `POST /ocr-bytes` with the raw image as body.
    Raw,
}

/// Per-field overrides applied on top of [`ProviderKind::default_capabilities`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CapabilityOverrides {
    pub supports_language_detection: Option<bool>,
    pub supports_handwriting: Option<bool>,
    pub supports_table_detection: Option<bool>,
    pub supports_form_detection: Option<bool>,
    pub max_image_size_mb: Option<f64>,
    pub supported_languages: Option<Vec<String>>,
    pub cost_per_request: Option<f64>,
    pub cost_per_1k_tokens: Option<f64>,
    pub avg_response_time_ms: Option<u64>,
    pub reliability_score: Option<f64>,
    pub quality_score: Option<f64>,
}

impl CapabilityOverrides {
    pub fn apply(&self, mut caps: ProviderCapabilities) -> ProviderCapabilities {
        if let Some(v) = self.supports_language_detection {
            caps.supports_language_detection = v;
        }
        if let Some(v) = self.supports_handwriting {
            caps.supports_handwriting = v;
        }
        if let Some(v) = self.supports_table_detection {
            caps.supports_table_detection = v;
        }
        if let Some(v) = self.supports_form_detection {
            caps.supports_form_detection = v;
        }
        if let Some(v) = self.max_image_size_mb {
            caps.max_image_size_mb = v;
        }
        if let Some(v) = &self.supported_languages {
            caps.supported_languages = v.clone();
        }
        if let Some(v) = self.cost_per_request {
            caps.cost_per_request = v;
        }
        if let Some(v) = self.cost_per_1k_tokens {
            caps.cost_per_1k_tokens = Some(v);
        }
        if let Some(v) = self.avg_response_time_ms {
            caps.avg_response_time_ms = v;
        }
        if let Some(v) = self.reliability_score {
            caps.reliability_score = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.quality_score {
            caps.quality_score = v.clamp(0.0, 1.0);
        }
        caps
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    /// AWS secret access key (`api_key` holds the access key id).
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub upload_mode: UploadMode,
    /// Delay between polls for providers with asynchronous jobs.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub capabilities: CapabilityOverrides,
}

fn default_true() -> bool {
    true
}

fn default_provider_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    500
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            api_key: None,
            secret_key: None,
            session_token: None,
            region: None,
            base_url: None,
            model: None,
            timeout_secs: default_provider_timeout(),
            upload_mode: UploadMode::default(),
            poll_interval_ms: default_poll_interval(),
            capabilities: CapabilityOverrides::default(),
        }
    }

    pub fn resolved_capabilities(&self) -> ProviderCapabilities {
        self.capabilities.apply(self.kind.default_capabilities())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: env::var("OCRGATE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env_or("OCRGATE_PORT", 3000),
            api_keys: env::var("OCRGATE_API_KEYS")
                .map(|keys| {
                    keys.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            max_upload_bytes: parse_env_or("OCRGATE_MAX_UPLOAD_BYTES", 50 * 1024 * 1024),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: parse_env_or("OCRGATE_MAX_RETRIES", 2),
            backoff: parse_env_or("OCRGATE_BACKOFF", BackoffKind::Exponential),
            retry_delay_ms: parse_env_or("OCRGATE_RETRY_DELAY_MS", 200),
            max_retry_delay_ms: parse_env_or("OCRGATE_MAX_RETRY_DELAY_MS", 5000),
            attempt_timeout_secs: parse_env_or("OCRGATE_ATTEMPT_TIMEOUT", 60),
            request_deadline_secs: parse_env_or("OCRGATE_REQUEST_DEADLINE", 180),
            batch_concurrency: parse_env_or("OCRGATE_BATCH_CONCURRENCY", 1),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ttl_secs: parse_env_or("OCRGATE_HEALTH_TTL", 60),
            refresh_interval_secs: parse_env_or("OCRGATE_HEALTH_REFRESH_INTERVAL", 300),
            probe_timeout_secs: parse_env_or("OCRGATE_HEALTH_PROBE_TIMEOUT", 10),
        }
    }
}

fn selection_weights_from_env() -> SelectionWeights {
    let defaults = SelectionWeights::default();
    SelectionWeights {
        reliability: parse_env_or("OCRGATE_WEIGHT_RELIABILITY", defaults.reliability),
        quality: parse_env_or("OCRGATE_WEIGHT_QUALITY", defaults.quality),
        cost: parse_env_or("OCRGATE_WEIGHT_COST", defaults.cost),
        latency: parse_env_or("OCRGATE_WEIGHT_LATENCY", defaults.latency),
    }
}

/// Providers discovered from well-known vendor environment variables, in a
/// fixed registration order.
fn providers_from_env() -> Vec<ProviderConfig> {
    let timeout = parse_env_or("OCRGATE_PROVIDER_TIMEOUT", default_provider_timeout());
    let mut providers = Vec::new();

    if env_non_empty("AWS_ACCESS_KEY_ID").is_some() || env_non_empty("AWS_SECRET_ACCESS_KEY").is_some() {
        let mut p = ProviderConfig::new("textract", ProviderKind::Textract);
        p.api_key = env_non_empty("AWS_ACCESS_KEY_ID");
        p.secret_key = env_non_empty("AWS_SECRET_ACCESS_KEY");
        p.session_token = env_non_empty("AWS_SESSION_TOKEN");
        p.region = env_non_empty("AWS_REGION").or_else(|| Some("us-east-1".to_string()));
        p.base_url = env_non_empty("TEXTRACT_ENDPOINT");
        p.timeout_secs = timeout;
        providers.push(p);
    }

    if env_non_empty("AZURE_VISION_ENDPOINT").is_some() || env_non_empty("AZURE_VISION_KEY").is_some() {
        let mut p = ProviderConfig::new("azure", ProviderKind::Azure);
        p.base_url = env_non_empty("AZURE_VISION_ENDPOINT");
        p.api_key = env_non_empty("AZURE_VISION_KEY");
        p.timeout_secs = timeout;
        providers.push(p);
    }

    if let Some(key) = env_non_empty("GOOGLE_VISION_API_KEY") {
        let mut p = ProviderConfig::new("google", ProviderKind::Google);
        p.api_key = Some(key);
        p.base_url = env_non_empty("GOOGLE_VISION_BASE_URL");
        p.timeout_secs = timeout;
        providers.push(p);
    }

    if let Some(key) = env_non_empty("OPENAI_API_KEY") {
        let mut p = ProviderConfig::new("openai", ProviderKind::OpenAi);
        p.api_key = Some(key);
        p.base_url = env_non_empty("OPENAI_BASE_URL");
        p.model = env_non_empty("OPENAI_OCR_MODEL");
        p.timeout_secs = timeout;
        providers.push(p);
    }

    if let Some(url) = env_non_empty("PADDLEOCR_URL") {
        let mut p = ProviderConfig::new("paddle", ProviderKind::Paddle);
        p.base_url = Some(url);
        if let Some(mode) = parse_env_opt::<String>("PADDLEOCR_UPLOAD_MODE") {
            if mode.eq_ignore_ascii_case("raw") {
                p.upload_mode = UploadMode::Raw;
            }
        }
        p.timeout_secs = timeout;
        providers.push(p);
    }

    providers
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            dispatch: DispatchConfig::default(),
            selection: selection_weights_from_env(),
            health: HealthConfig::default(),
            providers: providers_from_env(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Loads a TOML file; sections it omits fall back to the environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .build()
            .map_err(|e| {
                OcrError::Configuration(format!("Failed to read {}: {e}", path.display()))
            })?;

        settings.try_deserialize::<Config>().map_err(|e| {
            OcrError::Configuration(format!("Invalid configuration in {}: {e}", path.display()))
        })
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.selection.normalized()?;

        if self.dispatch.batch_concurrency == 0 {
            return Err(OcrError::Configuration(
                "dispatch.batch_concurrency must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(OcrError::Configuration(
                    "Provider name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(OcrError::Configuration(format!(
                    "Duplicate provider name: {}",
                    provider.name
                )));
            }
        }

        Ok(())
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }
}
