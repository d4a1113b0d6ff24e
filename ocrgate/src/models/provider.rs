use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Static description of what a provider supports and what it costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub supports_language_detection: bool,
    pub supports_handwriting: bool,
    pub supports_table_detection: bool,
    pub supports_form_detection: bool,
    pub max_image_size_mb: f64,
    /// Empty means the provider accepts any language.
    #[serde(default)]
    pub supported_languages: Vec<String>,
    pub cost_per_request: f64,
    /// Token-billed providers only.
    #[serde(default)]
    pub cost_per_1k_tokens: Option<f64>,
    pub avg_response_time_ms: u64,
    pub reliability_score: f64,
    pub quality_score: f64,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_language_detection: false,
            supports_handwriting: false,
            supports_table_detection: false,
            supports_form_detection: false,
            max_image_size_mb: 10.0,
            supported_languages: Vec::new(),
            cost_per_request: 0.0,
            cost_per_1k_tokens: None,
            avg_response_time_ms: 2000,
            reliability_score: 0.8,
            quality_score: 0.8,
        }
    }
}

impl ProviderCapabilities {
    pub fn max_image_size_bytes(&self) -> u64 {
        (self.max_image_size_mb * BYTES_PER_MB) as u64
    }

    /// Language match on the primary subtag, so `en-US` matches `en`.
    pub fn supports_language(&self, language: &str) -> bool {
        if self.supported_languages.is_empty() {
            return true;
        }
        let wanted = primary_subtag(language);
        self.supported_languages
            .iter()
            .any(|supported| primary_subtag(supported) == wanted)
    }
}

fn primary_subtag(language: &str) -> String {
    language
        .trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    /// Reachable but throttling; still eligible for selection.
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Snapshot of one provider's health as of `last_checked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub is_healthy: bool,
    pub is_available: bool,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub last_checked: Option<DateTime<Utc>>,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self::unknown()
    }
}

impl ProviderHealth {
    pub fn unknown() -> Self {
        Self {
            is_healthy: false,
            is_available: true,
            status: HealthStatus::Unknown,
            response_time_ms: 0,
            last_checked: None,
            success_rate: 1.0,
            last_error: None,
            last_error_time: None,
        }
    }

    pub fn healthy(response_time: Duration, success_rate: f64) -> Self {
        Self {
            is_healthy: true,
            is_available: true,
            status: HealthStatus::Healthy,
            response_time_ms: response_time.as_millis() as u64,
            last_checked: Some(Utc::now()),
            success_rate: success_rate.clamp(0.0, 1.0),
            last_error: None,
            last_error_time: None,
        }
    }

    pub fn degraded(response_time: Duration, success_rate: f64, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            is_healthy: false,
            is_available: true,
            status: HealthStatus::Degraded,
            response_time_ms: response_time.as_millis() as u64,
            last_checked: Some(now),
            success_rate: success_rate.clamp(0.0, 1.0),
            last_error: Some(reason.into()),
            last_error_time: Some(now),
        }
    }

    pub fn unhealthy(response_time: Duration, success_rate: f64, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            is_healthy: false,
            is_available: false,
            status: HealthStatus::Unhealthy,
            response_time_ms: response_time.as_millis() as u64,
            last_checked: Some(now),
            success_rate: success_rate.clamp(0.0, 1.0),
            last_error: Some(error.into()),
            last_error_time: Some(now),
        }
    }
}
