use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::models::{OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth};
use crate::providers::check_capabilities;
use crate::registry::ProviderRegistry;
use crate::selection::{Candidate, SelectionPolicy};

/// Static and cached runtime view of one provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: String,
    pub configured: bool,
    pub capabilities: ProviderCapabilities,
    pub reliability_score: f64,
    pub quality_score: f64,
    pub health: Option<ProviderHealth>,
}

/// What one provider would do with an image of a given size.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEstimate {
    pub provider: String,
    pub can_process: bool,
    pub cost: f64,
    pub estimated_ms: u64,
    pub available: bool,
}

/// Entry point for library callers, the HTTP API and the CLI.
pub struct OcrService {
    registry: Arc<ProviderRegistry>,
    health: HealthMonitor,
    dispatcher: Dispatcher,
}

impl OcrService {
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = ProviderRegistry::from_config(config)?;
        Self::with_registry(registry, config)
    }

    /// Uses an explicit set of providers with the policies from `config`.
    pub fn with_registry(registry: ProviderRegistry, config: &Config) -> Result<Self> {
        let registry = Arc::new(registry);
        let health = HealthMonitor::from_config(registry.clone(), &config.health);
        let policy = SelectionPolicy::new(config.selection)?;
        let dispatcher = Dispatcher::new(
            registry.clone(),
            health.clone(),
            policy,
            config.dispatch.clone(),
        );

        Ok(Self {
            registry,
            health,
            dispatcher,
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }

    pub async fn process_image(&self, request: &OcrRequest, cancel: &CancellationToken) -> OcrResult {
        self.dispatcher.process_image(request, cancel).await
    }

    pub async fn process_batch(
        &self,
        requests: &[OcrRequest],
        cancel: &CancellationToken,
    ) -> Vec<OcrResult> {
        self.dispatcher.process_batch(requests, cancel).await
    }

    pub async fn check_health(&self, name: &str) -> Result<ProviderHealth> {
        self.health.check_health(name).await
    }

    pub async fn check_all_health(&self) -> Vec<(String, ProviderHealth)> {
        self.health.check_all().await
    }

    pub async fn cost_estimate(&self, name: &str, size_bytes: u64, request: &OcrRequest) -> Result<f64> {
        let provider = self.registry.require(name)?;
        Ok(provider.cost_estimate(size_bytes, request).await)
    }

    pub fn can_process(&self, name: &str, request: &OcrRequest) -> Result<bool> {
        Ok(self.registry.require(name)?.can_process(request))
    }

    pub fn estimated_processing_time(&self, name: &str, size_bytes: u64) -> Result<Duration> {
        Ok(self.registry.require(name)?.estimated_processing_time(size_bytes))
    }

    pub fn reliability_score(&self, name: &str) -> Result<f64> {
        Ok(self.registry.require(name)?.reliability_score())
    }

    pub fn quality_score(&self, name: &str) -> Result<f64> {
        Ok(self.registry.require(name)?.quality_score())
    }

    pub async fn candidates(&self, request: &OcrRequest) -> Vec<Candidate> {
        self.dispatcher.candidates(request).await
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        self.registry
            .providers()
            .iter()
            .map(|p| ProviderInfo {
                name: p.name().to_string(),
                configured: p.is_configured(),
                capabilities: p.capabilities().clone(),
                reliability_score: p.reliability_score(),
                quality_score: p.quality_score(),
                health: self.health.cached(p.name()),
            })
            .collect()
    }

    /// Per-provider estimate for an image of `size_bytes` that is not uploaded.
    ///
    /// `profile` carries the requirement flags; its own image is ignored.
    pub async fn estimates(&self, size_bytes: u64, profile: &OcrRequest) -> Vec<ProviderEstimate> {
        let mut estimates = Vec::with_capacity(self.registry.len());
        for provider in self.registry.providers() {
            let caps = provider.capabilities();
            let can_process =
                size_bytes <= caps.max_image_size_bytes() && check_capabilities(caps, profile).is_ok();
            estimates.push(ProviderEstimate {
                provider: provider.name().to_string(),
                can_process,
                cost: provider.cost_estimate(size_bytes, profile).await,
                estimated_ms: provider.estimated_processing_time(size_bytes).as_millis() as u64,
                available: self.health.is_available(provider.name()),
            });
        }
        estimates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::error::OcrError;
    use crate::providers::{OcrProvider, UnavailableProvider};

    fn service() -> OcrService {
        let mut caps = ProviderKind::Google.default_capabilities();
        caps.max_image_size_mb = 20.0;
        let provider: Arc<dyn OcrProvider> =
            Arc::new(UnavailableProvider::new("google", caps, "API key required"));
        let registry = ProviderRegistry::new(vec![provider]).unwrap();
        let config = Config {
            providers: vec![],
            ..Config::default()
        };
        OcrService::with_registry(registry, &config).unwrap()
    }

    #[test]
    fn test_unknown_provider_lookups_fail() {
        let service = service();
        assert!(matches!(service.reliability_score("nope"), Err(OcrError::NotFound(_))));
        assert!(matches!(
            service.estimated_processing_time("nope", 10),
            Err(OcrError::NotFound(_))
        ));
        assert!(service.quality_score("google").is_ok());
    }

    #[tokio::test]
    async fn test_estimates_respect_size_limit() {
        let service = service();
        let profile = OcrRequest::new(Vec::<u8>::new());

        let small = service.estimates(1024, &profile).await;
        assert!(small[0].can_process);
        assert!(!small[0].available);

        let huge = service.estimates(50 * 1024 * 1024, &profile).await;
        assert!(!huge[0].can_process);
    }

    #[tokio::test]
    async fn test_providers_lists_configuration_state() {
        let service = service();
        let providers = service.providers();
        assert_eq!(providers.len(), 1);
        assert!(!providers[0].configured);
        assert!(providers[0].health.is_none());

        service.check_health("google").await.unwrap();
        assert!(service.providers()[0].health.is_some());
    }

    #[tokio::test]
    async fn test_batch_future_can_be_spawned() {
        let service = Arc::new(service());
        let requests = vec![OcrRequest::new(b"one".to_vec()), OcrRequest::new(b"two".to_vec())];

        // Spawning requires the batch future to be `Send` for any borrow.
        let handle = tokio::spawn({
            let service = service.clone();
            async move { service.process_batch(&requests, &CancellationToken::new()).await }
        });
        let results = handle.await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_success()));
    }
}
