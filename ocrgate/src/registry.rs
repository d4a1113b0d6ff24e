use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{OcrError, Result};
use crate::models::ProviderCapabilities;
use crate::providers::{build_provider, OcrProvider};

/// Read-only set of providers, fixed at startup, in registration order.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn OcrProvider>>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn OcrProvider>>) -> Result<Self> {
        let mut index = HashMap::with_capacity(providers.len());
        for (position, provider) in providers.iter().enumerate() {
            if index.insert(provider.name().to_string(), position).is_some() {
                return Err(OcrError::Configuration(format!(
                    "Duplicate provider name: {}",
                    provider.name()
                )));
            }
        }
        Ok(Self { providers, index })
    }

    /// Builds every enabled provider in configuration order.
    pub fn from_config(config: &Config) -> Result<Self> {
        let providers: Vec<Arc<dyn OcrProvider>> =
            config.enabled_providers().map(build_provider).collect();
        let registry = Self::new(providers)?;

        let configured = registry
            .providers
            .iter()
            .filter(|p| p.is_configured())
            .count();
        info!(
            total = registry.len(),
            configured,
            "Provider registry initialized"
        );
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn OcrProvider>> {
        self.index.get(name).map(|&i| &self.providers[i])
    }

    pub fn require(&self, name: &str) -> Result<&Arc<dyn OcrProvider>> {
        self.get(name)
            .ok_or_else(|| OcrError::NotFound(format!("Unknown provider: {name}")))
    }

    pub fn get_capabilities(&self, name: &str) -> Result<&ProviderCapabilities> {
        self.require(name).map(|p| p.capabilities())
    }

    pub fn providers(&self) -> &[Arc<dyn OcrProvider>] {
        &self.providers
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
