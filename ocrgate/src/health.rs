//! TTL-cached provider health with single-flight probing.
//!
//! Reads go through a `RwLock`ed map and never wait on the network. A probe
//! for one provider holds that provider's async mutex, so concurrent callers
//! queue behind it and then read the value it stored instead of probing again.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::Result;
use crate::models::{HealthStatus, ProviderHealth};
use crate::registry::ProviderRegistry;

#[derive(Debug, Clone)]
struct CacheEntry {
    health: ProviderHealth,
    checked_at: Instant,
}

struct Inner {
    registry: Arc<ProviderRegistry>,
    ttl: Duration,
    probe_timeout: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
    in_flight: HashMap<String, Arc<Mutex<()>>>,
}

/// Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("ttl", &self.inner.ttl)
            .field("probe_timeout", &self.inner.probe_timeout)
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(registry: Arc<ProviderRegistry>, ttl: Duration, probe_timeout: Duration) -> Self {
        let in_flight = registry
            .names()
            .into_iter()
            .map(|name| (name.to_string(), Arc::new(Mutex::new(()))))
            .collect();

        Self {
            inner: Arc::new(Inner {
                registry,
                ttl,
                probe_timeout,
                cache: RwLock::new(HashMap::new()),
                in_flight,
            }),
        }
    }

    pub fn from_config(registry: Arc<ProviderRegistry>, config: &HealthConfig) -> Self {
        Self::new(
            registry,
            Duration::from_secs(config.ttl_secs),
            Duration::from_secs(config.probe_timeout_secs),
        )
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Cached health if still fresh, otherwise one shared probe.
    pub async fn check_health(&self, name: &str) -> Result<ProviderHealth> {
        self.inner.registry.require(name)?;

        if let Some(health) = self.fresh(name) {
            return Ok(health);
        }

        let Some(lock) = self.inner.in_flight.get(name).cloned() else {
            return Ok(ProviderHealth::unknown());
        };
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(health) = self.fresh(name) {
            return Ok(health);
        }

        Ok(self.probe_and_store(name).await)
    }

    /// Health of every provider in registration order.
    pub async fn check_all(&self) -> Vec<(String, ProviderHealth)> {
        let names: Vec<String> = self
            .inner
            .registry
            .names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let checks = names.iter().map(|name| async move {
            let health = self
                .check_health(name)
                .await
                .unwrap_or_else(|e| ProviderHealth::unhealthy(Duration::ZERO, 0.0, e.to_string()));
            (name.clone(), health)
        });
        join_all(checks).await
    }

    /// Non-blocking availability answer from the cache.
    ///
    /// A missing or expired entry schedules a background refresh (unless one
    /// is already running) and answers with the last known state. Providers
    /// never checked count as available, unless they were never configured.
    pub fn is_available(&self, name: &str) -> bool {
        let Some(provider) = self.inner.registry.get(name) else {
            return false;
        };
        if !provider.is_configured() {
            return false;
        }

        let entry = self.entry(name);
        let fresh = entry
            .as_ref()
            .is_some_and(|e| e.checked_at.elapsed() < self.inner.ttl);
        if !fresh {
            self.spawn_refresh(name);
        }

        entry.map(|e| e.health.is_available).unwrap_or(true)
    }

    /// Last stored health, fresh or not.
    pub fn cached(&self, name: &str) -> Option<ProviderHealth> {
        self.entry(name).map(|e| e.health)
    }

    pub fn invalidate(&self, name: &str) {
        self.inner
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Re-probes every provider each `interval` until `cancel` fires.
    pub async fn run_refresh_loop(&self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Health refresh loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Health refresh loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    for name in self.inner.registry.names() {
                        self.invalidate(name);
                    }
                    let results = self.check_all().await;
                    let unavailable = results.iter().filter(|(_, h)| !h.is_available).count();
                    info!(
                        providers = results.len(),
                        unavailable,
                        "Health refresh completed"
                    );
                }
            }
        }
    }

    fn entry(&self, name: &str) -> Option<CacheEntry> {
        self.inner
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn fresh(&self, name: &str) -> Option<ProviderHealth> {
        self.entry(name)
            .filter(|e| e.checked_at.elapsed() < self.inner.ttl)
            .map(|e| e.health)
    }

    fn spawn_refresh(&self, name: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Some(lock) = self.inner.in_flight.get(name).cloned() else {
            return;
        };
        // A held lock means a probe is already running for this provider.
        let Ok(guard) = lock.try_lock_owned() else {
            return;
        };

        let monitor = self.clone();
        let name = name.to_string();
        debug!(provider = %name, "Scheduling background health refresh");
        handle.spawn(async move {
            let _guard = guard;
            monitor.probe_and_store(&name).await;
        });
    }

    /// Must be called with the provider's in-flight lock held.
    async fn probe_and_store(&self, name: &str) -> ProviderHealth {
        let Some(provider) = self.inner.registry.get(name).cloned() else {
            return ProviderHealth::unknown();
        };
        let previous_rate = self.cached(name).map(|h| h.success_rate).unwrap_or(1.0);

        let started = Instant::now();
        // Aborted when dropped, so a timed-out or abandoned probe cannot keep
        // running after the in-flight lock is released.
        let mut probe = AbortOnDropHandle::new(tokio::spawn(async move { provider.check_health().await }));
        let health = match tokio::time::timeout(self.inner.probe_timeout, &mut probe).await {
            Ok(Ok(health)) => health,
            Ok(Err(e)) => {
                warn!(provider = %name, error = %e, "Health probe aborted");
                ProviderHealth::unhealthy(started.elapsed(), previous_rate, format!("Health probe aborted: {e}"))
            }
            Err(_) => {
                probe.abort();
                warn!(provider = %name, timeout_ms = self.inner.probe_timeout.as_millis() as u64, "Health probe timed out");
                ProviderHealth::unhealthy(
                    started.elapsed(),
                    previous_rate,
                    format!("Health probe timed out after {:?}", self.inner.probe_timeout),
                )
            }
        };

        match health.status {
            HealthStatus::Healthy => {
                debug!(provider = %name, elapsed_ms = health.response_time_ms, "Provider healthy")
            }
            status => warn!(
                provider = %name,
                ?status,
                error = health.last_error.as_deref().unwrap_or(""),
                "Provider not healthy"
            ),
        }

        self.inner
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_string(),
                CacheEntry {
                    health: health.clone(),
                    checked_at: Instant::now(),
                },
            );
        health
    }
}
