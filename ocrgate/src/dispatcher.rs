//! Runs one request against ranked candidates with retry and failover.
//!
//! Each candidate gets `1 + max_retries` attempts. Transient failures are
//! retried after a backoff delay; anything else moves on to the next
//! candidate. The outcome is always an [`OcrResult`]: exhaustion, validation
//! failures and cancellation are reported through its `error` field so a
//! batch never aborts because of one image.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoff;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BackoffKind, DispatchConfig};
use crate::error::OcrError;
use crate::health::HealthMonitor;
use crate::models::{OcrRequest, OcrResult};
use crate::providers::OcrProvider;
use crate::registry::ProviderRegistry;
use crate::selection::{Candidate, SelectionPolicy};

pub const NO_PROVIDER_AVAILABLE: &str = "no OCR provider available";

/// One failed attempt, kept for the exhausted-result metadata.
#[derive(Debug)]
struct AttemptFailure {
    provider: String,
    attempt: u32,
    error: OcrError,
}

impl AttemptFailure {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "provider": self.provider,
            "attempt": self.attempt,
            "kind": self.error.kind_label(),
            "error": self.error.to_string(),
        })
    }
}

enum CandidateOutcome {
    Succeeded { result: OcrResult, retries: u32 },
    Failed,
    Aborted(OcrError),
}

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    health: HealthMonitor,
    policy: SelectionPolicy,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: HealthMonitor,
        policy: SelectionPolicy,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            health,
            policy,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub async fn candidates(&self, request: &OcrRequest) -> Vec<Candidate> {
        self.policy
            .select(request, &self.registry, &self.health)
            .await
    }

    fn new_backoff(&self) -> Box<dyn Backoff + Send> {
        let initial = Duration::from_millis(self.config.retry_delay_ms);
        match self.config.backoff {
            BackoffKind::Fixed => Box::new(Constant::new(initial)),
            BackoffKind::Exponential => Box::new(ExponentialBackoff {
                current_interval: initial,
                initial_interval: initial,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval: Duration::from_millis(self.config.max_retry_delay_ms.max(self.config.retry_delay_ms)),
                max_elapsed_time: None,
                ..Default::default()
            }),
        }
    }

    /// Processes one image, never returning an error: failures land in
    /// [`OcrResult::error`] with the attempt history in its metadata.
    pub async fn process_image(&self, request: &OcrRequest, cancel: &CancellationToken) -> OcrResult {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.config.request_deadline_secs);

        if let Err(e) = request.validate() {
            warn!(request_id = %request_id, error = %e, "Rejected OCR request");
            return OcrResult::failed("", e.to_string(), started.elapsed())
                .with_metadata("request_id", request_id)
                .with_metadata("attempts", 0);
        }

        let candidates = self.candidates(request).await;
        if candidates.is_empty() {
            warn!(request_id = %request_id, size_bytes = request.size_bytes(), "No OCR provider available");
            return OcrResult::failed("", NO_PROVIDER_AVAILABLE, started.elapsed())
                .with_metadata("request_id", request_id)
                .with_metadata("attempts", 0)
                .with_metadata("attempted_providers", json!([]));
        }

        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut attempted: Vec<String> = Vec::new();
        let mut attempts: u32 = 0;
        let mut abort: Option<OcrError> = None;

        for (depth, candidate) in candidates.iter().enumerate() {
            let Some(provider) = self.registry.get(&candidate.name) else {
                continue;
            };
            attempted.push(candidate.name.clone());

            let outcome = self
                .try_candidate(
                    provider.as_ref(),
                    request,
                    cancel,
                    deadline,
                    &request_id,
                    &mut attempts,
                    &mut failures,
                )
                .await;

            match outcome {
                CandidateOutcome::Succeeded { result, retries } => {
                    info!(
                        request_id = %request_id,
                        provider = %candidate.name,
                        attempts,
                        retries,
                        fallback_depth = depth,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "OCR request succeeded"
                    );
                    return result
                        .with_metadata("request_id", request_id)
                        .with_metadata("attempts", attempts)
                        .with_metadata("retries", retries)
                        .with_metadata("fallback_depth", depth);
                }
                CandidateOutcome::Failed => {
                    debug!(request_id = %request_id, provider = %candidate.name, "Falling back to next provider");
                }
                CandidateOutcome::Aborted(e) => {
                    abort = Some(e);
                    break;
                }
            }
        }

        let summary = match &abort {
            Some(e) => e.to_string(),
            None => {
                let last = failures
                    .last()
                    .map(|f| f.error.to_string())
                    .unwrap_or_else(|| NO_PROVIDER_AVAILABLE.to_string());
                OcrError::Exhausted(format!(
                    "{} provider(s) tried, last error: {last}",
                    attempted.len()
                ))
                .to_string()
            }
        };

        error!(
            request_id = %request_id,
            attempts,
            providers = ?attempted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %summary,
            "OCR request failed"
        );

        let provider = attempted.last().cloned().unwrap_or_default();
        OcrResult::failed(provider, summary, started.elapsed())
            .with_metadata("request_id", request_id)
            .with_metadata("attempts", attempts)
            .with_metadata("attempted_providers", json!(attempted))
            .with_metadata(
                "failures",
                serde_json::Value::Array(failures.iter().map(AttemptFailure::to_json).collect()),
            )
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_candidate(
        &self,
        provider: &dyn OcrProvider,
        request: &OcrRequest,
        cancel: &CancellationToken,
        deadline: Instant,
        request_id: &str,
        attempts: &mut u32,
        failures: &mut Vec<AttemptFailure>,
    ) -> CandidateOutcome {
        let name = provider.name();
        let max_attempts = 1 + self.config.max_retries;
        let per_attempt = Duration::from_secs(self.config.attempt_timeout_secs);
        let mut backoff = self.new_backoff();

        for attempt in 1..=max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return CandidateOutcome::Aborted(OcrError::Timeout(format!(
                    "request deadline of {}s exceeded",
                    self.config.request_deadline_secs
                )));
            }
            let budget = per_attempt.min(remaining);

            *attempts += 1;
            debug!(request_id, provider = name, attempt, "Attempting OCR");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(OcrError::Cancelled),
                timed = tokio::time::timeout(budget, provider.process_image(request, cancel)) => {
                    timed.unwrap_or_else(|_| {
                        let e = OcrError::Timeout(format!("{name} attempt exceeded {}ms", budget.as_millis()));
                        provider.record_failure(&e);
                        Err(e)
                    })
                }
            };

            let error = match outcome {
                Ok(result) => {
                    return CandidateOutcome::Succeeded {
                        result,
                        retries: attempt - 1,
                    }
                }
                Err(OcrError::Cancelled) => return CandidateOutcome::Aborted(OcrError::Cancelled),
                Err(e) => e,
            };

            let retryable = error.is_retryable();
            warn!(
                request_id,
                provider = name,
                attempt,
                kind = error.kind_label(),
                retryable,
                error = %error,
                "OCR attempt failed"
            );
            failures.push(AttemptFailure {
                provider: name.to_string(),
                attempt,
                error,
            });

            if !retryable || attempt == max_attempts {
                return CandidateOutcome::Failed;
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(Duration::from_millis(self.config.retry_delay_ms))
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return CandidateOutcome::Aborted(OcrError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        CandidateOutcome::Failed
    }

    /// Each image runs the full single-request flow; results keep input order.
    pub async fn process_batch(
        &self,
        requests: &[OcrRequest],
        cancel: &CancellationToken,
    ) -> Vec<OcrResult> {
        let concurrency = self.config.batch_concurrency.max(1);
        info!(images = requests.len(), concurrency, "Processing OCR batch");

        // Built eagerly: a lazy `Map` over the borrowed slice makes the
        // returned future fail the `Send` bound axum handlers need.
        let pending: Vec<BoxFuture<'_, OcrResult>> = requests
            .iter()
            .map(|r| self.process_image(r, cancel).boxed())
            .collect();
        let results: Vec<OcrResult> = stream::iter(pending).buffered(concurrency).collect().await;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(images = results.len(), failed, "OCR batch completed");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, SelectionWeights};
    use crate::error::{ProviderErrorKind, Result};
    use crate::models::{BoundingBox, ProviderCapabilities, ProviderHealth, TextBlock};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays scripted outcomes, then succeeds.
    struct Scripted {
        name: String,
        capabilities: ProviderCapabilities,
        script: Mutex<VecDeque<ProviderErrorKind>>,
        calls: AtomicU32,
        abandoned: AtomicU32,
        delay: Duration,
    }

    impl Scripted {
        fn new(name: &str, script: &[ProviderErrorKind]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                capabilities: ProviderKind::Paddle.default_capabilities(),
                script: Mutex::new(script.iter().copied().collect()),
                calls: AtomicU32::new(0),
                abandoned: AtomicU32::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                capabilities: ProviderKind::Paddle.default_capabilities(),
                script: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                abandoned: AtomicU32::new(0),
                delay,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OcrProvider for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &ProviderCapabilities {
            &self.capabilities
        }

        async fn process_image(
            &self,
            _request: &OcrRequest,
            _cancel: &CancellationToken,
        ) -> Result<OcrResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(kind) => Err(OcrError::provider(&self.name, kind, "scripted failure")),
                None => Ok(OcrResult::from_blocks(
                    &self.name,
                    vec![TextBlock::new("hello", 0.9, BoundingBox::default())],
                    None,
                    Duration::from_millis(1),
                    0.0,
                )),
            }
        }

        fn record_failure(&self, _error: &OcrError) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }

        async fn check_health(&self) -> ProviderHealth {
            ProviderHealth::healthy(Duration::ZERO, 1.0)
        }
    }

    fn dispatch_config(max_retries: u32) -> DispatchConfig {
        DispatchConfig {
            max_retries,
            backoff: BackoffKind::Exponential,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            attempt_timeout_secs: 5,
            request_deadline_secs: 30,
            batch_concurrency: 1,
        }
    }

    fn dispatcher(providers: Vec<Arc<Scripted>>, config: DispatchConfig) -> Dispatcher {
        let providers: Vec<Arc<dyn OcrProvider>> = providers
            .into_iter()
            .map(|p| p as Arc<dyn OcrProvider>)
            .collect();
        let registry = Arc::new(ProviderRegistry::new(providers).unwrap());
        let health = HealthMonitor::new(registry.clone(), Duration::from_secs(60), Duration::from_secs(1));
        let policy = SelectionPolicy::new(SelectionWeights::default()).unwrap();
        Dispatcher::new(registry, health, policy, config)
    }

    fn image() -> OcrRequest {
        OcrRequest::new(vec![0x89, b'P', b'N', b'G'])
    }

    #[tokio::test]
    async fn test_retry_then_success_records_one_retry() {
        let first = Scripted::new("first", &[ProviderErrorKind::Network]);
        let second = Scripted::new("second", &[]);
        let dispatcher = dispatcher(vec![first.clone(), second.clone()], dispatch_config(2));

        let result = dispatcher.process_image(&image(), &CancellationToken::new()).await;

        assert!(result.is_success(), "{:?}", result.error());
        assert_eq!(result.provider(), "first");
        assert_eq!(result.metadata()["retries"], 1);
        assert_eq!(result.metadata()["attempts"], 2);
        assert_eq!(result.metadata()["fallback_depth"], 0);
        assert_eq!(first.calls(), 2);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_over_immediately() {
        let first = Scripted::new("first", &[ProviderErrorKind::Auth]);
        let second = Scripted::new("second", &[]);
        let dispatcher = dispatcher(vec![first.clone(), second.clone()], dispatch_config(2));

        let result = dispatcher.process_image(&image(), &CancellationToken::new()).await;

        assert_eq!(result.provider(), "second");
        assert_eq!(result.metadata()["fallback_depth"], 1);
        assert_eq!(first.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_failed_result() {
        use ProviderErrorKind::Server;
        let first = Scripted::new("first", &[Server, Server, Server]);
        let second = Scripted::new("second", &[Server, Server, Server]);
        let dispatcher = dispatcher(vec![first.clone(), second.clone()], dispatch_config(2));

        let result = dispatcher.process_image(&image(), &CancellationToken::new()).await;

        assert!(!result.is_success());
        assert!(result.text().is_empty());
        assert_eq!(result.confidence(), 0.0);
        assert!(result.error().unwrap().contains("scripted failure"));
        assert_eq!(result.metadata()["attempts"], 6);
        assert_eq!(result.metadata()["attempted_providers"], json!(["first", "second"]));
        assert_eq!(result.metadata()["failures"].as_array().unwrap().len(), 6);
        assert!(result.metadata().contains_key("request_id"));
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_dispatched() {
        let only = Scripted::new("only", &[]);
        let dispatcher = dispatcher(vec![only.clone()], dispatch_config(2));

        let result = dispatcher
            .process_image(&OcrRequest::new(Vec::<u8>::new()), &CancellationToken::new())
            .await;

        assert!(result.error().unwrap().contains("Validation"));
        assert_eq!(only.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let dispatcher = dispatcher(vec![], dispatch_config(2));
        let result = dispatcher.process_image(&image(), &CancellationToken::new()).await;
        assert_eq!(result.error(), Some(NO_PROVIDER_AVAILABLE));
        assert!(result.text().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff_aborts() {
        let first = Scripted::new("first", &[ProviderErrorKind::Quota, ProviderErrorKind::Quota]);
        let mut config = dispatch_config(5);
        config.backoff = BackoffKind::Fixed;
        config.retry_delay_ms = 10_000;
        let dispatcher = dispatcher(vec![first.clone()], config);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = dispatcher.process_image(&image(), &cancel).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.error().unwrap().contains("cancelled"));
        assert_eq!(first.calls(), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retried_then_fails_over() {
        let slow = Scripted::slow("slow", Duration::from_secs(30));
        let fast = Scripted::new("fast", &[]);
        let mut config = dispatch_config(1);
        config.attempt_timeout_secs = 1;
        let dispatcher = dispatcher(vec![slow.clone(), fast.clone()], config);

        let result = dispatcher.process_image(&image(), &CancellationToken::new()).await;

        assert!(result.is_success());
        assert_eq!(result.provider(), "fast");
        assert_eq!(slow.calls(), 2);
        assert_eq!(slow.abandoned.load(Ordering::SeqCst), 2);
        assert_eq!(fast.abandoned.load(Ordering::SeqCst), 0);
        assert_eq!(result.metadata()["attempts"], 3);
        assert_eq!(result.metadata()["fallback_depth"], 1);
    }

    #[tokio::test]
    async fn test_batch_keeps_order_with_concurrency() {
        let only = Scripted::new("only", &[]);
        let mut config = dispatch_config(0);
        config.batch_concurrency = 3;
        let dispatcher = dispatcher(vec![only.clone()], config);

        let requests: Vec<OcrRequest> = (0..5)
            .map(|i| {
                if i == 2 {
                    OcrRequest::new(Vec::<u8>::new())
                } else {
                    image()
                }
            })
            .collect();
        let results = dispatcher.process_batch(&requests, &CancellationToken::new()).await;

        assert_eq!(results.len(), 5);
        let ok: Vec<bool> = results.iter().map(|r| r.is_success()).collect();
        assert_eq!(ok, vec![true, true, false, true, true]);
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let mut config = dispatch_config(3);
        config.retry_delay_ms = 200;
        config.max_retry_delay_ms = 500;
        let dispatcher = dispatcher(vec![], config);

        let mut backoff = dispatcher.new_backoff();
        let delays: Vec<u64> = (0..4)
            .map(|_| backoff.next_backoff().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![200, 400, 500, 500]);
    }
}
