use std::cmp::Ordering;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::SelectionWeights;
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::models::OcrRequest;
use crate::registry::ProviderRegistry;

/// Provider eligible for a request, with the inputs that ranked it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub name: String,
    pub score: f64,
    pub estimated_cost: f64,
    #[serde(rename = "estimatedMs", serialize_with = "serialize_ms")]
    pub estimated_latency: Duration,
}

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Pre-computed scoring inputs for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringInput {
    pub name: String,
    pub reliability: f64,
    pub quality: f64,
    pub cost: f64,
    pub latency: Duration,
}

/// Orders `inputs` by weighted score, best first.
///
/// Cost and latency are divided by their maximum across `inputs`, so both
/// penalties lie in `[0, 1]`. Equal scores keep the input order.
pub fn rank(inputs: Vec<ScoringInput>, weights: &SelectionWeights) -> Vec<Candidate> {
    let max_cost = inputs.iter().map(|i| i.cost).fold(0.0_f64, f64::max);
    let max_latency = inputs
        .iter()
        .map(|i| i.latency.as_secs_f64())
        .fold(0.0_f64, f64::max);

    let normalize = |value: f64, max: f64| if max > 0.0 { value / max } else { 0.0 };

    let mut candidates: Vec<Candidate> = inputs
        .into_iter()
        .map(|input| {
            let score = weights.reliability * input.reliability
                + weights.quality * input.quality
                - weights.cost * normalize(input.cost, max_cost)
                - weights.latency * normalize(input.latency.as_secs_f64(), max_latency);
            Candidate {
                name: input.name,
                score,
                estimated_cost: input.cost,
                estimated_latency: input.latency,
            }
        })
        .collect();

    // sort_by is stable: ties stay in registration order.
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    candidates
}

#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    weights: SelectionWeights,
}

impl SelectionPolicy {
    pub fn new(weights: SelectionWeights) -> Result<Self> {
        Ok(Self {
            weights: weights.normalized()?,
        })
    }

    pub fn weights(&self) -> &SelectionWeights {
        &self.weights
    }

    /// Eligible providers for `request`, best first. Empty means none can serve it.
    pub async fn select(
        &self,
        request: &OcrRequest,
        registry: &ProviderRegistry,
        health: &HealthMonitor,
    ) -> Vec<Candidate> {
        let size = request.size_bytes();
        let mut inputs = Vec::with_capacity(registry.len());

        for provider in registry.providers() {
            let name = provider.name();
            if !provider.can_process(request) {
                debug!(provider = name, "Skipping provider: capabilities do not match");
                continue;
            }
            if !health.is_available(name) {
                debug!(provider = name, "Skipping provider: unavailable");
                continue;
            }

            inputs.push(ScoringInput {
                name: name.to_string(),
                reliability: provider.reliability_score(),
                quality: provider.quality_score(),
                cost: provider.cost_estimate(size, request).await,
                latency: provider.estimated_processing_time(size),
            });
        }

        let candidates = rank(inputs, &self.weights);
        debug!(
            candidates = ?candidates.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "Providers ranked"
        );
        candidates
    }
}
