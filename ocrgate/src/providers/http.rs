use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OcrError, ProviderErrorKind, Result};
use crate::models::ProviderHealth;

use super::CallStats;

const MAX_ERROR_BODY_CHARS: usize = 300;

pub(crate) fn build_client(provider: &str, timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| {
            OcrError::Configuration(format!("{provider}: failed to create HTTP client: {e}"))
        })
}

pub(crate) fn transport_error(provider: &str, error: reqwest::Error) -> OcrError {
    let kind = if error.is_timeout() {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::Network
    };
    OcrError::provider(provider, kind, format!("Request failed: {error}"))
}

pub(crate) fn status_kind(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::Auth,
        429 => ProviderErrorKind::Quota,
        400 | 413 | 415 | 422 => ProviderErrorKind::MalformedImage,
        408 => ProviderErrorKind::Timeout,
        s if s >= 500 => ProviderErrorKind::Server,
        _ => ProviderErrorKind::InvalidResponse,
    }
}

pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str) -> OcrError {
    let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    OcrError::provider(
        provider,
        status_kind(status),
        format!("API request failed: {status} - {body}"),
    )
}

/// Sends the request, mapping transport failures and non-2xx statuses.
pub(crate) async fn send(provider: &str, request: RequestBuilder) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(provider, e))?;

    let status = response.status();
    debug!(provider, %status, "Provider response received");

    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());
    Err(status_error(provider, status, &body))
}

pub(crate) async fn parse_json<T: DeserializeOwned>(provider: &str, response: Response) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, e))?;
    serde_json::from_str(&body).map_err(|e| {
        OcrError::provider(
            provider,
            ProviderErrorKind::InvalidResponse,
            format!("Failed to parse response: {e}"),
        )
    })
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OcrError::Cancelled),
        result = fut => result,
    }
}

/// Issues a lightweight probe and classifies the outcome.
///
/// Any answer other than 401/403/429/5xx means the endpoint is up and our
/// credentials were accepted; 429 counts as degraded but still available.
pub(crate) async fn probe(provider: &str, stats: &CallStats, request: RequestBuilder) -> ProviderHealth {
    let started = Instant::now();
    let outcome = request.send().await;
    let elapsed = started.elapsed();
    let success_rate = stats.success_rate();

    match outcome {
        Ok(response) => {
            let status = response.status();
            match status.as_u16() {
                401 | 403 => ProviderHealth::unhealthy(
                    elapsed,
                    success_rate,
                    format!("{provider}: authentication rejected ({status})"),
                ),
                429 => ProviderHealth::degraded(
                    elapsed,
                    success_rate,
                    format!("{provider}: rate limited ({status})"),
                ),
                s if s >= 500 => ProviderHealth::unhealthy(
                    elapsed,
                    success_rate,
                    format!("{provider}: server error ({status})"),
                ),
                _ => ProviderHealth::healthy(elapsed, success_rate),
            }
        }
        Err(e) => ProviderHealth::unhealthy(
            elapsed,
            success_rate,
            format!("{provider}: probe failed: {e}"),
        ),
    }
}

pub(crate) fn trim_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}
