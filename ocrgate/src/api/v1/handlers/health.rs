use axum::extract::State;

use crate::api::state::AppState;
use crate::api::v1::dto::{HealthData, ProviderHealthEntry};
use crate::api::v1::response::ApiResponse;

/// `GET /api/v1/health`
///
/// Public. Reports `ok` while at least one provider is available, otherwise
/// `degraded`. Provider entries come from the health cache and only probe
/// when an entry has expired.
pub async fn health_check(State(state): State<AppState>) -> ApiResponse<HealthData> {
    let providers: Vec<ProviderHealthEntry> = state
        .service
        .check_all_health()
        .await
        .into_iter()
        .map(|(name, health)| ProviderHealthEntry { name, health })
        .collect();

    let status = if providers.iter().any(|p| p.health.is_available) {
        "ok"
    } else {
        "degraded"
    };

    ApiResponse::success(HealthData {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        providers,
    })
}
