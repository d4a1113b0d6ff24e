use axum::extract::State;

use crate::api::state::AppState;
use crate::api::v1::response::ApiResponse;
use crate::service::ProviderInfo;

/// `GET /api/v1/providers`
///
/// Registered providers with capabilities, scores and last cached health.
pub async fn list_providers(State(state): State<AppState>) -> ApiResponse<Vec<ProviderInfo>> {
    ApiResponse::success(state.service.providers())
}
