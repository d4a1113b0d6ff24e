//! Bearer token authentication for the protected v1 routes.
//!
//! With `server.api_keys` empty the service runs open and the middleware
//! passes every request through.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::state::AppState;

use super::response::{ApiResponse, ErrorCode};

pub async fn v1_auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let keys = &state.config.server.api_keys;
    if keys.is_empty() {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(token) => token,
            None => {
                return ApiResponse::<()>::error(
                    ErrorCode::Unauthorized,
                    "Invalid authorization header format. Expected: Bearer <token>",
                )
                .into_response();
            }
        },
        None => {
            return ApiResponse::<()>::error(
                ErrorCode::Unauthorized,
                "Missing authorization header",
            )
            .into_response();
        }
    };

    if keys.iter().any(|k| k == token) {
        next.run(request).await
    } else {
        ApiResponse::<()>::error(ErrorCode::Unauthorized, "Invalid API key").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::ProviderRegistry;
    use crate::service::OcrService;
    use axum::http::StatusCode;
    use axum::{middleware, routing::get, Router};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn build_test_app(api_keys: Vec<String>) -> Router {
        let mut config = Config {
            providers: vec![],
            ..Config::default()
        };
        config.server.api_keys = api_keys;
        let service = OcrService::with_registry(ProviderRegistry::default(), &config).unwrap();
        let state = AppState::new(config, service, CancellationToken::new());

        async fn protected_handler() -> &'static str {
            "protected"
        }

        Router::new()
            .route("/protected", get(protected_handler))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                v1_auth_middleware,
            ))
            .with_state(state)
    }

    async fn parse_error_body(response: Response) -> (StatusCode, serde_json::Value) {
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, json)
    }

    fn get_protected(auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/protected");
        if let Some(value) = auth {
            builder = builder.header("Authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_open_when_no_keys_configured() {
        let app = build_test_app(vec![]);
        let response = app.oneshot(get_protected(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_allows_valid_key() {
        let app = build_test_app(vec!["test-key".to_string()]);
        let response = app
            .oneshot(get_protected(Some("Bearer test-key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejects_invalid_key() {
        let app = build_test_app(vec!["test-key".to_string()]);
        let response = app
            .oneshot(get_protected(Some("Bearer wrong-key")))
            .await
            .unwrap();

        let (status, json) = parse_error_body(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["code"], "unauthorized");
        assert_eq!(json["error"]["message"], "Invalid API key");
    }

    #[tokio::test]
    async fn test_rejects_missing_or_malformed_header() {
        let app = build_test_app(vec!["test-key".to_string()]);
        let (status, json) = parse_error_body(app.clone().oneshot(get_protected(None)).await.unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["message"], "Missing authorization header");

        let (status, json) =
            parse_error_body(app.oneshot(get_protected(Some("Basic abc"))).await.unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(json.get("data").is_none());
    }
}
