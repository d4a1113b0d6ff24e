use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::api::state::AppState;

use super::handlers;
use super::middleware::v1_auth_middleware;

pub fn v1_router(state: AppState) -> Router<AppState> {
    let public_routes = Router::new().route("/health", get(handlers::health_check));

    let protected_routes = Router::new()
        .route("/providers", get(handlers::providers::list_providers))
        .route("/ocr", post(handlers::ocr::process_image))
        .route("/ocr:batch", post(handlers::ocr::process_batch))
        .route("/ocr:estimate", post(handlers::ocr::estimate))
        .route_layer(middleware::from_fn_with_state(state, v1_auth_middleware));

    Router::new().merge(public_routes).merge(protected_routes)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::api::routes::create_router;
    use crate::api::state::AppState;
    use crate::config::{Config, ProviderKind};
    use crate::error::Result;
    use crate::models::{
        BoundingBox, OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth, TextBlock,
    };
    use crate::providers::OcrProvider;
    use crate::registry::ProviderRegistry;
    use crate::service::OcrService;

    struct Echo {
        capabilities: ProviderCapabilities,
    }

    #[async_trait]
    impl OcrProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> &ProviderCapabilities {
            &self.capabilities
        }

        async fn process_image(
            &self,
            request: &OcrRequest,
            _cancel: &CancellationToken,
        ) -> Result<OcrResult> {
            let text = String::from_utf8_lossy(request.image()).to_string();
            Ok(OcrResult::from_blocks(
                "echo",
                vec![TextBlock::new(text, 0.9, BoundingBox::default())],
                request.language(),
                Duration::from_millis(1),
                0.0,
            ))
        }

        async fn check_health(&self) -> ProviderHealth {
            ProviderHealth::healthy(Duration::ZERO, 1.0)
        }
    }

    fn test_state(api_keys: Vec<String>) -> AppState {
        let mut config = Config {
            providers: vec![],
            ..Config::default()
        };
        config.server.api_keys = api_keys;
        let mut capabilities = ProviderKind::Paddle.default_capabilities();
        capabilities.max_image_size_mb = 1.0;
        let provider: Arc<dyn OcrProvider> = Arc::new(Echo { capabilities });
        let registry = ProviderRegistry::new(vec![provider]).unwrap();
        let service = OcrService::with_registry(registry, &config).unwrap();
        AppState::new(config, service, CancellationToken::new())
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const BOUNDARY: &str = "ocrgate-test-boundary";

    fn multipart_body(images: &[&str], fields: &[(&str, &str)]) -> Body {
        let mut body = String::new();
        for image in images {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"scan.png\"\r\nContent-Type: image/png\r\n\r\n{image}\r\n"
            ));
        }
        for (name, value) in fields {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        Body::from(body)
    }

    fn multipart_request(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = create_router(test_state(vec!["secret".to_string()]));

        let response = app
            .oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["status"], "ok");
        assert_eq!(json["data"]["providers"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn ocr_requires_auth_when_keys_configured() {
        let app = create_router(test_state(vec!["secret".to_string()]));

        let response = app
            .oneshot(multipart_request("/api/v1/ocr", multipart_body(&["hi"], &[])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn ocr_single_image() {
        let app = create_router(test_state(vec![]));

        let response = app
            .oneshot(multipart_request(
                "/api/v1/ocr",
                multipart_body(&["hello world"], &[("language", "de")]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["text"], "hello world");
        assert_eq!(json["data"]["provider"], "echo");
        assert_eq!(json["data"]["language"], "de");
        assert!(json["data"].get("error").is_none());
    }

    #[tokio::test]
    async fn ocr_without_image_is_invalid() {
        let app = create_router(test_state(vec![]));

        let response = app
            .oneshot(multipart_request(
                "/api/v1/ocr",
                multipart_body(&[], &[("language", "en")]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn ocr_unsupported_requirement_returns_failed_result() {
        let app = create_router(test_state(vec![]));

        let response = app
            .oneshot(multipart_request(
                "/api/v1/ocr",
                multipart_body(&["x"], &[("requiresFormDetection", "true")]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["error"], "no OCR provider available");
        assert_eq!(json["data"]["text"], "");
    }

    #[tokio::test]
    async fn ocr_batch_keeps_upload_order() {
        let app = create_router(test_state(vec![]));

        let response = app
            .oneshot(multipart_request(
                "/api/v1/ocr:batch",
                multipart_body(&["one", "two", "three"], &[]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let texts: Vec<&str> = json["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert_eq!(json["meta"]["total"], 3);
        assert_eq!(json["meta"]["failed"], 0);
    }

    #[tokio::test]
    async fn estimate_reports_size_limits() {
        let app = create_router(test_state(vec![]));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/ocr:estimate")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sizeBytes": 5000000}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"][0]["provider"], "echo");
        assert_eq!(json["data"][0]["canProcess"], false);
        assert_eq!(json["data"][0]["available"], true);
    }

    #[tokio::test]
    async fn providers_lists_capabilities() {
        let app = create_router(test_state(vec![]));

        let response = app
            .oneshot(Request::builder().uri("/api/v1/providers").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"][0]["name"], "echo");
        assert_eq!(json["data"][0]["configured"], true);
        assert_eq!(json["data"][0]["capabilities"]["max_image_size_mb"], 1.0);
    }
}
