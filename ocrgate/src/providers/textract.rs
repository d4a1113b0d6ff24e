use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::ProviderConfig;
use crate::error::{OcrError, ProviderErrorKind, Result};
use crate::models::{
    BoundingBox, OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth, TextBlock,
};

use super::{http, image_dimensions, require, CallStats, OcrProvider};

const DEFAULT_REGION: &str = "us-east-1";
const SERVICE: &str = "textract";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Per-page surcharges on top of plain text detection.
const TABLES_SURCHARGE: f64 = 0.015;
const FORMS_SURCHARGE: f64 = 0.05;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TextractResponse {
    #[serde(default)]
    blocks: Vec<TextractBlock>,
    #[serde(default)]
    document_metadata: Option<DocumentMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DocumentMetadata {
    #[serde(default)]
    pages: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TextractBlock {
    block_type: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    text_type: Option<String>,
    #[serde(default)]
    geometry: Option<Geometry>,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Geometry {
    bounding_box: NormalizedBox,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NormalizedBox {
    width: f64,
    height: f64,
    left: f64,
    top: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Relationship {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

#[derive(Debug, Clone)]
struct Credentials {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

/// Headers produced by signing one request.
#[derive(Debug, Clone, PartialEq)]
struct SignedHeaders {
    amz_date: String,
    authorization: String,
}

/// AWS Textract over the JSON 1.1 protocol.
#[derive(Debug)]
pub struct TextractProvider {
    name: String,
    client: Client,
    endpoint: Url,
    host: String,
    region: String,
    credentials: Credentials,
    capabilities: ProviderCapabilities,
    stats: CallStats,
}

impl TextractProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let access_key = require(&config.api_key, "Access key id")?.to_string();
        let secret_key = require(&config.secret_key, "Secret access key")?.to_string();
        let region = config
            .region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
            .to_string();

        let raw_endpoint = config
            .base_url
            .as_deref()
            .map(http::trim_base_url)
            .unwrap_or_else(|| format!("https://{SERVICE}.{region}.amazonaws.com"));
        let endpoint = Url::parse(&raw_endpoint).map_err(|e| {
            OcrError::Configuration(format!("Invalid endpoint '{raw_endpoint}': {e}"))
        })?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(OcrError::Configuration(format!(
                    "Endpoint '{raw_endpoint}' has no host"
                )))
            }
        };

        Ok(Self {
            name: config.name.clone(),
            client: http::build_client(&config.name, config.timeout_secs)?,
            endpoint,
            host,
            region,
            credentials: Credentials {
                access_key,
                secret_key,
                session_token: config.session_token.clone().filter(|t| !t.trim().is_empty()),
            },
            capabilities: config.resolved_capabilities(),
            stats: CallStats::default(),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn request_cost(&self, request: &OcrRequest) -> f64 {
        let mut cost = self.capabilities.cost_per_request;
        if request.requires_table_detection() {
            cost += TABLES_SURCHARGE;
        }
        if request.requires_form_detection() {
            cost += FORMS_SURCHARGE;
        }
        cost
    }

    /// Signs and posts one JSON 1.1 call, mapping AWS error types.
    async fn call(&self, target: &str, body: &serde_json::Value) -> Result<Response> {
        let payload = serde_json::to_vec(body)?;
        let signed = sign(
            &self.credentials,
            &self.region,
            &self.host,
            self.endpoint.path(),
            target,
            &payload,
            Utc::now(),
        )?;

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", CONTENT_TYPE)
            .header("X-Amz-Date", &signed.amz_date)
            .header("X-Amz-Target", target)
            .header("Authorization", &signed.authorization)
            .body(payload);
        if let Some(token) = &self.credentials.session_token {
            builder = builder.header("X-Amz-Security-Token", token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| http::transport_error(&self.name, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ServiceError>(&body) {
            Ok(error) if !error.kind.is_empty() => {
                let short = error.kind.rsplit('#').next().unwrap_or(&error.kind);
                Err(OcrError::provider(
                    &self.name,
                    error_kind(short).unwrap_or_else(|| http::status_kind(status)),
                    format!("{short}: {}", error.message),
                ))
            }
            _ => Err(http::status_error(&self.name, status, &body)),
        }
    }

    async fn recognize(&self, request: &OcrRequest) -> Result<OcrResult> {
        let started = Instant::now();
        let mut features = Vec::new();
        if request.requires_table_detection() {
            features.push("TABLES");
        }
        if request.requires_form_detection() {
            features.push("FORMS");
        }

        let document = json!({ "Bytes": STANDARD.encode(request.image()) });
        let (target, body) = if features.is_empty() {
            ("Textract.DetectDocumentText", json!({ "Document": document }))
        } else {
            (
                "Textract.AnalyzeDocument",
                json!({ "Document": document, "FeatureTypes": features }),
            )
        };

        debug!(provider = %self.name, target, "Sending Textract request");
        let response = self.call(target, &body).await?;
        let parsed: TextractResponse = http::parse_json(&self.name, response).await?;

        let dimensions = image_dimensions(request.image());
        let pages = parsed.document_metadata.as_ref().map(|m| m.pages).unwrap_or(1);
        let tables = parsed.blocks.iter().filter(|b| b.block_type == "TABLE").count();
        let key_values = parsed
            .blocks
            .iter()
            .filter(|b| b.block_type == "KEY_VALUE_SET")
            .count();
        let blocks = to_blocks(&parsed.blocks, dimensions, request.language());

        let mut result = OcrResult::from_blocks(
            &self.name,
            blocks,
            request.language(),
            started.elapsed(),
            self.request_cost(request) * pages as f64,
        )
        .with_metadata("operation", target)
        .with_metadata("pages", pages);
        if request.requires_table_detection() {
            result = result.with_metadata("tables", tables);
        }
        if request.requires_form_detection() {
            result = result.with_metadata("key_value_sets", key_values);
        }
        if dimensions.is_none() {
            result = result.with_metadata("normalized_geometry", true);
        }
        Ok(result)
    }
}

fn error_kind(aws_type: &str) -> Option<ProviderErrorKind> {
    let kind = match aws_type {
        "ThrottlingException"
        | "ProvisionedThroughputExceededException"
        | "LimitExceededException" => ProviderErrorKind::Quota,
        "UnrecognizedClientException"
        | "InvalidSignatureException"
        | "AccessDeniedException"
        | "ExpiredTokenException"
        | "IncompleteSignature"
        | "MissingAuthenticationToken" => ProviderErrorKind::Auth,
        "InvalidParameterException"
        | "UnsupportedDocumentException"
        | "BadDocumentException"
        | "DocumentTooLargeException" => ProviderErrorKind::MalformedImage,
        "InternalServerError" | "ServiceUnavailable" => ProviderErrorKind::Server,
        _ => return None,
    };
    Some(kind)
}

/// LINE blocks in document order; boxes scaled to pixels when the image
/// dimensions are known.
fn to_blocks(
    blocks: &[TextractBlock],
    dimensions: Option<(u32, u32)>,
    language: Option<&str>,
) -> Vec<TextBlock> {
    let words: HashMap<&str, &TextractBlock> = blocks
        .iter()
        .filter(|b| b.block_type == "WORD")
        .map(|b| (b.id.as_str(), b))
        .collect();

    blocks
        .iter()
        .filter(|b| b.block_type == "LINE")
        .filter_map(|line| {
            let text = line.text.as_deref()?.trim();
            if text.is_empty() {
                return None;
            }

            let normalized = line
                .geometry
                .as_ref()
                .map(|g| {
                    let b = &g.bounding_box;
                    BoundingBox::new(b.left, b.top, b.width, b.height)
                })
                .unwrap_or_default();
            let bbox = match dimensions {
                Some((w, h)) => normalized.scaled(w as f64, h as f64),
                None => normalized,
            };

            let children: Vec<&TextractBlock> = line
                .relationships
                .iter()
                .filter(|r| r.kind == "CHILD")
                .flat_map(|r| r.ids.iter())
                .filter_map(|id| words.get(id.as_str()).copied())
                .collect();
            let handwritten_words = children
                .iter()
                .filter(|w| w.text_type.as_deref() == Some("HANDWRITING"))
                .count();
            let handwritten = !children.is_empty() && handwritten_words * 2 > children.len();

            Some(
                TextBlock::new(text, line.confidence.unwrap_or(0.0) / 100.0, bbox)
                    .handwritten(handwritten)
                    .with_language(language),
            )
        })
        .collect()
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| OcrError::Internal(format!("HMAC key rejected: {e}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// AWS Signature Version 4 for a POST with a JSON 1.1 body.
fn sign(
    credentials: &Credentials,
    region: &str,
    host: &str,
    path: &str,
    target: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<SignedHeaders> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let path = if path.is_empty() { "/" } else { path };

    let mut headers = vec![
        ("content-type", CONTENT_TYPE.to_string()),
        ("host", host.to_string()),
        ("x-amz-date", amz_date.clone()),
        ("x-amz-target", target.to_string()),
    ];
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token", token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| *k)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "POST\n{path}\n\n{canonical_headers}\n{signed_headers}\n{}",
        sha256_hex(payload)
    );
    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(format!("AWS4{}", credentials.secret_key).as_bytes(), &date)?;
    let k_region = hmac_sha256(&k_date, region)?;
    let k_service = hmac_sha256(&k_region, SERVICE)?;
    let k_signing = hmac_sha256(&k_service, "aws4_request")?;
    let signature: String = hmac_sha256(&k_signing, &string_to_sign)?
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();

    Ok(SignedHeaders {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key
        ),
        amz_date,
    })
}

#[async_trait]
impl OcrProvider for TextractProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn process_image(
        &self,
        request: &OcrRequest,
        cancel: &CancellationToken,
    ) -> Result<OcrResult> {
        let result = http::cancellable(cancel, self.recognize(request)).await;
        self.stats.record(&result);
        result
    }

    fn record_failure(&self, error: &OcrError) {
        self.stats.record_error(error);
    }

    /// Submits an empty document: a parameter error proves the credentials work.
    async fn check_health(&self) -> ProviderHealth {
        let started = Instant::now();
        let outcome = self
            .call(
                "Textract.DetectDocumentText",
                &json!({ "Document": { "Bytes": "" } }),
            )
            .await;
        let elapsed = started.elapsed();
        let success_rate = self.stats.success_rate();

        match outcome {
            Ok(_)
            | Err(OcrError::Provider {
                kind: ProviderErrorKind::MalformedImage,
                ..
            }) => ProviderHealth::healthy(elapsed, success_rate),
            Err(OcrError::Provider {
                kind: ProviderErrorKind::Quota,
                message,
                ..
            }) => ProviderHealth::degraded(elapsed, success_rate, message),
            Err(e) => ProviderHealth::unhealthy(elapsed, success_rate, e.to_string()),
        }
    }

    async fn cost_estimate(&self, _size_bytes: u64, request: &OcrRequest) -> f64 {
        self.request_cost(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::config::ProviderKind;

    fn credentials(token: Option<&str>) -> Credentials {
        Credentials {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: token.map(String::from),
        }
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 30, 45).unwrap()
    }

    fn config() -> ProviderConfig {
        let mut config = ProviderConfig::new("textract", ProviderKind::Textract);
        config.api_key = Some("AKIDEXAMPLE".to_string());
        config.secret_key = Some("secret".to_string());
        config
    }

    #[test]
    fn test_requires_both_keys() {
        let mut missing_secret = config();
        missing_secret.secret_key = None;
        assert!(TextractProvider::new(&missing_secret).is_err());

        let provider = TextractProvider::new(&config()).unwrap();
        assert_eq!(provider.region(), "us-east-1");
        assert_eq!(provider.host, "textract.us-east-1.amazonaws.com");
    }

    #[test]
    fn test_custom_endpoint_keeps_port_in_host() {
        let mut config = config();
        config.base_url = Some("http://127.0.0.1:4566/".to_string());
        config.region = Some("eu-west-1".to_string());
        let provider = TextractProvider::new(&config).unwrap();
        assert_eq!(provider.host, "127.0.0.1:4566");
        assert_eq!(provider.region(), "eu-west-1");
    }

    #[test]
    fn test_sign_layout() {
        let signed = sign(
            &credentials(None),
            "us-east-1",
            "textract.us-east-1.amazonaws.com",
            "/",
            "Textract.DetectDocumentText",
            b"{}",
            fixed_time(),
        )
        .unwrap();

        assert_eq!(signed.amz_date, "20240315T123045Z");
        assert!(signed.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240315/us-east-1/textract/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date;x-amz-target, Signature="
        ));
        let signature = signed.authorization.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_is_deterministic_and_covers_payload() {
        let sign_with = |payload: &[u8], token: Option<&str>| {
            sign(
                &credentials(token),
                "us-east-1",
                "h",
                "/",
                "Textract.DetectDocumentText",
                payload,
                fixed_time(),
            )
            .unwrap()
        };

        assert_eq!(sign_with(b"a", None), sign_with(b"a", None));
        assert_ne!(sign_with(b"a", None), sign_with(b"b", None));

        let with_token = sign_with(b"a", Some("session"));
        assert!(with_token
            .authorization
            .contains("SignedHeaders=content-type;host;x-amz-date;x-amz-security-token;x-amz-target"));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(error_kind("ThrottlingException"), Some(ProviderErrorKind::Quota));
        assert_eq!(error_kind("UnrecognizedClientException"), Some(ProviderErrorKind::Auth));
        assert_eq!(error_kind("BadDocumentException"), Some(ProviderErrorKind::MalformedImage));
        assert_eq!(error_kind("SomethingNew"), None);
    }

    #[test]
    fn test_to_blocks_scales_and_detects_handwriting() {
        let parsed: TextractResponse = serde_json::from_str(
            r#"{
                "DocumentMetadata": {"Pages": 1},
                "Blocks": [
                    {"BlockType": "PAGE", "Id": "p"},
                    {"BlockType": "LINE", "Id": "l1", "Text": "Hello world", "Confidence": 99.0,
                     "Geometry": {"BoundingBox": {"Width": 0.5, "Height": 0.1, "Left": 0.1, "Top": 0.2}},
                     "Relationships": [{"Type": "CHILD", "Ids": ["w1", "w2"]}]},
                    {"BlockType": "WORD", "Id": "w1", "Text": "Hello", "TextType": "HANDWRITING"},
                    {"BlockType": "WORD", "Id": "w2", "Text": "world", "TextType": "HANDWRITING"},
                    {"BlockType": "LINE", "Id": "l2", "Text": "Printed", "Confidence": 80.0,
                     "Relationships": [{"Type": "CHILD", "Ids": ["w3"]}]},
                    {"BlockType": "WORD", "Id": "w3", "Text": "Printed", "TextType": "PRINTED"}
                ]
            }"#,
        )
        .unwrap();

        let blocks = to_blocks(&parsed.blocks, Some((1000, 500)), None);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].bounding_box, BoundingBox::new(100.0, 100.0, 500.0, 50.0));
        assert!((blocks[0].confidence - 0.99).abs() < 1e-9);
        assert!(blocks[0].is_handwritten);
        assert!(!blocks[1].is_handwritten);
        assert!((blocks[1].confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cost_includes_feature_surcharges() {
        let provider = TextractProvider::new(&config()).unwrap();
        let base = provider.capabilities().cost_per_request;
        let request = OcrRequest::new(vec![1u8])
            .requiring_table_detection(true)
            .requiring_form_detection(true);
        let cost = provider.cost_estimate(1, &request).await;
        assert!((cost - (base + TABLES_SURCHARGE + FORMS_SURCHARGE)).abs() < 1e-12);
    }
}
