//! # V1 API Response Envelope
//!
//! Every endpoint returns an [`ApiResponse<T>`] with optional top-level fields:
//!
//! ```json
//! {
//!   "data": { ... },                                  // present on success
//!   "meta": { "total": 5, "failed": 1 },              // batch summaries only
//!   "error": { "code": "invalid_request", "message": "..." }
//! }
//! ```
//!
//! An OCR request whose providers all failed is still a successful HTTP
//! exchange: the `OcrResult` in `data` carries the `error` field. The envelope
//! `error` is reserved for requests that never reached the dispatcher.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::OcrError;

/// Machine-readable error code, serialized in snake_case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// HTTP 400.
    InvalidRequest,
    /// HTTP 401.
    Unauthorized,
    /// HTTP 404.
    NotFound,
    /// HTTP 408.
    Cancelled,
    /// HTTP 502: an upstream OCR provider failed.
    UpstreamError,
    /// HTTP 503: the service or provider is not configured.
    Unavailable,
    /// HTTP 504.
    Timeout,
    /// HTTP 500. Internal details are never leaked to the client.
    InternalError,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::UpstreamError => StatusCode::BAD_GATEWAY,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
            Self::UpstreamError => "upstream_error",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::InternalError => "internal_error",
        };
        f.write_str(code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,

    #[serde(skip)]
    status: StatusCode,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            meta: None,
            error: None,
            status: StatusCode::OK,
        }
    }

    pub fn success_with_meta(data: T, meta: ResponseMeta) -> Self {
        Self {
            data: Some(data),
            meta: Some(meta),
            error: None,
            status: StatusCode::OK,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let status = code.status();
        Self {
            data: None,
            meta: None,
            error: Some(ApiError {
                code,
                message: message.into(),
            }),
            status,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = self.status;
        match serde_json::to_value(&self) {
            Ok(body) => (status, Json(body)).into_response(),
            Err(_) => {
                let body = serde_json::json!({
                    "error": {
                        "code": "internal_error",
                        "message": "An internal error occurred"
                    }
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

impl<T: Serialize> From<OcrError> for ApiResponse<T> {
    fn from(err: OcrError) -> Self {
        match err {
            OcrError::Validation(ref msg) => ApiResponse::error(ErrorCode::InvalidRequest, msg.clone()),
            OcrError::Json(ref e) => {
                ApiResponse::error(ErrorCode::InvalidRequest, format!("Invalid JSON: {e}"))
            }
            OcrError::NotFound(ref msg) => ApiResponse::error(ErrorCode::NotFound, msg.clone()),
            OcrError::Configuration(ref msg) => ApiResponse::error(ErrorCode::Unavailable, msg.clone()),
            OcrError::Cancelled => ApiResponse::error(ErrorCode::Cancelled, err.to_string()),
            OcrError::Timeout(ref msg) => ApiResponse::error(ErrorCode::Timeout, msg.clone()),
            OcrError::Provider { .. } | OcrError::Exhausted(_) => {
                ApiResponse::error(ErrorCode::UpstreamError, err.to_string())
            }
            ref internal @ (OcrError::Http(_) | OcrError::Io(_) | OcrError::Internal(_)) => {
                tracing::error!(error = %internal, "Internal error mapped to v1 response");
                ApiResponse::error(ErrorCode::InternalError, "An internal error occurred")
            }
        }
    }
}
