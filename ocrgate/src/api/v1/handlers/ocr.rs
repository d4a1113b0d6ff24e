use axum::extract::{Multipart, State};
use axum::Json;
use tracing::debug;

use crate::api::state::AppState;
use crate::api::v1::dto::{EstimateRequest, Upload, UploadedImage};
use crate::api::v1::response::{ApiResponse, ErrorCode, ResponseMeta};
use crate::error::{OcrError, Result};
use crate::models::OcrResult;
use crate::service::ProviderEstimate;

/// Collects `image` parts and requirement fields from a multipart body.
async fn read_upload(mut multipart: Multipart) -> Result<Upload> {
    let mut upload = Upload::default();

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| OcrError::Validation(format!("Invalid multipart body: {e}")))?;
        let Some(field) = field else {
            break;
        };
        let name = field.name().unwrap_or("").to_string();

        if name == "image" {
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| OcrError::Validation(format!("Failed to read image: {e}")))?;
            upload.images.push(UploadedImage {
                bytes,
                file_name,
                content_type,
            });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| OcrError::Validation(format!("Invalid {name} value: {e}")))?;
            upload.options.set_field(&name, &value)?;
        }
    }

    if upload.images.is_empty() {
        return Err(OcrError::Validation(
            "Missing required 'image' field".to_string(),
        ));
    }
    Ok(upload)
}

/// `POST /api/v1/ocr`
///
/// One `image` part plus optional requirement fields. A request every
/// provider failed still answers 200; the result carries the `error`.
pub async fn process_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResponse<OcrResult> {
    let upload = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(e) => return e.into(),
    };
    if upload.images.len() != 1 {
        return ApiResponse::error(
            ErrorCode::InvalidRequest,
            "Exactly one 'image' field is allowed; use /ocr:batch for several",
        );
    }

    let Some(request) = upload.into_requests().pop() else {
        return ApiResponse::error(ErrorCode::InvalidRequest, "Missing required 'image' field");
    };
    debug!(size_bytes = request.size_bytes(), "OCR upload received");

    let cancel = state.shutdown.child_token();
    ApiResponse::success(state.service.process_image(&request, &cancel).await)
}

/// `POST /api/v1/ocr:batch`
///
/// Repeated `image` parts share the requirement fields. Results follow
/// upload order; `meta.failed` counts results with an error.
pub async fn process_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResponse<Vec<OcrResult>> {
    let upload = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(e) => return e.into(),
    };

    let requests = upload.into_requests();
    let cancel = state.shutdown.child_token();
    let results = state.service.process_batch(&requests, &cancel).await;

    let failed = results.iter().filter(|r| !r.is_success()).count() as u64;
    let meta = ResponseMeta {
        total: Some(results.len() as u64),
        failed: Some(failed),
    };
    ApiResponse::success_with_meta(results, meta)
}

/// `POST /api/v1/ocr:estimate`
///
/// Cost, latency and eligibility per provider for an image that is not sent.
pub async fn estimate(
    State(state): State<AppState>,
    Json(body): Json<EstimateRequest>,
) -> ApiResponse<Vec<ProviderEstimate>> {
    if body.size_bytes == 0 {
        return ApiResponse::error(ErrorCode::InvalidRequest, "sizeBytes must be positive");
    }
    let profile = body.profile();
    ApiResponse::success(state.service.estimates(body.size_bytes, &profile).await)
}
