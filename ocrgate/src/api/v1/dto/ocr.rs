use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{OcrError, Result};
use crate::models::{OcrRequest, ProviderHealth};

/// Requirement flags shared by every image of an upload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OcrOptions {
    pub language: Option<String>,
    pub requires_language_detection: bool,
    pub requires_handwriting: bool,
    pub requires_table_detection: bool,
    pub requires_form_detection: bool,
    pub max_size_bytes: Option<u64>,
}

impl OcrOptions {
    pub fn apply(&self, request: OcrRequest) -> OcrRequest {
        let mut request = request
            .requiring_language_detection(self.requires_language_detection)
            .requiring_handwriting(self.requires_handwriting)
            .requiring_table_detection(self.requires_table_detection)
            .requiring_form_detection(self.requires_form_detection);
        if let Some(language) = &self.language {
            request = request.with_language(language.clone());
        }
        if let Some(max) = self.max_size_bytes {
            request = request.with_max_size_bytes(max);
        }
        request
    }

    /// Sets one multipart text field; unknown names are ignored.
    pub fn set_field(&mut self, name: &str, value: &str) -> Result<()> {
        let flag = |value: &str| {
            parse_form_bool(value)
                .ok_or_else(|| OcrError::Validation(format!("{name} must be one of true/false/1/0/yes/no")))
        };
        match name {
            "language" => self.language = Some(value.trim().to_string()).filter(|l| !l.is_empty()),
            "requiresLanguageDetection" => self.requires_language_detection = flag(value)?,
            "requiresHandwriting" => self.requires_handwriting = flag(value)?,
            "requiresTableDetection" => self.requires_table_detection = flag(value)?,
            "requiresFormDetection" => self.requires_form_detection = flag(value)?,
            "maxSizeBytes" => {
                let max = value.trim().parse::<u64>().map_err(|e| {
                    OcrError::Validation(format!("maxSizeBytes must be a positive integer: {e}"))
                })?;
                self.max_size_bytes = Some(max);
            }
            _ => {}
        }
        Ok(())
    }
}

pub(crate) fn parse_form_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// One `image` part of a multipart upload.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Bytes,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub images: Vec<UploadedImage>,
    pub options: OcrOptions,
}

impl Upload {
    /// One request per image, in upload order.
    pub fn into_requests(self) -> Vec<OcrRequest> {
        let options = self.options;
        self.images
            .into_iter()
            .map(|image| {
                let mut request = OcrRequest::new(image.bytes);
                if let Some(name) = image.file_name {
                    request = request.with_file_name(name);
                }
                // Browsers send octet-stream for unknown types; let sniffing decide.
                if let Some(mime) = image
                    .content_type
                    .filter(|m| m.starts_with("image/") || m == "application/pdf")
                {
                    request = request.with_mime_type(mime);
                }
                options.apply(request)
            })
            .collect()
    }
}

/// Body of `POST /api/v1/ocr:estimate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateRequest {
    pub size_bytes: u64,
    #[serde(flatten)]
    pub options: OcrOptions,
}

impl EstimateRequest {
    /// Flags-only request used for capability checks and cost estimates.
    pub fn profile(&self) -> OcrRequest {
        self.options.apply(OcrRequest::new(Bytes::new()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthData {
    pub status: String,
    pub version: String,
    pub providers: Vec<ProviderHealthEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthEntry {
    pub name: String,
    pub health: ProviderHealth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_form_bool_accepts_supported_values() {
        for value in ["true", "1", "yes", "on", " TRUE "] {
            assert_eq!(parse_form_bool(value), Some(true), "{value}");
        }
        for value in ["false", "0", "no", "off"] {
            assert_eq!(parse_form_bool(value), Some(false), "{value}");
        }
        assert_eq!(parse_form_bool("maybe"), None);
        assert_eq!(parse_form_bool(""), None);
    }

    #[test]
    fn set_field_parses_flags() {
        let mut options = OcrOptions::default();
        options.set_field("requiresHandwriting", "yes").unwrap();
        options.set_field("language", " de ").unwrap();
        options.set_field("maxSizeBytes", "1024").unwrap();
        options.set_field("somethingElse", "ignored").unwrap();

        assert!(options.requires_handwriting);
        assert_eq!(options.language.as_deref(), Some("de"));
        assert_eq!(options.max_size_bytes, Some(1024));
        assert!(options.set_field("requiresTableDetection", "maybe").is_err());
        assert!(options.set_field("maxSizeBytes", "-1").is_err());
    }

    #[test]
    fn upload_keeps_image_order_and_flags() {
        let upload = Upload {
            images: vec![
                UploadedImage {
                    bytes: Bytes::from_static(b"first"),
                    file_name: Some("a.png".into()),
                    content_type: Some("image/png".into()),
                },
                UploadedImage {
                    bytes: Bytes::from_static(b"second"),
                    file_name: None,
                    content_type: Some("application/octet-stream".into()),
                },
            ],
            options: OcrOptions {
                requires_form_detection: true,
                ..OcrOptions::default()
            },
        };

        let requests = upload.into_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].image().as_ref(), b"first");
        assert_eq!(requests[0].file_name(), Some("a.png"));
        assert_eq!(requests[0].mime_type(), "image/png");
        assert!(requests[1].requires_form_detection());
    }

    #[test]
    fn estimate_request_deserializes_camel_case() {
        let request: EstimateRequest = serde_json::from_str(
            r#"{"sizeBytes": 2048, "language": "fr", "requiresTableDetection": true}"#,
        )
        .unwrap();
        assert_eq!(request.size_bytes, 2048);
        let profile = request.profile();
        assert!(profile.requires_table_detection());
        assert_eq!(profile.language(), Some("fr"));
        assert_eq!(profile.size_bytes(), 0);
    }
}
