use bytes::Bytes;

use crate::error::{OcrError, Result};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// A single OCR call: the image plus the features the caller needs.
///
/// Built once per call with [`OcrRequest::new`] and the consuming `with_*`
/// setters; the image buffer is reference counted so retries and fallbacks
/// never copy it.
#[derive(Debug, Clone)]
pub struct OcrRequest {
    image: Bytes,
    language: Option<String>,
    mime_type: Option<String>,
    file_name: Option<String>,
    requires_language_detection: bool,
    requires_handwriting: bool,
    requires_table_detection: bool,
    requires_form_detection: bool,
    max_size_bytes: Option<u64>,
}

impl OcrRequest {
    pub fn new(image: impl Into<Bytes>) -> Self {
        Self {
            image: image.into(),
            language: None,
            mime_type: None,
            file_name: None,
            requires_language_detection: false,
            requires_handwriting: false,
            requires_table_detection: false,
            requires_form_detection: false,
            max_size_bytes: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        let language = language.into();
        self.language = if language.trim().is_empty() {
            None
        } else {
            Some(language.trim().to_string())
        };
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn requiring_language_detection(mut self, required: bool) -> Self {
        self.requires_language_detection = required;
        self
    }

    pub fn requiring_handwriting(mut self, required: bool) -> Self {
        self.requires_handwriting = required;
        self
    }

    pub fn requiring_table_detection(mut self, required: bool) -> Self {
        self.requires_table_detection = required;
        self
    }

    pub fn requiring_form_detection(mut self, required: bool) -> Self {
        self.requires_form_detection = required;
        self
    }

    pub fn with_max_size_bytes(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = Some(max_size_bytes);
        self
    }

    pub fn image(&self) -> &Bytes {
        &self.image
    }

    pub fn size_bytes(&self) -> u64 {
        self.image.len() as u64
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn requires_language_detection(&self) -> bool {
        self.requires_language_detection
    }

    pub fn requires_handwriting(&self) -> bool {
        self.requires_handwriting
    }

    pub fn requires_table_detection(&self) -> bool {
        self.requires_table_detection
    }

    pub fn requires_form_detection(&self) -> bool {
        self.requires_form_detection
    }

    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_bytes
    }

    /// Explicit MIME type if one was given, otherwise sniffed from the magic bytes.
    pub fn mime_type(&self) -> String {
        if let Some(mime) = &self.mime_type {
            return mime.clone();
        }
        infer::get(&self.image)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
    }

    /// File extension matching [`Self::mime_type`], used for multipart uploads.
    pub fn extension(&self) -> &'static str {
        match self.mime_type().as_str() {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/bmp" => "bmp",
            "image/tiff" => "tiff",
            "image/webp" => "webp",
            "application/pdf" => "pdf",
            _ => "bin",
        }
    }

    /// Rejects requests that can never succeed on any provider.
    pub fn validate(&self) -> Result<()> {
        if self.image.is_empty() {
            return Err(OcrError::Validation("Image payload is empty".to_string()));
        }

        if let Some(max) = self.max_size_bytes {
            if self.size_bytes() > max {
                return Err(OcrError::Validation(format!(
                    "Image too large: {} bytes (max {} bytes)",
                    self.size_bytes(),
                    max
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    #[test]
    fn test_builder_sets_flags() {
        let req = OcrRequest::new(vec![1, 2, 3])
            .with_language("de")
            .requiring_handwriting(true)
            .requiring_table_detection(true);

        assert_eq!(req.language(), Some("de"));
        assert!(req.requires_handwriting());
        assert!(req.requires_table_detection());
        assert!(!req.requires_form_detection());
        assert!(!req.requires_language_detection());
        assert_eq!(req.size_bytes(), 3);
    }

    #[test]
    fn test_blank_language_is_ignored() {
        let req = OcrRequest::new(vec![1]).with_language("  ");
        assert!(req.language().is_none());
    }

    #[test]
    fn test_mime_type_is_sniffed() {
        let req = OcrRequest::new(PNG_MAGIC.to_vec());
        assert_eq!(req.mime_type(), "image/png");
        assert_eq!(req.extension(), "png");
    }

    #[test]
    fn test_explicit_mime_type_wins() {
        let req = OcrRequest::new(PNG_MAGIC.to_vec()).with_mime_type("image/jpeg");
        assert_eq!(req.mime_type(), "image/jpeg");
        assert_eq!(req.extension(), "jpg");
    }

    #[test]
    fn test_unknown_bytes_fall_back_to_octet_stream() {
        let req = OcrRequest::new(vec![0u8; 4]);
        assert_eq!(req.mime_type(), "application/octet-stream");
    }

    #[test]
    fn test_validate_rejects_empty_image() {
        let result = OcrRequest::new(Vec::<u8>::new()).validate();
        assert!(matches!(result, Err(OcrError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_image() {
        let result = OcrRequest::new(vec![0u8; 100])
            .with_max_size_bytes(10)
            .validate();
        match result {
            Err(OcrError::Validation(msg)) => assert!(msg.contains("too large")),
            other => panic!("Expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_clone_shares_buffer() {
        let req = OcrRequest::new(vec![7u8; 1024]);
        let cloned = req.clone();
        assert_eq!(req.image().as_ptr(), cloned.image().as_ptr());
    }
}
