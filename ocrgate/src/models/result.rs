use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Language reported when a provider does not detect or echo one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Axis-aligned region in pixel coordinates of the submitted image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Smallest box enclosing a polygon given as `(x, y)` points.
    pub fn from_points(points: &[(f64, f64)]) -> Self {
        if points.is_empty() {
            return Self::default();
        }
        let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
        let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
        for &(x, y) in points {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        Self::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    pub fn scaled(&self, width: f64, height: f64) -> Self {
        Self::new(
            self.x * width,
            self.y * height,
            self.width * width,
            self.height * height,
        )
    }
}

/// One recognized line or region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
    pub is_handwritten: bool,
    pub is_printed: bool,
    pub language: String,
    pub reading_order: usize,
}

impl TextBlock {
    /// Printed block in the default language; reading order is assigned when
    /// the block is placed into an [`OcrResult`].
    pub fn new(text: impl Into<String>, confidence: f64, bounding_box: BoundingBox) -> Self {
        Self {
            text: text.into(),
            confidence: clamp_confidence(confidence),
            bounding_box,
            is_handwritten: false,
            is_printed: true,
            language: DEFAULT_LANGUAGE.to_string(),
            reading_order: 0,
        }
    }

    pub fn handwritten(mut self, handwritten: bool) -> Self {
        self.is_handwritten = handwritten;
        self.is_printed = !handwritten;
        self
    }

    pub fn with_language(mut self, language: Option<&str>) -> Self {
        self.language = normalize_language(language);
        self
    }
}

pub(crate) fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub(crate) fn normalize_language(language: Option<&str>) -> String {
    match language.map(str::trim) {
        Some(lang) if !lang.is_empty() && lang != "und" => lang.to_string(),
        _ => DEFAULT_LANGUAGE.to_string(),
    }
}

/// Outcome of one OCR request, successful or not.
///
/// Fields are private so the invariants hold for every value in circulation:
/// confidence lies in `[0, 1]` and is `0` without blocks, reading order is
/// `0..n` in block order, and a failed result carries no text. Deserialized
/// values are rebuilt through the same constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOcrResult")]
pub struct OcrResult {
    text: String,
    text_blocks: Vec<TextBlock>,
    confidence: f64,
    language: String,
    #[serde(with = "duration_ms")]
    processing_time: Duration,
    cost: f64,
    provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    metadata: Metadata,
}

/// Wire shape of [`OcrResult`]; derived fields (`text`, `confidence`) are
/// ignored and recomputed from the blocks.
#[derive(Deserialize)]
struct RawOcrResult {
    #[serde(default)]
    text_blocks: Vec<TextBlock>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default, with = "duration_ms")]
    processing_time: Duration,
    #[serde(default)]
    cost: f64,
    provider: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    metadata: Metadata,
}

impl TryFrom<RawOcrResult> for OcrResult {
    type Error = String;

    fn try_from(raw: RawOcrResult) -> Result<Self, Self::Error> {
        let mut result = match raw.error {
            Some(_) if !raw.text_blocks.is_empty() => {
                return Err("failed OCR result cannot carry text blocks".to_string())
            }
            Some(error) => OcrResult::failed(raw.provider, error, raw.processing_time),
            None => OcrResult::from_blocks(
                raw.provider,
                raw.text_blocks,
                raw.language.as_deref(),
                raw.processing_time,
                raw.cost,
            ),
        };
        result.metadata = raw.metadata;
        Ok(result)
    }
}

impl OcrResult {
    /// Successful result built from blocks in the order the provider emitted them.
    pub fn from_blocks(
        provider: impl Into<String>,
        blocks: Vec<TextBlock>,
        language: Option<&str>,
        processing_time: Duration,
        cost: f64,
    ) -> Self {
        let mut blocks = blocks;
        for (index, block) in blocks.iter_mut().enumerate() {
            block.reading_order = index;
            block.confidence = clamp_confidence(block.confidence);
        }

        let confidence = if blocks.is_empty() {
            0.0
        } else {
            let sum: f64 = blocks.iter().map(|b| b.confidence).sum();
            clamp_confidence(sum / blocks.len() as f64)
        };

        let text = blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            text,
            text_blocks: blocks,
            confidence,
            language: normalize_language(language),
            processing_time,
            cost: cost.max(0.0),
            provider: provider.into(),
            error: None,
            metadata: Metadata::new(),
        }
    }

    /// Failed result: no text, zero confidence, error populated.
    pub fn failed(
        provider: impl Into<String>,
        error: impl Into<String>,
        processing_time: Duration,
    ) -> Self {
        let error = error.into();
        Self {
            text: String::new(),
            text_blocks: Vec::new(),
            confidence: 0.0,
            language: DEFAULT_LANGUAGE.to_string(),
            processing_time,
            cost: 0.0,
            provider: provider.into(),
            error: Some(if error.trim().is_empty() {
                "unknown error".to_string()
            } else {
                error
            }),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_processing_time(mut self, processing_time: Duration) -> Self {
        self.processing_time = processing_time;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn text_blocks(&self) -> &[TextBlock] {
        &self.text_blocks
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn contains_handwriting(&self) -> bool {
        self.text_blocks.iter().any(|b| b.is_handwritten)
    }

    pub fn contains_printed_text(&self) -> bool {
        self.text_blocks.iter().any(|b| b.is_printed)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
