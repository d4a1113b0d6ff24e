//! v1 API Data Transfer Objects.
//!
//! Wire types for the REST surface, kept apart from the domain models in
//! `src/models/`. OCR results and provider descriptors serialize as-is.

pub mod ocr;

pub use ocr::*;
