//! Multi-provider OCR dispatch.
//!
//! An [`OcrService`] owns a [`ProviderRegistry`] of heterogeneous OCR
//! backends, a [`HealthMonitor`] caching their probe results, and a
//! [`Dispatcher`] that picks the best eligible provider for each image,
//! retries transient failures and falls back down the ranked list.
//!
//! The same service backs the HTTP API in [`api`] and the `ocrgate` CLI.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod models;
pub mod providers;
pub mod registry;
pub mod selection;
pub mod service;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{OcrError, ProviderErrorKind, Result};
pub use health::HealthMonitor;
pub use models::{
    BoundingBox, HealthStatus, OcrRequest, OcrResult, ProviderCapabilities, ProviderHealth,
    TextBlock,
};
pub use providers::OcrProvider;
pub use registry::ProviderRegistry;
pub use selection::{Candidate, SelectionPolicy};
pub use service::OcrService;
