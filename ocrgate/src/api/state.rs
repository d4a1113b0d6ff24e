use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::service::OcrService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<OcrService>,
    /// Cancelled on shutdown; in-flight OCR requests derive child tokens from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, service: OcrService, shutdown: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            service: Arc::new(service),
            shutdown,
        }
    }

    pub fn from_config(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let service = OcrService::from_config(&config)?;
        Ok(Self::new(config, service, shutdown))
    }
}
