use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes reported by a vendor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Network,
    Timeout,
    Auth,
    Quota,
    MalformedImage,
    InvalidResponse,
    Server,
}

impl ProviderErrorKind {
    /// Transient kinds that are worth another attempt against the same provider.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::Network
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Quota
                | ProviderErrorKind::Server
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::Quota => "quota",
            ProviderErrorKind::MalformedImage => "malformed_image",
            ProviderErrorKind::InvalidResponse => "invalid_response",
            ProviderErrorKind::Server => "server",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Provider {provider} failed ({kind}): {message}")]
    Provider {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("All OCR providers failed: {0}")]
    Exhausted(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcrError {
    pub fn provider(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        OcrError::Provider {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether the dispatcher may retry the same provider after this error.
    ///
    /// Validation and configuration failures are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            OcrError::Provider { kind, .. } => kind.is_transient(),
            OcrError::Timeout(_) => true,
            OcrError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Short machine-readable label used in result metadata.
    pub fn kind_label(&self) -> &'static str {
        match self {
            OcrError::Configuration(_) => "configuration",
            OcrError::Validation(_) => "validation",
            OcrError::NotFound(_) => "not_found",
            OcrError::Provider { kind, .. } => kind.as_str(),
            OcrError::Exhausted(_) => "exhausted",
            OcrError::Cancelled => "cancelled",
            OcrError::Timeout(_) => "timeout",
            OcrError::Http(_) => "http",
            OcrError::Json(_) => "json",
            OcrError::Io(_) => "io",
            OcrError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, OcrError>;
