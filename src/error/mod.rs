//! Error types and handlers for image copy operations

pub mod handlers;

use crate::copy::report::CopyReport;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Missing or invalid required input, detected before any network call
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Malformed image reference
    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },
    /// Registry or repository segment of a reference is empty
    #[error("Missing {component} in reference '{reference}'")]
    MissingComponent {
        reference: String,
        component: &'static str,
    },
    /// Registry rejected the request even after re-authenticating
    #[error("Authentication required: {0}")]
    AuthRequired(String),
    /// Explicit credential is malformed
    #[error("Credential resolution failed for {registry}: {reason}")]
    AuthResolution { registry: String, reason: String },
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Fetched content does not hash to the expected digest
    #[error("Digest mismatch for {context}: expected {expected}, got {actual}")]
    DigestMismatch {
        context: String,
        expected: String,
        actual: String,
    },
    /// Transferred byte count does not match the descriptor
    #[error("Size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },
    /// Platform selector matched nothing
    #[error("No platform matching '{platform}' in {reference} (available: {available})")]
    NoMatchingPlatform {
        platform: String,
        reference: String,
        available: String,
    },
    /// Manifest format this engine cannot copy
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
    /// No-clobber refused to replace an existing destination tag
    #[error("Refusing to clobber existing tag {reference} ({existing})")]
    ClobberRefused { reference: String, existing: String },
    /// One or more blob transfers failed
    #[error("Partial transfer: {}", .0.outcome_summary())]
    PartialTransfer(Box<CopyReport>),
    /// Operation was cancelled before every job was dispatched
    #[error("Cancelled: {}", .0.outcome_summary())]
    Cancelled(Box<CopyReport>),
    /// Network related errors
    #[error("Network error: {0}")]
    Network(String),
    /// Unexpected registry response
    #[error("Registry error (status {status}): {message}")]
    Registry { status: u16, message: String },
    /// File IO errors
    #[error("IO error: {0}")]
    Io(String),
    /// Parse errors
    #[error("Parse error: {0}")]
    Parse(String),
}

impl RegistryError {
    pub fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        RegistryError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    /// Transport failures worth restarting a whole blob job for.
    /// Integrity and auth errors never qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Network(_) => true,
            RegistryError::Registry { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        handlers::NetworkErrorHandler::handle_network_error(&err, "registry request")
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::Parse(format!("URL parse error: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for RegistryError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        RegistryError::Parse(format!("UTF-8 conversion error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RegistryError::Network("reset".into()).is_retryable());
        assert!(
            RegistryError::Registry {
                status: 503,
                message: "unavailable".into()
            }
            .is_retryable()
        );
        assert!(
            RegistryError::Registry {
                status: 429,
                message: "slow down".into()
            }
            .is_retryable()
        );
        assert!(
            !RegistryError::Registry {
                status: 400,
                message: "bad".into()
            }
            .is_retryable()
        );
        let mismatch = RegistryError::DigestMismatch {
            context: "blob".into(),
            expected: "sha256:aa".into(),
            actual: "sha256:bb".into(),
        };
        assert!(!mismatch.is_retryable());
        assert!(!RegistryError::AuthRequired("denied".into()).is_retryable());
    }
}
