//! Error taxonomy shared by every HealthFlow component.
//!
//! Each variant maps to one caller-visible failure class. The HTTP layer
//! translates variants into status codes; the ingestion pipeline uses
//! [`CoreError::is_transient`] to decide whether a failed embedding call is
//! worth retrying.

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Invalid or expired credentials. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Bad input shape, size or type.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The entity is absent or belongs to another owner.
    ///
    /// Both cases produce the same message so existence is not leaked.
    #[error("{0} not found")]
    NotFound(String),

    /// A storage, OCR or embedding provider failed.
    #[error("external service error: {message}")]
    ExternalService { message: String, transient: bool },

    /// Input rejected by a provider limit (e.g. text longer than the
    /// embedding model's token window). The caller must re-chunk.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("dimension mismatch: model declares {expected} dims, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Text extraction failed (corrupt file, unsupported encoding).
    #[error("text extraction failed: {0}")]
    Extraction(String),

    /// The unit of work was abandoned because its document was deleted.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        CoreError::ExternalService {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        CoreError::ExternalService {
            message: message.into(),
            transient: false,
        }
    }

    /// True for provider failures that a backoff retry may fix
    /// (rate limiting, timeouts, 5xx, connection errors).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::ExternalService {
                transient: true,
                ..
            }
        )
    }

    /// Machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Auth(_) => "unauthorized",
            CoreError::Validation(_) => "bad_request",
            CoreError::NotFound(_) => "not_found",
            CoreError::ExternalService { .. } => "external_service",
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::DimensionMismatch { .. } => "dimension_mismatch",
            CoreError::Extraction(_) => "extraction_failed",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::Storage(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CoreError::transient("429").is_transient());
        assert!(!CoreError::permanent("400").is_transient());
        assert!(!CoreError::Validation("x".into()).is_transient());
    }

    #[test]
    fn not_found_message_is_uniform() {
        let err = CoreError::not_found("document");
        assert_eq!(err.to_string(), "document not found");
        assert_eq!(err.code(), "not_found");
    }
}
