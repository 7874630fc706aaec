//! Structured error types for the engine.
//!
//! Internal functions return `Result<T, EngineError>` so callers can match on the
//! kind of failure. Boundary code (HTTP handlers, the CLI entry point) wraps these
//! in `anyhow::Result` with `.context(...)` instead of inventing new error types.

use thiserror::Error;

/// The closed set of failure kinds the engine produces.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("extraction batch failed for setter '{setter_name}': {reason}")]
    ExtractionBatch { setter_name: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("inference service unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("fatal error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn extraction_batch(setter_name: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ExtractionBatch {
            setter_name: setter_name.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status code this error kind maps to, per the external interface contract.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::NotFound(_) => 404,
            EngineError::ExtractionBatch { .. } => 502,
            EngineError::Store(_) => 500,
            EngineError::InferenceUnavailable(_) => 503,
            EngineError::Fatal(_) => 500,
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
