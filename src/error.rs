//! Core error taxonomy.
//!
//! A single typed error enum carries every failure mode the rest of the
//! crate can produce. The outer layer (HTTP, CLI, MCP — out of scope here)
//! maps each variant to whatever transport-level representation it needs;
//! the core itself never encodes a status code or wire format.

use thiserror::Error;

/// Field-level detail attached to a [`ArchivistError::Validation`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchivistError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<FieldError>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large: {0} bytes exceeds limit of {1} bytes")]
    PayloadTooLarge(u64, u64),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt document: {0}")]
    CorruptDocument(String),

    #[error("document produced zero chunks")]
    EmptyDocument,

    #[error("insufficient samples: {0}")]
    InsufficientSamples(String),

    #[error("embedding provider unavailable after {retries} retries: {source}")]
    EmbeddingUnavailable {
        retries: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("LLM unavailable after {retries} retries: {source}")]
    LlmUnavailable {
        retries: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("LLM rejected the request: {0}")]
    LlmRejected(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(#[source] anyhow::Error),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ArchivistError>;

impl From<sqlx::Error> for ArchivistError {
    fn from(e: sqlx::Error) -> Self {
        ArchivistError::StoreUnavailable(e.into())
    }
}

impl ArchivistError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ArchivistError::Validation(vec![FieldError::new(field, message)])
    }
}
