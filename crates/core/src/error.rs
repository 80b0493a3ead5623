//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only: malformed settings, bad identifiers, unknown
/// option names. Storage and transport failures belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A setting that must be present was empty or absent.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A backup option name that the archive engine does not know.
    #[error("unknown backup option: {0}")]
    UnknownOption(String),

    /// An identifier was invalid (parse failure, non-positive id).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
