//! Error types for ID parsing.

use thiserror::Error;

/// Errors produced while parsing a typed id from text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    #[error("ID missing underscore separator")]
    MissingSeparator,

    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if the text carried the wrong resource prefix.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
