//! Error types for image reference parsing.

use thiserror::Error;

/// Errors that can occur when parsing an image reference.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// The reference string is empty.
    #[error("image reference cannot be empty")]
    Empty,

    /// The fully qualified name exceeds the grammar's length limit.
    #[error("image name too long: {length} characters exceeds limit of {limit}")]
    NameTooLong { length: usize, limit: usize },

    /// The registry component is not a valid `host[:port]`.
    #[error("invalid registry '{0}'")]
    InvalidRegistry(String),

    /// The repository path has an invalid component.
    #[error(
        "invalid repository '{0}': components must be lowercase alphanumerics \
         joined by '.', '_', '__' or '-'"
    )]
    InvalidRepository(String),

    /// The tag does not match `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
    #[error("invalid tag '{0}'")]
    InvalidTag(String),

    /// The digest is not a valid `algorithm:hex` pair.
    #[error("invalid digest '{digest}': {reason}")]
    InvalidDigest { digest: String, reason: &'static str },
}

