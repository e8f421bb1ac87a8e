//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `emberfly-rs`.
pub type EflyResult<T> = Result<T, EflyError>;

/// High-level error categories for infrastructure failures.
///
/// Client-visible protocol errors never travel through this type: the dispatcher delivers them
/// on the connection reply sink and returns normally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EflyError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client protocol payload is malformed or semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Filesystem or socket I/O failed.
    #[error("io error: {0}")]
    Io(String),
}
