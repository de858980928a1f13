//! Common error types for pinshelf

use thiserror::Error;

/// Common result type for pinshelf operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the pinshelf services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input: bad slug format, out-of-range number, empty name
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Referenced tag, kind or image doesn't exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Domain invariant violated: system-tag ownership, non-empty kind
    /// deletion, missing system tag definition
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Operation attempted on a session that is not open, or a write
    /// operation attempted on a read session
    #[error("Session state error: {0}")]
    SessionState(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
