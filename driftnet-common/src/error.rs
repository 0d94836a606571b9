//! Common error types for driftnet

use thiserror::Error;

/// Common result type for driftnet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error vocabulary shared across driftnet services
#[derive(Error, Debug)]
pub enum Error {
    /// Relational store failure (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem or pipe failure (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation failure
    #[error("Configuration error: {0}")]
    Config(String),

    /// An external extractor tool failed or was killed
    #[error("Extractor process error: {0}")]
    Process(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
