//! Error types for the throttler crate.

use thiserror::Error;

/// Main error type for throttler operations.
///
/// Admission and adjustment never fail; only loading a configuration can.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for throttler operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
