//! Error types for the Slidegate service.

use thiserror::Error;

/// Main error type for Slidegate operations.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A key deriver could not produce a key for the request
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// The counter store failed to read or increment a count
    #[error("Counter store error: {0}")]
    CounterStore(String),

    /// The upstream URL could not be parsed
    #[error("Invalid upstream URL: {0}")]
    UpstreamParse(String),

    /// HTTP server errors
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;
