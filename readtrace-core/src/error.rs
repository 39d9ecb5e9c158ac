//! Error types for readtrace-core
//!
//! Tracker operations never return these: telemetry failures are absorbed
//! into [`crate::transport::Delivery`]. Errors surface only from setup paths
//! (config loading, logging, transport construction, replay scripts).

use thiserror::Error;

/// Main error type for the readtrace-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote store rejected or failed a request
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid replay script
    #[error("script error: {0}")]
    Script(String),
}

/// Result type alias for readtrace-core
pub type Result<T> = std::result::Result<T, Error>;
