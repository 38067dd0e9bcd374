//! Error types for the core detection pipeline.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A built-in detection pattern failed to compile. Fatal at startup.
    #[error("pattern compilation failed: {0}")]
    Pattern(#[from] regex::Error),

    /// Cache backing-store error.
    #[error("cache store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Sidecar transport error.
    #[error("sidecar request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Sidecar returned something that is not a detection array.
    #[error("sidecar response malformed: {0}")]
    Sidecar(String),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
