//! Error types for the proxy data plane.

use thiserror::Error;

/// Proxy error type.
///
/// Errors are handled at the lowest layer that can meaningfully degrade; the
/// request path surfaces only sanitized status lines to the client, never
/// upstream error strings.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA material error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP protocol error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The destination resolves to a private, loopback, or link-local
    /// address.
    #[error("connection to {host} refused: destination is a private address")]
    BlockedPrivateAddress { host: String },

    /// Upstream dial or forwarding failure.
    #[error("upstream connection to {host} failed: {reason}")]
    Upstream { host: String, reason: String },

    /// Malformed client request.
    #[error("bad request: {0}")]
    BadRequest(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate CA or leaf material.
    #[error("failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to read CA files.
    #[error("failed to read CA files: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA material.
    #[error("failed to parse CA material: {0}")]
    Parse(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
