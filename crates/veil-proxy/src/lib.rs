//! Veil proxy - the wire-facing data plane.
//!
//! A local forward proxy that strips PII out of request bodies bound for
//! LLM APIs and restores the original values in the responses, end to end:
//!
//! ```text
//! client ──► dispatcher ──► CONNECT to AI host? ──► TLS intercept ─┐
//!                │                                                 │
//!                ├─► CONNECT elsewhere ──► opaque tunnel           │
//!                │                                                 ▼
//!                └─► direct HTTP ─────────────► anonymize ──► SafeDial ──► upstream
//!                                                                  │
//!                    client ◄── stream deanon / bulk restore ◄─────┘
//! ```
//!
//! Every outbound dial is SafeDial-verified; intercepted sessions present
//! leaf certificates minted by the local CA.

pub mod ca;
pub mod error;
pub mod forward;
pub mod handler;
pub mod mitm;
pub mod proxy;
pub mod safedial;
pub mod stream;
pub mod tunnel;

pub use ca::CertAuthority;
pub use error::{CaError, ProxyError, Result};
pub use forward::Upstream;
pub use handler::{ProxyBody, ProxyContext, MAX_BODY_SIZE};
pub use proxy::{ProxyHandle, ProxyServer};
pub use stream::SseRewriter;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
