//! Veil core - PII detection, reversible tokenization, and the value cache.
//!
//! This crate holds everything about the mediation pipeline that is not
//! wire-facing:
//!
//! - the two-stage detector ([`Anonymizer`]): ordered regex patterns with
//!   per-pattern confidence, a persistent per-value cache for low-confidence
//!   matches, and asynchronous sidecar warm-up;
//! - per-request session maps ([`SessionMap`]) that make tokenization
//!   reversible;
//! - the S3-FIFO value cache ([`S3FifoCache`]) over a durable store;
//! - the runtime-mutable AI-domain registry, metrics, and configuration.
//!
//! The proxy crate drives these from the request path; the management crate
//! exposes the registry and metrics over HTTP.

pub mod anonymizer;
pub mod cache;
pub mod config;
pub mod domains;
pub mod error;
pub mod metrics;
pub mod pii;
pub mod session;
pub mod sidecar;

pub use anonymizer::{Anonymizer, AnonymizerConfig};
pub use cache::{CacheStore, MemoryStore, S3FifoCache, SqliteStore, DEFAULT_CACHE_CAPACITY};
pub use config::Config;
pub use domains::DomainRegistry;
pub use error::{CoreError, Result};
pub use metrics::Metrics;
pub use pii::PiiKind;
pub use session::{SessionMap, TokenReplacer};
pub use sidecar::SidecarClient;
