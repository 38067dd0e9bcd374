//! Shared state for the management API.

use std::sync::Arc;
use std::time::Instant;

use veil_core::{DomainRegistry, Metrics};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DomainRegistry>,
    pub metrics: Arc<Metrics>,
    pub started: Instant,

    pub proxy_port: u16,
    pub sidecar_endpoint: String,
    pub sidecar_model: String,
    pub ai_detection_enabled: bool,

    /// Bearer token; empty disables authentication.
    pub token: String,
}

impl AppState {
    /// Minimal state for tests: in-memory registry, fresh metrics, no auth.
    pub fn for_tests(domains: &[String]) -> Self {
        Self {
            registry: Arc::new(DomainRegistry::in_memory(domains)),
            metrics: Arc::new(Metrics::new()),
            started: Instant::now(),
            proxy_port: 8080,
            sidecar_endpoint: "http://localhost:11434".to_string(),
            sidecar_model: "qwen2.5:3b".to_string(),
            ai_detection_enabled: true,
            token: String::new(),
        }
    }
}
