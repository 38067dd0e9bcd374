//! Management API request handlers.

use std::sync::OnceLock;

use axum::extract::State;
use axum::Json;
use regex::Regex;
use serde::{Deserialize, Serialize};

use veil_core::metrics::Snapshot;

use crate::error::{ApiError, Result};
use crate::state::AppState;

/// Hostname validation per RFC 952 / RFC 1123.
fn domain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
        )
        .expect("built-in hostname regex")
    })
}

fn valid_domain(domain: &str) -> bool {
    domain.len() <= 253 && domain_regex().is_match(domain)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub proxy_port: u16,
    pub ai_api_domains: Vec<String>,
    pub sidecar: SidecarStatus,
}

#[derive(Debug, Serialize)]
pub struct SidecarStatus {
    pub endpoint: String,
    pub model: String,
    pub enabled: bool,
}

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running",
        uptime_secs: state.started.elapsed().as_secs(),
        proxy_port: state.proxy_port,
        ai_api_domains: state.registry.all(),
        sidecar: SidecarStatus {
            endpoint: state.sidecar_endpoint.clone(),
            model: state.sidecar_model.clone(),
            enabled: state.ai_detection_enabled,
        },
    })
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct DomainRequest {
    #[serde(default)]
    pub domain: String,
}

#[derive(Debug, Serialize)]
pub struct DomainChanged {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed: Option<String>,
}

fn validated(req: &DomainRequest) -> Result<String> {
    let domain = req.domain.trim().to_lowercase();
    if domain.is_empty() {
        return Err(ApiError::BadRequest(
            "invalid request: need {\"domain\":\"...\"}".to_string(),
        ));
    }
    if !valid_domain(&domain) {
        return Err(ApiError::BadRequest("invalid domain name".to_string()));
    }
    Ok(domain)
}

/// `POST /domains/add`
pub async fn add_domain(
    State(state): State<AppState>,
    Json(req): Json<DomainRequest>,
) -> Result<Json<DomainChanged>> {
    let domain = validated(&req)?;
    state.registry.add(&domain);
    tracing::info!("added AI domain: {}", domain);
    Ok(Json(DomainChanged {
        added: Some(domain),
        removed: None,
    }))
}

/// `POST /domains/remove`
pub async fn remove_domain(
    State(state): State<AppState>,
    Json(req): Json<DomainRequest>,
) -> Result<Json<DomainChanged>> {
    let domain = validated(&req)?;
    state.registry.remove(&domain);
    tracing::info!("removed AI domain: {}", domain);
    Ok(Json(DomainChanged {
        added: None,
        removed: Some(domain),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_validation() {
        assert!(valid_domain("api.example.com"));
        assert!(valid_domain("example.com"));
        assert!(valid_domain("a.b-c.d"));
        assert!(!valid_domain(""));
        assert!(!valid_domain("-bad.example.com"));
        assert!(!valid_domain("bad-.example.com"));
        assert!(!valid_domain("exa mple.com"));
        assert!(!valid_domain(&"a".repeat(254)));
    }
}
