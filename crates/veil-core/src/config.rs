//! Layered proxy configuration.
//!
//! Settings are resolved in three layers: built-in defaults, then an optional
//! JSON config file, then environment variables (env wins). The config file
//! may be partial; any field it omits keeps its default.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "veil-config.json";

/// Full proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub proxy_port: u16,
    pub management_port: u16,
    pub bind_address: String,

    pub sidecar_endpoint: String,
    pub sidecar_model: String,
    pub use_ai_detection: bool,
    pub ai_confidence_threshold: f64,
    pub sidecar_max_concurrent: usize,

    pub log_level: String,

    pub ca_cert_file: String,
    pub ca_key_file: String,
    pub management_token: String,
    /// Path to the persistent value cache; empty = in-memory only.
    pub cache_file: String,

    pub ai_api_domains: Vec<String>,
    pub auth_domains: Vec<String>,
    pub auth_paths: Vec<String>,

    /// Model-family prefix → system instruction injected when PII tokens are
    /// present. Lookup is prefix-based: `claude-sonnet-4` matches key
    /// `claude`. The special key `default` is used when no prefix matches.
    pub pii_instructions: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_port: 8080,
            management_port: 8081,
            bind_address: "127.0.0.1".to_string(),
            sidecar_endpoint: "http://localhost:11434".to_string(),
            sidecar_model: "qwen2.5:3b".to_string(),
            use_ai_detection: true,
            ai_confidence_threshold: 0.7,
            sidecar_max_concurrent: 1,
            log_level: "info".to_string(),
            ca_cert_file: "ca-cert.pem".to_string(),
            ca_key_file: "ca-key.pem".to_string(),
            management_token: String::new(),
            cache_file: "value-cache.db".to_string(),
            ai_api_domains: vec![
                "api.anthropic.com".to_string(),
                "api.openai.com".to_string(),
                "api.cohere.ai".to_string(),
                "generativelanguage.googleapis.com".to_string(),
                "api.mistral.ai".to_string(),
                "api.together.xyz".to_string(),
                "api.perplexity.ai".to_string(),
                "api.replicate.com".to_string(),
                "api.huggingface.co".to_string(),
            ],
            auth_domains: vec![
                "accounts.google.com".to_string(),
                "login.microsoftonline.com".to_string(),
                "auth0.com".to_string(),
                "okta.com".to_string(),
            ],
            auth_paths: vec![
                "/auth", "/login", "/signin", "/signup", "/register", "/token", "/oauth",
                "/authenticate", "/session", "/v1/auth", "/api/auth", "/api/login", "/api/token",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            pii_instructions: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration: defaults, overridden by [`CONFIG_FILE`] if it
    /// exists, overridden by environment variables.
    pub fn load() -> Self {
        Self::load_from(CONFIG_FILE)
    }

    /// Same as [`Config::load`] but with an explicit file path, for tests.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let mut cfg = match std::fs::read(path.as_ref()) {
            Ok(data) => match serde_json::from_slice::<Config>(&data) {
                Ok(cfg) => {
                    tracing::info!("loaded {}", path.as_ref().display());
                    cfg
                }
                Err(e) => {
                    tracing::warn!("could not parse {}: {}", path.as_ref().display(), e);
                    Config::default()
                }
            },
            // The file is optional.
            Err(_) => Config::default(),
        };
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = var("PROXY_PORT").and_then(|v| v.parse().ok()) {
            self.proxy_port = v;
        }
        if let Some(v) = var("MANAGEMENT_PORT").and_then(|v| v.parse().ok()) {
            self.management_port = v;
        }
        if let Some(v) = var("BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = var("SIDECAR_ENDPOINT") {
            self.sidecar_endpoint = v;
        }
        if let Some(v) = var("SIDECAR_MODEL") {
            self.sidecar_model = v;
        }
        if var("USE_AI_DETECTION").as_deref() == Some("false") {
            self.use_ai_detection = false;
        }
        if let Some(v) = var("AI_CONFIDENCE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.ai_confidence_threshold = v;
        }
        if let Some(v) = var("SIDECAR_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            if v > 0 {
                self.sidecar_max_concurrent = v;
            }
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("CA_CERT_FILE") {
            self.ca_cert_file = v;
        }
        if let Some(v) = var("CA_KEY_FILE") {
            self.ca_key_file = v;
        }
        if let Some(v) = var("MANAGEMENT_TOKEN") {
            self.management_token = v;
        }
        if let Some(v) = var("CACHE_FILE") {
            self.cache_file = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.proxy_port, 8080);
        assert_eq!(cfg.management_port, 8081);
        assert_eq!(cfg.bind_address, "127.0.0.1");
        assert!(cfg.use_ai_detection);
        assert!((cfg.ai_confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert!(cfg.ai_api_domains.contains(&"api.anthropic.com".to_string()));
        assert!(cfg.auth_paths.contains(&"/oauth".to_string()));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = Config::load_from("/nonexistent/veil-config.json");
        assert_eq!(cfg.proxy_port, 8080);
    }

    #[test]
    fn partial_file_overlays_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"proxyPort": 3128, "sidecarModel": "llama3"}}"#).unwrap();

        let cfg = Config::load_from(file.path());
        assert_eq!(cfg.proxy_port, 3128);
        assert_eq!(cfg.sidecar_model, "llama3");
        // Untouched fields keep their defaults.
        assert_eq!(cfg.management_port, 8081);
        assert!(!cfg.ai_api_domains.is_empty());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let cfg = Config::load_from(file.path());
        assert_eq!(cfg.proxy_port, 8080);
    }
}
