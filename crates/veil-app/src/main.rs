//! Veil - a local anonymizing proxy for LLM API traffic.
//!
//! Runs two servers: the proxy itself (CONNECT tunneling, TLS interception
//! of AI-API hosts, PII anonymization) and a loopback management API for
//! runtime inspection and domain configuration.
//!
//! All configuration comes from `veil-config.json` plus environment
//! variables; there are no flags. Exit code is 0 on clean shutdown and 1 on
//! fatal initialization errors (CA material, listener bind, pattern
//! compilation).

use std::collections::HashSet;
use std::sync::Arc;

use veil_core::{
    Anonymizer, AnonymizerConfig, CacheStore, Config, DomainRegistry, MemoryStore, Metrics,
    S3FifoCache, SqliteStore, DEFAULT_CACHE_CAPACITY,
};
use veil_proxy::{CertAuthority, ProxyContext, ProxyServer, Upstream};
use veil_server::{AppState, Server};

/// Runtime AI-domain overrides persisted next to the config file.
const DOMAIN_STATE_FILE: &str = "ai-domains.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    tracing::info!("starting veil proxy");
    tracing::info!(
        "proxy port {}, management port {}, sidecar {} ({}), AI detection {}",
        cfg.proxy_port,
        cfg.management_port,
        cfg.sidecar_endpoint,
        cfg.sidecar_model,
        cfg.use_ai_detection
    );
    tracing::info!(
        "point clients here: export HTTPS_PROXY=http://{}:{}",
        cfg.bind_address,
        cfg.proxy_port
    );

    let metrics = Arc::new(Metrics::new());

    // Value cache: persistent with S3-FIFO bounds when a file is configured,
    // plain in-memory otherwise. An unopenable cache file degrades to memory
    // rather than refusing to start.
    let cache: Arc<dyn CacheStore> = if cfg.cache_file.is_empty() {
        Arc::new(MemoryStore::new())
    } else {
        match SqliteStore::open(&cfg.cache_file) {
            Ok(store) => {
                tracing::info!("persistent value cache at {}", cfg.cache_file);
                Arc::new(S3FifoCache::new(Arc::new(store), DEFAULT_CACHE_CAPACITY))
            }
            Err(e) => {
                tracing::warn!(
                    "failed to open value cache at {}: {} (falling back to memory)",
                    cfg.cache_file,
                    e
                );
                Arc::new(MemoryStore::new())
            }
        }
    };

    let anonymizer = Arc::new(Anonymizer::new(
        AnonymizerConfig {
            sidecar_endpoint: cfg.sidecar_endpoint.clone(),
            sidecar_model: cfg.sidecar_model.clone(),
            use_ai: cfg.use_ai_detection,
            ai_threshold: cfg.ai_confidence_threshold,
            max_concurrent: cfg.sidecar_max_concurrent,
            instructions: cfg.pii_instructions.clone(),
        },
        cache.clone(),
        Some(metrics.clone()),
    )?);

    let registry = Arc::new(DomainRegistry::new(
        &cfg.ai_api_domains,
        Some(DOMAIN_STATE_FILE.into()),
    ));

    let ca = Arc::new(CertAuthority::load_or_generate(
        &cfg.ca_cert_file,
        &cfg.ca_key_file,
    )?);

    // Management API runs in the background; the proxy must not run without
    // its control plane, so a bind failure there is fatal too.
    let management = Server::new(
        format!("127.0.0.1:{}", cfg.management_port).parse()?,
        AppState {
            registry: registry.clone(),
            metrics: metrics.clone(),
            started: std::time::Instant::now(),
            proxy_port: cfg.proxy_port,
            sidecar_endpoint: cfg.sidecar_endpoint.clone(),
            sidecar_model: cfg.sidecar_model.clone(),
            ai_detection_enabled: cfg.use_ai_detection,
            token: cfg.management_token.clone(),
        },
    );
    tokio::spawn(async move {
        if let Err(e) = management.run().await {
            tracing::error!("management API fatal: {}", e);
            std::process::exit(1);
        }
    });

    let proxy = ProxyServer::new(
        format!("{}:{}", cfg.bind_address, cfg.proxy_port).parse()?,
        ProxyContext {
            anonymizer,
            domains: registry,
            auth_domains: cfg.auth_domains.iter().cloned().collect::<HashSet<_>>(),
            auth_paths: cfg.auth_paths.clone(),
            metrics,
            upstream: Upstream::new(),
            ca: Some(ca),
        },
    );

    tokio::select! {
        result = proxy.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    cache.close();
    Ok(())
}
