//! Runtime-mutable registry of AI-API domains.
//!
//! Holds the set of hosts whose traffic is anonymized. It is shared between
//! the proxy (membership tests on the hot path) and the management API
//! (add/remove). Changes are persisted to disk with an atomic temp-file +
//! rename write so they survive restarts; when the persisted file exists it
//! takes precedence over configuration defaults.

use std::collections::HashSet;
use std::path::PathBuf;

use parking_lot::RwLock;

/// Mutable set of AI-API domains. Membership is an exact match on the full
/// host name.
pub struct DomainRegistry {
    domains: RwLock<HashSet<String>>,
    /// Empty = no persistence.
    persist_path: Option<PathBuf>,
}

impl DomainRegistry {
    /// Creates a registry seeded from `seed`. If `persist_path` is set and
    /// the file exists, its contents replace the seed (it represents runtime
    /// overrides).
    pub fn new(seed: &[String], persist_path: Option<PathBuf>) -> Self {
        if let Some(path) = &persist_path {
            match std::fs::read(path) {
                Ok(data) => match serde_json::from_slice::<Vec<String>>(&data) {
                    Ok(persisted) => {
                        tracing::info!(
                            "loaded {} domains from {}",
                            persisted.len(),
                            path.display()
                        );
                        return Self {
                            domains: RwLock::new(persisted.into_iter().collect()),
                            persist_path,
                        };
                    }
                    Err(e) => {
                        tracing::warn!(
                            "failed to parse {}: {} (using config defaults)",
                            path.display(),
                            e
                        );
                    }
                },
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    tracing::warn!(
                        "failed to read {}: {} (using config defaults)",
                        path.display(),
                        e
                    );
                }
                Err(_) => {}
            }
        }

        Self {
            domains: RwLock::new(seed.iter().cloned().collect()),
            persist_path,
        }
    }

    /// Creates an in-memory registry, for tests.
    pub fn in_memory(seed: &[String]) -> Self {
        Self::new(seed, None)
    }

    /// True if `domain` is registered as an AI-API domain.
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.read().contains(domain)
    }

    /// Adds a domain and persists the new set.
    pub fn add(&self, domain: &str) {
        let snapshot = {
            let mut domains = self.domains.write();
            domains.insert(domain.to_string());
            Self::sorted(&domains)
        };
        self.persist(&snapshot);
    }

    /// Removes a domain and persists the new set.
    pub fn remove(&self, domain: &str) {
        let snapshot = {
            let mut domains = self.domains.write();
            domains.remove(domain);
            Self::sorted(&domains)
        };
        self.persist(&snapshot);
    }

    /// Returns all registered domains, sorted.
    pub fn all(&self) -> Vec<String> {
        Self::sorted(&self.domains.read())
    }

    fn sorted(domains: &HashSet<String>) -> Vec<String> {
        let mut out: Vec<String> = domains.iter().cloned().collect();
        out.sort();
        out
    }

    /// Writes the snapshot to disk atomically. Runs without the registry
    /// lock so membership tests are never blocked on file I/O.
    fn persist(&self, domains: &[String]) {
        let Some(path) = &self.persist_path else {
            return;
        };

        let data = match serde_json::to_vec_pretty(domains) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("domain list encode error: {}", e);
                return;
            }
        };

        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let tmp = match tempfile::NamedTempFile::new_in(dir) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("domain list persist error (create temp): {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(tmp.path(), &data) {
            tracing::warn!("domain list persist error (write): {}", e);
            return;
        }
        if let Err(e) = tmp.persist(path) {
            tracing::warn!("domain list persist error (rename): {}", e);
        }
    }
}
