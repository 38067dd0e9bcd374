//! Certificate authority management for TLS interception.
//!
//! Loads (or generates) the local root CA and mints short-lived leaf
//! certificates for intercepted hosts on demand. Minted leaves are cached per
//! host as ready-to-serve rustls configurations.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::error::CaError;

/// Maximum number of cached leaf certificates. On overflow the whole cache is
/// cleared: re-minting costs a key pair and one signature (milliseconds), so
/// LRU bookkeeping is not worth carrying at this scale.
const LEAF_CACHE_MAX: usize = 10_000;

/// Leaf certificate lifetime.
const LEAF_VALIDITY: Duration = Duration::days(7);

/// A cached leaf within this margin of expiry is re-minted on next use.
const LEAF_REFRESH_MARGIN: Duration = Duration::hours(1);

#[derive(Debug)]
struct CachedLeaf {
    config: Arc<ServerConfig>,
    not_after: OffsetDateTime,
}

/// The interception CA: issuer material plus the per-host leaf cache.
#[derive(Debug)]
pub struct CertAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    cache: RwLock<HashMap<String, CachedLeaf>>,
}

impl CertAuthority {
    /// Loads the CA from PEM files, generating a new one first when the files
    /// do not exist. Existing-but-invalid files are an error, not a prompt to
    /// overwrite key material.
    pub fn load_or_generate(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CaError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        if !cert_path.exists() || !key_path.exists() {
            Self::generate_ca(cert_path, key_path)?;
            tracing::info!("generated new CA: {} / {}", cert_path.display(), key_path.display());
            tracing::info!("trust the CA certificate to enable HTTPS interception:");
            tracing::info!(
                "  macOS:   security add-trusted-cert -d -r trustRoot -k ~/Library/Keychains/login.keychain {}",
                cert_path.display()
            );
            tracing::info!(
                "  Linux:   sudo cp {} /usr/local/share/ca-certificates/veil.crt && sudo update-ca-certificates",
                cert_path.display()
            );
            tracing::info!("  Windows: certutil -addstore Root {}", cert_path.display());
        } else {
            tracing::info!("loaded CA from {} / {}", cert_path.display(), key_path.display());
        }

        Self::load(cert_path, key_path)
    }

    /// Reads the CA certificate and key from PEM files.
    pub fn load(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CaError> {
        let cert_pem = fs::read_to_string(cert_path.as_ref())?;
        let key_pem = fs::read_to_string(key_path.as_ref())?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::Parse("no PEM certificate block".to_string()))?
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            issuer,
            ca_cert_der,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Generates a new self-signed root CA and writes both PEM files.
    pub fn generate_ca(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), CaError> {
        if let Some(dir) = cert_path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::new())
            .map_err(|e| CaError::Generation(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, "Veil Local CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Veil Anonymizing Proxy");
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc() - Duration::minutes(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(3650);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        fs::write(cert_path.as_ref(), cert.pem())?;
        fs::write(key_path.as_ref(), key_pair.serialize_pem())?;

        Ok(())
    }

    /// The CA certificate in DER form, for trust-installation tooling.
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Returns a rustls server configuration presenting a leaf certificate
    /// for `host`, minting and caching one as needed. Cached leaves within
    /// [`LEAF_REFRESH_MARGIN`] of expiry are replaced.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        {
            let cache = self.cache.read();
            if let Some(leaf) = cache.get(host) {
                if leaf.not_after - OffsetDateTime::now_utc() > LEAF_REFRESH_MARGIN {
                    return Ok(leaf.config.clone());
                }
                tracing::debug!("leaf certificate for {} near expiry, re-minting", host);
            }
        }

        let (config, not_after) = self.mint_leaf(host)?;

        let mut cache = self.cache.write();
        if cache.len() >= LEAF_CACHE_MAX {
            // Certs are cheap to regenerate; clear rather than track LRU.
            cache.clear();
        }
        cache.insert(
            host.to_string(),
            CachedLeaf {
                config: config.clone(),
                not_after,
            },
        );
        Ok(config)
    }

    fn mint_leaf(&self, host: &str) -> Result<(Arc<ServerConfig>, OffsetDateTime), CaError> {
        tracing::debug!("minting leaf certificate for {}", host);

        let leaf_key = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| CaError::Generation(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = OffsetDateTime::now_utc() - Duration::minutes(1);
        let not_after = OffsetDateTime::now_utc() + LEAF_VALIDITY;
        params.not_after = not_after;

        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let chain = vec![cert.der().clone(), self.ca_cert_der.clone()];
        let key: PrivateKeyDer<'static> =
            PrivatePkcs8KeyDer::from(leaf_key.serialize_der()).into();

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| CaError::Generation(e.to_string()))?;
        // ALPN preference: HTTP/2 first.
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok((Arc::new(config), not_after))
    }

    #[cfg(test)]
    fn cached_hosts(&self) -> usize {
        self.cache.read().len()
    }
}
