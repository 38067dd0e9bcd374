//! Upstream request forwarding.
//!
//! One verified TCP connection per forwarded request: SafeDial resolves and
//! checks the destination, TLS is layered on for https targets, and the
//! request is sent over a dedicated HTTP/1.1 client connection. Hop-by-hop
//! headers are stripped on both directions by the caller via
//! [`strip_hop_by_hop`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

use crate::error::{ProxyError, Result};
use crate::safedial;

/// TLS handshake timeout against the upstream.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum wait for upstream response headers.
const UPSTREAM_RESPONSE_TIMEOUT: Duration = Duration::from_secs(90);

/// Headers that are connection-scoped and must not be forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Removes all hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Upstream HTTP client. The rustls connector is built once; the root store
/// is expensive to construct per request.
pub struct Upstream {
    tls: TlsConnector,
}

impl Default for Upstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Upstream {
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Dials `host:port` through SafeDial and performs one request/response
    /// exchange. The response body is returned still streaming.
    pub async fn send(
        &self,
        host: &str,
        port: u16,
        use_tls: bool,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>> {
        let stream = safedial::dial(host, port, safedial::DIAL_TIMEOUT).await?;

        if use_tls {
            let name = ServerName::try_from(host.to_string())
                .map_err(|_| ProxyError::BadRequest(format!("invalid host name {host:?}")))?;
            let tls_stream =
                match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, self.tls.connect(name, stream))
                    .await
                {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => return Err(ProxyError::Tls(e.to_string())),
                    Err(_) => {
                        return Err(ProxyError::Upstream {
                            host: host.to_string(),
                            reason: "TLS handshake timed out".to_string(),
                        })
                    }
                };
            request_over(tls_stream, host, req).await
        } else {
            request_over(stream, host, req).await
        }
    }
}

/// Drives one HTTP/1.1 exchange over an established connection.
async fn request_over<T>(io: T, host: &str, req: Request<Full<Bytes>>) -> Result<Response<Incoming>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    let host_label = host.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("upstream connection to {} closed: {}", host_label, e);
        }
    });

    match tokio::time::timeout(UPSTREAM_RESPONSE_TIMEOUT, sender.send_request(req)).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) => Err(ProxyError::Upstream {
            host: host.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ProxyError::Upstream {
            host: host.to_string(),
            reason: "upstream response timed out".to_string(),
        }),
    }
}
