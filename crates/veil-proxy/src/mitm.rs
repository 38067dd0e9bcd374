//! TLS interception for AI-API CONNECT sessions.
//!
//! After the dispatcher replies `200 Connection Established`, the hijacked
//! byte stream lands here: a server-side TLS handshake using a leaf
//! certificate minted for the target host, then plaintext HTTP/2 or HTTP/1.1
//! service according to the negotiated ALPN protocol. Every intercepted
//! request flows through the shared mediation path against the original
//! upstream.

use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio_rustls::TlsAcceptor;

use crate::ca::CertAuthority;
use crate::error::{ProxyError, Result};
use crate::handler::{self, ProxyContext};

/// Client-side TLS handshake timeout.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum concurrent streams served per intercepted HTTP/2 connection.
const H2_MAX_CONCURRENT_STREAMS: u32 = 250;

/// An intercepted HTTP/2 connection idle this long is pinged; a ping that
/// goes unanswered for [`H2_KEEP_ALIVE_TIMEOUT`] closes the connection, so
/// idle MITM sessions are reaped instead of held open forever.
const H2_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(90);
const H2_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(90);

/// Terminates TLS on the hijacked connection and serves the intercepted
/// session.
pub async fn serve(
    upgraded: Upgraded,
    host: String,
    port: u16,
    ca: Arc<CertAuthority>,
    ctx: Arc<ProxyContext>,
) -> Result<()> {
    let config = ca.server_config_for(&host)?;
    let acceptor = TlsAcceptor::from(config);

    let tls = match tokio::time::timeout(
        TLS_HANDSHAKE_TIMEOUT,
        acceptor.accept(TokioIo::new(upgraded)),
    )
    .await
    {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => return Err(ProxyError::Tls(e.to_string())),
        Err(_) => return Err(ProxyError::Tls("client handshake timed out".to_string())),
    };

    let negotiated = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
    let io = TokioIo::new(tls);

    let service = {
        let ctx = ctx.clone();
        let host = host.clone();
        service_fn(move |req| {
            let ctx = ctx.clone();
            let host = host.clone();
            async move {
                Ok::<_, std::convert::Infallible>(
                    handler::mediate(ctx, req, host, port, true).await,
                )
            }
        })
    };

    match negotiated.as_deref() {
        Some(b"h2") => {
            hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                .max_concurrent_streams(H2_MAX_CONCURRENT_STREAMS)
                .keep_alive_interval(H2_KEEP_ALIVE_INTERVAL)
                .keep_alive_timeout(H2_KEEP_ALIVE_TIMEOUT)
                .serve_connection(io, service)
                .await?;
        }
        _ => {
            hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await?;
        }
    }
    Ok(())
}
