//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! Each accepted connection is served as HTTP/1.1 with upgrade support and
//! dispatched by method:
//!
//! - `CONNECT` to a registered AI-API host (with a CA available) → TLS
//!   interception ([`crate::mitm`]);
//! - `CONNECT` to anything else → opaque tunnel ([`crate::tunnel`]);
//! - any other method → direct-HTTP mediation ([`crate::handler`]).
//!
//! SafeDial is consulted before every upstream connection, tunnels included.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::{ProxyError, Result};
use crate::handler::{self, empty_body, status_response, ProxyBody, ProxyContext};
use crate::safedial;
use crate::{mitm, tunnel};

/// The proxy server. Binds a loopback listener and serves until shut down.
pub struct ProxyServer {
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn new(addr: SocketAddr, ctx: ProxyContext) -> Self {
        Self {
            addr,
            ctx: Arc::new(ctx),
        }
    }

    /// Binds and serves until the process exits. Bind failure is fatal.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("proxy listening on {}", listener.local_addr()?);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        accept_loop(listener, self.ctx, shutdown_rx).await;
        Ok(())
    }

    /// Binds and serves in a background task. Returns a handle carrying the
    /// bound address and a shutdown trigger.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("proxy listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(listener, self.ctx, shutdown_rx));

        Ok(ProxyHandle {
            addr,
            shutdown_tx,
            handle,
        })
    }
}

/// Handle for a proxy running in the background.
pub struct ProxyHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// The address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the accept loop to stop. In-flight connections finish on
    /// their own tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shuts down and waits for the accept loop to exit.
    pub async fn stop(self) {
        self.shutdown();
        let _ = self.handle.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("accepted connection from {}", peer);
                        let ctx = ctx.clone();
                        tokio::spawn(serve_connection(stream, ctx));
                    }
                    Err(e) => {
                        tracing::warn!("accept error: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("proxy shutting down");
                    return;
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, ctx: Arc<ProxyContext>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| dispatch(ctx.clone(), req));

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        tracing::debug!("client connection error: {}", e);
    }
}

async fn dispatch(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    let resp = if req.method() == Method::CONNECT {
        handle_connect(ctx, req).await
    } else {
        handle_direct(ctx, req).await
    };
    Ok(resp)
}

/// CONNECT: classify the authority and either intercept or tunnel.
async fn handle_connect(ctx: Arc<ProxyContext>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return status_response(StatusCode::BAD_REQUEST, "malformed CONNECT target");
    };
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);

    let intercept = ctx.ca.is_some() && ctx.is_ai_host(&host);
    if intercept {
        // The CA presence is part of the intercept decision above.
        let ca = ctx.ca.clone().expect("intercept implies CA");
        tracing::debug!("CONNECT {}:{} [intercept]", host, port);

        let ctx_task = ctx.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = mitm::serve(upgraded, host.clone(), port, ca, ctx_task).await {
                        tracing::warn!("intercepted session for {} failed: {}", host, e);
                    }
                }
                Err(e) => tracing::debug!("CONNECT upgrade failed for {}: {}", host, e),
            }
        });
        return Response::new(empty_body());
    }

    tracing::debug!("CONNECT {}:{} [tunnel]", host, port);
    // Dial before answering 200 so dial failures map to real status codes.
    match safedial::dial(&host, port, safedial::TUNNEL_DIAL_TIMEOUT).await {
        Ok(upstream) => {
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => tunnel::relay(upgraded, upstream, &host).await,
                    Err(e) => tracing::debug!("CONNECT upgrade failed for {}: {}", host, e),
                }
            });
            Response::new(empty_body())
        }
        Err(ProxyError::BlockedPrivateAddress { host }) => {
            tracing::warn!("refused CONNECT to {}: private address", host);
            status_response(StatusCode::FORBIDDEN, "forbidden")
        }
        Err(e) => {
            tracing::warn!("CONNECT dial to {}:{} failed: {}", host, port, e);
            status_response(StatusCode::BAD_GATEWAY, "bad gateway")
        }
    }
}

/// Direct-HTTP proxy request (absolute-form URI or Host header).
async fn handle_direct(ctx: Arc<ProxyContext>, req: Request<Incoming>) -> Response<ProxyBody> {
    let uri = req.uri();
    let host = uri
        .host()
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|h| h.split(':').next().unwrap_or(h).to_string())
        })
        .unwrap_or_default();
    if host.is_empty() {
        return status_response(StatusCode::BAD_REQUEST, "missing target host");
    }

    let use_tls = uri.scheme_str() == Some("https");
    let port = uri
        .port_u16()
        .unwrap_or(if use_tls { 443 } else { 80 });

    handler::mediate(ctx, req, host, port, use_tls).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use veil_core::{Anonymizer, AnonymizerConfig, DomainRegistry, MemoryStore, Metrics};

    use crate::forward::Upstream;

    fn test_context() -> ProxyContext {
        let anonymizer = Anonymizer::new(
            AnonymizerConfig {
                use_ai: false,
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
            None,
        )
        .unwrap();
        ProxyContext {
            anonymizer: Arc::new(anonymizer),
            domains: Arc::new(DomainRegistry::in_memory(&["api.anthropic.com".to_string()])),
            auth_domains: HashSet::new(),
            auth_paths: Vec::new(),
            metrics: Arc::new(Metrics::new()),
            upstream: Upstream::new(),
            ca: None,
        }
    }

    async fn started() -> ProxyHandle {
        let server = ProxyServer::new("127.0.0.1:0".parse().unwrap(), test_context());
        server.start().await.unwrap()
    }

    async fn roundtrip(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match tokio::time::timeout(
                std::time::Duration::from_secs(5),
                stream.read(&mut chunk),
            )
            .await
            {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                Ok(Err(_)) => break,
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let handle = started().await;
        assert_ne!(handle.addr().port(), 0);
        handle.stop().await;
    }

    #[tokio::test]
    async fn connect_to_private_address_is_forbidden() {
        let handle = started().await;
        let resp = roundtrip(
            handle.addr(),
            "CONNECT 10.0.0.1:443 HTTP/1.1\r\nHost: 10.0.0.1:443\r\n\r\n",
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 403"), "got: {resp}");
        handle.stop().await;
    }

    #[tokio::test]
    async fn direct_request_to_private_address_is_forbidden() {
        let handle = started().await;
        let resp = roundtrip(
            handle.addr(),
            "GET http://169.254.169.254/latest/meta-data/ HTTP/1.1\r\nHost: 169.254.169.254\r\n\r\n",
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 403"), "got: {resp}");
        handle.stop().await;
    }

    #[tokio::test]
    async fn direct_request_without_host_is_bad_request() {
        let handle = started().await;
        let resp = roundtrip(handle.addr(), "GET / HTTP/1.1\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 400"), "got: {resp}");
        handle.stop().await;
    }

    #[tokio::test]
    async fn shutdown_stops_accept_loop() {
        let handle = started().await;
        let addr = handle.addr();
        handle.stop().await;
        // After shutdown, new connections are refused (or reset immediately).
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let connect = TcpStream::connect(addr).await;
        if let Ok(mut stream) = connect {
            // Listener backlog may still accept the TCP handshake; the
            // connection must at least be unserviced.
            let mut buf = [0u8; 1];
            stream
                .write_all(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
                .await
                .ok();
            let read = tokio::time::timeout(
                std::time::Duration::from_millis(200),
                stream.read(&mut buf),
            )
            .await;
            match read {
                Ok(Ok(0)) | Err(_) => {}
                Ok(Ok(_)) => panic!("shut-down proxy served a request"),
                Ok(Err(_)) => {}
            }
        }
    }
}
