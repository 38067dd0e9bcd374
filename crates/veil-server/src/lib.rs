//! Veil server - management HTTP API.
//!
//! A small loopback control plane for the running proxy:
//!
//! - `GET /status` - health, uptime, and the current AI-domain list
//! - `GET /metrics` - metrics snapshot
//! - `POST /domains/add` - register an AI-API domain `{"domain":"..."}`
//! - `POST /domains/remove` - unregister an AI-API domain
//!
//! When a management token is configured, every endpoint requires
//! `Authorization: Bearer <token>`; the comparison is constant-time.

pub mod error;
mod handlers;
pub mod state;

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use socket2::{Domain, Protocol, Socket, Type};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default management port.
pub const DEFAULT_PORT: u16 = 8081;

/// Domain add/remove request bodies are tiny; cap them hard.
const DOMAIN_BODY_LIMIT: usize = 1024;

/// A client that has not finished sending request headers within this window
/// loses its connection.
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the management address.
    #[error("failed to bind to {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// The management API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Builds the router around the shared state.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        if !state.token.is_empty() {
            info!("management bearer-token authentication enabled");
        }

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let router = Router::new()
            .route("/status", get(handlers::status))
            .route("/metrics", get(handlers::metrics))
            .route("/domains/add", post(handlers::add_domain))
            .route("/domains/remove", post(handlers::remove_domain))
            .layer(DefaultBodyLimit::max(DOMAIN_BODY_LIMIT))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .layer(cors)
            .with_state(state);

        Self { router, addr }
    }

    /// The configured bind address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the router, for in-process tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Binds and serves until shutdown. Uses `SO_REUSEADDR` so restarts are
    /// not blocked by lingering sockets, and drops connections whose request
    /// headers do not arrive within [`READ_HEADER_TIMEOUT`].
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        info!("management API listening on {}", self.addr);

        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::Bind(self.addr, e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::Bind(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::Bind(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::Bind(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::Bind(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::Bind(self.addr, e))?;

        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("management accept error: {}", e);
                    continue;
                }
            };
            let service = TowerToHyperService::new(self.router.clone());
            tokio::spawn(async move {
                let mut builder = auto::Builder::new(TokioExecutor::new());
                builder.http1().header_read_timeout(READ_HEADER_TIMEOUT);
                if let Err(e) = builder
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!("management connection error: {}", e);
                }
            });
        }
    }
}

/// Bearer-token middleware. A missing configured token leaves the API open
/// (loopback-only by default).
async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    if state.token.is_empty() {
        return Ok(next.run(request).await);
    }

    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();

    if presented.as_bytes().ct_eq(state.token.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("unauthorized management access attempt");
        Err(ApiError::Unauthorized)
    }
}
