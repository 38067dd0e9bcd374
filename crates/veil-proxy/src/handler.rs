//! The anonymize → forward → deanonymize request path.
//!
//! Both the direct-HTTP dispatcher and the TLS-intercept service funnel
//! requests through [`mediate`]: classify the target (AI / auth / other),
//! anonymize the body for AI requests, forward through SafeDial, and restore
//! tokens in the response - buffered for ordinary bodies, streaming for SSE.
//!
//! Session lifecycle is scoped to this function: the session map entry is
//! created immediately before anonymization and dropped when the handler
//! returns, whatever the outcome. The streaming path snapshots the session
//! first, so the drop cannot race the stream reader.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

use veil_core::{Anonymizer, DomainRegistry, Metrics};

use crate::ca::CertAuthority;
use crate::error::ProxyError;
use crate::forward::{strip_hop_by_hop, Upstream};
use crate::stream;

/// Response body type used on the client side of the proxy.
pub type ProxyBody = BoxBody<Bytes, Infallible>;

/// Request bodies above this size are rejected with `413`.
pub const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Hostname prefixes that mark a request as authentication traffic.
const AUTH_HOST_PREFIXES: &[&str] = &["auth.", "login.", "accounts.", "sso.", "oauth."];

/// Shared state for the request path.
pub struct ProxyContext {
    pub anonymizer: Arc<Anonymizer>,
    pub domains: Arc<DomainRegistry>,
    pub auth_domains: HashSet<String>,
    pub auth_paths: Vec<String>,
    pub metrics: Arc<Metrics>,
    pub upstream: Upstream,
    /// Interception CA; `None` disables TLS interception entirely (all
    /// CONNECTs tunnel opaquely).
    pub ca: Option<Arc<CertAuthority>>,
}

impl ProxyContext {
    /// True if the request is authentication traffic and must pass through
    /// unmodified: auth-domain match, well-known auth hostname prefix, or
    /// configured auth path prefix.
    pub fn is_auth_request(&self, host: &str, path: &str) -> bool {
        if self.auth_domains.contains(host) {
            return true;
        }
        if AUTH_HOST_PREFIXES.iter().any(|p| host.starts_with(p)) {
            return true;
        }
        self.auth_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Exact-match membership in the AI-API domain set.
    pub fn is_ai_host(&self, host: &str) -> bool {
        self.domains.contains(host)
    }
}

/// Deletes the request's session when the handler exits, success or not.
struct SessionGuard {
    anonymizer: Arc<Anonymizer>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.session_id.is_empty() {
            self.anonymizer.delete_session(&self.session_id);
        }
    }
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    BodyExt::boxed(Full::new(data.into()).map_err(|e| match e {}))
}

pub fn empty_body() -> ProxyBody {
    BodyExt::boxed(Empty::new().map_err(|e| match e {}))
}

/// A sanitized status-only response. Upstream error detail never reaches the
/// client.
pub fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(format!("{message}\n")))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// Mediates one request end to end. `use_tls` selects https upstream; the
/// target is always dialed through SafeDial.
pub async fn mediate(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    host: String,
    port: u16,
    use_tls: bool,
) -> Response<ProxyBody> {
    Metrics::incr(&ctx.metrics.requests_total);

    let path = req.uri().path().to_string();
    let is_auth = ctx.is_auth_request(&host, &path);
    let is_ai = ctx.is_ai_host(&host);
    let anonymize = is_ai && !is_auth;

    if is_auth {
        Metrics::incr(&ctx.metrics.requests_auth);
    } else if anonymize {
        Metrics::incr(&ctx.metrics.requests_anonymized);
    } else {
        Metrics::incr(&ctx.metrics.requests_passthrough);
    }
    tracing::debug!(
        "{} {}{} {}",
        req.method(),
        host,
        path,
        if is_auth {
            "[auth][pass]"
        } else if anonymize {
            "[anon]"
        } else {
            "[pass]"
        }
    );

    let (parts, body) = req.into_parts();

    let body_bytes = match Limited::new(body, MAX_BODY_SIZE).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                status_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
            } else {
                status_response(StatusCode::BAD_REQUEST, "bad request")
            };
        }
    };

    // The session exists only for requests that actually anonymize a body.
    let session_id = if anonymize && !body_bytes.is_empty() {
        format!("{:016x}", rand::random::<u64>())
    } else {
        String::new()
    };
    let _session = SessionGuard {
        anonymizer: ctx.anonymizer.clone(),
        session_id: session_id.clone(),
    };

    let out_body = if session_id.is_empty() {
        body_bytes
    } else {
        let started = Instant::now();
        let anonymized = ctx.anonymizer.anonymize_json(&body_bytes, &session_id);
        ctx.metrics.record_anon_latency(started.elapsed());
        Bytes::from(anonymized)
    };

    // Rebuild the outbound request in origin form with clean headers.
    let mut upstream_req = Request::builder()
        .method(parts.method.clone())
        .uri(
            parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .to_string(),
        );
    if let Some(headers) = upstream_req.headers_mut() {
        *headers = parts.headers.clone();
        strip_hop_by_hop(headers);
        headers.remove(CONTENT_LENGTH);
        if let Ok(value) = host.parse() {
            headers.insert(HOST, value);
        }
        if !out_body.is_empty() {
            if let Ok(value) = out_body.len().to_string().parse() {
                headers.insert(CONTENT_LENGTH, value);
            }
        }
    }
    let upstream_req = match upstream_req.body(Full::new(out_body)) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("failed to build upstream request for {}: {}", host, e);
            return status_response(StatusCode::BAD_REQUEST, "bad request");
        }
    };

    let started = Instant::now();
    let upstream_resp = match ctx.upstream.send(&host, port, use_tls, upstream_req).await {
        Ok(resp) => resp,
        Err(ProxyError::BlockedPrivateAddress { host }) => {
            tracing::warn!("refused dial to {}: private address", host);
            return status_response(StatusCode::FORBIDDEN, "forbidden");
        }
        Err(e) => {
            tracing::warn!("upstream error for {}: {}", host, e);
            Metrics::incr(&ctx.metrics.errors_upstream);
            return status_response(StatusCode::BAD_GATEWAY, "bad gateway");
        }
    };
    ctx.metrics.record_upstream_latency(started.elapsed());

    let (mut resp_parts, resp_body) = upstream_resp.into_parts();
    strip_hop_by_hop(&mut resp_parts.headers);

    // Nothing was tokenized: relay the body as-is, still streaming.
    if session_id.is_empty() || ctx.anonymizer.session_token_count(&session_id) == 0 {
        return Response::from_parts(resp_parts, relay_body(resp_body));
    }

    let content_type = resp_parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("text/event-stream") {
        // Snapshot before the guard drops the session at return.
        let replacer = ctx.anonymizer.session_replacer(&session_id);
        return Response::from_parts(resp_parts, stream::deanonymize_body(resp_body, replacer));
    }

    // Buffered response: read fully, substitute, re-emit.
    let collected = match resp_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("upstream body read error for {}: {}", host, e);
            Metrics::incr(&ctx.metrics.errors_upstream);
            return status_response(StatusCode::BAD_GATEWAY, "bad gateway");
        }
    };
    let restored = ctx
        .anonymizer
        .deanonymize_text(&String::from_utf8_lossy(&collected), &session_id);

    resp_parts.headers.remove(CONTENT_LENGTH);
    if let Ok(value) = restored.len().to_string().parse() {
        resp_parts.headers.insert(CONTENT_LENGTH, value);
    }
    Response::from_parts(resp_parts, full_body(restored))
}

/// Adapts an upstream body for the client without inspecting it. Read errors
/// terminate the stream; mid-stream errors cannot be reported to the client
/// except via the transport.
fn relay_body(mut body: Incoming) -> ProxyBody {
    use hyper::body::Frame;
    use tokio_stream::wrappers::ReceiverStream;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Frame<Bytes>, Infallible>>(16);
    tokio::spawn(async move {
        while let Some(next) = body.frame().await {
            match next {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        if tx.send(Ok(Frame::data(data))).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("relay body read error: {}", e);
                    return;
                }
            }
        }
    });
    BodyExt::boxed(http_body_util::StreamBody::new(ReceiverStream::new(rx)))
}
