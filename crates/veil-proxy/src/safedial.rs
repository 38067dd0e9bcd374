//! SSRF-safe upstream dialing.
//!
//! Every outbound TCP connection goes through [`dial`]: the destination host
//! is resolved, every resolved address is checked against the private-network
//! list, and the connection targets the first verified IP directly rather
//! than the hostname. Dialing the checked IP (instead of re-resolving) closes
//! the DNS-rebinding TOCTOU window.

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use ipnet::IpNet;
use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};

/// Upstream TCP dial timeout for forwarded requests.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream TCP dial timeout for opaque tunnels.
pub const TUNNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Prefixes the proxy refuses to connect to. This list is a constant, not a
/// user input.
const BLOCKED_PREFIXES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

fn blocked_networks() -> &'static [IpNet] {
    static NETWORKS: OnceLock<Vec<IpNet>> = OnceLock::new();
    NETWORKS.get_or_init(|| {
        BLOCKED_PREFIXES
            .iter()
            .map(|p| p.parse().expect("built-in CIDR literal"))
            .collect()
    })
}

/// True if `ip` falls inside any blocked prefix.
pub fn is_blocked(ip: IpAddr) -> bool {
    blocked_networks().iter().any(|net| net.contains(&ip))
}

/// Resolves `host` and returns the first address, refusing the whole set if
/// any resolved address is private. Literal IPs are checked directly.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked(ip) {
            return Err(ProxyError::BlockedPrivateAddress {
                host: host.to_string(),
            });
        }
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProxyError::Upstream {
            host: host.to_string(),
            reason: format!("DNS resolution failed: {e}"),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(ProxyError::Upstream {
            host: host.to_string(),
            reason: "DNS resolution returned no addresses".to_string(),
        });
    }

    // One private address poisons the whole set: a rebinding resolver can
    // interleave public and private answers.
    if addrs.iter().any(|a| is_blocked(a.ip())) {
        return Err(ProxyError::BlockedPrivateAddress {
            host: host.to_string(),
        });
    }

    Ok(addrs[0])
}

/// Resolves and dials `host:port` with the given timeout. The connection
/// targets the verified IP, never the hostname.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = resolve(host, port).await?;
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::Upstream {
            host: host.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ProxyError::Upstream {
            host: host.to_string(),
            reason: "connection timed out".to_string(),
        }),
    }
}
