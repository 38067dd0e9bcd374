//! Opaque CONNECT tunneling.
//!
//! Non-intercepted CONNECT targets get a plain TCP relay: the upstream is
//! dialed through SafeDial *before* `200 Connection Established` is sent, and
//! bytes are copied bidirectionally until either side closes. The tunnel
//! never inspects or decrypts content.

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

/// Relays bytes between the upgraded client connection and the already
/// dialed upstream until either side closes.
pub async fn relay(client: Upgraded, mut upstream: TcpStream, host: &str) {
    let mut client = TokioIo::new(client);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            tracing::debug!(
                "tunnel to {} closed ({}B up, {}B down)",
                host,
                to_upstream,
                to_client
            );
        }
        Err(e) => {
            tracing::debug!("tunnel to {} aborted: {}", host, e);
        }
    }
}
