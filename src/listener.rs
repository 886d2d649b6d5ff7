//! UDP listener: the master port's receive loop and its two datagram
//! handlers (heartbeat intake, getservers reply).
//!
//! The recv loop itself never awaits handler work — each classified
//! datagram is dispatched via `tokio::spawn`, the same accept/dispatch
//! shape as `crates/timer-core/src/workers/client_connector.rs`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::prober;
use crate::registry::{Endpoint, GETSERVERS_LIVENESS_WINDOW, Registry};
use crate::wire;

const RECV_BUF_SIZE: usize = 1024;

/// Runs the UDP listener loop forever on an already-bound socket. A failed
/// `recv_from` is logged and the loop continues rather than exiting — bind
/// failure, the one fatal condition for this socket, happens earlier in the
/// caller and is never seen here.
pub async fn run(socket: UdpSocket, registry: Arc<Registry>) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "udp listener recv failed");
                continue;
            }
        };

        let payload = buf[..n].to_vec();
        let socket = Arc::clone(&socket);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            dispatch(&socket, &registry, addr, &payload).await;
        });
    }
}

async fn dispatch(socket: &UdpSocket, registry: &Registry, addr: SocketAddr, payload: &[u8]) {
    let text = wire::decode_latin1_lossy(payload);
    let trimmed = text.trim();

    if trimmed.starts_with("heartbeat") {
        handle_heartbeat(registry, addr).await;
    } else if trimmed.starts_with("getservers") {
        handle_getservers(socket, registry, addr).await;
    } else {
        tracing::warn!(%addr, prefix = %trimmed.chars().take(32).collect::<String>(), "unrecognized datagram, ignored");
    }
}

fn endpoint_of(addr: SocketAddr) -> Option<Endpoint> {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => Some(Endpoint::new(ip, addr.port())),
        std::net::IpAddr::V6(_) => None,
    }
}

/// Heartbeat payload itself is never parsed — its arrival triggers a
/// probe back to the sender. The protocol's trust model is
/// respond-probe-back, not payload-based.
async fn handle_heartbeat(registry: &Registry, addr: SocketAddr) {
    let Some(endpoint) = endpoint_of(addr) else {
        tracing::warn!(%addr, "heartbeat from non-IPv4 address, ignored");
        return;
    };

    if registry.probed_recently(endpoint) {
        return;
    }

    let Some(info) = prober::probe(registry, endpoint).await else {
        tracing::debug!(%addr, "heartbeat probe returned no info");
        return;
    };

    registry.mark_heartbeat(endpoint);
    if let Err(e) = registry.upsert_info(endpoint, info).await {
        tracing::error!(%addr, error = %e, "registry upsert failed for heartbeat");
    }
}

async fn handle_getservers(socket: &UdpSocket, registry: &Registry, addr: SocketAddr) {
    let endpoints = match registry.get_live_endpoints(GETSERVERS_LIVENESS_WINDOW).await {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(%addr, error = %e, "registry read failed for getservers");
            return;
        }
    };

    if endpoints.is_empty() {
        tracing::info!(%addr, "no live servers for getservers reply");
        return;
    }

    let reply = wire::encode_getservers_response(&endpoints);
    if let Err(e) = socket.send_to(&reply, addr).await {
        tracing::warn!(%addr, error = %e, "failed to send getserversResponse");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerInfo;
    use std::net::SocketAddrV4;

    fn sample_info() -> ServerInfo {
        ServerInfo {
            name: "Foo".to_owned(),
            version: "ET 2.60b linux-i386 May 8 2006".to_owned(),
            mod_name: "etmain".to_owned(),
            players: 3,
            max_players: 20,
            map: "oasis".to_owned(),
        }
    }

    #[tokio::test]
    async fn getservers_handler_replies_with_live_endpoints() {
        let registry = Registry::open_in_memory().await.unwrap();
        let live = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 27960);
        registry.upsert_info(live, sample_info()).await.unwrap();

        let listener_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let client_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let client_addr = client_socket.local_addr().unwrap();

        handle_getservers(&listener_socket, &registry, client_addr).await;

        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), client_socket.recv(&mut buf))
            .await
            .expect("should have received a reply")
            .unwrap();
        let endpoints = wire::parse_getservers_response(&buf[..n]);
        assert_eq!(endpoints, vec![live]);
    }

    #[tokio::test]
    async fn getservers_handler_sends_nothing_when_no_live_servers() {
        let registry = Registry::open_in_memory().await.unwrap();
        let listener_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let client_socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let client_addr = client_socket.local_addr().unwrap();

        handle_getservers(&listener_socket, &registry, client_addr).await;

        let mut buf = [0u8; 256];
        let result = tokio::time::timeout(std::time::Duration::from_millis(200), client_socket.recv(&mut buf)).await;
        assert!(result.is_err(), "no reply should have been sent");
    }

    #[test]
    fn endpoint_of_rejects_ipv6() {
        let addr: SocketAddr = "[::1]:27960".parse().unwrap();
        assert!(endpoint_of(addr).is_none());
    }

    #[test]
    fn endpoint_of_accepts_ipv4() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 27960));
        let endpoint = endpoint_of(addr).unwrap();
        assert_eq!(endpoint.ip, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(endpoint.port, 27960);
    }
}
