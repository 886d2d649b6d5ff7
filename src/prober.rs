//! Issues a `getinfo` probe to a single endpoint and parses the reply.
//!
//! Grounded on `dnakov-factorio-headless-client/src/protocol/transport.rs`'s
//! `Transport::recv_timeout`: bind an ephemeral socket, send once, wait for
//! one datagram under a timeout, and let the socket close on drop.

use std::net::SocketAddrV4;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::registry::{Endpoint, Registry, ServerInfo};
use crate::wire;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_RECV_BUF: usize = 4096;

/// Probes `endpoint` for metadata. Never returns an error outward — probe
/// failures are logged and folded into `None`. Unconditionally marks the
/// endpoint as probed in `registry`'s auxiliary state, success or failure;
/// does not touch the stored `ServerRecord` — that remains the caller's
/// responsibility.
pub async fn probe(registry: &Registry, endpoint: Endpoint) -> Option<ServerInfo> {
    let result = probe_once(endpoint).await;
    registry.mark_probed(endpoint);

    match result {
        Ok(info) => Some(info),
        Err(reason) => {
            let addr = format!("{}:{}", endpoint.ip, endpoint.port);
            tracing::debug!(%addr, %reason, "probe failed");
            None
        }
    }
}

async fn probe_once(endpoint: Endpoint) -> Result<ServerInfo, String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .map_err(|e| format!("bind failed: {e}"))?;

    let target = SocketAddrV4::new(endpoint.ip, endpoint.port);
    socket
        .send_to(&wire::build_getinfo(), target)
        .await
        .map_err(|e| format!("send failed: {e}"))?;

    let mut buf = vec![0u8; PROBE_RECV_BUF];
    let n = tokio::time::timeout(PROBE_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| "timed out".to_owned())?
        .map_err(|e| format!("recv failed: {e}"))?;

    let info = wire::parse_info_response(&buf[..n]).ok_or_else(|| "no infoResponse marker".to_owned())?;
    Ok(ServerInfo::from_info_response(&info))
}
