//! The two periodic activities: the Sweeper (re-probes live endpoints) and
//! Upstream Sync (crawls configured upstream masters for new endpoints).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::prober;
use crate::registry::{Endpoint, Registry};
use crate::wire;

const SWEEPER_PERIOD: Duration = Duration::from_secs(5);
const UPSTREAM_SYNC_PERIOD: Duration = Duration::from_secs(300);
const MAX_CONCURRENT_PROBES: usize = 100;
const UPSTREAM_PORT: u16 = 27950;
const UPSTREAM_RECV_TIMEOUT: Duration = Duration::from_secs(5);
const UPSTREAM_RECV_BUF: usize = 4096;

/// Runs the Sweeper loop forever. Each tick snapshots endpoints, filters to
/// sweep-eligible ones, and probes up to `MAX_CONCURRENT_PROBES` of them in
/// parallel, waiting for all to settle before scheduling the next tick.
pub async fn run_sweeper(registry: Arc<Registry>) {
    let mut interval = tokio::time::interval(SWEEPER_PERIOD);
    loop {
        interval.tick().await;
        if let Err(e) = sweep_once(&registry).await {
            tracing::error!(error = %e, "sweeper tick failed to read registry");
        }
    }
}

async fn sweep_once(registry: &Arc<Registry>) -> Result<(), crate::error::RegistryError> {
    let endpoints = registry.all_endpoints().await?;
    let eligible: Vec<Endpoint> = endpoints
        .into_iter()
        .filter(|e| registry.sweep_eligible(*e))
        .collect();

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
    let mut tasks = JoinSet::new();
    for endpoint in eligible {
        let registry = Arc::clone(registry);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            if let Some(info) = prober::probe(&registry, endpoint).await {
                if let Err(e) = registry.upsert_info(endpoint, info).await {
                    let addr = endpoint_display(endpoint);
                    tracing::error!(%addr, error = %e, "sweeper upsert failed");
                }
            }
        });
    }
    while tasks.join_next().await.is_some() {}
    Ok(())
}

fn endpoint_display(endpoint: Endpoint) -> String {
    format!("{}:{}", endpoint.ip, endpoint.port)
}

/// Runs the Upstream Sync loop forever.
pub async fn run_upstream_sync(registry: Arc<Registry>, config: Arc<Config>) {
    let mut interval = tokio::time::interval(UPSTREAM_SYNC_PERIOD);
    loop {
        interval.tick().await;
        sync_once(&registry, &config).await;
    }
}

async fn sync_once(registry: &Registry, config: &Config) {
    let mut discovered = std::collections::HashSet::new();

    for host in &config.master_servers {
        let endpoints = fetch_master_servers(host, &config.known_protocols).await;
        discovered.extend(endpoints);
    }

    for endpoint in discovered {
        if let Err(e) = registry.insert_stub_if_absent(endpoint).await {
            let addr = endpoint_display(endpoint);
            tracing::error!(%addr, error = %e, "failed to insert stub record");
        }
    }
}

/// Queries one upstream host, trying each configured protocol in order and
/// stopping at the first that yields more than 24 accumulated bytes. A
/// protocol attempt that fails (timeout, send/recv error) is logged and
/// skipped so the remaining protocols still get a try.
async fn fetch_master_servers(host: &str, known_protocols: &[u16]) -> Vec<Endpoint> {
    for &protocol in known_protocols {
        let accumulated = match query_upstream_protocol((host, UPSTREAM_PORT), protocol).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%host, protocol, error = %e, "upstream protocol query failed");
                continue;
            }
        };

        if accumulated.len() > 24 {
            return wire::parse_getservers_response(&accumulated);
        }
    }
    Vec::new()
}

async fn query_upstream_protocol(
    upstream: impl tokio::net::ToSocketAddrs,
    protocol: u16,
) -> Result<Vec<u8>, String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    socket
        .connect(upstream)
        .await
        .map_err(|e| format!("connect failed: {e}"))?;
    socket
        .send(&wire::build_getservers_request(protocol))
        .await
        .map_err(|e| format!("send failed: {e}"))?;

    let mut accumulated = Vec::new();
    loop {
        let mut buf = vec![0u8; UPSTREAM_RECV_BUF];
        let n = match tokio::time::timeout(UPSTREAM_RECV_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(format!("recv failed: {e}")),
            Err(_) => break, // recv timed out: stop accumulating
        };
        accumulated.extend_from_slice(&buf[..n]);
        if buf[..n].ends_with(&[0xFF, 0xFF, 0xFF, 0xFF]) {
            break;
        }
    }
    Ok(accumulated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use tokio::net::UdpSocket as TokioUdpSocket;

    async fn fake_upstream_single_datagram(reply: Vec<u8>) -> SocketAddr {
        let socket = TokioUdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&reply, peer).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn sweep_once_skips_ineligible_endpoints() {
        let registry = Arc::new(Registry::open_in_memory().await.unwrap());
        // No heartbeat observed for this endpoint: not sweep_eligible, so it
        // must not be probed (no listening socket exists at this port, so
        // a probe attempt would just waste a 2s timeout if it ran).
        let endpoint = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 1);
        registry
            .upsert_info(endpoint, crate::registry::ServerInfo {
                name: "Foo".to_owned(),
                version: "Unknown".to_owned(),
                mod_name: "Unknown".to_owned(),
                players: 0,
                max_players: 0,
                map: "Unknown".to_owned(),
            })
            .await
            .unwrap();

        sweep_once(&registry).await.unwrap();
        assert!(!registry.probed_recently(endpoint));
    }

    #[tokio::test]
    async fn query_upstream_protocol_accumulates_until_trailing_sentinel() {
        let mut body = vec![0u8; 22];
        body.extend_from_slice(&[10, 0, 0, 1, 0x6D, 0x3C]);
        body.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);

        let addr = fake_upstream_single_datagram(body.clone()).await;
        let accumulated = query_upstream_protocol(addr, 84).await.expect("query should succeed");
        assert_eq!(accumulated, body);
    }

    #[tokio::test]
    async fn fetch_master_servers_parses_once_over_threshold() {
        let mut body = vec![0u8; 22];
        body.extend_from_slice(&[10, 0, 0, 1, 0x6D, 0x3C]);
        body.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        let addr = fake_upstream_single_datagram(body).await;

        let endpoints = query_upstream_protocol(addr, 84).await.unwrap();
        let parsed = wire::parse_getservers_response(&endpoints);
        assert_eq!(parsed, vec![Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 0x6D3C)]);
    }
}
