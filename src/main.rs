use std::sync::Arc;

use et_masterd::config;
use et_masterd::registry::Registry;
use et_masterd::{http, listener, scheduler};
use tokio::net::UdpSocket;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = config::load_config().expect("failed to load config");
    let config = Arc::new(config);

    info!(db_path = %config.db_path, "opening registry");
    let registry = Registry::open(&config.db_path)
        .await
        .expect("failed to open registry database");
    let registry = Arc::new(registry);

    let udp_socket = UdpSocket::bind((config.udp_ip.as_str(), config.udp_port))
        .await
        .expect("failed to bind UDP listener");
    info!(udp_ip = %config.udp_ip, udp_port = config.udp_port, "udp listener bound");

    tokio::spawn(listener::run(udp_socket, Arc::clone(&registry)));
    tokio::spawn(scheduler::run_sweeper(Arc::clone(&registry)));
    tokio::spawn(scheduler::run_upstream_sync(Arc::clone(&registry), Arc::clone(&config)));

    let state = http::AppState { registry: Arc::clone(&registry) };
    let router = http::build_router(state);
    let http_addr = format!("{}:{}", config.host, config.port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .expect("failed to bind HTTP listener");
    info!(addr = %http_addr, "http read api listening");

    axum::serve(http_listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("http server error");
    info!("shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
