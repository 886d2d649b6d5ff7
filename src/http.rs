//! The read-only HTTP API: `GET /servers`, `/healthz`, `/readyz`.
//!
//! Grounded on `services/server/src/lib.rs::build_router` (axum `Router` +
//! `tower_http` CORS + a small `health` submodule for the liveness/readiness
//! pair), with CORS permissive per `spec.md` §6 "CORS is open".

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::registry::{Registry, ServerRecord};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/servers", get(get_servers))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// JSON shape for one `GET /servers` entry: `ip, port, name, version, mod,
/// players, max_players, map, first_seen, last_heartbeat`.
#[derive(Debug, Serialize)]
struct ServerJson {
    ip: String,
    port: u16,
    name: String,
    version: String,
    #[serde(rename = "mod")]
    mod_name: String,
    players: u32,
    max_players: u32,
    map: String,
    first_seen: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl From<ServerRecord> for ServerJson {
    fn from(r: ServerRecord) -> Self {
        Self {
            ip: r.endpoint.ip.to_string(),
            port: r.endpoint.port,
            name: r.name,
            version: r.version,
            mod_name: r.mod_name,
            players: r.players,
            max_players: r.max_players,
            map: r.map,
            first_seen: r.first_seen,
            last_heartbeat: r.last_heartbeat,
        }
    }
}

async fn get_servers(State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.get_live_records().await {
        Ok(records) => {
            let body: Vec<ServerJson> = records.into_iter().map(ServerJson::from).collect();
            Json(body).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to read registry for /servers");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.registry.is_healthy().await {
        (axum::http::StatusCode::OK, "ok")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    fn app(registry: Registry) -> Router {
        build_router(AppState { registry: Arc::new(registry) })
    }

    #[tokio::test]
    async fn servers_endpoint_returns_live_records_as_json() {
        let registry = Registry::open_in_memory().await.unwrap();
        registry
            .upsert_info(
                crate::registry::Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 27960),
                crate::registry::ServerInfo {
                    name: "Foo".to_owned(),
                    version: "ET 2.60b linux-i386 May 8 2006".to_owned(),
                    mod_name: "etmain".to_owned(),
                    players: 3,
                    max_players: 20,
                    map: "oasis".to_owned(),
                },
            )
            .await
            .unwrap();

        let response = app(registry)
            .oneshot(Request::builder().uri("/servers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed[0]["name"], "Foo");
        assert_eq!(parsed[0]["mod"], "etmain");
    }

    #[tokio::test]
    async fn healthz_always_ok() {
        let registry = Registry::open_in_memory().await.unwrap();
        let response = app(registry)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_ok_when_registry_reachable() {
        let registry = Registry::open_in_memory().await.unwrap();
        let response = app(registry)
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
