//! The keyed registry of known game-server endpoints.
//!
//! Record storage is backed by a single-file SQLite database via
//! `rusqlite`. Because `rusqlite::Connection` is synchronous, every query
//! runs on the blocking thread pool via `tokio::task::spawn_blocking`,
//! following `services/receiver/src/db.rs`'s `Db` wrapper. The two
//! auxiliary rate-limiting maps are plain in-memory state guarded by a
//! single `std::sync::Mutex`, per `spec.md` §4.6.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::RegistryError;
use crate::wire::InfoResponse;

/// Sweeper probes an endpoint only if its last probe is at least this old
/// (or has never happened).
pub const PROBE_COOLDOWN: Duration = Duration::from_secs(15);
/// Sweeper probes an endpoint only if a heartbeat was seen within this window.
pub const SWEEPER_HEARTBEAT_WINDOW: Duration = Duration::from_secs(720);
/// Records older than this are excluded from `getserversResponse` replies.
pub const GETSERVERS_LIVENESS_WINDOW: Duration = Duration::from_secs(360);
/// Records older than this are excluded from the JSON read API.
pub const JSON_API_LIVENESS_WINDOW: Duration = Duration::from_secs(1140);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS servers (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    ip              TEXT NOT NULL,
    port            INTEGER NOT NULL,
    name            TEXT NOT NULL DEFAULT 'Unknown',
    version         TEXT NOT NULL DEFAULT 'Unknown',
    mod             TEXT NOT NULL DEFAULT 'Unknown',
    players         INTEGER NOT NULL DEFAULT 0,
    max_players     INTEGER NOT NULL DEFAULT 0,
    map             TEXT NOT NULL DEFAULT 'Unknown',
    first_seen      TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_heartbeat  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(ip, port)
);
";

/// `(ip, port)` primary key shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

/// The six info fields projected out of an `infoResponse`, with defaults
/// applied, ready to upsert into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub mod_name: String,
    pub players: u32,
    pub max_players: u32,
    pub map: String,
}

impl ServerInfo {
    /// Projects a fixed record out of an open-ended `infoResponse` bag.
    /// Unknown keys are ignored; missing keys fall back to their defaults.
    pub fn from_info_response(info: &InfoResponse) -> Self {
        Self {
            name: info.get("hostname").unwrap_or("Unknown").to_owned(),
            version: info.version(),
            mod_name: info.get("game").unwrap_or("Unknown").to_owned(),
            players: info.get("clients").and_then(|v| v.parse().ok()).unwrap_or(0),
            max_players: info
                .get("sv_maxclients")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            map: info.get("mapname").unwrap_or("Unknown").to_owned(),
        }
    }
}

/// A stored registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub endpoint: Endpoint,
    pub name: String,
    pub version: String,
    pub mod_name: String,
    pub players: u32,
    pub max_players: u32,
    pub map: String,
    pub first_seen: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// In-memory rate-limiting state for one endpoint.
#[derive(Debug, Default)]
struct AuxState {
    last_probe_time: HashMap<Endpoint, Instant>,
    last_heartbeat_time: HashMap<Endpoint, Instant>,
}

/// The registry: SQLite-backed records plus in-memory auxiliary timers.
pub struct Registry {
    conn: Arc<AsyncMutex<Connection>>,
    aux: Mutex<AuxState>,
}

impl Registry {
    /// Opens (creating if absent) the SQLite file at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_owned();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open(path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
            aux: Mutex::new(AuxState::default()),
        })
    }

    /// Opens an in-memory database, for tests.
    pub async fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
            aux: Mutex::new(AuxState::default()),
        })
    }

    /// `GET /servers` support: every record whose `last_heartbeat` is within
    /// `JSON_API_LIVENESS_WINDOW`.
    pub async fn get_live_records(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        self.get_live_records_within(JSON_API_LIVENESS_WINDOW).await
    }

    /// `getserversResponse` support: every endpoint whose `last_heartbeat`
    /// is within `within` (6 minutes per `spec.md` §3).
    pub async fn get_live_endpoints(&self, within: Duration) -> Result<Vec<Endpoint>, RegistryError> {
        Ok(self
            .get_live_records_within(within)
            .await?
            .into_iter()
            .map(|r| r.endpoint)
            .collect())
    }

    async fn get_live_records_within(&self, within: Duration) -> Result<Vec<ServerRecord>, RegistryError> {
        let conn = Arc::clone(&self.conn);
        let cutoff_secs = within.as_secs() as i64;
        tokio::task::spawn_blocking(move || -> Result<Vec<ServerRecord>, rusqlite::Error> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT ip, port, name, version, mod, players, max_players, map, first_seen, last_heartbeat
                 FROM servers
                 WHERE last_heartbeat >= datetime('now', ? || ' seconds')",
            )?;
            let neg_cutoff = format!("-{cutoff_secs}");
            let rows = stmt.query_map([neg_cutoff], row_to_record_lossy)?;
            let mut records = Vec::new();
            for row in rows {
                if let Some(record) = row? {
                    records.push(record);
                }
            }
            Ok(records)
        })
        .await?
        .map_err(RegistryError::from)
    }

    /// Fetches a single record by endpoint, if present (regardless of liveness).
    pub async fn get(&self, endpoint: Endpoint) -> Result<Option<ServerRecord>, RegistryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<Option<ServerRecord>, rusqlite::Error> {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT ip, port, name, version, mod, players, max_players, map, first_seen, last_heartbeat
                 FROM servers WHERE ip = ?1 AND port = ?2",
                rusqlite::params![endpoint.ip.to_string(), endpoint.port],
                row_to_record,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })
        })
        .await?
        .map_err(RegistryError::from)
    }

    /// Inserts or updates the six info fields and refreshes `last_heartbeat`.
    /// Sets `first_seen` on insert; leaves it untouched on update.
    pub async fn upsert_info(&self, endpoint: Endpoint, info: ServerInfo) -> Result<(), RegistryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<(), rusqlite::Error> {
            let conn = conn.blocking_lock();
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM servers WHERE ip = ?1 AND port = ?2",
                    rusqlite::params![endpoint.ip.to_string(), endpoint.port],
                    |row| row.get(0),
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    e => Err(e),
                })?;

            if existing.is_some() {
                conn.execute(
                    "UPDATE servers SET name=?1, version=?2, mod=?3, players=?4, max_players=?5,
                         map=?6, last_heartbeat=CURRENT_TIMESTAMP
                     WHERE ip=?7 AND port=?8",
                    rusqlite::params![
                        info.name,
                        info.version,
                        info.mod_name,
                        info.players,
                        info.max_players,
                        info.map,
                        endpoint.ip.to_string(),
                        endpoint.port,
                    ],
                )?;
            } else {
                conn.execute(
                    "INSERT INTO servers (ip, port, name, version, mod, players, max_players, map)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        endpoint.ip.to_string(),
                        endpoint.port,
                        info.name,
                        info.version,
                        info.mod_name,
                        info.players,
                        info.max_players,
                        info.map,
                    ],
                )?;
            }
            Ok(())
        })
        .await?
        .map_err(RegistryError::from)
    }

    /// Inserts a stub record with all defaults, if one does not already
    /// exist for this endpoint. Existing records are left untouched — their
    /// info comes from the Prober, not upstream sync.
    pub async fn insert_stub_if_absent(&self, endpoint: Endpoint) -> Result<(), RegistryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<(), rusqlite::Error> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR IGNORE INTO servers (ip, port) VALUES (?1, ?2)",
                rusqlite::params![endpoint.ip.to_string(), endpoint.port],
            )?;
            Ok(())
        })
        .await?
        .map_err(RegistryError::from)
    }

    /// Snapshots every known endpoint, live or stale.
    pub async fn all_endpoints(&self) -> Result<Vec<Endpoint>, RegistryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<Vec<Endpoint>, rusqlite::Error> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare("SELECT ip, port FROM servers")?;
            let rows = stmt.query_map([], |row| {
                let ip: String = row.get(0)?;
                let port: u16 = row.get(1)?;
                Ok(Endpoint::new(ip.parse().unwrap_or(Ipv4Addr::UNSPECIFIED), port))
            })?;
            rows.collect()
        })
        .await?
        .map_err(RegistryError::from)
    }

    /// Verifies the database is reachable, for `/readyz`.
    pub async fn is_healthy(&self) -> bool {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
        })
        .await
        .unwrap_or(false)
    }

    // -- Auxiliary rate-limiting state -------------------------------------

    /// True if `last_probe_time[endpoint]` is within the last 15 seconds.
    pub fn probed_recently(&self, endpoint: Endpoint) -> bool {
        let aux = self.aux.lock().expect("aux mutex poisoned");
        aux.last_probe_time
            .get(&endpoint)
            .is_some_and(|t| t.elapsed() < PROBE_COOLDOWN)
    }

    /// Unconditionally marks `endpoint` as probed "now", regardless of outcome.
    pub fn mark_probed(&self, endpoint: Endpoint) {
        let mut aux = self.aux.lock().expect("aux mutex poisoned");
        aux.last_probe_time.insert(endpoint, Instant::now());
    }

    /// Atomically marks `endpoint` as both probed and heartbeating "now",
    /// for the heartbeat handler's §4.3 step 3.
    pub fn mark_heartbeat(&self, endpoint: Endpoint) {
        let mut aux = self.aux.lock().expect("aux mutex poisoned");
        let now = Instant::now();
        aux.last_probe_time.insert(endpoint, now);
        aux.last_heartbeat_time.insert(endpoint, now);
    }

    /// Sweeper eligibility per `spec.md` §4.4: a fresh-enough heartbeat and
    /// a cooled-down probe, evaluated as a single atomic read of both maps.
    pub fn sweep_eligible(&self, endpoint: Endpoint) -> bool {
        let aux = self.aux.lock().expect("aux mutex poisoned");
        let heartbeat_ok = aux
            .last_heartbeat_time
            .get(&endpoint)
            .is_some_and(|t| t.elapsed() <= SWEEPER_HEARTBEAT_WINDOW);
        let query_needed = aux
            .last_probe_time
            .get(&endpoint)
            .is_none_or(|t| t.elapsed() >= PROBE_COOLDOWN);
        heartbeat_ok && query_needed
    }

    #[cfg(test)]
    async fn backdate_last_heartbeat(&self, endpoint: Endpoint, seconds_ago: i64) -> Result<(), RegistryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<(), rusqlite::Error> {
            let conn = conn.blocking_lock();
            conn.execute(
                "UPDATE servers SET last_heartbeat = datetime('now', ?1 || ' seconds') WHERE ip = ?2 AND port = ?3",
                rusqlite::params![-seconds_ago, endpoint.ip.to_string(), endpoint.port],
            )?;
            Ok(())
        })
        .await?
        .map_err(RegistryError::from)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ServerRecord> {
    let ip: String = row.get(0)?;
    let port: u16 = row.get(1)?;
    let first_seen: String = row.get(8)?;
    let last_heartbeat: String = row.get(9)?;
    Ok(ServerRecord {
        endpoint: Endpoint::new(ip.parse().unwrap_or(Ipv4Addr::UNSPECIFIED), port),
        name: row.get(2)?,
        version: row.get(3)?,
        mod_name: row.get(4)?,
        players: row.get::<_, i64>(5)? as u32,
        max_players: row.get::<_, i64>(6)? as u32,
        map: row.get(7)?,
        first_seen: parse_sqlite_timestamp(&first_seen),
        last_heartbeat: parse_sqlite_timestamp(&last_heartbeat),
    })
}

/// Like `row_to_record`, but a stored IP that fails octet parsing is
/// skipped with a warning instead of aborting the whole query — matching
/// the getservers handler's "skip, don't abort" policy for bad addresses.
fn row_to_record_lossy(row: &rusqlite::Row) -> rusqlite::Result<Option<ServerRecord>> {
    let ip: String = row.get(0)?;
    if ip.parse::<Ipv4Addr>().is_err() {
        tracing::warn!(%ip, "skipping record with unparseable IP");
        return Ok(None);
    }
    row_to_record(row).map(Some)
}

fn parse_sqlite_timestamp(s: &str) -> DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

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
    async fn upsert_then_get_round_trips() {
        let registry = Registry::open_in_memory().await.unwrap();
        let endpoint = Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 27960);
        registry.upsert_info(endpoint, sample_info()).await.unwrap();

        let record = registry.get(endpoint).await.unwrap().expect("record exists");
        assert_eq!(record.name, "Foo");
        assert_eq!(record.players, 3);
        assert_eq!(record.max_players, 20);
        assert_eq!(record.first_seen, record.last_heartbeat);
    }

    #[tokio::test]
    async fn upsert_preserves_first_seen_on_update() {
        let registry = Registry::open_in_memory().await.unwrap();
        let endpoint = Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 27960);
        registry.upsert_info(endpoint, sample_info()).await.unwrap();
        let first = registry.get(endpoint).await.unwrap().unwrap();

        let mut updated = sample_info();
        updated.players = 7;
        registry.upsert_info(endpoint, updated).await.unwrap();
        let second = registry.get(endpoint).await.unwrap().unwrap();

        assert_eq!(first.first_seen, second.first_seen);
        assert_eq!(second.players, 7);
    }

    #[tokio::test]
    async fn insert_stub_if_absent_does_not_clobber_existing() {
        let registry = Registry::open_in_memory().await.unwrap();
        let endpoint = Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 27960);
        registry.upsert_info(endpoint, sample_info()).await.unwrap();
        registry.insert_stub_if_absent(endpoint).await.unwrap();

        let record = registry.get(endpoint).await.unwrap().unwrap();
        assert_eq!(record.name, "Foo");
    }

    #[tokio::test]
    async fn insert_stub_if_absent_creates_defaults() {
        let registry = Registry::open_in_memory().await.unwrap();
        let endpoint = Endpoint::new(Ipv4Addr::new(5, 6, 7, 8), 27961);
        registry.insert_stub_if_absent(endpoint).await.unwrap();

        let record = registry.get(endpoint).await.unwrap().unwrap();
        assert_eq!(record.name, "Unknown");
        assert_eq!(record.players, 0);
    }

    #[test]
    fn probe_cooldown_short_circuits_within_window() {
        let registry = block_on_open_in_memory();
        let endpoint = Endpoint::new(Ipv4Addr::new(9, 9, 9, 9), 1234);
        assert!(!registry.probed_recently(endpoint));
        registry.mark_probed(endpoint);
        assert!(registry.probed_recently(endpoint));
    }

    #[test]
    fn sweep_eligibility_requires_fresh_heartbeat_and_cooled_probe() {
        let registry = block_on_open_in_memory();
        let endpoint = Endpoint::new(Ipv4Addr::new(9, 9, 9, 9), 1234);
        assert!(!registry.sweep_eligible(endpoint));

        registry.mark_heartbeat(endpoint);
        // just heartbeated => probe also just happened => cooldown blocks it
        assert!(!registry.sweep_eligible(endpoint));
    }

    /// These two tests exercise only the sync `aux` state, so a full tokio
    /// test harness isn't needed — just enough of a runtime to open the
    /// in-memory database once at setup.
    fn block_on_open_in_memory() -> Registry {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(Registry::open_in_memory()).unwrap()
    }

    #[tokio::test]
    async fn all_endpoints_lists_both_stubs_and_full_records() {
        let registry = Registry::open_in_memory().await.unwrap();
        let a = Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 1);
        let b = Endpoint::new(Ipv4Addr::new(2, 2, 2, 2), 2);
        registry.upsert_info(a, sample_info()).await.unwrap();
        registry.insert_stub_if_absent(b).await.unwrap();

        let mut endpoints = registry.all_endpoints().await.unwrap();
        endpoints.sort_by_key(|e| e.port);
        assert_eq!(endpoints, vec![a, b]);
    }

    #[tokio::test]
    async fn stale_record_excluded_from_getservers_and_json_views() {
        let registry = Registry::open_in_memory().await.unwrap();
        let endpoint = Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 27960);
        registry.upsert_info(endpoint, sample_info()).await.unwrap();

        registry.backdate_last_heartbeat(endpoint, 20 * 60).await.unwrap();

        let live = registry
            .get_live_endpoints(GETSERVERS_LIVENESS_WINDOW)
            .await
            .unwrap();
        assert!(!live.contains(&endpoint));

        let visible = registry.get_live_records().await.unwrap();
        assert!(!visible.iter().any(|r| r.endpoint == endpoint));
    }

    #[tokio::test]
    async fn record_stale_for_getservers_but_still_visible_in_json_api() {
        let registry = Registry::open_in_memory().await.unwrap();
        let endpoint = Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 27960);
        registry.upsert_info(endpoint, sample_info()).await.unwrap();

        // 10 minutes: past the 6-minute getservers window, inside the 19-minute JSON window.
        registry.backdate_last_heartbeat(endpoint, 10 * 60).await.unwrap();

        let live = registry
            .get_live_endpoints(GETSERVERS_LIVENESS_WINDOW)
            .await
            .unwrap();
        assert!(!live.contains(&endpoint));

        let visible = registry.get_live_records().await.unwrap();
        assert!(visible.iter().any(|r| r.endpoint == endpoint));
    }
}
