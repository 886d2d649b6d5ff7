//! Master server configuration loading.
//!
//! JSON is the sole config source. Default config path is `./config.json`,
//! overridable via the `ET_MASTER_CONFIG` environment variable.
//!
//! All fields are optional in the document; missing fields fall back to the
//! defaults in `spec.md` §6.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Validated, defaulted master server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub udp_ip: String,
    pub udp_port: u16,
    /// Tried against each upstream in order; first protocol yielding more
    /// than 24 accumulated bytes wins (see `scheduler::fetch_master_servers`).
    pub known_protocols: Vec<u16>,
    /// Upstream master hostnames. The source's `[host, _]` pairs are
    /// collapsed to just the host — the second tuple element is read by
    /// nothing downstream and is dropped here rather than carried as dead
    /// weight (see DESIGN.md Open Questions).
    pub master_servers: Vec<String>,
    /// Path to the embedded SQLite registry file.
    pub db_path: String,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

// ---------------------------------------------------------------------------
// Raw TOML-style staging types (all-Option, mirrors forwarder config.rs)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    host: Option<String>,
    port: Option<u16>,
    use_ssl: Option<bool>,
    ssl_cert: Option<String>,
    ssl_key: Option<String>,
    udp_ip: Option<String>,
    udp_port: Option<u16>,
    known_protocols: Option<Vec<u16>>,
    master_servers: Option<Vec<(String, serde_json::Value)>>,
    db_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the path named by `ET_MASTER_CONFIG`, defaulting to
/// `./config.json`.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = std::env::var("ET_MASTER_CONFIG").unwrap_or_else(|_| "./config.json".to_owned());
    load_config_from_path(Path::new(&path))
}

pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let json_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&json_str)
}

pub fn load_config_from_str(json_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig =
        serde_json::from_str(json_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let tls = match (raw.use_ssl.unwrap_or(false), raw.ssl_cert, raw.ssl_key) {
        (false, _, _) => None,
        (true, Some(cert), Some(key)) => Some(TlsConfig { cert, key }),
        (true, _, _) => {
            return Err(ConfigError::InvalidValue(
                "use_ssl is true but ssl_cert/ssl_key are not both set".to_owned(),
            ));
        }
    };

    let known_protocols = raw.known_protocols.unwrap_or_else(|| vec![84]);
    if known_protocols.is_empty() {
        return Err(ConfigError::InvalidValue(
            "known_protocols must not be empty".to_owned(),
        ));
    }

    let master_servers = raw
        .master_servers
        .unwrap_or_default()
        .into_iter()
        .map(|(host, _ignored)| host)
        .collect();

    Ok(Config {
        host: raw.host.unwrap_or_else(|| "0.0.0.0".to_owned()),
        port: raw.port.unwrap_or(5000),
        tls,
        udp_ip: raw.udp_ip.unwrap_or_else(|| "0.0.0.0".to_owned()),
        udp_port: raw.udp_port.unwrap_or(27950),
        known_protocols,
        master_servers,
        db_path: raw.db_path.unwrap_or_else(|| "masterserver.db".to_owned()),
    })
}
