//! Load config from file and environment.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mirror_core::chunk::{DEFAULT_CHUNK_SIZE, MAX_SLOTS_PER_CONNECTION};
use mirror_core::PeerIdentity;

/// Node configuration. File: ~/.config/mirror/config.toml or /etc/mirror/config.toml.
/// Env overrides: MIRROR_LISTEN_PORT, MIRROR_CACHE_DIR, MIRROR_SECRET, MIRROR_MAX_TRANSFERS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local character name.
    #[serde(default)]
    pub name: String,
    /// Local character world.
    #[serde(default)]
    pub world: String,
    /// Shared secret mixed into every fingerprint.
    #[serde(default)]
    pub secret: String,
    /// TCP listen port (default 45800).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Rendezvous base URLs, tried in order.
    #[serde(default)]
    pub rendezvous: Vec<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
    #[serde(default = "default_liveness_secs")]
    pub liveness_secs: u64,
    #[serde(default = "default_publish_millis")]
    pub publish_millis: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_delay_millis")]
    pub chunk_delay_millis: u64,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// Blobs published by the built-in static adapter (adapter key -> blob).
    #[serde(default)]
    pub state: BTreeMap<String, String>,
    /// Trusted peers.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub name: String,
    pub world: String,
    /// Fixed "host:port"; skips rendezvous lookup.
    #[serde(default)]
    pub address: Option<String>,
}

impl PeerConfig {
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(&self.name, &self.world)
    }
}

fn default_listen_port() -> u16 {
    45800
}
fn default_cache_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/mirror/cache"),
        None => PathBuf::from("mirror-cache"),
    }
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_reconnect_secs() -> u64 {
    10
}
fn default_liveness_secs() -> u64 {
    5
}
fn default_publish_millis() -> u64 {
    500
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_max_concurrent_transfers() -> usize {
    4
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_chunk_delay_millis() -> u64 {
    1
}
fn default_retry_backoff_secs() -> u64 {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_chunk_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            world: String::new(),
            secret: String::new(),
            listen_port: default_listen_port(),
            cache_dir: default_cache_dir(),
            rendezvous: Vec::new(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_secs: default_reconnect_secs(),
            liveness_secs: default_liveness_secs(),
            publish_millis: default_publish_millis(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            chunk_size: default_chunk_size(),
            chunk_delay_millis: default_chunk_delay_millis(),
            retry_backoff_secs: default_retry_backoff_secs(),
            max_attempts: default_max_attempts(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            state: BTreeMap::new(),
            peers: Vec::new(),
        }
    }
}

impl Config {
    pub fn local_identity(&self) -> PeerIdentity {
        PeerIdentity::new(&self.name, &self.world)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs.max(1))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_secs.max(1))
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_millis.max(10))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    /// Global cap, clamped so one connection never needs more slots than exist.
    pub fn transfer_cap(&self) -> usize {
        self.max_concurrent_transfers
            .clamp(1, MAX_SLOTS_PER_CONNECTION)
    }

    /// Check fields that have no usable default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() || self.world.trim().is_empty() {
            return Err(ConfigError::Missing("name and world"));
        }
        if self.secret.is_empty() {
            return Err(ConfigError::Missing("secret"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive"));
        }
        Ok(())
    }

    /// Apply MIRROR_* environment overrides from `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(p) = lookup("MIRROR_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.listen_port = p;
        }
        if let Some(dir) = lookup("MIRROR_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(secret) = lookup("MIRROR_SECRET") {
            self.secret = secret;
        }
        if let Some(n) = lookup("MIRROR_MAX_TRANSFERS").and_then(|s| s.parse::<usize>().ok()) {
            self.max_concurrent_transfers = n;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Load config: explicit path if given (errors are fatal), else the first default path that
/// exists, else defaults; then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_default_file().unwrap_or_default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/mirror/config.toml"));
    }
    out.push(PathBuf::from("/etc/mirror/config.toml"));
    out
}

fn load_default_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!("ignoring config: {}", e);
            None
        }
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let c: Config = toml::from_str(
            r#"
            name = "Alice"
            world = "Lich"
            secret = "s"
            listen_port = 5000
            rendezvous = ["http://a.example", "http://b.example"]
            max_concurrent_transfers = 8

            [state]
            appearance = "blob"

            [[peers]]
            name = "Bob"
            world = "Odin"
            address = "10.0.0.2:5000"
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.rendezvous.len(), 2);
        assert_eq!(c.transfer_cap(), 8);
        assert_eq!(c.peers[0].identity(), PeerIdentity::new("Bob", "Odin"));
        assert_eq!(c.state.get("appearance").map(String::as_str), Some("blob"));
        assert_eq!(c.heartbeat_secs, 5);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("bogus = 1").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut c = Config::default();
        c.apply_env(|k| match k {
            "MIRROR_LISTEN_PORT" => Some("6000".into()),
            "MIRROR_SECRET" => Some("from-env".into()),
            "MIRROR_MAX_TRANSFERS" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.secret, "from-env");
        assert_eq!(c.max_concurrent_transfers, 4);
    }

    #[test]
    fn transfer_cap_is_clamped() {
        let c = Config {
            max_concurrent_transfers: 10_000,
            ..Config::default()
        };
        assert_eq!(c.transfer_cap(), MAX_SLOTS_PER_CONNECTION);
        let c = Config {
            max_concurrent_transfers: 0,
            ..Config::default()
        };
        assert_eq!(c.transfer_cap(), 1);
    }

    #[test]
    fn validate_requires_identity_and_secret() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
