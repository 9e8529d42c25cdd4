//! Configuration system for Conclave.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CONCLAVE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/conclave/config.toml
//!   3. ~/.config/conclave/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
///
/// The protocol core consumes these as opaque settings threaded through
/// construction; nothing reads them ad hoc at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConclaveConfig {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address for the stream transport.
    pub listen_addr: String,
    /// TCP port for client connections.
    pub port: u16,
    /// UDP port for unreliable channel datagrams. 0 = same as `port`.
    pub datagram_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long a caller waits for a correlated reply before failing
    /// with TimedOut.
    pub reply_timeout_ms: u64,
    /// How long a deferred authorization may stay pending before the
    /// original caller is failed.
    pub authorize_timeout_ms: u64,
    /// Interval for the session-table snapshot log line.
    pub keep_alive_secs: u64,
    /// Period of the stale-pending-authorization sweep.
    pub cleanup_period_secs: u64,
    /// Per-connection event queue depth. Events past this are dropped
    /// for that connection (and logged).
    pub max_pending_events: usize,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for ConclaveConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 4461,
            datagram_port: 0,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 30_000,
            authorize_timeout_ms: 60_000,
            keep_alive_secs: 30,
            cleanup_period_secs: 10,
            max_pending_events: 1024,
        }
    }
}

impl ProtocolConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn authorize_timeout(&self) -> Duration {
        Duration::from_millis(self.authorize_timeout_ms)
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("conclave")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl ConclaveConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ConclaveConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CONCLAVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ConclaveConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CONCLAVE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CONCLAVE_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("CONCLAVE_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("CONCLAVE_NETWORK__DATAGRAM_PORT") {
            if let Ok(p) = v.parse() {
                self.network.datagram_port = p;
            }
        }
        if let Ok(v) = std::env::var("CONCLAVE_PROTOCOL__REPLY_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.protocol.reply_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("CONCLAVE_PROTOCOL__AUTHORIZE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.protocol.authorize_timeout_ms = ms;
            }
        }
    }
}
