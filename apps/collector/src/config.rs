//! Collector configuration: YAML file + `HONEYGRID_*` overrides.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use hg_notify::NotificationsConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CollectorConfig {
    pub server: ServerSection,
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub database: DatabaseSection,
    pub security: SecuritySection,
    /// Capacity of the bounded queue feeding the dashboard.
    pub ui_queue_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9000,
            ca_cert: "certs/ca.crt".into(),
            server_cert: "certs/server.crt".into(),
            server_key: "certs/server.key".into(),
            database: DatabaseSection::default(),
            security: SecuritySection::default(),
            ui_queue_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
    pub passphrase: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: "data/honeygrid.db".into(),
            passphrase: "change_this_passphrase".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub nonce_cache_size: usize,
    /// Seconds of silence before an agent is considered offline.
    pub agent_timeout_seconds: u64,
    /// Interval of the liveness sweep.
    pub health_check_interval_seconds: u64,
    /// TLS handshake deadline.
    pub handshake_timeout_seconds: u64,
    /// Grace period for in-flight sessions at shutdown.
    pub shutdown_grace_seconds: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            nonce_cache_size: 1000,
            agent_timeout_seconds: 90,
            health_check_interval_seconds: 30,
            handshake_timeout_seconds: 10,
            shutdown_grace_seconds: 5,
        }
    }
}

impl CollectorConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // The serialized defaults give environment overrides a full tree to
        // resolve multi-word keys against.
        let defaults =
            serde_yaml::to_value(CollectorConfig::default()).context("serialize defaults")?;
        hg_config::load(path, defaults)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip = IpAddr::from_str(&self.server.host)
            .with_context(|| format!("invalid bind address {}", self.server.host))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let config = CollectorConfig::load(None).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.security.nonce_cache_size, 1000);
        assert_eq!(config.server.security.agent_timeout_seconds, 90);
        assert!(!config.notifications.enabled);
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 9100\n  security:\n    agent_timeout_seconds: 45\n"
        )
        .unwrap();
        let config = CollectorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.security.agent_timeout_seconds, 45);
        // Untouched values keep their defaults.
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = CollectorConfig::load(Some(Path::new("/nonexistent/honeygrid.yaml"))).unwrap();
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn invalid_host_rejected() {
        let mut config = CollectorConfig::default();
        config.server.host = "not-an-ip".into();
        assert!(config.bind_addr().is_err());
    }
}
