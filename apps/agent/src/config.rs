//! Agent configuration: YAML file + `HONEYGRID_*` overrides.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub agent_id: String,
    pub server: ServerSection,
    pub certificates: CertificatesSection,
    pub monitoring: MonitoringSection,
    pub heartbeat: HeartbeatSection,
    pub rate_limit: RateLimitSection,
    pub reconnect_delay_seconds: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            agent_id: "agent-001".into(),
            server: ServerSection::default(),
            certificates: CertificatesSection::default(),
            monitoring: MonitoringSection::default(),
            heartbeat: HeartbeatSection::default(),
            rate_limit: RateLimitSection::default(),
            reconnect_delay_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 9000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificatesSection {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl Default for CertificatesSection {
    fn default() -> Self {
        Self {
            ca_cert: "certs/ca.crt".into(),
            client_cert: PathBuf::new(),
            client_key: PathBuf::new(),
        }
    }
}

impl CertificatesSection {
    /// Fills the per-agent default paths (`certs/client_<id>.crt` / `.key`)
    /// where no explicit path was configured.
    pub fn resolve_defaults(&mut self, agent_id: &str) {
        if self.client_cert.as_os_str().is_empty() {
            self.client_cert = PathBuf::from(format!("certs/client_{agent_id}.crt"));
        }
        if self.client_key.as_os_str().is_empty() {
            self.client_key = PathBuf::from(format!("certs/client_{agent_id}.key"));
        }
    }
}

/// One monitored decoy: the path under watch and the token it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchPath {
    pub path: PathBuf,
    pub token_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub watch_paths: Vec<WatchPath>,
    /// Poll access times and report `accessed` events. Only meaningful on
    /// filesystems that track atime.
    pub watch_atime: bool,
    pub atime_interval_seconds: u64,
    /// Track content hashes of monitored files.
    pub hash_tracking: bool,
    /// Identify the process holding a touched decoy (Linux only).
    pub capture_process_info: bool,
    pub queue_size: usize,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            watch_paths: Vec::new(),
            watch_atime: false,
            atime_interval_seconds: 1,
            hash_tracking: true,
            capture_process_info: true,
            queue_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_seconds: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub events_per_second: f64,
    pub burst: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            events_per_second: 10.0,
            burst: 20,
        }
    }
}

impl AgentConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // The serialized defaults give environment overrides a full tree to
        // resolve multi-word keys against.
        let defaults = serde_yaml::to_value(AgentConfig::default())
            .map_err(|err| anyhow::anyhow!("serialize defaults: {err}"))?;
        let mut config: AgentConfig = hg_config::load(path, defaults)?;
        let agent_id = config.agent.agent_id.clone();
        config.agent.certificates.resolve_defaults(&agent_id);
        Ok(config)
    }
}
