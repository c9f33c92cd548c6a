//! keel.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub reconciler: ReconcilerConfig,
    pub fleet: FleetConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Subject the fleet health monitor publishes feedback on.
    pub feedback_subject: String,
    /// Queue group shared by all control-plane instances.
    pub queue_group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub start_subject: String,
    pub stop_subject: String,
    pub stop_instances_subject: String,
    /// `host:port` of the fleet's HTTP command receiver. Commands are
    /// POSTed to `/{subject}` there; when unset they are only logged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_endpoint: Option<String>,
    /// Per-command delivery timeout, in milliseconds.
    pub command_timeout_ms: u64,
}

/// HTTP bridge between the bus and the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    /// Address the gateway listens on.
    pub listen: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            feedback_subject: "cloudcontrollers.hm.requests.ng".to_string(),
            queue_group: "cc".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/keel"),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            start_subject: "dea.start".to_string(),
            stop_subject: "dea.stop".to_string(),
            stop_instances_subject: "dea.stop_instances".to_string(),
            command_endpoint: None,
            command_timeout_ms: 5_000,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:8480".to_string(),
        }
    }
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeelConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
