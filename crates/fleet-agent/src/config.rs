//! Configuration for the agent daemon

use crate::executor::ExecMethod;
use crate::gpu::DetectionMethod;
use fleet_core::{Error, LoggingConfig, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete configuration for the agent daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub scheduler: SchedulerSection,
    pub gpu: GpuSection,
    pub executor: ExecutorSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent identifier; doubles as the node id in GPU ids
    pub id: String,

    /// Seconds between heartbeats
    pub heartbeat_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Primary scheduler endpoint, e.g. "http://10.0.0.2:50051"
    pub primary_addr: String,

    /// Standby scheduler endpoint for failover
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby_addr: Option<String>,

    /// Seconds to wait before reconnecting after a lost session
    pub retry_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSection {
    pub detection_method: DetectionMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSection {
    pub method: ExecMethod,

    /// Working directory for task processes and their log files
    pub work_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentSection {
                id: default_agent_id(),
                heartbeat_interval_seconds: 10,
            },
            scheduler: SchedulerSection {
                primary_addr: "http://127.0.0.1:50051".to_string(),
                standby_addr: None,
                retry_interval_seconds: 5,
            },
            gpu: GpuSection {
                detection_method: DetectionMethod::NvidiaSmi,
            },
            executor: ExecutorSection {
                method: ExecMethod::Process,
                work_dir: PathBuf::from("/var/lib/gpufleet/tasks"),
            },
            logging: LoggingConfig::default(),
        }
    }
}

fn default_agent_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "fleet-agent".to_string())
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = fleet_core::load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        fleet_core::save_yaml(self, path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.agent.id.is_empty() {
            return Err(Error::config("agent.id cannot be empty"));
        }
        if self.agent.heartbeat_interval_seconds == 0 {
            return Err(Error::config("agent.heartbeat_interval_seconds must be positive"));
        }
        if self.scheduler.primary_addr.is_empty() {
            return Err(Error::config("scheduler.primary_addr is required"));
        }
        self.logging.validate()?;
        Ok(())
    }
}
