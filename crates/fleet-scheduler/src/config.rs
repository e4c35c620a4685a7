//! Configuration for the scheduler daemon

use fleet_core::{Error, LoggingConfig, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Role of a scheduler instance in the primary/standby pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts submissions and emits dispatches
    Primary,
    /// Serves reads only, awaiting failover
    Standby,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Standby => write!(f, "standby"),
        }
    }
}

/// Complete configuration for the scheduler daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Instance identifier, echoed in Ping responses
    pub scheduler_id: String,

    /// Server bind addresses
    pub server: ServerConfig,

    /// Scheduling behavior
    pub scheduling: SchedulingConfig,

    /// Quota split between the two priority classes
    pub quota: QuotaConfig,

    /// Agent liveness tracking
    pub agent: AgentLivenessConfig,

    /// Dispatch delivery
    pub dispatch: DispatchConfig,

    /// Primary/standby pairing
    pub replication: ReplicationConfig,

    /// Snapshot storage
    pub storage: StorageConfig,

    /// Logging
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Agent RPC bind address
    pub grpc_addr: SocketAddr,

    /// REST API bind address
    pub http_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Role of this instance
    pub role: Role,

    /// Fixed tick between scheduling cycles (seconds)
    pub schedule_interval_seconds: u64,

    /// Fixed tick between periodic snapshots (seconds)
    pub snapshot_interval_seconds: u64,

    /// Fixed RNG seed for GPU selection; unset means entropy-seeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Fraction of the fleet reserved for the online (high) class; the
    /// batch class gets the complement
    pub online_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLivenessConfig {
    /// Seconds without a heartbeat before an agent is declared offline
    pub heartbeat_timeout_seconds: u64,

    /// Seconds between sweeper passes
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum queued dispatches per agent; agents at the bound are
    /// excluded from candidate selection until drained
    pub queue_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Address of the peer scheduler, if paired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_addr: Option<String>,

    /// Seconds between peer pings
    pub ping_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding state.json
    pub snapshot_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_id: "scheduler-1".to_string(),
            server: ServerConfig {
                grpc_addr: "0.0.0.0:50051".parse().unwrap(),
                http_addr: "0.0.0.0:8080".parse().unwrap(),
            },
            scheduling: SchedulingConfig {
                role: Role::Primary,
                schedule_interval_seconds: 5,
                snapshot_interval_seconds: 30,
                selection_seed: None,
            },
            quota: QuotaConfig {
                online_fraction: 0.7,
            },
            agent: AgentLivenessConfig {
                heartbeat_timeout_seconds: 30,
                sweep_interval_seconds: 10,
            },
            dispatch: DispatchConfig { queue_limit: 1024 },
            replication: ReplicationConfig {
                peer_addr: None,
                ping_interval_seconds: 5,
            },
            storage: StorageConfig {
                snapshot_dir: PathBuf::from("/var/lib/gpufleet"),
            },
            logging: LoggingConfig::default(),
        }
    }
}

impl SchedulerConfig {
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
        if self.scheduler_id.is_empty() {
            return Err(Error::config("scheduler_id cannot be empty"));
        }
        if !(0.0..=1.0).contains(&self.quota.online_fraction) {
            return Err(Error::config(
                "quota.online_fraction must be within [0, 1]",
            ));
        }
        if self.scheduling.schedule_interval_seconds == 0 {
            return Err(Error::config("scheduling.schedule_interval_seconds must be positive"));
        }
        if self.scheduling.snapshot_interval_seconds == 0 {
            return Err(Error::config("scheduling.snapshot_interval_seconds must be positive"));
        }
        if self.agent.heartbeat_timeout_seconds == 0 {
            return Err(Error::config("agent.heartbeat_timeout_seconds must be positive"));
        }
        if self.dispatch.queue_limit == 0 {
            return Err(Error::config("dispatch.queue_limit must be positive"));
        }
        self.logging.validate()?;
        Ok(())
    }

    /// Fraction of the fleet assigned to the batch class
    pub fn batch_fraction(&self) -> f64 {
        1.0 - self.quota.online_fraction
    }
}
