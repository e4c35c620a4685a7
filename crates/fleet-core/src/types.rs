//! Core type definitions for gpufleet

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status of a GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuStatus {
    /// Available for allocation
    Idle,
    /// Held by a running task
    Busy,
    /// Owning agent is unreachable
    Offline,
}

impl std::str::FromStr for GpuStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(GpuStatus::Idle),
            "busy" => Ok(GpuStatus::Busy),
            "offline" => Ok(GpuStatus::Offline),
            _ => Err(format!("Unknown GPU status: {}", s)),
        }
    }
}

impl fmt::Display for GpuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuStatus::Idle => write!(f, "idle"),
            GpuStatus::Busy => write!(f, "busy"),
            GpuStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A single accelerator device owned by an agent node.
///
/// GPUs are stored flat in the scheduler state, keyed by `id`; the owning
/// agent record holds only the id list. All cross-references are string ids,
/// never object graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    /// Globally unique id, conventionally `"<node_id>-gpu-<device_index>"`
    pub id: String,
    /// Owning node
    pub node_id: String,
    /// Device index local to the node
    pub device_index: u32,
    /// Hardware model, free-form (e.g. "A100")
    pub model: String,
    /// Total device memory in bytes
    pub memory_bytes: u64,
    pub status: GpuStatus,
    /// Set exactly when status is Busy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Gpu {
    /// Build the conventional GPU id for a device on a node
    pub fn make_id(node_id: &str, device_index: u32) -> String {
        format!("{}-gpu-{}", node_id, device_index)
    }
}

/// Task priority class; each class has an independent quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Online workloads, attempted first
    High,
    /// Batch workloads
    Low,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued, awaiting allocation
    Pending,
    /// Allocated and dispatched
    Running,
    Success,
    Failed,
    /// Deleted before it ever ran
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work requesting GPUs to run an opaque command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub priority: Priority,
    /// Number of GPUs required, at least 1
    pub gpu_count: u32,
    /// Optional hardware model filter; only matching GPUs are candidates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
    pub command: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    pub status: TaskStatus,
    /// Populated exactly while Running, |assigned_gpu_ids| == gpu_count
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assigned_gpu_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// First delivery of the dispatch to the owning agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Create a new Pending task
    pub fn new(
        id: impl Into<String>,
        priority: Priority,
        gpu_count: u32,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            gpu_count,
            gpu_model: None,
            command: command.into(),
            env: HashMap::new(),
            status: TaskStatus::Pending,
            assigned_gpu_ids: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            dispatched_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Restrict candidate GPUs to a hardware model
    pub fn with_gpu_model(mut self, model: impl Into<String>) -> Self {
        self.gpu_model = Some(model.into());
        self
    }

    /// Attach environment variables for the executing process
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Liveness status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A worker process on a node that owns local GPUs and executes dispatches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub address: String,
    /// Ids of the GPUs this agent owns; the devices themselves live in the
    /// flat GPU index
    pub gpu_ids: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
}

/// Global quota record partitioning capacity between the two classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quota {
    pub total_gpus: u32,
    pub online_quota: u32,
    pub batch_quota: u32,
    pub online_used: u32,
    pub batch_used: u32,
}

impl Quota {
    /// Capacity in use for a class
    pub fn used(&self, priority: Priority) -> u32 {
        match priority {
            Priority::High => self.online_used,
            Priority::Low => self.batch_used,
        }
    }

    /// Upper bound for a class
    pub fn limit(&self, priority: Priority) -> u32 {
        match priority {
            Priority::High => self.online_quota,
            Priority::Low => self.batch_quota,
        }
    }

    /// Remaining capacity for a class, saturating at zero
    pub fn available(&self, priority: Priority) -> u32 {
        self.limit(priority).saturating_sub(self.used(priority))
    }

    /// Whether `count` more GPUs fit under the class limit
    pub fn admits(&self, priority: Priority, count: u32) -> bool {
        self.used(priority) + count <= self.limit(priority)
    }
}

/// A per-GPU status report carried on an agent heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuReport {
    pub gpu_id: String,
    pub status: GpuStatus,
    pub utilization_pct: f32,
    pub memory_used_bytes: u64,
}

/// A scheduler-to-agent directive to start a task on specific local devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub task_id: String,
    pub priority: Priority,
    pub gpu_count: u32,
    pub command: String,
    pub env: HashMap<String, String>,
    /// Ids of the assigned GPUs, all owned by the receiving agent
    pub assigned_gpu_ids: Vec<String>,
    /// Device indices matching `assigned_gpu_ids`, local to the node
    pub assigned_device_indices: Vec<u32>,
}
