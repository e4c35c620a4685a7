//! Authoritative in-memory scheduler state
//!
//! The [`StateManager`] is the only component permitted to mutate fleet
//! state. Every mutating operation takes the write half of a single
//! readers-writer lock for the whole invariant-preserving step; observers
//! take the read half and receive cloned views. All cross-references between
//! entities are string ids into the flat GPU and task indexes.

use chrono::{DateTime, Utc};
use fleet_core::{
    Agent, AgentStatus, Error, Gpu, GpuStatus, Priority, Quota, Result, Task, TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Root of the scheduler's authoritative state.
///
/// The two queues hold ids of Pending tasks in FIFO submission order; the
/// tasks themselves live in the flat `tasks` index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetState {
    pub gpus: HashMap<String, Gpu>,
    pub tasks: HashMap<String, Task>,
    #[serde(default)]
    pub high_priority_queue: VecDeque<String>,
    #[serde(default)]
    pub low_priority_queue: VecDeque<String>,
    pub agents: HashMap<String, Agent>,
    pub quota: Quota,
    /// Last-set quota fractions; quotas are recomputed from these whenever
    /// the GPU inventory changes
    #[serde(default)]
    pub online_fraction: f64,
    #[serde(default)]
    pub batch_fraction: f64,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for FleetState {
    fn default() -> Self {
        Self {
            gpus: HashMap::new(),
            tasks: HashMap::new(),
            high_priority_queue: VecDeque::new(),
            low_priority_queue: VecDeque::new(),
            agents: HashMap::new(),
            quota: Quota::default(),
            online_fraction: 0.0,
            batch_fraction: 0.0,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

impl FleetState {
    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<String> {
        match priority {
            Priority::High => &mut self.high_priority_queue,
            Priority::Low => &mut self.low_priority_queue,
        }
    }

    /// Pending task ids for a class, in FIFO order
    pub fn queue(&self, priority: Priority) -> &VecDeque<String> {
        match priority {
            Priority::High => &self.high_priority_queue,
            Priority::Low => &self.low_priority_queue,
        }
    }

    fn used_mut(&mut self, priority: Priority) -> &mut u32 {
        match priority {
            Priority::High => &mut self.quota.online_used,
            Priority::Low => &mut self.quota.batch_used,
        }
    }

    fn recompute_quotas(&mut self) {
        let total = self.quota.total_gpus as f64;
        self.quota.online_quota = (total * self.online_fraction).floor() as u32;
        self.quota.batch_quota = (total * self.batch_fraction).floor() as u32;
    }

    /// Move a Running task to a terminal state under the write lock,
    /// returning its GPUs and quota. GPUs that have disappeared from the
    /// index (agent re-registration) are skipped; GPUs already Offline stay
    /// Offline.
    fn finish_task(&mut self, task_id: &str, status: TaskStatus, error: Option<String>) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };

        let priority = task.priority;
        let gpu_count = task.gpu_count;
        let assigned = std::mem::take(&mut task.assigned_gpu_ids);

        task.status = status;
        task.finished_at = Some(Utc::now());
        if error.is_some() {
            task.error = error;
        }

        for gpu_id in &assigned {
            if let Some(gpu) = self.gpus.get_mut(gpu_id) {
                if gpu.current_task_id.as_deref() == Some(task_id) {
                    gpu.current_task_id = None;
                    if gpu.status == GpuStatus::Busy {
                        gpu.status = GpuStatus::Idle;
                    }
                    gpu.updated_at = Utc::now();
                }
            }
        }

        let used = self.used_mut(priority);
        *used = used.saturating_sub(gpu_count);
    }
}

/// Guards all mutations of the fleet state and signals the snapshot lane.
#[derive(Clone)]
pub struct StateManager {
    state: Arc<RwLock<FleetState>>,
    snapshot_tx: mpsc::Sender<()>,
}

impl StateManager {
    /// Create an empty state manager.
    ///
    /// The returned receiver is the change-coalescing snapshot signal: one
    /// message is pending whenever at least one mutation committed since the
    /// last snapshot write.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let manager = Self {
            state: Arc::new(RwLock::new(FleetState::default())),
            snapshot_tx,
        };
        (manager, snapshot_rx)
    }

    /// Replace the entire state, used once at startup after a snapshot load.
    pub async fn restore(&self, state: FleetState) {
        let mut guard = self.state.write().await;
        *guard = state;
        info!(version = guard.version, "State restored from snapshot");
    }

    /// Clone the full state under a brief read lock.
    pub async fn view(&self) -> FleetState {
        self.state.read().await.clone()
    }

    // Bumps the version and queues a snapshot write. Must be called with the
    // write lock held, as the final step of a successful mutation.
    fn commit(&self, state: &mut FleetState) {
        state.version += 1;
        state.updated_at = Utc::now();
        // A full channel means a write is already queued.
        let _ = self.snapshot_tx.try_send(());
    }

    /// Register an agent with its GPU inventory.
    ///
    /// Idempotent on agent id collision: the previous registration is
    /// overwritten and its GPUs are treated as released. Running tasks still
    /// holding any of them are force-failed and their quota returned.
    pub async fn register_agent(&self, agent_id: &str, address: &str, gpus: Vec<Gpu>) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(previous) = state.agents.remove(agent_id) {
            let stale: Vec<String> = previous
                .gpu_ids
                .iter()
                .filter_map(|gpu_id| {
                    state
                        .gpus
                        .get(gpu_id)
                        .and_then(|gpu| gpu.current_task_id.clone())
                })
                .collect();

            for task_id in stale {
                warn!(task_id, agent_id, "Force-failing task on agent re-registration");
                state.finish_task(&task_id, TaskStatus::Failed, Some("agent re-registered".into()));
            }

            for gpu_id in &previous.gpu_ids {
                if state.gpus.remove(gpu_id).is_some() {
                    state.quota.total_gpus = state.quota.total_gpus.saturating_sub(1);
                }
            }
        }

        let gpu_ids: Vec<String> = gpus.iter().map(|gpu| gpu.id.clone()).collect();
        for gpu in gpus {
            state.quota.total_gpus += 1;
            state.gpus.insert(gpu.id.clone(), gpu);
        }
        state.recompute_quotas();

        state.agents.insert(
            agent_id.to_string(),
            Agent {
                id: agent_id.to_string(),
                address: address.to_string(),
                gpu_ids,
                last_heartbeat: Utc::now(),
                status: AgentStatus::Online,
            },
        );

        self.commit(&mut state);
        info!(agent_id, total_gpus = state.quota.total_gpus, "Agent registered");
        Ok(())
    }

    /// Refresh an agent's heartbeat and force it Online.
    pub async fn update_agent_heartbeat(&self, agent_id: &str) -> Result<()> {
        let mut state = self.state.write().await;

        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::not_found(format!("agent {}", agent_id)))?;

        agent.last_heartbeat = Utc::now();
        agent.status = AgentStatus::Online;

        self.commit(&mut state);
        Ok(())
    }

    /// Apply an externally reported GPU status transition.
    ///
    /// Only `Idle ↔ Offline` is accepted from status reports; `Busy → Busy`
    /// is a no-op. `Busy ↔ Idle` belongs to allocation and release alone and
    /// is rejected.
    pub async fn update_gpu_status(&self, gpu_id: &str, status: GpuStatus) -> Result<()> {
        let mut state = self.state.write().await;

        let gpu = state
            .gpus
            .get_mut(gpu_id)
            .ok_or_else(|| Error::not_found(format!("gpu {}", gpu_id)))?;

        match (gpu.status, status) {
            (current, reported) if current == reported => return Ok(()),
            (GpuStatus::Idle, GpuStatus::Offline) | (GpuStatus::Offline, GpuStatus::Idle) => {
                gpu.status = status;
                gpu.updated_at = Utc::now();
            }
            (current, reported) => {
                return Err(Error::conflict(format!(
                    "gpu {} transition {} -> {} not allowed from a status report",
                    gpu_id, current, reported
                )));
            }
        }

        self.commit(&mut state);
        Ok(())
    }

    /// Accept a task into its priority queue.
    pub async fn submit_task(&self, mut task: Task) -> Result<()> {
        let mut state = self.state.write().await;

        if state.tasks.contains_key(&task.id) {
            return Err(Error::conflict(format!("task {} already exists", task.id)));
        }

        task.status = TaskStatus::Pending;
        task.assigned_gpu_ids.clear();

        let id = task.id.clone();
        let priority = task.priority;
        state.tasks.insert(id.clone(), task);
        state.queue_mut(priority).push_back(id.clone());

        self.commit(&mut state);
        info!(task_id = %id, %priority, "Task submitted");
        Ok(())
    }

    /// Atomically allocate `gpu_ids` to a Pending task.
    ///
    /// Preconditions, checked under the write lock: the task is Pending,
    /// every GPU is Idle, and the class quota admits the task. A quota miss
    /// returns `QuotaExceeded`, any other miss returns `Conflict`; nothing
    /// mutates either way.
    pub async fn commit_allocation(&self, task_id: &str, gpu_ids: &[String]) -> Result<()> {
        let mut state = self.state.write().await;

        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::not_found(format!("task {}", task_id)))?;

        if task.status != TaskStatus::Pending {
            return Err(Error::conflict(format!(
                "task {} is {}, not pending",
                task_id, task.status
            )));
        }
        if gpu_ids.len() != task.gpu_count as usize {
            return Err(Error::conflict(format!(
                "task {} needs {} gpus, got {}",
                task_id,
                task.gpu_count,
                gpu_ids.len()
            )));
        }

        let priority = task.priority;
        let gpu_count = task.gpu_count;

        if !state.quota.admits(priority, gpu_count) {
            return Err(Error::quota_exceeded(format!(
                "quota for {} admits {} more gpus, task {} needs {}",
                priority,
                state.quota.available(priority),
                task_id,
                gpu_count
            )));
        }

        for gpu_id in gpu_ids {
            match state.gpus.get(gpu_id) {
                Some(gpu) if gpu.status == GpuStatus::Idle => {}
                Some(gpu) => {
                    return Err(Error::conflict(format!(
                        "gpu {} is {}, not idle",
                        gpu_id, gpu.status
                    )));
                }
                None => return Err(Error::conflict(format!("gpu {} not found", gpu_id))),
            }
        }

        // All preconditions hold; flip everything in one step.
        for gpu_id in gpu_ids {
            if let Some(gpu) = state.gpus.get_mut(gpu_id) {
                gpu.status = GpuStatus::Busy;
                gpu.current_task_id = Some(task_id.to_string());
                gpu.updated_at = Utc::now();
            }
        }

        if let Some(task) = state.tasks.get_mut(task_id) {
            task.status = TaskStatus::Running;
            task.assigned_gpu_ids = gpu_ids.to_vec();
            task.started_at = Some(Utc::now());
        }

        state.queue_mut(priority).retain(|id| id != task_id);
        *state.used_mut(priority) += gpu_count;

        self.commit(&mut state);
        debug!(task_id, ?gpu_ids, "Allocation committed");
        Ok(())
    }

    /// Record the first delivery of a task's dispatch to its agent.
    pub async fn mark_dispatched(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.write().await;

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::not_found(format!("task {}", task_id)))?;

        if task.status == TaskStatus::Running && task.dispatched_at.is_none() {
            task.dispatched_at = Some(Utc::now());
            self.commit(&mut state);
        }
        Ok(())
    }

    /// Release a Running task into a terminal state, freeing its GPUs and
    /// returning its quota.
    ///
    /// Idempotent: releasing an already-terminal task returns
    /// `AlreadyTerminal` without mutation.
    pub async fn release_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<()> {
        if !matches!(status, TaskStatus::Success | TaskStatus::Failed) {
            return Err(Error::invalid_request(format!(
                "terminal status must be success or failed, got {}",
                status
            )));
        }

        let mut state = self.state.write().await;

        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::not_found(format!("task {}", task_id)))?;

        if task.status.is_terminal() {
            return Err(Error::already_terminal(format!(
                "task {} is already {}",
                task_id, task.status
            )));
        }
        if task.status != TaskStatus::Running {
            return Err(Error::conflict(format!(
                "task {} is {}, not running",
                task_id, task.status
            )));
        }

        state.finish_task(task_id, status, error);

        self.commit(&mut state);
        info!(task_id, %status, "Task released");
        Ok(())
    }

    /// Cancel a Pending task. Running tasks cannot be cancelled; terminal
    /// tasks report `AlreadyTerminal`.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.write().await;

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::not_found(format!("task {}", task_id)))?;

        match task.status {
            TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                task.finished_at = Some(Utc::now());
                let priority = task.priority;
                state.queue_mut(priority).retain(|id| id != task_id);
                self.commit(&mut state);
                info!(task_id, "Task cancelled");
                Ok(())
            }
            TaskStatus::Running => Err(Error::conflict(format!(
                "task {} is running and cannot be cancelled",
                task_id
            ))),
            status => Err(Error::already_terminal(format!(
                "task {} is already {}",
                task_id, status
            ))),
        }
    }

    /// Set the quota fractions and recompute both class quotas.
    ///
    /// Running tasks are never evicted; a class whose usage now exceeds its
    /// quota simply admits no new work until it drains.
    pub async fn set_quota(&self, online_fraction: f64, batch_fraction: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&online_fraction) || !(0.0..=1.0).contains(&batch_fraction) {
            return Err(Error::invalid_request(
                "quota fractions must be within [0, 1]".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        state.online_fraction = online_fraction;
        state.batch_fraction = batch_fraction;
        state.recompute_quotas();

        self.commit(&mut state);
        info!(
            online_quota = state.quota.online_quota,
            batch_quota = state.quota.batch_quota,
            "Quota updated"
        );
        Ok(())
    }

    /// Declare an agent unreachable: the agent and its GPUs go Offline and
    /// every task Running on them is force-failed. Returns the reaped task
    /// ids.
    pub async fn mark_agent_offline(&self, agent_id: &str) -> Result<Vec<String>> {
        let mut state = self.state.write().await;

        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::not_found(format!("agent {}", agent_id)))?;

        agent.status = AgentStatus::Offline;
        let gpu_ids = agent.gpu_ids.clone();

        let mut reaped = Vec::new();
        for gpu_id in &gpu_ids {
            if let Some(gpu) = state.gpus.get(gpu_id) {
                if let Some(task_id) = gpu.current_task_id.clone() {
                    if !reaped.contains(&task_id) {
                        reaped.push(task_id);
                    }
                }
            }
        }

        for task_id in &reaped {
            warn!(task_id, agent_id, "Force-failing task on offline agent");
            state.finish_task(task_id, TaskStatus::Failed, Some("agent offline".into()));
        }

        for gpu_id in &gpu_ids {
            if let Some(gpu) = state.gpus.get_mut(gpu_id) {
                gpu.status = GpuStatus::Offline;
                gpu.updated_at = Utc::now();
            }
        }

        self.commit(&mut state);
        warn!(agent_id, reaped = reaped.len(), "Agent marked offline");
        Ok(reaped)
    }

    /// Online agents whose last heartbeat is older than `timeout_seconds`.
    pub async fn agents_overdue(&self, timeout_seconds: u64) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::seconds(timeout_seconds as i64);
        let state = self.state.read().await;
        state
            .agents
            .values()
            .filter(|agent| agent.status == AgentStatus::Online && agent.last_heartbeat < cutoff)
            .map(|agent| agent.id.clone())
            .collect()
    }

    /// Repair the state after a snapshot load, before anything serves.
    ///
    /// Running tasks whose assigned GPUs are not all present, Busy, and
    /// back-pointing at them are force-failed with their quota returned.
    /// Usage counters are then recomputed from the surviving Running tasks.
    /// Returns the ids of the force-failed tasks.
    pub async fn reconcile(&self) -> Vec<String> {
        let mut state = self.state.write().await;

        let broken: Vec<String> = state
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Running)
            .filter(|task| {
                task.assigned_gpu_ids.len() != task.gpu_count as usize
                    || !task.assigned_gpu_ids.iter().all(|gpu_id| {
                        state.gpus.get(gpu_id).is_some_and(|gpu| {
                            gpu.status == GpuStatus::Busy
                                && gpu.current_task_id.as_deref() == Some(task.id.as_str())
                        })
                    })
            })
            .map(|task| task.id.clone())
            .collect();

        for task_id in &broken {
            warn!(task_id, "Force-failing task lost across restart");
            state.finish_task(task_id, TaskStatus::Failed, Some("lost on restart".into()));
        }

        let mut online_used = 0;
        let mut batch_used = 0;
        for task in state.tasks.values() {
            if task.status == TaskStatus::Running {
                match task.priority {
                    Priority::High => online_used += task.gpu_count,
                    Priority::Low => batch_used += task.gpu_count,
                }
            }
        }
        state.quota.online_used = online_used;
        state.quota.batch_used = batch_used;

        if !broken.is_empty() {
            self.commit(&mut state);
        }
        broken
    }

    /// Look up a task by id.
    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let state = self.state.read().await;
        state
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("task {}", task_id)))
    }

    /// All tasks, newest first.
    pub async fn list_tasks(&self) -> Vec<Task> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// All GPUs, ordered by id.
    pub async fn list_gpus(&self) -> Vec<Gpu> {
        let state = self.state.read().await;
        let mut gpus: Vec<Gpu> = state.gpus.values().cloned().collect();
        gpus.sort_by(|a, b| a.id.cmp(&b.id));
        gpus
    }

    /// Look up an agent by id.
    pub async fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        let state = self.state.read().await;
        state
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("agent {}", agent_id)))
    }

    /// Current quota record.
    pub async fn get_quota(&self) -> Quota {
        self.state.read().await.quota
    }

    /// Current state version.
    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_gpus(node_id: &str, count: u32, model: &str) -> Vec<Gpu> {
        (0..count)
            .map(|index| Gpu {
                id: Gpu::make_id(node_id, index),
                node_id: node_id.to_string(),
                device_index: index,
                model: model.to_string(),
                memory_bytes: 40_000_000_000,
                status: GpuStatus::Idle,
                current_task_id: None,
                updated_at: Utc::now(),
            })
            .collect()
    }

    async fn manager_with_fleet(gpus_per_node: u32) -> StateManager {
        let (manager, _rx) = StateManager::new();
        manager
            .register_agent("n1", "10.0.0.1:9090", make_gpus("n1", gpus_per_node, "A100"))
            .await
            .unwrap();
        manager.set_quota(1.0, 0.0).await.unwrap();
        manager
    }

    /// Checks the cross-entity invariants that must hold on every external
    /// observation of the state.
    async fn assert_invariants(manager: &StateManager) {
        let state = manager.view().await;

        // Busy GPUs and Running tasks back-point at each other.
        for gpu in state.gpus.values() {
            match gpu.status {
                GpuStatus::Busy => {
                    let task_id = gpu.current_task_id.as_ref().expect("busy gpu has task");
                    let task = state.tasks.get(task_id).expect("task exists");
                    assert_eq!(task.status, TaskStatus::Running);
                    assert!(task.assigned_gpu_ids.contains(&gpu.id));
                }
                _ => assert!(gpu.current_task_id.is_none()),
            }
        }

        // Usage equals the sum over Running tasks, per class.
        let mut online = 0;
        let mut batch = 0;
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Running => {
                    assert_eq!(task.assigned_gpu_ids.len(), task.gpu_count as usize);
                    match task.priority {
                        Priority::High => online += task.gpu_count,
                        Priority::Low => batch += task.gpu_count,
                    }
                }
                _ => assert!(task.assigned_gpu_ids.is_empty()),
            }
        }
        assert_eq!(state.quota.online_used, online);
        assert_eq!(state.quota.batch_used, batch);

        // Pending tasks sit in exactly one queue matching their class.
        for task in state.tasks.values() {
            let in_high = state.high_priority_queue.contains(&task.id);
            let in_low = state.low_priority_queue.contains(&task.id);
            if task.status == TaskStatus::Pending {
                match task.priority {
                    Priority::High => assert!(in_high && !in_low),
                    Priority::Low => assert!(in_low && !in_high),
                }
            } else {
                assert!(!in_high && !in_low);
            }
        }
    }

    #[tokio::test]
    async fn test_register_merges_inventory_and_recomputes_quota() {
        let (manager, _rx) = StateManager::new();
        manager.set_quota(0.5, 0.5).await.unwrap();
        manager
            .register_agent("n1", "addr", make_gpus("n1", 4, "A100"))
            .await
            .unwrap();

        let quota = manager.get_quota().await;
        assert_eq!(quota.total_gpus, 4);
        assert_eq!(quota.online_quota, 2);
        assert_eq!(quota.batch_quota, 2);
        assert_invariants(&manager).await;
    }

    #[tokio::test]
    async fn test_reregister_identical_inventory_is_idempotent() {
        let (manager, _rx) = StateManager::new();
        manager
            .register_agent("n1", "addr", make_gpus("n1", 2, "A100"))
            .await
            .unwrap();
        let before = manager.view().await;

        manager
            .register_agent("n1", "addr", make_gpus("n1", 2, "A100"))
            .await
            .unwrap();
        let after = manager.view().await;

        assert_eq!(before.quota, after.quota);
        assert_eq!(
            before.gpus.keys().collect::<std::collections::BTreeSet<_>>(),
            after.gpus.keys().collect::<std::collections::BTreeSet<_>>()
        );
        assert!(after.version > before.version);
    }

    #[tokio::test]
    async fn test_reregister_force_fails_running_tasks() {
        let manager = manager_with_fleet(2).await;

        let task = Task::new("t1", Priority::High, 2, "train.sh");
        manager.submit_task(task).await.unwrap();
        manager
            .commit_allocation("t1", &["n1-gpu-0".into(), "n1-gpu-1".into()])
            .await
            .unwrap();

        manager
            .register_agent("n1", "addr", make_gpus("n1", 2, "A100"))
            .await
            .unwrap();

        let task = manager.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("agent re-registered"));
        assert_eq!(manager.get_quota().await.online_used, 0);
        assert_invariants(&manager).await;
    }

    #[tokio::test]
    async fn test_commit_allocation_happy_path() {
        let manager = manager_with_fleet(4).await;

        manager
            .submit_task(Task::new("t1", Priority::High, 4, "train.sh"))
            .await
            .unwrap();
        manager
            .commit_allocation(
                "t1",
                &[
                    "n1-gpu-0".into(),
                    "n1-gpu-1".into(),
                    "n1-gpu-2".into(),
                    "n1-gpu-3".into(),
                ],
            )
            .await
            .unwrap();

        let task = manager.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert_eq!(manager.get_quota().await.online_used, 4);
        assert!(manager
            .list_gpus()
            .await
            .iter()
            .all(|gpu| gpu.status == GpuStatus::Busy));
        assert_invariants(&manager).await;
    }

    #[tokio::test]
    async fn test_commit_allocation_rejects_busy_gpu() {
        let manager = manager_with_fleet(2).await;

        manager
            .submit_task(Task::new("t1", Priority::High, 1, "a.sh"))
            .await
            .unwrap();
        manager
            .submit_task(Task::new("t2", Priority::High, 1, "b.sh"))
            .await
            .unwrap();

        manager
            .commit_allocation("t1", &["n1-gpu-0".into()])
            .await
            .unwrap();

        // Losing the race for the same GPU is a Conflict, and nothing moves.
        let before = manager.view().await;
        let err = manager
            .commit_allocation("t2", &["n1-gpu-0".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let after = manager.view().await;
        assert_eq!(before, after);
        assert_eq!(after.quota.online_used, 1);
        assert_invariants(&manager).await;
    }

    #[tokio::test]
    async fn test_commit_allocation_enforces_quota() {
        let (manager, _rx) = StateManager::new();
        manager
            .register_agent("n1", "addr", make_gpus("n1", 4, "A100"))
            .await
            .unwrap();
        manager.set_quota(0.5, 0.5).await.unwrap();

        manager
            .submit_task(Task::new("t1", Priority::High, 3, "train.sh"))
            .await
            .unwrap();

        let err = manager
            .commit_allocation(
                "t1",
                &["n1-gpu-0".into(), "n1-gpu-1".into(), "n1-gpu-2".into()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
        assert_eq!(manager.get_quota().await.online_used, 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let manager = manager_with_fleet(2).await;

        manager
            .submit_task(Task::new("t1", Priority::High, 2, "train.sh"))
            .await
            .unwrap();
        manager
            .commit_allocation("t1", &["n1-gpu-0".into(), "n1-gpu-1".into()])
            .await
            .unwrap();

        manager
            .release_task("t1", TaskStatus::Success, None)
            .await
            .unwrap();
        let once = manager.view().await;

        let err = manager
            .release_task("t1", TaskStatus::Success, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyTerminal(_)));

        let twice = manager.view().await;
        assert_eq!(once, twice);
        assert_eq!(twice.quota.online_used, 0);
        assert_invariants(&manager).await;
    }

    #[tokio::test]
    async fn test_release_requires_running() {
        let manager = manager_with_fleet(1).await;
        manager
            .submit_task(Task::new("t1", Priority::High, 1, "train.sh"))
            .await
            .unwrap();

        let err = manager
            .release_task("t1", TaskStatus::Success, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let manager = manager_with_fleet(1).await;
        manager
            .submit_task(Task::new("t1", Priority::Low, 1, "batch.sh"))
            .await
            .unwrap();

        manager.cancel_task("t1").await.unwrap();
        let task = manager.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_invariants(&manager).await;

        manager
            .submit_task(Task::new("t2", Priority::High, 1, "serve.sh"))
            .await
            .unwrap();
        manager
            .commit_allocation("t2", &["n1-gpu-0".into()])
            .await
            .unwrap();
        assert!(matches!(
            manager.cancel_task("t2").await.unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_gpu_status_transitions_restricted() {
        let manager = manager_with_fleet(1).await;

        // Idle <-> Offline is the only externally driven transition.
        manager
            .update_gpu_status("n1-gpu-0", GpuStatus::Offline)
            .await
            .unwrap();
        manager
            .update_gpu_status("n1-gpu-0", GpuStatus::Idle)
            .await
            .unwrap();

        manager
            .submit_task(Task::new("t1", Priority::High, 1, "train.sh"))
            .await
            .unwrap();
        manager
            .commit_allocation("t1", &["n1-gpu-0".into()])
            .await
            .unwrap();

        // Busy -> Busy is a no-op; Busy -> Idle is owned by release.
        manager
            .update_gpu_status("n1-gpu-0", GpuStatus::Busy)
            .await
            .unwrap();
        assert!(matches!(
            manager
                .update_gpu_status("n1-gpu-0", GpuStatus::Idle)
                .await
                .unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_mark_agent_offline_reaps_tasks() {
        let manager = manager_with_fleet(2).await;

        manager
            .submit_task(Task::new("t1", Priority::High, 2, "train.sh"))
            .await
            .unwrap();
        manager
            .commit_allocation("t1", &["n1-gpu-0".into(), "n1-gpu-1".into()])
            .await
            .unwrap();

        let reaped = manager.mark_agent_offline("n1").await.unwrap();
        assert_eq!(reaped, vec!["t1".to_string()]);

        let task = manager.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("agent offline"));
        assert_eq!(manager.get_quota().await.online_used, 0);
        assert!(manager
            .list_gpus()
            .await
            .iter()
            .all(|gpu| gpu.status == GpuStatus::Offline));
        assert_invariants(&manager).await;
    }

    #[tokio::test]
    async fn test_lowering_quota_never_evicts() {
        let manager = manager_with_fleet(2).await;

        manager
            .submit_task(Task::new("t1", Priority::High, 2, "train.sh"))
            .await
            .unwrap();
        manager
            .commit_allocation("t1", &["n1-gpu-0".into(), "n1-gpu-1".into()])
            .await
            .unwrap();

        manager.set_quota(0.0, 1.0).await.unwrap();

        let quota = manager.get_quota().await;
        assert_eq!(quota.online_quota, 0);
        assert_eq!(quota.online_used, 2);
        assert_eq!(
            manager.get_task("t1").await.unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_version_strictly_monotonic() {
        let (manager, _rx) = StateManager::new();
        let mut last = manager.version().await;

        manager
            .register_agent("n1", "addr", make_gpus("n1", 2, "A100"))
            .await
            .unwrap();
        let v = manager.version().await;
        assert!(v > last);
        last = v;

        manager.set_quota(1.0, 0.0).await.unwrap();
        let v = manager.version().await;
        assert!(v > last);
        last = v;

        manager
            .submit_task(Task::new("t1", Priority::High, 1, "train.sh"))
            .await
            .unwrap();
        assert!(manager.version().await > last);
    }

    #[tokio::test]
    async fn test_reconcile_fails_tasks_with_broken_backpointers() {
        let manager = manager_with_fleet(2).await;

        manager
            .submit_task(Task::new("t1", Priority::High, 2, "train.sh"))
            .await
            .unwrap();
        manager
            .commit_allocation("t1", &["n1-gpu-0".into(), "n1-gpu-1".into()])
            .await
            .unwrap();

        // Simulate a snapshot taken before the GPU flips landed.
        let mut broken = manager.view().await;
        for gpu in broken.gpus.values_mut() {
            gpu.status = GpuStatus::Idle;
            gpu.current_task_id = None;
        }
        let (restored, _rx) = StateManager::new();
        restored.restore(broken).await;

        let failed = restored.reconcile().await;
        assert_eq!(failed, vec!["t1".to_string()]);

        let task = restored.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("lost on restart"));
        assert_eq!(restored.get_quota().await.online_used, 0);
        assert_invariants(&restored).await;
    }

    #[tokio::test]
    async fn test_snapshot_signal_coalesces() {
        let (manager, mut rx) = StateManager::new();

        for i in 0..5 {
            manager
                .submit_task(Task::new(format!("t{}", i), Priority::Low, 1, "x"))
                .await
                .unwrap();
        }

        // Multiple commits while no writer drained the channel collapse to
        // a single pending signal.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_agents_overdue() {
        let manager = manager_with_fleet(1).await;
        assert!(manager.agents_overdue(3600).await.is_empty());
        // A zero-second timeout makes any prior heartbeat overdue.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(manager.agents_overdue(0).await, vec!["n1".to_string()]);
    }
}
