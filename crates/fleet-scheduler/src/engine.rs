//! Core scheduling engine
//!
//! A scheduling cycle runs on a fixed tick and on explicit wake signals
//! (task submission, task release). Each cycle walks the High queue in FIFO
//! order, then the Low queue. Planning works against a cloned read view;
//! the only mutation is the transactional `commit_allocation`, so the
//! engine never holds the state lock across I/O and a lost race surfaces
//! as a retryable `Conflict`.

use crate::dispatch::DispatchRouter;
use crate::services::RoleAdapter;
use fleet_core::{Dispatch, Error, Gpu, GpuStatus, Priority, Result, Task, TaskStatus};
use fleet_state::{FleetState, StateManager};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

const COMMIT_RETRIES: usize = 3;

/// Outcome of one scheduling attempt for a task
enum Attempt {
    /// Allocation committed and the dispatch queued
    Committed,
    /// The class quota cannot admit the task; head-of-line blocks the
    /// whole class for this cycle to preserve FIFO order
    QuotaBlocked,
    /// No node has enough matching idle GPUs; pools are model-partitioned,
    /// so the next task still gets its attempt
    NoCandidates,
    /// Lost races exhausted the retries, or the task moved under us
    Skipped,
}

/// Priority-and-quota-based placement engine.
pub struct Engine {
    state: StateManager,
    dispatch: DispatchRouter,
    role: RoleAdapter,
    interval: Duration,
    wake: Notify,
    rng: Mutex<SmallRng>,
}

impl Engine {
    /// Create an engine. A fixed `seed` makes GPU selection deterministic,
    /// which tests rely on; production leaves it unset.
    pub fn new(
        state: StateManager,
        dispatch: DispatchRouter,
        role: RoleAdapter,
        interval: Duration,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        Self {
            state,
            dispatch,
            role,
            interval,
            wake: Notify::new(),
            rng: Mutex::new(rng),
        }
    }

    /// Signal the engine to run a cycle soon.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Run cycles until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
            self.run_cycle().await;
        }
        info!("Scheduling engine stopped");
    }

    /// Execute one scheduling cycle. Only a primary places work.
    pub async fn run_cycle(&self) {
        if !self.role.is_primary() {
            return;
        }

        self.process_queue(Priority::High).await;
        self.process_queue(Priority::Low).await;
    }

    async fn process_queue(&self, priority: Priority) {
        let queue: Vec<String> = {
            let view = self.state.view().await;
            view.queue(priority).iter().cloned().collect()
        };

        for task_id in queue {
            match self.schedule_task(&task_id).await {
                Attempt::Committed | Attempt::NoCandidates | Attempt::Skipped => {}
                Attempt::QuotaBlocked => {
                    debug!(%priority, task_id, "Head of line blocked on quota");
                    break;
                }
            }
        }
    }

    /// Try to place one task, retrying lost commit races with a fresh view.
    async fn schedule_task(&self, task_id: &str) -> Attempt {
        for attempt in 0..COMMIT_RETRIES {
            let view = self.state.view().await;

            let Some(task) = view.tasks.get(task_id) else {
                return Attempt::Skipped;
            };
            if task.status != TaskStatus::Pending {
                return Attempt::Skipped;
            }

            if !view.quota.admits(task.priority, task.gpu_count) {
                return Attempt::QuotaBlocked;
            }

            let backlogged = self.dispatch.backlogged_agents().await;
            let Some(selected) = self.select_gpus(&view, task, &backlogged).await else {
                return Attempt::NoCandidates;
            };

            let gpu_ids: Vec<String> = selected.iter().map(|gpu| gpu.id.clone()).collect();
            match self.state.commit_allocation(task_id, &gpu_ids).await {
                Ok(()) => {
                    self.hand_off(task, &selected).await;
                    info!(
                        task_id,
                        priority = %task.priority,
                        gpu_count = task.gpu_count,
                        ?gpu_ids,
                        "Task scheduled"
                    );
                    return Attempt::Committed;
                }
                Err(Error::QuotaExceeded(reason)) => {
                    debug!(task_id, reason, "Quota closed under us");
                    return Attempt::QuotaBlocked;
                }
                Err(Error::Conflict(reason)) => {
                    debug!(task_id, attempt, reason, "Allocation conflict, retrying");
                }
                Err(e) => {
                    warn!(task_id, "Allocation failed: {}", e);
                    return Attempt::Skipped;
                }
            }
        }

        debug!(task_id, "Allocation retries exhausted, skipping this cycle");
        Attempt::Skipped
    }

    /// Pick the task's GPUs from the idle pool.
    ///
    /// Dispatches target a single agent, so all of a task's GPUs must share
    /// a node: candidates are grouped by node, a node with enough matching
    /// idle devices is chosen at random, and the devices are sampled at
    /// random within it. Candidate lists are id-sorted first so a seeded
    /// generator yields a reproducible selection.
    async fn select_gpus(
        &self,
        view: &FleetState,
        task: &Task,
        backlogged: &HashSet<String>,
    ) -> Option<Vec<Gpu>> {
        let mut by_node: BTreeMap<&str, Vec<&Gpu>> = BTreeMap::new();
        for gpu in view.gpus.values() {
            if gpu.status != GpuStatus::Idle {
                continue;
            }
            if let Some(model) = &task.gpu_model {
                if &gpu.model != model {
                    continue;
                }
            }
            if backlogged.contains(&gpu.node_id) {
                continue;
            }
            by_node.entry(gpu.node_id.as_str()).or_default().push(gpu);
        }

        let eligible: Vec<(&str, Vec<&Gpu>)> = by_node
            .into_iter()
            .filter(|(_, gpus)| gpus.len() >= task.gpu_count as usize)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let mut rng = self.rng.lock().await;
        let (_, mut gpus) = eligible
            .choose(&mut *rng)
            .map(|(node, gpus)| (*node, gpus.clone()))?;

        gpus.sort_by(|a, b| a.id.cmp(&b.id));
        let selected: Vec<Gpu> = gpus
            .choose_multiple(&mut *rng, task.gpu_count as usize)
            .map(|gpu| (*gpu).clone())
            .collect();

        Some(selected)
    }

    /// Queue the dispatch record under the owning agent.
    async fn hand_off(&self, task: &Task, gpus: &[Gpu]) {
        let Some(first) = gpus.first() else {
            return;
        };

        let dispatch = Dispatch {
            task_id: task.id.clone(),
            priority: task.priority,
            gpu_count: task.gpu_count,
            command: task.command.clone(),
            env: task.env.clone(),
            assigned_gpu_ids: gpus.iter().map(|gpu| gpu.id.clone()).collect(),
            assigned_device_indices: gpus.iter().map(|gpu| gpu.device_index).collect(),
        };

        self.dispatch.enqueue(&first.node_id, dispatch).await;
    }

    /// Release path: free a finished task's resources and refill the freed
    /// capacity right away.
    pub async fn release(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.state.release_task(task_id, status, error).await?;
        self.wake();
        Ok(())
    }
}
