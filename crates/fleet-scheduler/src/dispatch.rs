//! Per-agent dispatch delivery queues
//!
//! Committed allocations become dispatch records queued under the owning
//! agent's id, delivered on that agent's next heartbeat. Delivery is
//! at-most-once per stream attempt: records delivered on a stream stay
//! "unacknowledged" until a later heartbeat arrives on the same stream
//! epoch. A heartbeat on a new epoch (the agent reconnected) redelivers
//! them first, so a dropped stream never strands a Running task.

use fleet_core::Dispatch;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct AgentLane {
    queued: VecDeque<Dispatch>,
    unacked: Vec<Dispatch>,
    unacked_epoch: u64,
}

/// Routes dispatch records to agents with bounded queues and
/// redelivery-on-reconnect semantics.
#[derive(Clone)]
pub struct DispatchRouter {
    lanes: Arc<RwLock<HashMap<String, AgentLane>>>,
    queue_limit: usize,
}

impl DispatchRouter {
    pub fn new(queue_limit: usize) -> Self {
        Self {
            lanes: Arc::new(RwLock::new(HashMap::new())),
            queue_limit,
        }
    }

    /// Queue a dispatch for an agent.
    ///
    /// The bound is enforced at planning time (backlogged agents are
    /// excluded from candidate sets), so a committed allocation is always
    /// accepted here; exceeding the bound through a planning race only
    /// draws a warning.
    pub async fn enqueue(&self, agent_id: &str, dispatch: Dispatch) {
        let mut lanes = self.lanes.write().await;
        let lane = lanes.entry(agent_id.to_string()).or_default();

        if lane.queued.len() >= self.queue_limit {
            warn!(
                agent_id,
                queued = lane.queued.len(),
                "Dispatch queue over its bound"
            );
        }

        debug!(agent_id, task_id = %dispatch.task_id, "Dispatch queued");
        lane.queued.push_back(dispatch);
    }

    /// Agents whose queues are at the bound; their idle GPUs are excluded
    /// from candidate selection until the queue drains.
    pub async fn backlogged_agents(&self) -> HashSet<String> {
        let lanes = self.lanes.read().await;
        lanes
            .iter()
            .filter(|(_, lane)| lane.queued.len() >= self.queue_limit)
            .map(|(agent_id, _)| agent_id.clone())
            .collect()
    }

    /// Hand over everything deliverable on a heartbeat.
    ///
    /// `epoch` identifies the heartbeat stream. A heartbeat on the epoch
    /// that previously received dispatches acknowledges them; a heartbeat
    /// on a different epoch means the old stream died, so the
    /// unacknowledged records are redelivered ahead of the queue.
    pub async fn collect(&self, agent_id: &str, epoch: u64) -> Vec<Dispatch> {
        let mut lanes = self.lanes.write().await;
        let Some(lane) = lanes.get_mut(agent_id) else {
            return Vec::new();
        };

        let mut delivery: Vec<Dispatch> = if lane.unacked_epoch == epoch {
            // Same stream heartbeated again: the previous delivery arrived.
            lane.unacked.clear();
            Vec::new()
        } else {
            let redeliver = std::mem::take(&mut lane.unacked);
            if !redeliver.is_empty() {
                warn!(
                    agent_id,
                    count = redeliver.len(),
                    "Redelivering dispatches after stream reconnect"
                );
            }
            redeliver
        };

        delivery.extend(lane.queued.drain(..));

        lane.unacked = delivery.clone();
        lane.unacked_epoch = epoch;
        delivery
    }

    /// Drop everything held for an agent (it was declared offline; its
    /// tasks were force-failed). Returns how many records were discarded.
    pub async fn drop_agent(&self, agent_id: &str) -> usize {
        let mut lanes = self.lanes.write().await;
        match lanes.remove(agent_id) {
            Some(lane) => lane.queued.len() + lane.unacked.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Priority;
    use std::collections::HashMap as StdHashMap;

    fn dispatch(task_id: &str) -> Dispatch {
        Dispatch {
            task_id: task_id.to_string(),
            priority: Priority::High,
            gpu_count: 1,
            command: "run.sh".to_string(),
            env: StdHashMap::new(),
            assigned_gpu_ids: vec!["n1-gpu-0".to_string()],
            assigned_device_indices: vec![0],
        }
    }

    #[tokio::test]
    async fn test_collect_delivers_queued_in_order() {
        let router = DispatchRouter::new(16);
        router.enqueue("n1", dispatch("t1")).await;
        router.enqueue("n1", dispatch("t2")).await;

        let delivered = router.collect("n1", 1).await;
        let ids: Vec<&str> = delivered.iter().map(|d| d.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_same_epoch_heartbeat_acknowledges() {
        let router = DispatchRouter::new(16);
        router.enqueue("n1", dispatch("t1")).await;

        let first = router.collect("n1", 7).await;
        assert_eq!(first.len(), 1);

        // The next heartbeat on the same stream acks; nothing to redeliver.
        let second = router.collect("n1", 7).await;
        assert!(second.is_empty());

        // And a later reconnect has nothing to redeliver either.
        let third = router.collect("n1", 8).await;
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn test_new_epoch_redelivers_unacked() {
        let router = DispatchRouter::new(16);
        router.enqueue("n1", dispatch("t1")).await;

        let first = router.collect("n1", 1).await;
        assert_eq!(first.len(), 1);

        // Stream died before the agent heartbeated again; a new stream
        // sees the dispatch once more, ahead of newer work.
        router.enqueue("n1", dispatch("t2")).await;
        let redelivered = router.collect("n1", 2).await;
        let ids: Vec<&str> = redelivered.iter().map(|d| d.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_backlogged_agents_at_bound() {
        let router = DispatchRouter::new(2);
        router.enqueue("n1", dispatch("t1")).await;
        assert!(router.backlogged_agents().await.is_empty());

        router.enqueue("n1", dispatch("t2")).await;
        let backlogged = router.backlogged_agents().await;
        assert!(backlogged.contains("n1"));

        router.collect("n1", 1).await;
        assert!(router.backlogged_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_drop_agent_discards_everything() {
        let router = DispatchRouter::new(16);
        router.enqueue("n1", dispatch("t1")).await;
        router.collect("n1", 1).await;
        router.enqueue("n1", dispatch("t2")).await;

        assert_eq!(router.drop_agent("n1").await, 2);
        assert!(router.collect("n1", 2).await.is_empty());
    }

    #[tokio::test]
    async fn test_collect_unknown_agent_is_empty() {
        let router = DispatchRouter::new(16);
        assert!(router.collect("ghost", 1).await.is_empty());
    }
}
