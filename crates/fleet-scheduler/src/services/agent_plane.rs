//! Agent-facing gRPC service
//!
//! Three operations: one-shot registration, the long-lived bidirectional
//! heartbeat stream (agent pushes GPU status, scheduler pushes dispatches),
//! and the unary terminal report. Stream handling never holds the state
//! lock across a send; every state touch goes through the StateManager's
//! own locking.

use crate::dispatch::DispatchRouter;
use crate::engine::Engine;
use crate::services::RoleAdapter;
use fleet_core::{Error, GpuReport, TaskStatus};
use fleet_proto::{
    timestamp, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
    SchedulerService, TaskFinishedRequest, TaskFinishedResponse,
};
use fleet_state::StateManager;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

/// gRPC endpoint serving fleet agents
#[derive(Clone)]
pub struct AgentPlane {
    state: StateManager,
    engine: Arc<Engine>,
    dispatch: DispatchRouter,
    role: RoleAdapter,
    // Distinguishes heartbeat stream attempts for dispatch acknowledgment
    stream_epochs: Arc<AtomicU64>,
}

impl AgentPlane {
    pub fn new(
        state: StateManager,
        engine: Arc<Engine>,
        dispatch: DispatchRouter,
        role: RoleAdapter,
    ) -> Self {
        Self {
            state,
            engine,
            dispatch,
            role,
            stream_epochs: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Process one inbound heartbeat and build the response.
    ///
    /// Returns a terminal `Status` when the agent must (re-)register: it is
    /// unknown, or it went Offline and came back with a different GPU
    /// inventory than the one on file.
    pub(crate) async fn handle_heartbeat(
        &self,
        req: HeartbeatRequest,
        epoch: u64,
    ) -> std::result::Result<HeartbeatResponse, Status> {
        let agent_id = req.agent_id.as_str();

        let agent = self
            .state
            .get_agent(agent_id)
            .await
            .map_err(|_| Status::failed_precondition(format!("agent {} not registered", agent_id)))?;

        if agent.status == fleet_core::AgentStatus::Offline {
            let on_file: BTreeSet<&str> = agent.gpu_ids.iter().map(String::as_str).collect();
            let reported: BTreeSet<&str> =
                req.gpu_status.iter().map(|report| report.id.as_str()).collect();
            if on_file != reported {
                warn!(agent_id, "Offline agent returned with changed inventory");
                return Err(Status::failed_precondition(format!(
                    "agent {} inventory changed, re-register required",
                    agent_id
                )));
            }
            info!(agent_id, "Offline agent revived by heartbeat");
        }

        if let Err(e) = self.state.update_agent_heartbeat(agent_id).await {
            return Err(Status::failed_precondition(e.to_string()));
        }

        for report in req.gpu_status {
            let report = match GpuReport::try_from(report) {
                Ok(report) => report,
                Err(e) => {
                    debug!(agent_id, "Ignoring malformed GPU report: {}", e);
                    continue;
                }
            };
            // Busy/Idle flips belong to allocation and release; rejected
            // transitions are expected noise, not stream errors.
            if let Err(e) = self
                .state
                .update_gpu_status(&report.gpu_id, report.status)
                .await
            {
                debug!(gpu_id = %report.gpu_id, "GPU status report dropped: {}", e);
            }
        }

        let is_primary = self.role.is_primary();
        let dispatches = if is_primary {
            self.dispatch.collect(agent_id, epoch).await
        } else {
            Vec::new()
        };

        for dispatch in &dispatches {
            if let Err(e) = self.state.mark_dispatched(&dispatch.task_id).await {
                debug!(task_id = %dispatch.task_id, "mark_dispatched failed: {}", e);
            }
        }

        if !dispatches.is_empty() {
            info!(agent_id, count = dispatches.len(), "Dispatching tasks on heartbeat");
        }

        Ok(HeartbeatResponse {
            is_primary,
            tasks: dispatches.into_iter().map(Into::into).collect(),
            timestamp: timestamp::now(),
        })
    }
}

#[tonic::async_trait]
impl SchedulerService for AgentPlane {
    async fn register_agent(
        &self,
        request: Request<RegisterRequest>,
    ) -> std::result::Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        info!(
            agent_id = %req.agent_id,
            address = %req.address,
            gpu_count = req.gpus.len(),
            "Agent registering"
        );

        if req.agent_id.is_empty() {
            return Ok(Response::new(RegisterResponse {
                success: false,
                message: "agent_id is required".to_string(),
            }));
        }

        let gpus = req
            .gpus
            .into_iter()
            .map(|spec| spec.into_gpu(&req.agent_id))
            .collect();

        match self
            .state
            .register_agent(&req.agent_id, &req.address, gpus)
            .await
        {
            Ok(()) => {
                self.engine.wake();
                Ok(Response::new(RegisterResponse {
                    success: true,
                    message: "registered".to_string(),
                }))
            }
            Err(e) => Ok(Response::new(RegisterResponse {
                success: false,
                message: e.to_string(),
            })),
        }
    }

    type HeartbeatStream = ReceiverStream<std::result::Result<HeartbeatResponse, Status>>;

    async fn heartbeat(
        &self,
        request: Request<Streaming<HeartbeatRequest>>,
    ) -> std::result::Result<Response<Self::HeartbeatStream>, Status> {
        let mut stream = request.into_inner();
        let plane = self.clone();
        let epoch = self.stream_epochs.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tokio::spawn(async move {
            let mut agent_id = String::new();

            while let Some(message) = stream.message().await.transpose() {
                match message {
                    Ok(req) => {
                        agent_id = req.agent_id.clone();

                        match plane.handle_heartbeat(req, epoch).await {
                            Ok(response) => {
                                if tx.send(Ok(response)).await.is_err() {
                                    debug!(agent_id, "Heartbeat receiver dropped");
                                    break;
                                }
                            }
                            Err(status) => {
                                let _ = tx.send(Err(status)).await;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(agent_id, "Heartbeat receive error: {}", e);
                        break;
                    }
                }
            }
            debug!(agent_id, epoch, "Heartbeat stream ended");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn task_finished(
        &self,
        request: Request<TaskFinishedRequest>,
    ) -> std::result::Result<Response<TaskFinishedResponse>, Status> {
        let req = request.into_inner();
        info!(task_id = %req.task_id, status = %req.status, "Task finished report");

        let status = match req.status.as_str() {
            "success" => TaskStatus::Success,
            "failed" => TaskStatus::Failed,
            other => {
                return Ok(Response::new(TaskFinishedResponse {
                    success: false,
                    message: format!("invalid status: {}", other),
                }));
            }
        };

        let error = if req.error.is_empty() {
            None
        } else {
            Some(req.error)
        };

        match self.engine.release(&req.task_id, status, error).await {
            Ok(()) => Ok(Response::new(TaskFinishedResponse {
                success: true,
                message: "released".to_string(),
            })),
            // A duplicate report after the task already settled is fine.
            Err(Error::AlreadyTerminal(_)) => Ok(Response::new(TaskFinishedResponse {
                success: true,
                message: "already terminal".to_string(),
            })),
            Err(e) => {
                warn!(task_id = %req.task_id, "Failed to release task: {}", e);
                Ok(Response::new(TaskFinishedResponse {
                    success: false,
                    message: e.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use fleet_core::Priority;
    use fleet_proto::{GpuSpec, GpuStatusReport};
    use std::time::Duration;

    fn make_plane(role: Role) -> (AgentPlane, StateManager, DispatchRouter) {
        let (state, _rx) = StateManager::new();
        let dispatch = DispatchRouter::new(1024);
        let engine = Arc::new(Engine::new(
            state.clone(),
            dispatch.clone(),
            RoleAdapter::new("sched-test", role),
            Duration::from_secs(5),
            Some(7),
        ));
        let plane = AgentPlane::new(state.clone(), engine, dispatch.clone(), RoleAdapter::new("sched-test", role));
        (plane, state, dispatch)
    }

    fn register_req(agent_id: &str, gpu_count: u32) -> RegisterRequest {
        RegisterRequest {
            agent_id: agent_id.to_string(),
            address: "10.0.0.1:9090".to_string(),
            gpus: (0..gpu_count)
                .map(|index| GpuSpec {
                    id: format!("{}-gpu-{}", agent_id, index),
                    device_index: index,
                    model: "A100".to_string(),
                    memory_bytes: 40_000_000_000,
                })
                .collect(),
        }
    }

    fn heartbeat_req(agent_id: &str, gpu_ids: &[&str]) -> HeartbeatRequest {
        HeartbeatRequest {
            agent_id: agent_id.to_string(),
            gpu_status: gpu_ids
                .iter()
                .map(|id| GpuStatusReport {
                    id: id.to_string(),
                    status: "idle".to_string(),
                    utilization_pct: 0.0,
                    memory_used_bytes: 0,
                })
                .collect(),
            timestamp: timestamp::now(),
        }
    }

    #[tokio::test]
    async fn test_register_agent_success() {
        let (plane, state, _) = make_plane(Role::Primary);

        let response = plane
            .register_agent(Request::new(register_req("n1", 2)))
            .await
            .unwrap()
            .into_inner();

        assert!(response.success);
        assert_eq!(state.list_gpus().await.len(), 2);
        assert_eq!(state.get_quota().await.total_gpus, 2);
    }

    #[tokio::test]
    async fn test_register_agent_requires_id() {
        let (plane, _, _) = make_plane(Role::Primary);

        let response = plane
            .register_agent(Request::new(register_req("", 1)))
            .await
            .unwrap()
            .into_inner();

        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_agent_fails() {
        let (plane, _, _) = make_plane(Role::Primary);

        let result = plane.handle_heartbeat(heartbeat_req("ghost", &[]), 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_delivers_dispatch_and_marks_dispatched() {
        let (plane, state, _) = make_plane(Role::Primary);
        plane
            .register_agent(Request::new(register_req("n1", 2)))
            .await
            .unwrap();
        state.set_quota(1.0, 0.0).await.unwrap();
        state
            .submit_task(fleet_core::Task::new("t1", Priority::High, 2, "train.sh"))
            .await
            .unwrap();
        plane.engine.run_cycle().await;

        let response = plane
            .handle_heartbeat(heartbeat_req("n1", &["n1-gpu-0", "n1-gpu-1"]), 1)
            .await
            .unwrap();

        assert!(response.is_primary);
        assert_eq!(response.tasks.len(), 1);
        assert_eq!(response.tasks[0].id, "t1");
        assert_eq!(response.tasks[0].assigned_gpus.len(), 2);
        assert!(state.get_task("t1").await.unwrap().dispatched_at.is_some());
    }

    #[tokio::test]
    async fn test_standby_heartbeat_is_empty_and_not_primary() {
        let (plane, state, dispatch) = make_plane(Role::Standby);
        plane
            .register_agent(Request::new(register_req("n1", 1)))
            .await
            .unwrap();
        // Even with a queued dispatch, a standby must not emit it.
        dispatch
            .enqueue(
                "n1",
                fleet_core::Dispatch {
                    task_id: "t1".to_string(),
                    priority: Priority::High,
                    gpu_count: 1,
                    command: "x".to_string(),
                    env: Default::default(),
                    assigned_gpu_ids: vec!["n1-gpu-0".to_string()],
                    assigned_device_indices: vec![0],
                },
            )
            .await;

        let response = plane
            .handle_heartbeat(heartbeat_req("n1", &["n1-gpu-0"]), 1)
            .await
            .unwrap();

        assert!(!response.is_primary);
        assert!(response.tasks.is_empty());
        assert!(state.get_task("t1").await.is_err());
    }

    #[tokio::test]
    async fn test_offline_agent_revived_with_matching_inventory() {
        let (plane, state, _) = make_plane(Role::Primary);
        plane
            .register_agent(Request::new(register_req("n1", 1)))
            .await
            .unwrap();
        state.mark_agent_offline("n1").await.unwrap();

        let response = plane
            .handle_heartbeat(heartbeat_req("n1", &["n1-gpu-0"]), 1)
            .await;
        assert!(response.is_ok());

        let agent = state.get_agent("n1").await.unwrap();
        assert_eq!(agent.status, fleet_core::AgentStatus::Online);
    }

    #[tokio::test]
    async fn test_offline_agent_with_changed_inventory_must_reregister() {
        let (plane, state, _) = make_plane(Role::Primary);
        plane
            .register_agent(Request::new(register_req("n1", 1)))
            .await
            .unwrap();
        state.mark_agent_offline("n1").await.unwrap();

        let result = plane
            .handle_heartbeat(heartbeat_req("n1", &["n1-gpu-0", "n1-gpu-1"]), 1)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_task_finished_releases_and_is_idempotent() {
        let (plane, state, _) = make_plane(Role::Primary);
        plane
            .register_agent(Request::new(register_req("n1", 1)))
            .await
            .unwrap();
        state.set_quota(1.0, 0.0).await.unwrap();
        state
            .submit_task(fleet_core::Task::new("t1", Priority::High, 1, "train.sh"))
            .await
            .unwrap();
        plane.engine.run_cycle().await;

        let req = TaskFinishedRequest {
            task_id: "t1".to_string(),
            status: "success".to_string(),
            error: String::new(),
            timestamp: timestamp::now(),
        };

        let first = plane
            .task_finished(Request::new(req.clone()))
            .await
            .unwrap()
            .into_inner();
        assert!(first.success);
        assert_eq!(state.get_quota().await.online_used, 0);

        // A duplicate terminal report acks cleanly without mutating.
        let second = plane
            .task_finished(Request::new(req))
            .await
            .unwrap()
            .into_inner();
        assert!(second.success);
    }

    #[tokio::test]
    async fn test_task_finished_rejects_bad_status() {
        let (plane, _, _) = make_plane(Role::Primary);

        let response = plane
            .task_finished(Request::new(TaskFinishedRequest {
                task_id: "t1".to_string(),
                status: "exploded".to_string(),
                error: String::new(),
                timestamp: timestamp::now(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!response.success);
    }
}
