//! gRPC client for agent-to-scheduler communication

use fleet_core::{Error, Gpu, GpuReport, Result, TaskStatus};
use fleet_proto::{
    timestamp, HeartbeatRequest, HeartbeatResponse, RegisterRequest, SchedulerServiceClient,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing::info;

/// Connection to one scheduler instance
pub struct SchedulerClient {
    agent_id: String,
    address: String,
    client: SchedulerServiceClient<Channel>,
}

impl SchedulerClient {
    /// Connect to a scheduler endpoint.
    pub async fn connect(agent_id: impl Into<String>, address: impl Into<String>) -> Result<Self> {
        let agent_id = agent_id.into();
        let address = address.into();

        info!(%agent_id, %address, "Connecting to scheduler");
        let client = SchedulerServiceClient::connect(address.clone())
            .await
            .map_err(|e| Error::transport(format!("failed to connect to {}: {}", address, e)))?;

        Ok(Self {
            agent_id,
            address,
            client,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register this agent and its GPU inventory.
    pub async fn register(&mut self, gpus: &[Gpu]) -> Result<()> {
        let request = RegisterRequest {
            agent_id: self.agent_id.clone(),
            address: self.address.clone(),
            gpus: gpus.iter().cloned().map(Into::into).collect(),
        };

        let response = self
            .client
            .register_agent(request)
            .await
            .map_err(|e| Error::transport(format!("register failed: {}", e)))?
            .into_inner();

        if !response.success {
            return Err(Error::invalid_request(format!(
                "registration rejected: {}",
                response.message
            )));
        }

        info!(agent_id = %self.agent_id, "Registered with scheduler");
        Ok(())
    }

    /// Open the bidirectional heartbeat stream.
    ///
    /// The returned sender feeds outbound heartbeats; the stream yields the
    /// scheduler's responses (role and dispatches).
    pub async fn open_heartbeat(
        &mut self,
    ) -> Result<(
        tokio::sync::mpsc::Sender<HeartbeatRequest>,
        Streaming<HeartbeatResponse>,
    )> {
        let (tx, rx) = tokio::sync::mpsc::channel(8);

        let inbound = self
            .client
            .heartbeat(ReceiverStream::new(rx))
            .await
            .map_err(|e| Error::transport(format!("heartbeat stream failed: {}", e)))?
            .into_inner();

        Ok((tx, inbound))
    }

    /// Report a task's terminal status.
    pub async fn report_finished(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<()> {
        let request = fleet_proto::TaskFinishedRequest {
            task_id: task_id.to_string(),
            status: status.to_string(),
            error: error.unwrap_or_default(),
            timestamp: timestamp::now(),
        };

        let response = self
            .client
            .task_finished(request)
            .await
            .map_err(|e| Error::transport(format!("task finished report failed: {}", e)))?
            .into_inner();

        if !response.success {
            return Err(Error::invalid_request(format!(
                "task finished report rejected: {}",
                response.message
            )));
        }

        Ok(())
    }

    /// Build an outbound heartbeat message.
    pub fn heartbeat_request(&self, reports: Vec<GpuReport>) -> HeartbeatRequest {
        HeartbeatRequest {
            agent_id: self.agent_id.clone(),
            gpu_status: reports.into_iter().map(Into::into).collect(),
            timestamp: timestamp::now(),
        }
    }
}
