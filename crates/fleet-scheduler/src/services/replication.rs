//! Primary/standby role handling and the scheduler-to-scheduler Ping

use crate::config::Role;
use fleet_proto::{
    timestamp, PingRequest, PingResponse, ReplicationService, ReplicationServiceClient,
};
use tonic::{Request, Response, Status};
use tracing::debug;

/// Holds this instance's configured role and gates role-dependent behavior.
///
/// The role is static configuration: only a primary accepts task
/// submissions and emits dispatches. Election and state transfer are
/// deliberately absent; a standby serves reads and answers Pings so the
/// pair can observe each other.
#[derive(Debug, Clone)]
pub struct RoleAdapter {
    scheduler_id: String,
    role: Role,
}

impl RoleAdapter {
    pub fn new(scheduler_id: impl Into<String>, role: Role) -> Self {
        Self {
            scheduler_id: scheduler_id.into(),
            role,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn scheduler_id(&self) -> &str {
        &self.scheduler_id
    }
}

/// gRPC service answering peer Pings
#[derive(Debug, Clone)]
pub struct ReplicationEndpoint {
    role: RoleAdapter,
}

impl ReplicationEndpoint {
    pub fn new(role: RoleAdapter) -> Self {
        Self { role }
    }
}

#[tonic::async_trait]
impl ReplicationService for ReplicationEndpoint {
    async fn ping(
        &self,
        request: Request<PingRequest>,
    ) -> std::result::Result<Response<PingResponse>, Status> {
        let req = request.into_inner();
        debug!(sender_id = %req.sender_id, "Ping received");

        Ok(Response::new(PingResponse {
            responder_id: self.role.scheduler_id().to_string(),
            is_primary: self.role.is_primary(),
            timestamp: timestamp::now(),
        }))
    }
}

/// Ping the peer scheduler once, returning its reported role.
pub async fn ping_peer(
    peer_addr: &str,
    sender_id: &str,
) -> std::result::Result<PingResponse, fleet_core::Error> {
    let mut client = ReplicationServiceClient::connect(peer_addr.to_string())
        .await
        .map_err(|e| fleet_core::Error::transport(format!("peer connect failed: {}", e)))?;

    let response = client
        .ping(PingRequest {
            sender_id: sender_id.to_string(),
            timestamp: timestamp::now(),
        })
        .await
        .map_err(|e| fleet_core::Error::transport(format!("peer ping failed: {}", e)))?;

    Ok(response.into_inner())
}
