//! # fleet-proto
//!
//! Protocol buffer definitions and generated gRPC bindings for gpufleet.
//!
//! This crate provides the wire API between fleet agents and the scheduler
//! (registration, the bidirectional heartbeat stream, terminal task
//! reports) and the Ping exchanged by a primary/standby scheduler pair.

pub mod conversions;

// Generated protobuf code
pub mod v1 {
    tonic::include_proto!("gpufleet.v1");
}

// Re-export commonly used types for convenience (both server and client)
pub use v1::{
    replication_service_client::ReplicationServiceClient,
    replication_service_server::{ReplicationService, ReplicationServiceServer},
    scheduler_service_client::SchedulerServiceClient,
    scheduler_service_server::{SchedulerService, SchedulerServiceServer},
    GpuSpec, GpuStatusReport, HeartbeatRequest, HeartbeatResponse, PingRequest, PingResponse,
    RegisterRequest, RegisterResponse, TaskDispatch, TaskFinishedRequest, TaskFinishedResponse,
};

/// Common error type for proto conversions
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;

/// Wire timestamps are unix seconds, as signed 64-bit integers
pub mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};

    /// Current time as a wire timestamp
    pub fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Convert a wire timestamp back to UTC, clamping out-of-range values
    pub fn to_datetime(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
    }
}
