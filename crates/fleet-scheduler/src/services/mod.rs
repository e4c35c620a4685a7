//! gRPC services hosted by the scheduler daemon

pub mod agent_plane;
pub mod replication;

pub use agent_plane::AgentPlane;
pub use replication::{ping_peer, ReplicationEndpoint, RoleAdapter};
