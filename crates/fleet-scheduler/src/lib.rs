//! # fleet-scheduler
//!
//! The gpufleet scheduler daemon: the priority-and-quota placement engine,
//! the agent-facing gRPC endpoint (registration, bidirectional heartbeat,
//! terminal reports), the heartbeat-timeout sweeper, the primary/standby
//! role adapter, and the REST admission surface.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod rest;
pub mod scheduler;
pub mod services;
pub mod sweeper;

pub use config::{Role, SchedulerConfig};
pub use dispatch::DispatchRouter;
pub use engine::Engine;
pub use scheduler::Scheduler;

pub use fleet_core::{Error, Result};
