//! # fleet-core
//!
//! Core types, errors, and shared configuration for gpufleet.
//!
//! This crate defines the entities the scheduler reasons about (GPUs,
//! tasks, agents, quota) and the unified error type used across all
//! gpufleet components. It carries no I/O beyond config file helpers.

pub mod config;
pub mod error;
pub mod types;

pub use config::{init_logging, load_yaml, save_yaml, LoggingConfig};
pub use error::{Error, Result};
pub use types::{
    Agent, AgentStatus, Dispatch, Gpu, GpuReport, GpuStatus, Priority, Quota, Task, TaskStatus,
};
