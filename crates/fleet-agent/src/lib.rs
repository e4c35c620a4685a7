//! # fleet-agent
//!
//! Worker-node daemon for gpufleet.
//!
//! The agent enumerates local GPUs, registers them with the scheduler,
//! keeps a bidirectional heartbeat stream open, executes dispatched tasks
//! with `CUDA_VISIBLE_DEVICES` pinned to their assigned devices, and
//! reports terminal status back.

pub mod agent;
pub mod client;
pub mod config;
pub mod executor;
pub mod gpu;

pub use agent::Agent;
pub use client::SchedulerClient;
pub use config::AgentConfig;
pub use executor::{ExecMethod, TaskExecutor, TaskResult};
pub use gpu::{DetectionMethod, GpuDetector};

pub use fleet_core::{Error, Result};
