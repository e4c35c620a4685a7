//! # fleet-state
//!
//! Authoritative scheduler state and durable snapshots for gpufleet.
//!
//! This crate provides:
//! - The in-memory fleet state (GPUs, tasks, priority queues, agents,
//!   quota) behind a single readers-writer lock
//! - Transactional mutations that preserve the cross-entity invariants
//! - Snapshot persistence with temp-file-plus-atomic-rename semantics
//! - Load-time reconciliation of tasks lost across a restart

pub mod snapshot;
pub mod store;

pub use snapshot::Snapshotter;
pub use store::{FleetState, StateManager};
