//! Conversions between fleet-core types and protobuf types
//!
//! The core types carry richer state (lifecycle status, timestamps,
//! back-pointers) than the wire messages; conversions in the proto → core
//! direction validate enum strings and fail on unknown values.

use crate::{v1 as proto, ProtoError};
use chrono::Utc;
use fleet_core::{Dispatch, Gpu, GpuReport, GpuStatus, Priority};

impl proto::GpuSpec {
    /// Materialize the declared device as an Idle GPU owned by `node_id`
    pub fn into_gpu(self, node_id: &str) -> Gpu {
        Gpu {
            id: self.id,
            node_id: node_id.to_string(),
            device_index: self.device_index,
            model: self.model,
            memory_bytes: self.memory_bytes,
            status: GpuStatus::Idle,
            current_task_id: None,
            updated_at: Utc::now(),
        }
    }
}

impl From<Gpu> for proto::GpuSpec {
    fn from(gpu: Gpu) -> Self {
        Self {
            id: gpu.id,
            device_index: gpu.device_index,
            model: gpu.model,
            memory_bytes: gpu.memory_bytes,
        }
    }
}

impl TryFrom<proto::GpuStatusReport> for GpuReport {
    type Error = ProtoError;

    fn try_from(report: proto::GpuStatusReport) -> Result<Self, Self::Error> {
        let status: GpuStatus = report
            .status
            .parse()
            .map_err(ProtoError::InvalidData)?;

        Ok(Self {
            gpu_id: report.id,
            status,
            utilization_pct: report.utilization_pct,
            memory_used_bytes: report.memory_used_bytes,
        })
    }
}

impl From<GpuReport> for proto::GpuStatusReport {
    fn from(report: GpuReport) -> Self {
        Self {
            id: report.gpu_id,
            status: report.status.to_string(),
            utilization_pct: report.utilization_pct,
            memory_used_bytes: report.memory_used_bytes,
        }
    }
}

impl From<Dispatch> for proto::TaskDispatch {
    fn from(dispatch: Dispatch) -> Self {
        Self {
            id: dispatch.task_id,
            priority: dispatch.priority.to_string(),
            gpu_count: dispatch.gpu_count,
            command: dispatch.command,
            env: dispatch.env,
            assigned_gpus: dispatch.assigned_gpu_ids,
            assigned_device_indices: dispatch.assigned_device_indices,
        }
    }
}

impl TryFrom<proto::TaskDispatch> for Dispatch {
    type Error = ProtoError;

    fn try_from(dispatch: proto::TaskDispatch) -> Result<Self, Self::Error> {
        let priority: Priority = dispatch
            .priority
            .parse()
            .map_err(ProtoError::InvalidData)?;

        Ok(Self {
            task_id: dispatch.id,
            priority,
            gpu_count: dispatch.gpu_count,
            command: dispatch.command,
            env: dispatch.env,
            assigned_gpu_ids: dispatch.assigned_gpus,
            assigned_device_indices: dispatch.assigned_device_indices,
        })
    }
}
