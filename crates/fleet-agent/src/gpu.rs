//! Local GPU inventory and status
//!
//! Detection is a closed set of methods. NVML support rides on the
//! nvidia-smi query interface for now, the same CSV surface, so both
//! variants share one parser.

use chrono::Utc;
use fleet_core::{Error, Gpu, GpuReport, GpuStatus, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::process::Command;
use tracing::{debug, warn};

const MIB: u64 = 1024 * 1024;

/// How the agent enumerates local devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    NvidiaSmi,
    Nvml,
}

/// Detects and reports on the GPUs of one node
#[derive(Debug, Clone)]
pub struct GpuDetector {
    method: DetectionMethod,
    node_id: String,
}

impl GpuDetector {
    pub fn new(method: DetectionMethod, node_id: impl Into<String>) -> Self {
        Self {
            method,
            node_id: node_id.into(),
        }
    }

    /// Enumerate all GPUs on this node.
    pub async fn detect(&self) -> Result<Vec<Gpu>> {
        if self.method == DetectionMethod::Nvml {
            debug!("NVML detection uses the nvidia-smi query interface");
        }

        let output = run_nvidia_smi(&[
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .await?;

        let gpus = parse_inventory(&output, &self.node_id);
        if gpus.is_empty() {
            return Err(Error::config("no GPUs detected on this node"));
        }
        Ok(gpus)
    }

    /// Current utilization of the node's GPUs, with status derived from the
    /// set of devices the executor currently holds.
    pub async fn status_reports(
        &self,
        gpus: &[Gpu],
        busy_devices: &HashSet<u32>,
    ) -> Result<Vec<GpuReport>> {
        let output = run_nvidia_smi(&[
            "--query-gpu=index,utilization.gpu,memory.used",
            "--format=csv,noheader,nounits",
        ])
        .await?;

        Ok(parse_utilization(&output, gpus, busy_devices))
    }

    /// Quick liveness probe of the driver stack.
    pub async fn health_check(&self) -> Result<()> {
        run_nvidia_smi(&["-L"]).await.map(|_| ())
    }
}

/// Build heartbeat reports without touching the driver, used when the
/// query interface is unavailable.
pub fn synthesize_reports(gpus: &[Gpu], busy_devices: &HashSet<u32>) -> Vec<GpuReport> {
    gpus.iter()
        .map(|gpu| GpuReport {
            gpu_id: gpu.id.clone(),
            status: device_status(gpu.device_index, busy_devices),
            utilization_pct: 0.0,
            memory_used_bytes: 0,
        })
        .collect()
}

fn device_status(device_index: u32, busy_devices: &HashSet<u32>) -> GpuStatus {
    if busy_devices.contains(&device_index) {
        GpuStatus::Busy
    } else {
        GpuStatus::Idle
    }
}

async fn run_nvidia_smi(args: &[&str]) -> Result<String> {
    let output = Command::new("nvidia-smi")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::config(format!("failed to run nvidia-smi: {}", e)))?;

    if !output.status.success() {
        return Err(Error::config(format!(
            "nvidia-smi exited with {}",
            output.status
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| Error::config(format!("nvidia-smi produced invalid utf-8: {}", e)))
}

fn parse_inventory(output: &str, node_id: &str) -> Vec<Gpu> {
    let mut gpus = Vec::new();

    for line in output.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            continue;
        }

        let Ok(index) = parts[0].parse::<u32>() else {
            warn!(line, "Skipping unparsable nvidia-smi inventory line");
            continue;
        };
        let Ok(memory_mib) = parts[2].parse::<u64>() else {
            warn!(line, "Skipping unparsable nvidia-smi inventory line");
            continue;
        };

        gpus.push(Gpu {
            id: Gpu::make_id(node_id, index),
            node_id: node_id.to_string(),
            device_index: index,
            model: parts[1].to_string(),
            memory_bytes: memory_mib * MIB,
            status: GpuStatus::Idle,
            current_task_id: None,
            updated_at: Utc::now(),
        });
    }

    gpus
}

fn parse_utilization(output: &str, gpus: &[Gpu], busy_devices: &HashSet<u32>) -> Vec<GpuReport> {
    let mut reports = Vec::new();

    for line in output.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            continue;
        }

        let Ok(index) = parts[0].parse::<u32>() else {
            continue;
        };
        let utilization_pct = parts[1].parse::<f32>().unwrap_or(0.0);
        let memory_used_mib = parts[2].parse::<u64>().unwrap_or(0);

        let Some(gpu) = gpus.iter().find(|gpu| gpu.device_index == index) else {
            continue;
        };

        reports.push(GpuReport {
            gpu_id: gpu.id.clone(),
            status: device_status(index, busy_devices),
            utilization_pct,
            memory_used_bytes: memory_used_mib * MIB,
        });
    }

    reports
}
