//! Task execution on the worker node
//!
//! Execution is a closed set of methods. A dispatched task runs as a child
//! process with `CUDA_VISIBLE_DEVICES` pinned to its assigned device
//! indices and its output captured to a per-task log file; the terminal
//! status flows back over a results channel that the agent forwards to the
//! scheduler.

use fleet_core::{Dispatch, Error, Result, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// How tasks are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMethod {
    /// Spawn the command as a local child process
    Process,
    /// Run in a container; currently falls back to Process
    Docker,
}

/// Terminal result of one task execution
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

/// Runs dispatched tasks and reports their terminal status.
#[derive(Clone)]
pub struct TaskExecutor {
    method: ExecMethod,
    work_dir: std::path::PathBuf,
    // task_id -> the device indices it holds
    running: Arc<RwLock<HashMap<String, Vec<u32>>>>,
    results_tx: mpsc::Sender<TaskResult>,
}

impl TaskExecutor {
    /// Create an executor and the channel its results arrive on.
    pub fn new(
        method: ExecMethod,
        work_dir: impl Into<std::path::PathBuf>,
    ) -> (Self, mpsc::Receiver<TaskResult>) {
        let (results_tx, results_rx) = mpsc::channel(128);
        (
            Self {
                method,
                work_dir: work_dir.into(),
                running: Arc::new(RwLock::new(HashMap::new())),
                results_tx,
            },
            results_rx,
        )
    }

    /// Start executing a dispatch. Returns once the process is spawned;
    /// completion is reported over the results channel.
    pub async fn execute(&self, dispatch: Dispatch) -> Result<()> {
        if self.method == ExecMethod::Docker {
            warn!("Docker execution not implemented yet, running as a process");
        }
        self.execute_as_process(dispatch).await
    }

    async fn execute_as_process(&self, dispatch: Dispatch) -> Result<()> {
        let mut parts = dispatch.command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(Error::invalid_request(format!(
                "task {} has an empty command",
                dispatch.task_id
            )));
        };
        let args: Vec<&str> = parts.collect();

        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            Error::config(format!(
                "failed to create work directory {}: {}",
                self.work_dir.display(),
                e
            ))
        })?;

        let visible_devices = dispatch
            .assigned_device_indices
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let log_path = self.work_dir.join(format!("{}.log", dispatch.task_id));
        let log_file = std::fs::File::create(&log_path)
            .map_err(|e| Error::config(format!("failed to create task log: {}", e)))?;
        let log_stderr = log_file
            .try_clone()
            .map_err(|e| Error::config(format!("failed to clone task log handle: {}", e)))?;

        let mut command = Command::new(program);
        command
            .args(&args)
            .current_dir(&self.work_dir)
            .env("CUDA_VISIBLE_DEVICES", &visible_devices)
            .envs(&dispatch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_stderr));

        let mut child = command.spawn().map_err(|e| {
            Error::invalid_request(format!(
                "failed to start task {}: {}",
                dispatch.task_id, e
            ))
        })?;

        info!(
            task_id = %dispatch.task_id,
            command = %dispatch.command,
            devices = %visible_devices,
            log = %log_path.display(),
            "Task started"
        );

        self.running
            .write()
            .await
            .insert(dispatch.task_id.clone(), dispatch.assigned_device_indices.clone());

        let running = self.running.clone();
        let results_tx = self.results_tx.clone();
        let task_id = dispatch.task_id.clone();

        tokio::spawn(async move {
            let result = match child.wait().await {
                Ok(status) if status.success() => TaskResult {
                    task_id: task_id.clone(),
                    status: TaskStatus::Success,
                    error: None,
                },
                Ok(status) => TaskResult {
                    task_id: task_id.clone(),
                    status: TaskStatus::Failed,
                    error: Some(format!("process exited with {}", status)),
                },
                Err(e) => TaskResult {
                    task_id: task_id.clone(),
                    status: TaskStatus::Failed,
                    error: Some(format!("failed to await process: {}", e)),
                },
            };

            running.write().await.remove(&task_id);

            info!(task_id, status = %result.status, "Task finished");
            if results_tx.send(result).await.is_err() {
                warn!(task_id, "Result receiver dropped");
            }
        });

        Ok(())
    }

    /// Task ids currently executing.
    pub async fn running_tasks(&self) -> Vec<String> {
        self.running.read().await.keys().cloned().collect()
    }

    /// Device indices currently held by running tasks.
    pub async fn busy_devices(&self) -> HashSet<u32> {
        self.running
            .read()
            .await
            .values()
            .flatten()
            .copied()
            .collect()
    }
}
