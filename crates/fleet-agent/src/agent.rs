//! Agent daemon wiring
//!
//! Detects local GPUs once at startup, then supervises scheduler sessions:
//! connect, register, and drive the heartbeat stream, executing dispatches
//! as they arrive and forwarding terminal results. A lost session is
//! retried with the configured backoff, alternating to the standby address
//! when one is configured.

use crate::client::SchedulerClient;
use crate::config::AgentConfig;
use crate::executor::{TaskExecutor, TaskResult};
use crate::gpu::{synthesize_reports, GpuDetector};
use fleet_core::{Dispatch, Gpu, Result, TaskStatus};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;

        let detector = GpuDetector::new(self.config.gpu.detection_method, &self.config.agent.id);

        info!(agent_id = %self.config.agent.id, "Detecting GPUs");
        let gpus = detector.detect().await?;
        for gpu in &gpus {
            info!(
                id = %gpu.id,
                model = %gpu.model,
                memory_bytes = gpu.memory_bytes,
                "GPU found"
            );
        }

        let (executor, mut results_rx) =
            TaskExecutor::new(self.config.executor.method, self.config.executor.work_dir.clone());

        let supervision = async {
            let retry = Duration::from_secs(self.config.scheduler.retry_interval_seconds);
            let mut attempt: u32 = 0;

            loop {
                let address = self.pick_address(attempt);
                match self
                    .session(&detector, &gpus, &executor, &mut results_rx, address)
                    .await
                {
                    Ok(()) => info!("Scheduler closed the session"),
                    Err(e) => warn!("Scheduler session failed: {}", e),
                }

                attempt += 1;
                tokio::time::sleep(retry).await;
            }
        };

        tokio::select! {
            _ = wait_for_signal() => {
                info!("Shutdown signal received");
            }
            _ = supervision => {}
        }

        info!("gpufleet agent stopped");
        Ok(())
    }

    /// Alternate between primary and standby across failed attempts.
    fn pick_address(&self, attempt: u32) -> &str {
        match &self.config.scheduler.standby_addr {
            Some(standby) if attempt % 2 == 1 => standby,
            _ => &self.config.scheduler.primary_addr,
        }
    }

    /// One connect-register-heartbeat session.
    async fn session(
        &self,
        detector: &GpuDetector,
        gpus: &[Gpu],
        executor: &TaskExecutor,
        results_rx: &mut mpsc::Receiver<TaskResult>,
        address: &str,
    ) -> Result<()> {
        let mut client = SchedulerClient::connect(&self.config.agent.id, address).await?;
        client.register(gpus).await?;

        let (heartbeat_tx, mut inbound) = client.open_heartbeat().await?;

        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.agent.heartbeat_interval_seconds,
        ));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let busy = executor.busy_devices().await;
                    let reports = match detector.status_reports(gpus, &busy).await {
                        Ok(reports) if !reports.is_empty() => reports,
                        Ok(_) => synthesize_reports(gpus, &busy),
                        Err(e) => {
                            debug!("GPU status query failed, synthesizing reports: {}", e);
                            synthesize_reports(gpus, &busy)
                        }
                    };

                    let request = client.heartbeat_request(reports);
                    if heartbeat_tx.send(request).await.is_err() {
                        return Err(fleet_core::Error::transport(
                            "heartbeat stream closed".to_string(),
                        ));
                    }
                }

                message = inbound.message() => {
                    match message {
                        Ok(Some(response)) => {
                            if !response.is_primary {
                                warn!(
                                    address,
                                    "Scheduler is not primary; awaiting failover"
                                );
                            }
                            self.handle_dispatches(&mut client, executor, response.tasks).await;
                        }
                        Ok(None) => return Ok(()),
                        Err(status) => {
                            return Err(fleet_core::Error::transport(format!(
                                "heartbeat stream error: {}",
                                status
                            )));
                        }
                    }
                }

                Some(result) = results_rx.recv() => {
                    if let Err(e) = client
                        .report_finished(&result.task_id, result.status, result.error.clone())
                        .await
                    {
                        warn!(task_id = %result.task_id, "Failed to report task result: {}", e);
                    }
                }
            }
        }
    }

    /// Start every dispatched task; a task that fails to even start is
    /// reported failed right away so the scheduler frees its GPUs.
    async fn handle_dispatches(
        &self,
        client: &mut SchedulerClient,
        executor: &TaskExecutor,
        tasks: Vec<fleet_proto::TaskDispatch>,
    ) {
        for wire_dispatch in tasks {
            let dispatch = match Dispatch::try_from(wire_dispatch) {
                Ok(dispatch) => dispatch,
                Err(e) => {
                    warn!("Ignoring malformed dispatch: {}", e);
                    continue;
                }
            };

            let task_id = dispatch.task_id.clone();
            info!(
                task_id,
                command = %dispatch.command,
                gpus = ?dispatch.assigned_gpu_ids,
                "Executing dispatched task"
            );

            if let Err(e) = executor.execute(dispatch).await {
                warn!(task_id, "Failed to start task: {}", e);
                if let Err(report_err) = client
                    .report_finished(&task_id, TaskStatus::Failed, Some(e.to_string()))
                    .await
                {
                    warn!(task_id, "Failed to report startup failure: {}", report_err);
                }
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
