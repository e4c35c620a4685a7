//! Scheduler daemon wiring
//!
//! Builds the state manager, engine, sweeper, snapshot lane, and both
//! servers from configuration, and runs them until a shutdown signal.
//! Snapshot load and reconciliation complete before anything serves.

use crate::config::SchedulerConfig;
use crate::dispatch::DispatchRouter;
use crate::engine::Engine;
use crate::rest::RestServer;
use crate::services::{ping_peer, AgentPlane, ReplicationEndpoint, RoleAdapter};
use crate::sweeper::Sweeper;
use fleet_core::{Error, Result};
use fleet_proto::{ReplicationServiceServer, SchedulerServiceServer};
use fleet_state::{Snapshotter, StateManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub struct Scheduler {
    config: SchedulerConfig,
    state: StateManager,
    engine: Arc<Engine>,
    dispatch: DispatchRouter,
    role: RoleAdapter,
    snapshot_rx: Option<mpsc::Receiver<()>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Build a scheduler from configuration.
    ///
    /// Loads the snapshot if one exists (a snapshot that exists but fails
    /// to parse is fatal), applies the boot quota fractions, and reconciles
    /// tasks lost across the restart.
    pub async fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let (state, snapshot_rx) = StateManager::new();

        if let Some(loaded) = Snapshotter::load(&config.storage.snapshot_dir).await? {
            state.restore(loaded).await;
        }

        state
            .set_quota(config.quota.online_fraction, config.batch_fraction())
            .await?;

        let lost = state.reconcile().await;
        if !lost.is_empty() {
            warn!(count = lost.len(), ?lost, "Reconciled tasks lost across restart");
        }

        let role = RoleAdapter::new(config.scheduler_id.clone(), config.scheduling.role);
        let dispatch = DispatchRouter::new(config.dispatch.queue_limit);
        let engine = Arc::new(Engine::new(
            state.clone(),
            dispatch.clone(),
            role.clone(),
            Duration::from_secs(config.scheduling.schedule_interval_seconds),
            config.scheduling.selection_seed,
        ));

        Ok(Self {
            config,
            state,
            engine,
            dispatch,
            role,
            snapshot_rx: Some(snapshot_rx),
        })
    }

    /// Run the scheduler until SIGINT/SIGTERM, then shut down gracefully
    /// with a final snapshot.
    pub async fn run(mut self) -> Result<()> {
        info!(
            scheduler_id = %self.config.scheduler_id,
            role = %self.config.scheduling.role,
            grpc = %self.config.server.grpc_addr,
            http = %self.config.server.http_addr,
            "Starting gpufleet scheduler"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let snapshot_rx = self
            .snapshot_rx
            .take()
            .ok_or_else(|| Error::config("scheduler already running"))?;
        let snapshotter = Snapshotter::new(
            self.state.clone(),
            self.config.storage.snapshot_dir.clone(),
            Duration::from_secs(self.config.scheduling.snapshot_interval_seconds),
            snapshot_rx,
        );
        let snapshot_handle = tokio::spawn(snapshotter.run(shutdown_rx.clone()));

        let engine_handle = tokio::spawn(self.engine.clone().run(shutdown_rx.clone()));

        let sweeper = Sweeper::new(
            self.state.clone(),
            self.dispatch.clone(),
            self.engine.clone(),
            self.config.agent.heartbeat_timeout_seconds,
            Duration::from_secs(self.config.agent.sweep_interval_seconds),
        );
        let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx.clone()));

        let agent_plane = AgentPlane::new(
            self.state.clone(),
            self.engine.clone(),
            self.dispatch.clone(),
            self.role.clone(),
        );
        let replication = ReplicationEndpoint::new(self.role.clone());
        let grpc_addr = self.config.server.grpc_addr;
        let mut grpc_shutdown = shutdown_rx.clone();
        let grpc_handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(SchedulerServiceServer::new(agent_plane))
                .add_service(ReplicationServiceServer::new(replication))
                .serve_with_shutdown(grpc_addr, async move {
                    let _ = grpc_shutdown.changed().await;
                })
                .await
                .map_err(|e| Error::transport(format!("agent RPC server failed: {}", e)))
        });

        let rest = RestServer::new(self.state.clone(), self.engine.clone(), self.role.clone());
        let rest_handle = tokio::spawn(rest.serve(self.config.server.http_addr, shutdown_rx.clone()));

        if let Some(peer_addr) = self.config.replication.peer_addr.clone() {
            let scheduler_id = self.config.scheduler_id.clone();
            let interval = Duration::from_secs(self.config.replication.ping_interval_seconds);
            let mut ping_shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = ping_shutdown.changed() => break,
                    }
                    match ping_peer(&peer_addr, &scheduler_id).await {
                        Ok(pong) => info!(
                            peer = %pong.responder_id,
                            peer_is_primary = pong.is_primary,
                            "Peer ping ok"
                        ),
                        Err(e) => warn!(peer_addr, "Peer ping failed: {}", e),
                    }
                }
            });
        }

        info!("gpufleet scheduler started");

        // A server that dies before any signal is a fatal error (bad bind,
        // port in use); surface it as a non-zero exit.
        tokio::select! {
            _ = wait_for_signal() => {
                info!("Shutdown signal received");
            }
            result = grpc_handle => {
                shutdown_tx.send(true).ok();
                return flatten_server_exit("agent RPC", result);
            }
            result = rest_handle => {
                shutdown_tx.send(true).ok();
                return flatten_server_exit("REST", result);
            }
        }

        shutdown_tx.send(true).ok();

        let _ = engine_handle.await;
        let _ = sweeper_handle.await;
        // The snapshot lane writes a final snapshot on its way out.
        let _ = snapshot_handle.await;

        info!("gpufleet scheduler stopped");
        Ok(())
    }
}

fn flatten_server_exit(
    name: &str,
    result: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(Error::transport(format!("{} server panicked: {}", name, e))),
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
