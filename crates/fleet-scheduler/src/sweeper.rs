//! Heartbeat-timeout sweeper
//!
//! Periodically scans for Online agents whose last heartbeat is older than
//! the configured timeout, declares them offline (which force-fails the
//! tasks running on their GPUs), drops their queued dispatches, and wakes
//! the engine to reuse whatever capacity the reaping returned elsewhere.

use crate::dispatch::DispatchRouter;
use crate::engine::Engine;
use fleet_state::StateManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Sweeper {
    state: StateManager,
    dispatch: DispatchRouter,
    engine: Arc<Engine>,
    timeout_seconds: u64,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        state: StateManager,
        dispatch: DispatchRouter,
        engine: Arc<Engine>,
        timeout_seconds: u64,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            dispatch,
            engine,
            timeout_seconds,
            interval,
        }
    }

    /// Run sweep passes until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.sweep().await;
        }
        info!("Heartbeat sweeper stopped");
    }

    /// One pass: reap every agent past the timeout.
    pub async fn sweep(&self) {
        let overdue = self.state.agents_overdue(self.timeout_seconds).await;

        for agent_id in overdue {
            warn!(agent_id, timeout_seconds = self.timeout_seconds, "Agent heartbeat timed out");

            match self.state.mark_agent_offline(&agent_id).await {
                Ok(reaped) => {
                    let dropped = self.dispatch.drop_agent(&agent_id).await;
                    if !reaped.is_empty() || dropped > 0 {
                        warn!(
                            agent_id,
                            reaped_tasks = reaped.len(),
                            dropped_dispatches = dropped,
                            "Reaped offline agent"
                        );
                        self.engine.wake();
                    }
                }
                Err(e) => warn!(agent_id, "Failed to mark agent offline: {}", e),
            }
        }
    }
}
