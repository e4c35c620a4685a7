//! Durable snapshots of the fleet state
//!
//! The state is persisted as a single JSON document using temp-file plus
//! atomic-rename semantics, so a crash can never leave a torn snapshot on
//! disk. Two writers share one serialized lane: a fixed-interval periodic
//! writer and a change-coalescing writer fed by the state manager's commit
//! signal.

use crate::store::{FleetState, StateManager};
use fleet_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

const SNAPSHOT_FILE: &str = "state.json";

/// Writes snapshots of the fleet state to a single file in `dir`.
pub struct Snapshotter {
    state: StateManager,
    dir: PathBuf,
    interval: Duration,
    changes: mpsc::Receiver<()>,
}

impl Snapshotter {
    pub fn new(
        state: StateManager,
        dir: impl Into<PathBuf>,
        interval: Duration,
        changes: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            state,
            dir: dir.into(),
            interval,
            changes,
        }
    }

    /// Load a snapshot from `dir`.
    ///
    /// A missing file is a clean cold start and returns `Ok(None)`. A file
    /// that exists but fails to parse is fatal: silent state divergence is
    /// worse than refusing to start.
    pub async fn load(dir: impl AsRef<Path>) -> Result<Option<FleetState>> {
        let path = dir.as_ref().join(SNAPSHOT_FILE);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::persistence(format!(
                    "failed to read snapshot {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let state: FleetState = serde_json::from_slice(&data).map_err(|e| {
            Error::persistence(format!(
                "failed to parse snapshot {}: {}",
                path.display(),
                e
            ))
        })?;

        info!(path = %path.display(), version = state.version, "Snapshot loaded");
        Ok(Some(state))
    }

    /// Write one snapshot now, regardless of pending signals.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.view().await;
        write_snapshot(&self.dir, &state).await
    }

    /// Run the snapshot lane until `shutdown` flips, then write a final
    /// snapshot.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let write_due = tokio::select! {
                _ = ticker.tick() => true,
                changed = self.changes.recv() => changed.is_some(),
                _ = shutdown.changed() => break,
            };

            if write_due {
                if let Err(e) = self.save().await {
                    error!("Snapshot write failed: {}", e);
                }
            }
        }

        if let Err(e) = self.save().await {
            error!("Final snapshot write failed: {}", e);
        } else {
            info!("Final snapshot written");
        }
    }
}

async fn write_snapshot(dir: &Path, state: &FleetState) -> Result<()> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        Error::persistence(format!(
            "failed to create snapshot directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let path = dir.join(SNAPSHOT_FILE);
    let temp_path = dir.join(format!("{}.tmp", SNAPSHOT_FILE));

    let data = serde_json::to_vec_pretty(state)
        .map_err(|e| Error::persistence(format!("failed to serialize state: {}", e)))?;

    tokio::fs::write(&temp_path, &data).await.map_err(|e| {
        Error::persistence(format!(
            "failed to write snapshot {}: {}",
            temp_path.display(),
            e
        ))
    })?;

    // Flush file contents before the rename makes them visible.
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .open(&temp_path)
        .await
        .map_err(|e| Error::persistence(format!("failed to reopen snapshot: {}", e)))?;
    file.sync_all()
        .await
        .map_err(|e| Error::persistence(format!("failed to sync snapshot: {}", e)))?;

    tokio::fs::rename(&temp_path, &path).await.map_err(|e| {
        Error::persistence(format!(
            "failed to rename snapshot into place {}: {}",
            path.display(),
            e
        ))
    })?;

    debug!(path = %path.display(), version = state.version, "Snapshot written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{Priority, Task};
    use tempfile::TempDir;

    async fn seeded_manager() -> (StateManager, mpsc::Receiver<()>) {
        let (manager, rx) = StateManager::new();
        manager
            .submit_task(Task::new("t1", Priority::High, 1, "train.sh"))
            .await
            .unwrap();
        (manager, rx)
    }

    #[tokio::test]
    async fn test_load_missing_is_cold_start() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = Snapshotter::load(temp_dir.path()).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, rx) = seeded_manager().await;
        let saved = manager.view().await;

        let snapshotter =
            Snapshotter::new(manager.clone(), temp_dir.path(), Duration::from_secs(60), rx);
        snapshotter.save().await.unwrap();

        // Mutate in memory after the save.
        manager
            .submit_task(Task::new("t2", Priority::Low, 1, "batch.sh"))
            .await
            .unwrap();

        let loaded = Snapshotter::load(temp_dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_load_garbage_refuses() {
        let temp_dir = TempDir::new().unwrap();
        tokio::fs::write(temp_dir.path().join(SNAPSHOT_FILE), b"{not json")
            .await
            .unwrap();

        let err = Snapshotter::load(temp_dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, rx) = seeded_manager().await;

        let snapshotter =
            Snapshotter::new(manager, temp_dir.path(), Duration::from_secs(60), rx);
        snapshotter.save().await.unwrap();

        assert!(temp_dir.path().join(SNAPSHOT_FILE).exists());
        assert!(!temp_dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_run_writes_on_change_signal() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, rx) = seeded_manager().await;

        let snapshotter = Snapshotter::new(
            manager.clone(),
            temp_dir.path(),
            Duration::from_secs(3600),
            rx,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(snapshotter.run(shutdown_rx));

        // The submit in seeded_manager left a pending change signal; the
        // startup tick also forces a write. Either way the file appears.
        for _ in 0..50 {
            if temp_dir.path().join(SNAPSHOT_FILE).exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(temp_dir.path().join(SNAPSHOT_FILE).exists());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let loaded = Snapshotter::load(temp_dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, manager.view().await);
    }
}
