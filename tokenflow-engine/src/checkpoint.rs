//! Automatic checkpoints.
//!
//! The manager snapshots the store once enough commits or WAL bytes have
//! piled up since the last snapshot, which lets the store drop the segments
//! the snapshot covers.

use crate::config::CheckpointConfig;
use crate::engine::ProcessEngine;
use crate::error::EngineError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokenflow_storage::CheckpointResult;
use tokio::sync::Notify;

/// Runs checkpoints in the background when thresholds are crossed.
pub struct CheckpointManager {
    engine: Arc<ProcessEngine>,
    config: CheckpointConfig,
    last_checkpoint: parking_lot::Mutex<Instant>,
    checkpoints: AtomicU64,
    segments_deleted: AtomicU64,
    shutdown: AtomicBool,
    notify: Notify,
}

impl CheckpointManager {
    pub fn new(engine: Arc<ProcessEngine>, config: CheckpointConfig) -> Self {
        Self {
            engine,
            config,
            last_checkpoint: parking_lot::Mutex::new(Instant::now()),
            checkpoints: AtomicU64::new(0),
            segments_deleted: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Whether a threshold is crossed and the minimum interval has passed.
    pub fn should_checkpoint(&self) -> bool {
        if self.config.is_disabled() || !self.engine.store().is_durable() {
            return false;
        }

        if self.last_checkpoint.lock().elapsed() < self.config.min_interval() {
            return false;
        }

        let store = self.engine.store();
        if self.config.commits_threshold > 0
            && store.commits_since_checkpoint() >= self.config.commits_threshold
        {
            return true;
        }

        if self.config.size_threshold() > 0 {
            match store.wal_size() {
                Ok(size) if size >= self.config.size_threshold() => return true,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "could not read WAL size"),
            }
        }

        false
    }

    /// Checkpoints now, regardless of thresholds.
    pub fn run_checkpoint(&self) -> Result<CheckpointResult, EngineError> {
        let result = self.engine.checkpoint()?;
        *self.last_checkpoint.lock() = Instant::now();
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.segments_deleted
            .fetch_add(result.segments_deleted as u64, Ordering::Relaxed);
        Ok(result)
    }

    /// Runs the checkpoint loop (call from a background task).
    pub async fn run(&self) {
        if self.config.is_disabled() {
            tracing::info!("Automatic checkpoints are disabled");
            return;
        }

        tracing::info!(
            "Checkpoint manager started (commits_threshold={}, size_threshold_mb={})",
            self.config.commits_threshold,
            self.config.size_threshold_mb
        );

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.check_interval()) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            if self.should_checkpoint() {
                tracing::debug!("Starting automatic checkpoint");
                match self.run_checkpoint() {
                    Ok(result) => tracing::info!(
                        "Auto-checkpoint complete: {} segments deleted",
                        result.segments_deleted
                    ),
                    Err(e) => tracing::error!(error = %e, "automatic checkpoint failed"),
                }
            }
        }

        tracing::info!("Checkpoint manager stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            segments_deleted: self.segments_deleted.load(Ordering::Relaxed),
            commits_since_checkpoint: self.engine.store().commits_since_checkpoint(),
            since_last: self.last_checkpoint.lock().elapsed(),
        }
    }
}

/// Checkpoint counters.
#[derive(Debug)]
pub struct CheckpointStats {
    pub checkpoints: u64,
    pub segments_deleted: u64,
    pub commits_since_checkpoint: u64,
    pub since_last: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokenflow_core::BehaviorRegistry;
    use tokenflow_storage::{EngineStore, StoreConfig};

    fn wait_document() -> serde_json::Value {
        json!({
            "activities": [
                {"id": "start", "type": "startEvent"},
                {"id": "wait", "type": "receiveTask"},
                {"id": "end", "type": "endEvent"}
            ],
            "flows": [
                {"id": "f1", "from": "start", "to": "wait"},
                {"id": "f2", "from": "wait", "to": "end"}
            ]
        })
    }

    fn durable_engine(dir: &TempDir) -> Arc<ProcessEngine> {
        let store = EngineStore::open(StoreConfig::new(dir.path()).with_segment_size(2048)).unwrap();
        Arc::new(
            ProcessEngine::builder()
                .store(Arc::new(store))
                .registry(BehaviorRegistry::new())
                .build(),
        )
    }

    fn config(commits_threshold: u64) -> CheckpointConfig {
        CheckpointConfig {
            enabled: true,
            commits_threshold,
            size_threshold_mb: 0,
            min_interval_secs: 0,
            check_interval_ms: 10,
        }
    }

    fn start_instances(engine: &ProcessEngine, count: usize) {
        for _ in 0..count {
            engine
                .start_process_instance("wait", None, BTreeMap::new())
                .unwrap();
        }
    }

    #[test]
    fn test_thresholds_gate_checkpoints() {
        let dir = TempDir::new().unwrap();
        let engine = durable_engine(&dir);
        engine.deploy("wait", &wait_document()).unwrap();

        let manager = CheckpointManager::new(Arc::clone(&engine), config(5));
        start_instances(&engine, 4);
        assert!(!manager.should_checkpoint());
        start_instances(&engine, 1);
        assert!(manager.should_checkpoint());

        let result = manager.run_checkpoint().unwrap();
        assert!(result.snapshot.is_some());
        assert!(!manager.should_checkpoint());
        let stats = manager.stats();
        assert_eq!(stats.checkpoints, 1);
        assert_eq!(stats.commits_since_checkpoint, 0);

        let mut spaced = config(1);
        spaced.min_interval_secs = 3600;
        let spaced = CheckpointManager::new(Arc::clone(&engine), spaced);
        start_instances(&engine, 1);
        assert!(!spaced.should_checkpoint());
    }

    #[test]
    fn test_in_memory_engine_never_checkpoints() {
        let engine = Arc::new(ProcessEngine::builder().build());
        engine.deploy("wait", &wait_document()).unwrap();
        let manager = CheckpointManager::new(Arc::clone(&engine), config(1));
        start_instances(&engine, 3);
        assert!(!manager.should_checkpoint());
    }

    #[tokio::test]
    async fn test_run_loop_compacts_and_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let engine = durable_engine(&dir);
        engine.deploy("wait", &wait_document()).unwrap();
        start_instances(&engine, 20);

        let manager = Arc::new(CheckpointManager::new(Arc::clone(&engine), config(10)));
        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run().await })
        };

        let done = tokio::time::timeout(Duration::from_secs(5), async {
            while manager.stats().checkpoints == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(done.is_ok());

        manager.shutdown();
        task.await.unwrap();
        assert!(manager.stats().segments_deleted > 0);

        engine.close().unwrap();
        drop(manager);
        drop(engine);

        let reopened = durable_engine(&dir);
        let stats = reopened.stats();
        assert_eq!(stats.process_instances, 20);
        assert_eq!(stats.commits, 20);
    }
}
