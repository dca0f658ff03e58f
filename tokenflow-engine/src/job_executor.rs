//! Background job acquisition and execution.
//!
//! The executor loop locks due jobs in batches and hands each one to a
//! bounded pool of blocking workers. Locking is a compare-and-set on the
//! job's revision, so several executors (or several engines on one store)
//! never run the same job twice while its lock holds. A lock that expires
//! makes the job acquirable again.

use crate::config::JobExecutorConfig;
use crate::engine::ProcessEngine;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokenflow_core::Job;
use tokio::sync::{Notify, Semaphore};

/// Shortest sleep between acquisition cycles.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Acquires due jobs and runs them on a worker pool.
pub struct JobExecutor {
    engine: Arc<ProcessEngine>,
    config: JobExecutorConfig,
    lock_owner: String,
    workers: Arc<Semaphore>,
    shutdown: AtomicBool,
    wakeup: Notify,
    acquired: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    conflicts: AtomicU64,
    rejected: AtomicU64,
}

impl JobExecutor {
    pub fn new(engine: Arc<ProcessEngine>, config: JobExecutorConfig) -> Self {
        let lock_owner = config
            .lock_owner
            .clone()
            .unwrap_or_else(|| format!("tokenflow-{}", uuid::Uuid::new_v4()));
        Self {
            engine,
            workers: Arc::new(Semaphore::new(config.max_workers)),
            config,
            lock_owner,
            shutdown: AtomicBool::new(false),
            wakeup: Notify::new(),
            acquired: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    /// Locks up to one batch of due jobs, never more than there are idle workers.
    pub fn acquire_jobs(&self) -> Vec<Job> {
        let limit = self
            .config
            .max_jobs_per_acquisition
            .min(self.workers.available_permits());
        if limit == 0 {
            return Vec::new();
        }

        let store = self.engine.store();
        let now = self.engine.now();
        let expiration = now + self.config.lock_time();
        let mut acquired = Vec::new();
        for job in store.find_acquirable_jobs(now, limit) {
            match store.try_lock_job(&job.id, job.revision, &self.lock_owner, expiration) {
                Ok(locked) => acquired.push(locked),
                Err(e) if e.is_optimistic_lock() => {
                    // Another executor got there first.
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(job = %job.id, "job already acquired elsewhere");
                }
                Err(e) => {
                    tracing::warn!(job = %job.id, error = %e, "failed to lock job");
                }
            }
        }

        if !acquired.is_empty() {
            self.acquired
                .fetch_add(acquired.len() as u64, Ordering::Relaxed);
            tracing::debug!(owner = %self.lock_owner, count = acquired.len(), "acquired jobs");
        }
        acquired
    }

    /// Runs an acquired job on the calling thread. Returns whether it succeeded.
    pub fn execute(&self, job: &Job) -> bool {
        match self.engine.run_job(&job.id, Some(&self.lock_owner)) {
            Ok(()) => {
                self.executed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job = %job.id, code = e.error_code(), error = %e, "job did not complete");
                false
            }
        }
    }

    fn dispatch(self: &Arc<Self>, job: Job) {
        let permit = match Arc::clone(&self.workers).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job = %job.id, "worker pool saturated, releasing job");
                if let Err(e) = self.engine.store().unlock_job(&job) {
                    // The lock simply expires.
                    tracing::warn!(job = %job.id, error = %e, "failed to release job");
                }
                return;
            }
        };

        let executor = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            executor.execute(&job);
            drop(_permit);
            executor.wakeup.notify_one();
        });
    }

    fn next_wait(&self) -> Duration {
        let max_wait = self.config.wait_time();
        if self.workers.available_permits() == 0 {
            // A finishing worker wakes the loop.
            return max_wait;
        }
        let now = self.engine.now();
        match self.engine.store().next_job_due_date(now) {
            Some(due) => (due - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_WAIT, max_wait.max(MIN_WAIT)),
            None => max_wait,
        }
    }

    /// Runs the acquisition loop (call from a background task).
    pub async fn run(self: Arc<Self>) {
        if !self.config.enabled {
            tracing::info!("Job executor is disabled");
            return;
        }

        tracing::info!(
            "Job executor started (owner={}, workers={}, batch={})",
            self.lock_owner,
            self.config.max_workers,
            self.config.max_jobs_per_acquisition
        );

        let job_notify = self.engine.job_notify();
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let jobs = self.acquire_jobs();
            let full_batch = jobs.len() >= self.config.max_jobs_per_acquisition;
            for job in jobs {
                self.dispatch(job);
            }
            if full_batch {
                tokio::task::yield_now().await;
                continue;
            }

            let wait = self.next_wait();
            tokio::select! {
                _ = job_notify.notified() => {}
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!("Job executor stopped");
    }

    /// Stops acquiring. Running jobs finish; see [`JobExecutor::drain`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wakeup.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Waits until every worker is idle.
    pub async fn drain(&self) {
        let total = self.config.max_workers.min(u32::MAX as usize) as u32;
        if let Ok(permits) = self.workers.acquire_many(total).await {
            drop(permits);
        }
    }

    pub fn stats(&self) -> JobExecutorStats {
        JobExecutorStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            busy_workers: self.config.max_workers - self.workers.available_permits(),
        }
    }
}

/// Job executor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobExecutorStats {
    pub acquired: u64,
    pub executed: u64,
    pub failed: u64,
    /// Lock attempts lost to another executor.
    pub conflicts: u64,
    /// Jobs released again because no worker was free.
    pub rejected: u64,
    pub busy_workers: usize,
}
