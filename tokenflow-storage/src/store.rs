//! The engine store.
//!
//! All runtime state lives in in-memory tables guarded by one lock. A commit
//! validates its change set against current revisions, appends it to the WAL
//! and only then applies it, so a crash after the append is repaired by
//! replaying the log on the next open.
//!
//! A checkpoint writes the tables to a snapshot and deletes the WAL segments
//! it covers; opening the store loads that snapshot and replays the rest.

use crate::change::{Change, ChangeSet, Entity, EntityKind};
use crate::error::StorageError;
use crate::index::DueIndex;
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokenflow_core::{Execution, HistoricProcessInstance, Incident, Job, ProcessDefinition};
use tokenflow_wal::{FsyncPolicy, Wal, WalConfig, WalEntry, WalOffset};

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base directory for all storage.
    pub dir: PathBuf,
    /// WAL configuration.
    pub wal: WalConfig,
    /// Table snapshots written at checkpoints.
    pub snapshot_dir: PathBuf,
}

impl StoreConfig {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            wal: WalConfig::new(dir.join("wal")),
            snapshot_dir: dir.join("snapshots"),
            dir,
        }
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.wal = self.wal.with_segment_size(size);
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.wal = self.wal.with_fsync_policy(policy);
        self
    }
}

/// A deployed definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDefinition {
    pub key: String,
    pub version: u32,
    pub checksum: String,
    pub definition: serde_json::Value,
}

/// Outcome of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub key: String,
    pub version: u32,
    pub checksum: String,
    /// `false` when an identical document was already the latest version.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub definitions: usize,
    pub executions: usize,
    pub process_instances: usize,
    pub jobs: usize,
    pub incidents: usize,
    pub history: usize,
    pub commits: u64,
}

/// What a checkpoint did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointResult {
    /// `None` for an in-memory store.
    pub snapshot: Option<SnapshotMeta>,
    pub segments_deleted: usize,
}

/// Table contents as written to a snapshot.
#[derive(Serialize)]
struct TableImageRef<'a> {
    definitions: Vec<&'a StoredDefinition>,
    executions: Vec<&'a Execution>,
    jobs: Vec<&'a Job>,
    incidents: Vec<&'a Incident>,
    history: Vec<&'a HistoricProcessInstance>,
}

/// Table contents as read back from a snapshot.
#[derive(Deserialize)]
struct TableImage {
    definitions: Vec<StoredDefinition>,
    executions: Vec<Execution>,
    jobs: Vec<Job>,
    incidents: Vec<Incident>,
    history: Vec<HistoricProcessInstance>,
}

#[derive(Default)]
struct Tables {
    definitions: BTreeMap<(String, u32), StoredDefinition>,
    executions: HashMap<String, Execution>,
    /// Process instance id -> execution ids.
    instance_executions: HashMap<String, BTreeSet<String>>,
    jobs: HashMap<String, Job>,
    due_index: DueIndex,
    incidents: HashMap<String, Incident>,
    history: HashMap<String, HistoricProcessInstance>,
}

impl Tables {
    fn revision_of(&self, kind: EntityKind, id: &str) -> Option<u64> {
        match kind {
            EntityKind::Execution => self.executions.get(id).map(|e| e.revision),
            EntityKind::Job => self.jobs.get(id).map(|e| e.revision),
            EntityKind::Incident => self.incidents.get(id).map(|e| e.revision),
            EntityKind::History => self.history.get(id).map(|e| e.revision),
        }
    }

    /// Checks every change against the revisions it would see, including
    /// the effect of earlier changes in the same set.
    fn validate(&self, changes: &[Change]) -> Result<(), StorageError> {
        let mut overlay: HashMap<(EntityKind, &str), Option<u64>> = HashMap::new();
        for change in changes {
            let key = (change.kind(), change.id());
            let current = match overlay.get(&key) {
                Some(revision) => *revision,
                None => self.revision_of(key.0, key.1),
            };
            let next = match change {
                Change::Insert { .. } => {
                    if current.is_some() {
                        return Err(StorageError::DuplicateEntity {
                            kind: key.0,
                            id: key.1.to_string(),
                        });
                    }
                    Some(1)
                }
                Change::Update { entity } => {
                    check_revision(key, entity.revision(), current)?;
                    Some(entity.revision() + 1)
                }
                Change::Delete { revision, .. } => {
                    check_revision(key, *revision, current)?;
                    None
                }
            };
            overlay.insert(key, next);
        }
        Ok(())
    }

    fn apply(&mut self, change: Change) {
        match change {
            Change::Insert { mut entity } => {
                entity.set_revision(1);
                self.put(entity);
            }
            Change::Update { mut entity } => {
                entity.set_revision(entity.revision() + 1);
                self.put(entity);
            }
            Change::Delete { kind, id, .. } => self.remove(kind, &id),
        }
    }

    fn put(&mut self, entity: Entity) {
        match entity {
            Entity::Execution(execution) => {
                self.instance_executions
                    .entry(execution.process_instance_id.clone())
                    .or_default()
                    .insert(execution.id.clone());
                self.executions.insert(execution.id.clone(), execution);
            }
            Entity::Job(job) => {
                if let Some(old) = self.jobs.get(&job.id) {
                    self.due_index.remove(old.due_date, &old.id);
                }
                self.due_index.insert(job.due_date, &job.id);
                self.jobs.insert(job.id.clone(), job);
            }
            Entity::Incident(incident) => {
                self.incidents.insert(incident.id.clone(), incident);
            }
            Entity::History(history) => {
                self.history.insert(history.id.clone(), history);
            }
        }
    }

    fn remove(&mut self, kind: EntityKind, id: &str) {
        match kind {
            EntityKind::Execution => {
                if let Some(execution) = self.executions.remove(id) {
                    let pid = &execution.process_instance_id;
                    if let Some(ids) = self.instance_executions.get_mut(pid) {
                        ids.remove(id);
                        if ids.is_empty() {
                            self.instance_executions.remove(pid);
                        }
                    }
                }
            }
            EntityKind::Job => {
                if let Some(job) = self.jobs.remove(id) {
                    self.due_index.remove(job.due_date, id);
                }
            }
            EntityKind::Incident => {
                self.incidents.remove(id);
            }
            EntityKind::History => {
                self.history.remove(id);
            }
        }
    }

    fn image(&self) -> TableImageRef<'_> {
        TableImageRef {
            definitions: self.definitions.values().collect(),
            executions: self.executions.values().collect(),
            jobs: self.jobs.values().collect(),
            incidents: self.incidents.values().collect(),
            history: self.history.values().collect(),
        }
    }

    fn from_image(image: TableImage) -> Self {
        let mut tables = Tables::default();
        for definition in image.definitions {
            tables.put_definition(definition);
        }
        let entities = image
            .executions
            .into_iter()
            .map(Entity::Execution)
            .chain(image.jobs.into_iter().map(Entity::Job))
            .chain(image.incidents.into_iter().map(Entity::Incident))
            .chain(image.history.into_iter().map(Entity::History));
        for entity in entities {
            tables.put(entity);
        }
        tables
    }

    fn put_definition(&mut self, definition: StoredDefinition) {
        self.definitions
            .insert((definition.key.clone(), definition.version), definition);
    }

    fn latest_definition(&self, key: &str) -> Option<&StoredDefinition> {
        self.definitions
            .range((key.to_string(), 0)..=(key.to_string(), u32::MAX))
            .next_back()
            .map(|(_, d)| d)
    }
}

fn check_revision(
    key: (EntityKind, &str),
    expected: u64,
    actual: Option<u64>,
) -> Result<(), StorageError> {
    if actual == Some(expected) {
        Ok(())
    } else {
        Err(StorageError::OptimisticLock {
            kind: key.0,
            id: key.1.to_string(),
            expected,
            actual,
        })
    }
}

/// Tables plus the log that makes them durable.
pub struct EngineStore {
    /// `None` runs the store purely in memory.
    wal: Option<Arc<Wal>>,
    snapshots: Option<SnapshotStore>,
    tables: RwLock<Tables>,
    commits: AtomicU64,
    /// Commit count covered by the latest snapshot.
    checkpointed_commits: AtomicU64,
    closed: AtomicBool,
}

impl EngineStore {
    /// Opens or creates a store at the configured directory and replays its log.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.dir)?;
        let snapshots = SnapshotStore::open(&config.snapshot_dir)?;
        let wal = Arc::new(Wal::open(config.wal)?);
        let store = Self {
            wal: Some(wal),
            snapshots: Some(snapshots),
            tables: RwLock::new(Tables::default()),
            commits: AtomicU64::new(0),
            checkpointed_commits: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };
        store.replay()?;
        Ok(store)
    }

    /// A store without durability, for tests and benchmarks.
    pub fn in_memory() -> Self {
        Self {
            wal: None,
            snapshots: None,
            tables: RwLock::new(Tables::default()),
            commits: AtomicU64::new(0),
            checkpointed_commits: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    pub fn wal(&self) -> Option<&Arc<Wal>> {
        self.wal.as_ref()
    }

    fn replay(&self) -> Result<(), StorageError> {
        let (Some(wal), Some(snapshots)) = (&self.wal, &self.snapshots) else {
            return Ok(());
        };

        let (mut tables, mut commits, from) = match snapshots.load_latest::<TableImage>()? {
            Some((meta, image)) => {
                let from = WalOffset::from_u64(meta.wal_offset);
                tracing::info!(
                    snapshot = %meta.snapshot_id,
                    commits = meta.commits,
                    "loaded snapshot"
                );
                (Tables::from_image(image), meta.commits, Some(from))
            }
            None => {
                let first = wal.segment_ids()?.first().copied().unwrap_or(1);
                if first > 1 {
                    return Err(StorageError::Corruption(format!(
                        "WAL starts at segment {} but no snapshot covers the earlier ones",
                        first
                    )));
                }
                (Tables::default(), 0, None)
            }
        };
        self.checkpointed_commits.store(commits, Ordering::SeqCst);

        let entries = wal.read_from(from.unwrap_or_else(WalOffset::start), None)?;
        let entry_count = entries.len();
        for (_, _, entry) in entries {
            match entry {
                WalEntry::PutDefinition {
                    key,
                    version,
                    checksum,
                    definition,
                } => tables.put_definition(StoredDefinition {
                    key,
                    version,
                    checksum,
                    definition,
                }),
                WalEntry::Commit { changes, .. } => {
                    for value in changes {
                        let change: Change = serde_json::from_value(value)?;
                        tables.apply(change);
                    }
                    commits += 1;
                }
                WalEntry::Checkpoint { .. } => {}
            }
        }
        self.commits.store(commits, Ordering::SeqCst);

        // Segments left over from a checkpoint interrupted before compaction.
        if let Some(from) = from {
            wal.compact_before(from)?;
        }

        if entry_count > 0 || from.is_some() {
            tracing::info!(
                entries = entry_count,
                definitions = tables.definitions.len(),
                process_instances = tables.instance_executions.len(),
                jobs = tables.jobs.len(),
                "WAL replay complete"
            );
        }
        *self.tables.write() = tables;
        Ok(())
    }

    /// Validates and applies a change set atomically.
    ///
    /// Returns the commit number. Nothing is written when any change fails
    /// validation.
    pub fn commit(&self, set: ChangeSet) -> Result<u64, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        if set.is_empty() {
            return Ok(self.commits.load(Ordering::SeqCst));
        }

        let mut tables = self.tables.write();
        if let Err(e) = tables.validate(set.changes()) {
            tracing::debug!(command = set.command(), error = %e, "commit rejected");
            return Err(e);
        }

        let command = set.command().to_string();
        let changes = set.into_changes();
        if let Some(wal) = &self.wal {
            let payload = changes
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            wal.append(&WalEntry::Commit {
                command: command.clone(),
                changes: payload,
                timestamp: Utc::now().timestamp_millis(),
            })?;
        }

        let count = changes.len();
        for change in changes {
            tables.apply(change);
        }
        let commit = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(command = %command, changes = count, commit, "committed");
        Ok(commit)
    }

    /// Deploys a definition document under `key`.
    ///
    /// Redeploying the document of the latest version is a no-op; anything
    /// else becomes the next version.
    pub fn deploy_definition(
        &self,
        key: &str,
        document: &serde_json::Value,
    ) -> Result<DeployResult, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let checksum = ProcessDefinition::checksum_of(document)?;
        let mut tables = self.tables.write();

        let version = match tables.latest_definition(key) {
            Some(latest) if latest.checksum == checksum => {
                return Ok(DeployResult {
                    key: key.to_string(),
                    version: latest.version,
                    checksum,
                    created: false,
                });
            }
            Some(latest) => latest.version + 1,
            None => 1,
        };

        let definition = ProcessDefinition::from_json(key, version, document)?;
        let canonical = definition.to_json()?;
        if let Some(wal) = &self.wal {
            wal.append(&WalEntry::PutDefinition {
                key: key.to_string(),
                version,
                checksum: checksum.clone(),
                definition: canonical.clone(),
            })?;
        }
        tables.put_definition(StoredDefinition {
            key: key.to_string(),
            version,
            checksum: checksum.clone(),
            definition: canonical,
        });
        tracing::info!(key, version, checksum = %checksum, "process definition deployed");

        Ok(DeployResult {
            key: key.to_string(),
            version,
            checksum,
            created: true,
        })
    }

    /// Looks up a definition; `None` picks the latest version.
    pub fn get_definition(
        &self,
        key: &str,
        version: Option<u32>,
    ) -> Result<StoredDefinition, StorageError> {
        let tables = self.tables.read();
        let found = match version {
            Some(v) => tables.definitions.get(&(key.to_string(), v)),
            None => tables.latest_definition(key),
        };
        found.cloned().ok_or_else(|| StorageError::DefinitionNotFound {
            key: key.to_string(),
            version,
        })
    }

    pub fn list_definitions(&self) -> Vec<StoredDefinition> {
        self.tables.read().definitions.values().cloned().collect()
    }

    pub fn get_execution(&self, id: &str) -> Option<Execution> {
        self.tables.read().executions.get(id).cloned()
    }

    pub fn executions_for_process_instance(&self, process_instance_id: &str) -> Vec<Execution> {
        let tables = self.tables.read();
        tables
            .instance_executions
            .get(process_instance_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.executions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids of process instances that still have runtime executions.
    pub fn process_instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tables
            .read()
            .instance_executions
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.tables.read().jobs.get(id).cloned()
    }

    /// All jobs, earliest due first.
    pub fn jobs(&self) -> Vec<Job> {
        let tables = self.tables.read();
        tables
            .due_index
            .iter()
            .filter_map(|(_, id)| tables.jobs.get(id).cloned())
            .collect()
    }

    pub fn jobs_for_execution(&self, execution_id: &str) -> Vec<Job> {
        self.jobs_where(|j| j.execution_id == execution_id)
    }

    pub fn jobs_for_process_instance(&self, process_instance_id: &str) -> Vec<Job> {
        self.jobs_where(|j| j.process_instance_id == process_instance_id)
    }

    fn jobs_where(&self, predicate: impl Fn(&Job) -> bool) -> Vec<Job> {
        let tables = self.tables.read();
        tables
            .due_index
            .iter()
            .filter_map(|(_, id)| tables.jobs.get(id))
            .filter(|j| predicate(j))
            .cloned()
            .collect()
    }

    /// Due, unlocked (or lock-expired), active jobs without an incident,
    /// earliest due first.
    pub fn find_acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Vec<Job> {
        let tables = self.tables.read();
        tables
            .due_index
            .due_before(now)
            .filter_map(|id| tables.jobs.get(id))
            .filter(|j| j.is_acquirable(now))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Earliest time at which some job may become acquirable.
    pub fn next_job_due_date(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tables = self.tables.read();
        tables
            .jobs
            .values()
            .filter(|j| !j.suspended && j.incident_id.is_none())
            .filter_map(|j| {
                if j.is_locked(now) {
                    j.lock_expiration.map(|expiry| expiry.max(j.due_date))
                } else {
                    Some(j.due_date)
                }
            })
            .min()
    }

    /// Claims a job if nobody changed it since `expected_revision` was read.
    pub fn try_lock_job(
        &self,
        job_id: &str,
        expected_revision: u64,
        owner: &str,
        lock_expiration: DateTime<Utc>,
    ) -> Result<Job, StorageError> {
        let mut job = self
            .get_job(job_id)
            .ok_or_else(|| StorageError::OptimisticLock {
                kind: EntityKind::Job,
                id: job_id.to_string(),
                expected: expected_revision,
                actual: None,
            })?;
        job.revision = expected_revision;
        job.lock_owner = Some(owner.to_string());
        job.lock_expiration = Some(lock_expiration);

        let mut set = ChangeSet::new("LockJob");
        set.update(job.clone());
        self.commit(set)?;
        job.revision += 1;
        Ok(job)
    }

    /// Releases a lock held on `job` as read.
    pub fn unlock_job(&self, job: &Job) -> Result<Job, StorageError> {
        let mut job = job.clone();
        job.unlock();
        let mut set = ChangeSet::new("UnlockJob");
        set.update(job.clone());
        self.commit(set)?;
        job.revision += 1;
        Ok(job)
    }

    pub fn get_incident(&self, id: &str) -> Option<Incident> {
        self.tables.read().incidents.get(id).cloned()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        let mut incidents: Vec<Incident> =
            self.tables.read().incidents.values().cloned().collect();
        incidents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        incidents
    }

    pub fn incidents_for_process_instance(&self, process_instance_id: &str) -> Vec<Incident> {
        self.incidents()
            .into_iter()
            .filter(|i| i.process_instance_id == process_instance_id)
            .collect()
    }

    pub fn get_history(&self, process_instance_id: &str) -> Option<HistoricProcessInstance> {
        self.tables.read().history.get(process_instance_id).cloned()
    }

    pub fn history(&self) -> Vec<HistoricProcessInstance> {
        let mut all: Vec<HistoricProcessInstance> =
            self.tables.read().history.values().cloned().collect();
        all.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        all
    }

    pub fn stats(&self) -> StoreStats {
        let tables = self.tables.read();
        StoreStats {
            definitions: tables.definitions.len(),
            executions: tables.executions.len(),
            process_instances: tables.instance_executions.len(),
            jobs: tables.jobs.len(),
            incidents: tables.incidents.len(),
            history: tables.history.len(),
            commits: self.commits.load(Ordering::SeqCst),
        }
    }

    /// Snapshots the tables and deletes the WAL segments the snapshot covers.
    ///
    /// Commits wait while the snapshot is written.
    pub fn checkpoint(&self) -> Result<CheckpointResult, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let (Some(wal), Some(snapshots)) = (&self.wal, &self.snapshots) else {
            return Ok(CheckpointResult::default());
        };

        let meta = {
            let tables = self.tables.read();
            let boundary = wal.rotate()?;
            let now = Utc::now().timestamp_millis();
            wal.append(&WalEntry::Checkpoint { timestamp: now })?;
            wal.sync()?;
            let commits = self.commits.load(Ordering::SeqCst);
            let meta = snapshots.create_snapshot(boundary.as_u64(), commits, now, &tables.image())?;
            self.checkpointed_commits.store(commits, Ordering::SeqCst);
            meta
        };

        let segments_deleted = wal.compact_before(WalOffset::from_u64(meta.wal_offset))?;
        tracing::info!(
            snapshot = %meta.snapshot_id,
            segments_deleted,
            "checkpoint complete"
        );
        Ok(CheckpointResult {
            snapshot: Some(meta),
            segments_deleted,
        })
    }

    /// Commits applied since the latest snapshot.
    pub fn commits_since_checkpoint(&self) -> u64 {
        self.commits
            .load(Ordering::SeqCst)
            .saturating_sub(self.checkpointed_commits.load(Ordering::SeqCst))
    }

    /// Bytes held by WAL segments; zero without a WAL.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        match &self.wal {
            Some(wal) => Ok(wal.total_size()?),
            None => Ok(0),
        }
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        Ok(())
    }

    /// Syncs and rejects further writes.
    pub fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        if let Some(wal) = &self.wal {
            wal.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tokenflow_core::{ExecutionTree, JobKind, JobRequest, DEFAULT_RETRIES};

    fn document() -> serde_json::Value {
        json!({
            "activities": [
                {"id": "start", "type": "startEvent"},
                {"id": "wait", "type": "timer", "durationMs": 1000},
                {"id": "end", "type": "endEvent"}
            ],
            "flows": [
                {"id": "f1", "from": "start", "to": "wait"},
                {"id": "f2", "from": "wait", "to": "end"}
            ]
        })
    }

    fn root_execution() -> Execution {
        let definition = ProcessDefinition::from_json("order", 1, &document()).unwrap();
        ExecutionTree::new_process_instance(&definition, Some("b-1".into()))
            .root()
            .unwrap()
            .clone()
    }

    fn job(execution: &Execution, due: DateTime<Utc>) -> Job {
        Job::new(
            JobRequest {
                execution_id: execution.id.clone(),
                kind: JobKind::Timer {
                    activity_id: "wait".into(),
                },
                due_date: Some(due),
                retries: None,
            },
            &execution.process_instance_id,
            "order",
            due,
            DEFAULT_RETRIES,
        )
    }

    #[test]
    fn test_commit_assigns_revisions() {
        let store = EngineStore::in_memory();
        let execution = root_execution();

        let mut set = ChangeSet::new("Start");
        set.insert(execution.clone());
        assert_eq!(store.commit(set).unwrap(), 1);

        let stored = store.get_execution(&execution.id).unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(
            store.executions_for_process_instance(&execution.process_instance_id),
            vec![stored.clone()]
        );

        let mut updated = stored.clone();
        updated.activity_id = Some("wait".into());
        let mut set = ChangeSet::new("Signal");
        set.update(updated);
        store.commit(set).unwrap();
        assert_eq!(store.get_execution(&execution.id).unwrap().revision, 2);
    }

    #[test]
    fn test_stale_update_is_rejected() {
        let store = EngineStore::in_memory();
        let execution = root_execution();
        let mut set = ChangeSet::new("Start");
        set.insert(execution.clone());
        store.commit(set).unwrap();

        let read = store.get_execution(&execution.id).unwrap();
        let mut first = ChangeSet::new("A");
        first.update(read.clone());
        store.commit(first).unwrap();

        let mut second = ChangeSet::new("B");
        second.update(read.clone());
        let err = store.commit(second).unwrap_err();
        assert!(err.is_optimistic_lock());
        assert!(err.is_retryable());

        let mut delete = ChangeSet::new("Delete");
        delete.delete(&read);
        assert!(store.commit(delete).unwrap_err().is_optimistic_lock());
    }

    #[test]
    fn test_change_set_is_all_or_nothing() {
        let store = EngineStore::in_memory();
        let execution = root_execution();
        let mut set = ChangeSet::new("Start");
        set.insert(execution.clone());
        store.commit(set).unwrap();

        let now = Utc::now();
        let mut set = ChangeSet::new("Broken");
        set.insert(job(&execution, now));
        set.insert(execution.clone());
        assert!(matches!(
            store.commit(set),
            Err(StorageError::DuplicateEntity { kind: EntityKind::Execution, .. })
        ));
        assert!(store.jobs().is_empty());
        assert_eq!(store.stats().commits, 1);
    }

    #[test]
    fn test_deploy_is_idempotent_per_checksum() {
        let store = EngineStore::in_memory();
        let first = store.deploy_definition("order", &document()).unwrap();
        assert_eq!(first.version, 1);
        assert!(first.created);

        let again = store.deploy_definition("order", &document()).unwrap();
        assert_eq!(again.version, 1);
        assert!(!again.created);

        let mut changed = document();
        changed["activities"][1]["durationMs"] = json!(5000);
        let second = store.deploy_definition("order", &changed).unwrap();
        assert_eq!(second.version, 2);
        assert_ne!(second.checksum, first.checksum);

        assert_eq!(store.get_definition("order", None).unwrap().version, 2);
        assert_eq!(store.get_definition("order", Some(1)).unwrap().checksum, first.checksum);
        assert!(matches!(
            store.get_definition("missing", None),
            Err(StorageError::DefinitionNotFound { .. })
        ));
        assert!(store
            .deploy_definition("bad", &json!({"activities": []}))
            .is_err());
    }

    #[test]
    fn test_acquirable_jobs_ordered_and_filtered() {
        let store = EngineStore::in_memory();
        let execution = root_execution();
        let now = Utc::now();

        let late = job(&execution, now - Duration::seconds(1));
        let early = job(&execution, now - Duration::seconds(30));
        let future = job(&execution, now + Duration::seconds(30));
        let mut incident = job(&execution, now - Duration::seconds(60));
        incident.incident_id = Some("i1".into());

        let mut set = ChangeSet::new("Jobs");
        for j in [&late, &early, &future, &incident] {
            set.insert(j.clone());
        }
        store.commit(set).unwrap();

        let ids: Vec<String> = store
            .find_acquirable_jobs(now, 10)
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![early.id.clone(), late.id.clone()]);
        assert_eq!(store.find_acquirable_jobs(now, 1).len(), 1);
        assert_eq!(store.next_job_due_date(now), Some(early.due_date));
        assert_eq!(store.jobs_for_execution(&execution.id).len(), 4);
    }

    #[test]
    fn test_try_lock_job_is_compare_and_set() {
        let store = EngineStore::in_memory();
        let execution = root_execution();
        let now = Utc::now();
        let j = job(&execution, now);
        let mut set = ChangeSet::new("Jobs");
        set.insert(j.clone());
        store.commit(set).unwrap();

        let expiry = now + Duration::minutes(5);
        let locked = store.try_lock_job(&j.id, 1, "worker-a", expiry).unwrap();
        assert_eq!(locked.revision, 2);
        assert_eq!(locked.lock_owner.as_deref(), Some("worker-a"));
        assert!(store.find_acquirable_jobs(now, 10).is_empty());

        // Second claimant read the same revision and loses.
        assert!(store
            .try_lock_job(&j.id, 1, "worker-b", expiry)
            .unwrap_err()
            .is_optimistic_lock());

        // After the lock expires the job is visible again.
        assert_eq!(store.find_acquirable_jobs(expiry + Duration::seconds(1), 10).len(), 1);

        let unlocked = store.unlock_job(&locked).unwrap();
        assert!(unlocked.lock_owner.is_none());
        assert_eq!(store.find_acquirable_jobs(now, 10).len(), 1);
    }

    #[test]
    fn test_replay_restores_state() {
        let dir = TempDir::new().unwrap();
        let execution = root_execution();
        let now = Utc::now();
        let j = job(&execution, now);
        let history = HistoricProcessInstance::started(
            &execution.id,
            "order",
            1,
            execution.business_key.clone(),
            now,
        );

        {
            let store = EngineStore::open(StoreConfig::new(dir.path())).unwrap();
            store.deploy_definition("order", &document()).unwrap();
            let mut set = ChangeSet::new("Start");
            set.insert(execution.clone());
            set.insert(j.clone());
            set.insert(history.clone());
            store.commit(set).unwrap();

            let mut done = ChangeSet::new("ExecuteJob");
            done.delete(&store.get_job(&j.id).unwrap());
            store.commit(done).unwrap();
            store.close().unwrap();
        }

        let store = EngineStore::open(StoreConfig::new(dir.path())).unwrap();
        assert_eq!(store.get_definition("order", None).unwrap().version, 1);
        let restored = store.get_execution(&execution.id).unwrap();
        assert_eq!(restored.revision, 1);
        assert_eq!(restored.business_key.as_deref(), Some("b-1"));
        assert!(store.get_job(&j.id).is_none());
        assert_eq!(store.get_history(&execution.id).unwrap().revision, 1);
        assert_eq!(store.stats().commits, 2);
        assert_eq!(store.process_instance_ids(), vec![execution.id.clone()]);
    }

    #[test]
    fn test_reopen_after_checkpoint_compaction() {
        let dir = TempDir::new().unwrap();
        let config = || StoreConfig::new(dir.path()).with_segment_size(1024);
        let now = Utc::now();
        let execution = root_execution();
        let mut kept = Vec::new();

        {
            let store = EngineStore::open(config()).unwrap();
            store.deploy_definition("order", &document()).unwrap();
            let mut set = ChangeSet::new("Start");
            set.insert(execution.clone());
            store.commit(set).unwrap();
            for n in 0..20 {
                let j = job(&execution, now + Duration::seconds(n));
                let mut set = ChangeSet::new("CreateJob");
                set.insert(j.clone());
                store.commit(set).unwrap();
                if n % 2 == 0 {
                    let mut done = ChangeSet::new("ExecuteJob");
                    done.delete(&store.get_job(&j.id).unwrap());
                    store.commit(done).unwrap();
                } else {
                    kept.push(j.id);
                }
            }
            let segments_before = store.wal().unwrap().segment_ids().unwrap().len();
            assert!(segments_before > 2);
            assert_eq!(store.commits_since_checkpoint(), 31);

            let result = store.checkpoint().unwrap();
            let snapshot = result.snapshot.unwrap();
            assert_eq!(snapshot.commits, 31);
            assert_eq!(result.segments_deleted, segments_before);
            assert_eq!(store.commits_since_checkpoint(), 0);
            assert_eq!(store.wal().unwrap().segment_ids().unwrap().len(), 1);

            // Work after the checkpoint lands in the remaining segment.
            let mut updated = store.get_execution(&execution.id).unwrap();
            updated.activity_id = Some("wait".into());
            let mut set = ChangeSet::new("Signal");
            set.update(updated);
            store.commit(set).unwrap();
            store.close().unwrap();
        }

        let store = EngineStore::open(config()).unwrap();
        assert_eq!(store.stats().commits, 32);
        assert_eq!(store.commits_since_checkpoint(), 1);
        assert_eq!(store.get_definition("order", None).unwrap().version, 1);
        let restored = store.get_execution(&execution.id).unwrap();
        assert_eq!(restored.revision, 2);
        assert_eq!(restored.activity_id.as_deref(), Some("wait"));

        let mut ids: Vec<String> = store.jobs().into_iter().map(|j| j.id).collect();
        ids.sort();
        kept.sort();
        assert_eq!(ids, kept);
        assert_eq!(
            store.find_acquirable_jobs(now + Duration::minutes(1), 100).len(),
            10
        );

        // Revisions from the snapshot still guard updates.
        let mut first = store.get_job(&kept[0]).unwrap();
        assert_eq!(first.revision, 1);
        first.revision = 7;
        let mut set = ChangeSet::new("Stale");
        set.update(first);
        assert!(store.commit(set).unwrap_err().is_optimistic_lock());
        assert_eq!(store.stats().commits, 32);
    }

    #[test]
    fn test_compacted_log_without_snapshot_is_refused() {
        let dir = TempDir::new().unwrap();
        {
            let store = EngineStore::open(StoreConfig::new(dir.path())).unwrap();
            store.deploy_definition("order", &document()).unwrap();
            store.checkpoint().unwrap();
            store.close().unwrap();
        }
        std::fs::remove_dir_all(dir.path().join("snapshots")).unwrap();

        assert!(matches!(
            EngineStore::open(StoreConfig::new(dir.path())),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_in_memory_checkpoint_is_a_no_op() {
        let store = EngineStore::in_memory();
        assert_eq!(store.checkpoint().unwrap(), CheckpointResult::default());
        assert_eq!(store.wal_size().unwrap(), 0);
    }

    #[test]
    fn test_closed_store_rejects_writes() {
        let store = EngineStore::in_memory();
        store.close().unwrap();
        let mut set = ChangeSet::new("Start");
        set.insert(root_execution());
        assert!(matches!(store.commit(set), Err(StorageError::Closed)));
    }

    proptest! {
        /// Only updates carrying the current revision succeed, and each
        /// success bumps the revision by one.
        #[test]
        fn prop_revisions_advance_once_per_accepted_update(
            expected in prop::collection::vec(1u64..6, 1..20)
        ) {
            let store = EngineStore::in_memory();
            let execution = root_execution();
            let mut set = ChangeSet::new("Start");
            set.insert(execution.clone());
            store.commit(set).unwrap();

            let mut current = 1u64;
            for revision in expected {
                let mut write = execution.clone();
                write.revision = revision;
                let mut set = ChangeSet::new("Update");
                set.update(write);
                let result = store.commit(set);
                prop_assert_eq!(result.is_ok(), revision == current);
                if revision == current {
                    current += 1;
                }
                prop_assert_eq!(store.get_execution(&execution.id).unwrap().revision, current);
            }
        }
    }
}
