//! Command context: the unit of work behind every command.
//!
//! The context loads execution trees on demand and remembers what it loaded.
//! At flush the trees are diffed against those snapshots, and the resulting
//! inserts, updates and deletes are committed as one change set together with
//! the job, incident and history changes the command recorded.

use crate::backoff::BackoffPolicy;
use crate::command::Command;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokenflow_core::{
    BehaviorRegistry, Clock, CoreError, Execution, ExecutionTree, HistoricProcessInstance,
    Incident, Interpreter, Job, JobKind, JobRequest, ProcessDefinition, RuntimeSettings,
};
use tokenflow_storage::{Change, ChangeSet, EngineStore, EntityKind, Record};
use tokio::sync::Notify;

/// Commands may nest this deep before the context refuses.
pub const MAX_NESTING_DEPTH: usize = 16;

/// Everything a command can reach besides its own context.
pub struct EngineServices {
    pub(crate) store: Arc<EngineStore>,
    pub(crate) registry: Arc<BehaviorRegistry>,
    pub(crate) settings: RuntimeSettings,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) backoff: Arc<dyn BackoffPolicy>,
    pub(crate) default_retries: u32,
    /// Parsed definitions indexed by (key, version).
    pub(crate) definitions: DashMap<(String, u32), Arc<ProcessDefinition>>,
    /// Woken whenever a commit creates or reschedules jobs.
    pub(crate) job_notify: Arc<Notify>,
}

impl EngineServices {
    pub fn store(&self) -> &EngineStore {
        &self.store
    }

    pub fn registry(&self) -> &BehaviorRegistry {
        &self.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns a parsed definition, loading it from the store on a cache miss.
    pub fn definition(
        &self,
        key: &str,
        version: u32,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        let cache_key = (key.to_string(), version);
        if let Some(definition) = self.definitions.get(&cache_key) {
            return Ok(Arc::clone(definition.value()));
        }
        let stored = self.store.get_definition(key, Some(version))?;
        let definition = Arc::new(ProcessDefinition::from_json(
            key,
            version,
            &stored.definition,
        )?);
        self.definitions.insert(cache_key, Arc::clone(&definition));
        Ok(definition)
    }

    pub fn latest_definition(&self, key: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        let stored = self.store.get_definition(key, None)?;
        self.definition(key, stored.version)
    }
}

/// A process instance the command has touched.
pub struct LoadedInstance {
    pub definition: Arc<ProcessDefinition>,
    pub tree: ExecutionTree,
    /// Executions as read from the store.
    snapshot: BTreeMap<String, Execution>,
    job_requests: Vec<JobRequest>,
    /// Hosts whose stored boundary timers are deleted at flush.
    cancelled_timers: Vec<(String, String)>,
    deleted: bool,
}

struct PendingHistory {
    record: HistoricProcessInstance,
    /// `None` for a record created by this command.
    original: Option<HistoricProcessInstance>,
}

/// What a flush produced.
pub struct Flush {
    pub changes: ChangeSet,
    /// Whether the commit creates or reschedules jobs.
    pub touches_jobs: bool,
}

/// State of one command execution.
pub struct CommandContext<'a> {
    services: &'a EngineServices,
    command: &'static str,
    now: DateTime<Utc>,
    depth: usize,
    instances: BTreeMap<String, LoadedInstance>,
    history: BTreeMap<String, PendingHistory>,
    changes: Vec<Change>,
    touched: HashSet<(EntityKind, String)>,
}

impl<'a> CommandContext<'a> {
    pub fn new(services: &'a EngineServices, command: &'static str) -> Self {
        Self {
            services,
            command,
            now: services.now(),
            depth: 0,
            instances: BTreeMap::new(),
            history: BTreeMap::new(),
            changes: Vec::new(),
            touched: HashSet::new(),
        }
    }

    pub fn services(&self) -> &'a EngineServices {
        self.services
    }

    pub fn store(&self) -> &'a EngineStore {
        &self.services.store
    }

    /// Time of the command, fixed when the context opened.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn command(&self) -> &'static str {
        self.command
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Runs another command inside this context; its changes commit with ours.
    pub fn execute_nested<C: Command + ?Sized>(
        &mut self,
        command: &C,
    ) -> Result<C::Output, EngineError> {
        if self.depth + 1 >= MAX_NESTING_DEPTH {
            return Err(EngineError::NestingTooDeep(MAX_NESTING_DEPTH));
        }
        self.depth += 1;
        tracing::debug!(command = command.name(), depth = self.depth, "nested command");
        let result = command.execute(self);
        self.depth -= 1;
        result
    }

    // =========================================================================
    // Execution trees
    // =========================================================================

    /// Process instance an execution belongs to.
    pub fn process_instance_of(&self, execution_id: &str) -> Result<String, EngineError> {
        if let Some(pid) = self
            .instances
            .iter()
            .find(|(_, loaded)| loaded.tree.contains(execution_id))
            .map(|(pid, _)| pid.clone())
        {
            return Ok(pid);
        }
        self.store()
            .get_execution(execution_id)
            .map(|e| e.process_instance_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Loads the instance's tree once per command.
    pub fn load_instance(
        &mut self,
        process_instance_id: &str,
    ) -> Result<&mut LoadedInstance, EngineError> {
        if !self.instances.contains_key(process_instance_id) {
            let executions = self
                .store()
                .executions_for_process_instance(process_instance_id);
            if executions.is_empty() {
                return Err(EngineError::ProcessInstanceNotFound(
                    process_instance_id.to_string(),
                ));
            }
            let snapshot: BTreeMap<String, Execution> = executions
                .iter()
                .map(|e| (e.id.clone(), e.clone()))
                .collect();
            let tree = ExecutionTree::from_executions(executions)?;
            let root = tree.root()?;
            let definition = self
                .services
                .definition(&root.definition_key, root.definition_version)?;
            self.instances.insert(
                process_instance_id.to_string(),
                LoadedInstance {
                    definition,
                    tree,
                    snapshot,
                    job_requests: Vec::new(),
                    cancelled_timers: Vec::new(),
                    deleted: false,
                },
            );
        }
        self.instances
            .get_mut(process_instance_id)
            .ok_or_else(|| EngineError::ProcessInstanceNotFound(process_instance_id.to_string()))
    }

    /// Creates a new instance of `definition` and runs it to its first wait states.
    pub fn start_instance(
        &mut self,
        definition: Arc<ProcessDefinition>,
        business_key: Option<String>,
        variables: BTreeMap<String, Value>,
    ) -> Result<String, EngineError> {
        let mut tree = ExecutionTree::new_process_instance(&definition, business_key.clone());
        let pid = tree.process_instance_id().to_string();
        for (name, value) in variables {
            tree.set_variable_local(&pid, &name, value)?;
        }
        self.history.insert(
            pid.clone(),
            PendingHistory {
                record: HistoricProcessInstance::started(
                    pid.clone(),
                    definition.key.clone(),
                    definition.version,
                    business_key,
                    self.now,
                ),
                original: None,
            },
        );
        self.instances.insert(
            pid.clone(),
            LoadedInstance {
                definition,
                tree,
                snapshot: BTreeMap::new(),
                job_requests: Vec::new(),
                cancelled_timers: Vec::new(),
                deleted: false,
            },
        );
        self.run(&pid, |interpreter| interpreter.start())?;
        Ok(pid)
    }

    /// Drives the interpreter over a loaded instance.
    pub fn run<F>(&mut self, process_instance_id: &str, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Interpreter<'_>) -> Result<(), CoreError>,
    {
        let services = self.services;
        let now = self.now;
        let instance = self.load_instance(process_instance_id)?;
        let definition = Arc::clone(&instance.definition);
        let (requests, cancelled) = {
            let mut interpreter = Interpreter::new(
                &mut instance.tree,
                &definition,
                &services.registry,
                &services.settings,
                now,
            );
            f(&mut interpreter)?;
            tracing::trace!(steps = interpreter.steps(), "interpreter finished");
            (interpreter.take_jobs(), interpreter.take_cancelled_timers())
        };
        // Timers requested by an earlier run of this command and cancelled
        // by this one are never created.
        instance
            .job_requests
            .retain(|request| !cancels(&cancelled, &request.execution_id, &request.kind));
        instance.job_requests.extend(requests);
        instance.cancelled_timers.extend(cancelled);
        Ok(())
    }

    /// Removes the instance's runtime state at flush. No listeners fire.
    pub fn delete_instance(
        &mut self,
        process_instance_id: &str,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let now = self.now;
        self.load_instance(process_instance_id)?.deleted = true;
        self.history_mut(process_instance_id)?.delete(reason, now);
        Ok(())
    }

    // =========================================================================
    // Jobs, incidents, history
    // =========================================================================

    pub fn insert_job(&mut self, job: Job) {
        self.record(Change::Insert {
            entity: job.into_entity(),
        });
    }

    pub fn update_job(&mut self, job: Job) {
        self.record(Change::Update {
            entity: job.into_entity(),
        });
    }

    pub fn delete_job(&mut self, job: &Job) {
        self.record(delete_change(job));
    }

    pub fn insert_incident(&mut self, incident: Incident) {
        self.record(Change::Insert {
            entity: incident.into_entity(),
        });
    }

    pub fn update_incident(&mut self, incident: Incident) {
        self.record(Change::Update {
            entity: incident.into_entity(),
        });
    }

    pub fn delete_incident(&mut self, incident: &Incident) {
        self.record(delete_change(incident));
    }

    fn record(&mut self, change: Change) {
        self.touched.insert((change.kind(), change.id().to_string()));
        self.changes.push(change);
    }

    fn is_touched(&self, kind: EntityKind, id: &str) -> bool {
        self.touched.contains(&(kind, id.to_string()))
    }

    /// History record of an instance, loaded on first access.
    pub fn history_mut(
        &mut self,
        process_instance_id: &str,
    ) -> Result<&mut HistoricProcessInstance, EngineError> {
        if !self.history.contains_key(process_instance_id) {
            let record = self
                .store()
                .get_history(process_instance_id)
                .ok_or_else(|| {
                    EngineError::ProcessInstanceNotFound(process_instance_id.to_string())
                })?;
            self.history.insert(
                process_instance_id.to_string(),
                PendingHistory {
                    original: Some(record.clone()),
                    record,
                },
            );
        }
        self.history
            .get_mut(process_instance_id)
            .map(|pending| &mut pending.record)
            .ok_or_else(|| EngineError::ProcessInstanceNotFound(process_instance_id.to_string()))
    }

    /// Deletes jobs and incidents that hang off a removed execution.
    fn cascade_execution(&mut self, process_instance_id: &str, execution_id: &str) {
        let store = self.store();
        for job in store.jobs_for_execution(execution_id) {
            if !self.is_touched(EntityKind::Job, &job.id) {
                tracing::debug!(job = %job.id, execution = execution_id, "removing orphaned job");
                self.delete_job(&job);
            }
        }
        for incident in store.incidents_for_process_instance(process_instance_id) {
            if incident.execution_id == execution_id
                && !self.is_touched(EntityKind::Incident, &incident.id)
            {
                self.delete_incident(&incident);
            }
        }
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Turns everything the command did into one change set.
    pub fn flush(mut self) -> Result<Flush, EngineError> {
        let mut executions = ChangeSet::new(self.command);
        let mut touches_jobs = false;
        let instances = std::mem::take(&mut self.instances);

        for (pid, instance) in instances {
            let LoadedInstance {
                definition,
                tree,
                snapshot,
                job_requests,
                cancelled_timers,
                deleted,
            } = instance;
            let ended = tree.root()?.is_ended;

            if ended || deleted {
                for old in snapshot.values() {
                    executions.delete(old);
                    self.cascade_execution(&pid, &old.id);
                }
                if ended && !deleted {
                    let now = self.now;
                    self.history_mut(&pid)?.complete(now);
                    tracing::debug!(process_instance = %pid, "process instance completed");
                }
                continue;
            }

            for execution in tree.executions() {
                match snapshot.get(&execution.id) {
                    None => executions.insert(execution.clone()),
                    Some(old) => {
                        if old != execution || tree.is_forced(&execution.id) {
                            executions.update(execution.clone());
                        }
                    }
                }
            }
            for old in snapshot.values() {
                if !tree.contains(&old.id) {
                    executions.delete(old);
                    self.cascade_execution(&pid, &old.id);
                }
            }
            for (execution_id, _) in &cancelled_timers {
                if !tree.contains(execution_id) {
                    continue;
                }
                for job in self.store().jobs_for_execution(execution_id) {
                    if cancels(&cancelled_timers, execution_id, &job.kind)
                        && !self.is_touched(EntityKind::Job, &job.id)
                    {
                        tracing::debug!(job = %job.id, execution = %execution_id, "boundary timer cancelled");
                        self.delete_job(&job);
                    }
                }
            }
            for request in job_requests {
                if !tree.contains(&request.execution_id) {
                    continue;
                }
                let suspended = tree.get(&request.execution_id)?.suspended;
                let mut job = Job::new(
                    request,
                    &pid,
                    &definition.key,
                    self.now,
                    self.services.default_retries,
                );
                job.suspended = suspended;
                tracing::debug!(job = %job.id, kind = job.kind.name(), due = %job.due_date, "job created");
                self.insert_job(job);
            }
        }

        for change in self.changes {
            if change.kind() == EntityKind::Job && !matches!(change, Change::Delete { .. }) {
                touches_jobs = true;
            }
            executions.push(change);
        }
        for (_, pending) in self.history {
            match pending.original {
                None => executions.insert(pending.record),
                Some(original) if original != pending.record => executions.update(pending.record),
                Some(_) => {}
            }
        }

        Ok(Flush {
            changes: executions,
            touches_jobs,
        })
    }
}

/// Whether a boundary timer of `kind` on `execution_id` was cancelled.
fn cancels(cancelled: &[(String, String)], execution_id: &str, kind: &JobKind) -> bool {
    match kind {
        JobKind::BoundaryTimer { activity_id, .. } => cancelled
            .iter()
            .any(|(e, a)| e == execution_id && a == activity_id),
        _ => false,
    }
}

fn delete_change<R: Record>(record: &R) -> Change {
    Change::Delete {
        kind: R::KIND,
        id: record.id().to_string(),
        revision: record.revision(),
    }
}
