//! Process engine facade.

use crate::backoff::BackoffPolicy;
use crate::command::{Command, CommandExecutor, LogInterceptor, RetryInterceptor};
use crate::commands::{
    ActivateProcessInstanceCommand, DeleteJobCommand, DeleteProcessInstanceCommand,
    DeployCommand, ExecuteJobCommand, HandleFailedJobCommand, SetJobRetriesCommand,
    SetVariablesCommand, SignalCommand, StartProcessInstanceCommand,
    SuspendProcessInstanceCommand,
};
use crate::config::{Config, EngineConfig};
use crate::context::EngineServices;
use crate::error::EngineError;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokenflow_core::{
    BehaviorRegistry, Clock, Execution, ExecutionTree, HistoricProcessInstance, Incident, Job,
    ProcessDefinition, RuntimeSettings, SystemClock,
};
use tokenflow_storage::{
    CheckpointResult, DeployResult, EngineStore, StoreStats, StoredDefinition,
};
use tokio::sync::Notify;

/// Builds a [`ProcessEngine`].
pub struct ProcessEngineBuilder {
    store: Option<Arc<EngineStore>>,
    registry: BehaviorRegistry,
    clock: Arc<dyn Clock>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
    config: EngineConfig,
}

impl Default for ProcessEngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            registry: BehaviorRegistry::new(),
            clock: Arc::new(SystemClock),
            backoff: None,
            config: EngineConfig::default(),
        }
    }
}

impl ProcessEngineBuilder {
    /// Store to run on; an in-memory store when unset.
    pub fn store(mut self, store: Arc<EngineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: BehaviorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the backoff configured in `EngineConfig::retry_backoff`.
    pub fn backoff(mut self, backoff: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ProcessEngine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(EngineStore::in_memory()));
        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(self.config.retry_backoff.clone()));
        let services = Arc::new(EngineServices {
            store,
            registry: Arc::new(self.registry),
            settings: RuntimeSettings {
                unhandled_error: self.config.unhandled_bpmn_error,
            },
            clock: self.clock,
            backoff,
            default_retries: self.config.default_retries,
            definitions: DashMap::new(),
            job_notify: Arc::new(Notify::new()),
        });
        let executor = CommandExecutor::new(
            Arc::clone(&services),
            vec![
                Box::new(LogInterceptor),
                Box::new(RetryInterceptor::new(self.config.optimistic_lock_retries)),
            ],
        );
        ProcessEngine { services, executor }
    }
}

/// Entry point for deploying processes, driving instances and querying state.
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    executor: CommandExecutor,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::default()
    }

    /// Opens the configured store and builds an engine on it.
    pub fn open(config: &Config, registry: BehaviorRegistry) -> Result<Self, EngineError> {
        let store = if config.storage.in_memory {
            tracing::info!("Storage: in-memory");
            EngineStore::in_memory()
        } else {
            tracing::info!("Storage: {}", config.storage.data_dir.display());
            EngineStore::open(config.storage.store_config())?
        };
        Ok(Self::builder()
            .store(Arc::new(store))
            .registry(registry)
            .config(config.engine.clone())
            .build())
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn store(&self) -> &EngineStore {
        &self.services.store
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.services.now()
    }

    /// Notified whenever a commit creates or reschedules jobs.
    pub fn job_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.services.job_notify)
    }

    /// Runs any command through the interceptor chain.
    pub fn execute<C: Command + ?Sized>(&self, command: &C) -> Result<C::Output, EngineError> {
        self.executor.execute(command)
    }

    // =========================================================================
    // Deployment
    // =========================================================================

    pub fn deploy(&self, key: &str, document: &Value) -> Result<DeployResult, EngineError> {
        self.execute(&DeployCommand {
            key: key.to_string(),
            document: document.clone(),
        })
    }

    /// Deploys every `*.json` file in `dir`, keyed by file stem.
    pub fn deploy_directory(&self, dir: impl AsRef<Path>) -> Result<Vec<DeployResult>, EngineError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let document: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            results.push(self.deploy(key, &document)?);
        }
        Ok(results)
    }

    pub fn definition(
        &self,
        key: &str,
        version: Option<u32>,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        match version {
            Some(v) => self.services.definition(key, v),
            None => self.services.latest_definition(key),
        }
    }

    pub fn definitions(&self) -> Vec<StoredDefinition> {
        self.store().list_definitions()
    }

    // =========================================================================
    // Runtime commands
    // =========================================================================

    /// Starts the latest version of `key`; returns the process instance id.
    pub fn start_process_instance(
        &self,
        key: &str,
        business_key: Option<&str>,
        variables: BTreeMap<String, Value>,
    ) -> Result<String, EngineError> {
        self.execute(&StartProcessInstanceCommand {
            key: key.to_string(),
            version: None,
            business_key: business_key.map(str::to_string),
            variables,
        })
    }

    pub fn signal(&self, execution_id: &str) -> Result<(), EngineError> {
        self.execute(&SignalCommand {
            execution_id: execution_id.to_string(),
        })
    }

    pub fn set_variables(
        &self,
        execution_id: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.execute(&SetVariablesCommand {
            execution_id: execution_id.to_string(),
            variables,
            local: false,
        })
    }

    pub fn set_variables_local(
        &self,
        execution_id: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.execute(&SetVariablesCommand {
            execution_id: execution_id.to_string(),
            variables,
            local: true,
        })
    }

    pub fn suspend_process_instance(&self, process_instance_id: &str) -> Result<(), EngineError> {
        self.execute(&SuspendProcessInstanceCommand {
            process_instance_id: process_instance_id.to_string(),
        })
    }

    pub fn activate_process_instance(&self, process_instance_id: &str) -> Result<(), EngineError> {
        self.execute(&ActivateProcessInstanceCommand {
            process_instance_id: process_instance_id.to_string(),
        })
    }

    pub fn delete_process_instance(
        &self,
        process_instance_id: &str,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        self.execute(&DeleteProcessInstanceCommand {
            process_instance_id: process_instance_id.to_string(),
            reason: reason.map(str::to_string),
        })
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Executes a job now, recording a failure the same way the job executor does.
    pub fn execute_job(&self, job_id: &str) -> Result<(), EngineError> {
        self.run_job(job_id, None)
    }

    pub(crate) fn run_job(&self, job_id: &str, lock_owner: Option<&str>) -> Result<(), EngineError> {
        let result = self.execute(&ExecuteJobCommand {
            job_id: job_id.to_string(),
            lock_owner: lock_owner.map(str::to_string),
        });
        match result {
            Err(
                e @ (EngineError::JobNotFound(_)
                | EngineError::JobLocked { .. }
                | EngineError::Suspended(_)
                | EngineError::ShuttingDown),
            ) => Err(e),
            Err(e) => {
                tracing::warn!(job = job_id, error = %e, "job execution failed");
                if let Err(handle_err) = self.execute(&HandleFailedJobCommand {
                    job_id: job_id.to_string(),
                    message: e.to_string(),
                    lock_owner: lock_owner.map(str::to_string),
                }) {
                    tracing::error!(job = job_id, error = %handle_err, "failed to record job failure");
                }
                Err(e)
            }
            ok => ok,
        }
    }

    pub fn set_job_retries(&self, job_id: &str, retries: u32) -> Result<(), EngineError> {
        self.execute(&SetJobRetriesCommand {
            job_id: job_id.to_string(),
            retries,
        })
    }

    pub fn delete_job(&self, job_id: &str) -> Result<(), EngineError> {
        self.execute(&DeleteJobCommand {
            job_id: job_id.to_string(),
        })
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.store().get_job(job_id)
    }

    /// All jobs, earliest due first.
    pub fn jobs(&self) -> Vec<Job> {
        self.store().jobs()
    }

    pub fn jobs_for_process_instance(&self, process_instance_id: &str) -> Vec<Job> {
        self.store().jobs_for_process_instance(process_instance_id)
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.store().incidents()
    }

    pub fn incidents_for_process_instance(&self, process_instance_id: &str) -> Vec<Incident> {
        self.store()
            .incidents_for_process_instance(process_instance_id)
    }

    // =========================================================================
    // Runtime queries
    // =========================================================================

    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.store().get_execution(execution_id)
    }

    pub fn executions(&self, process_instance_id: &str) -> Vec<Execution> {
        self.store()
            .executions_for_process_instance(process_instance_id)
    }

    /// Snapshot of an instance's execution tree.
    pub fn execution_tree(&self, process_instance_id: &str) -> Result<ExecutionTree, EngineError> {
        let executions = self.executions(process_instance_id);
        if executions.is_empty() {
            return Err(EngineError::ProcessInstanceNotFound(
                process_instance_id.to_string(),
            ));
        }
        Ok(ExecutionTree::from_executions(executions)?)
    }

    /// Variables visible from an execution; closer scopes win.
    pub fn variables(&self, execution_id: &str) -> Result<BTreeMap<String, Value>, EngineError> {
        let execution = self
            .execution(execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        let tree = self.execution_tree(&execution.process_instance_id)?;
        Ok(tree.variables(execution_id)?)
    }

    pub fn variable(&self, execution_id: &str, name: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.variables(execution_id)?.remove(name))
    }

    /// Activities currently occupied by active executions, sorted.
    pub fn active_activity_ids(&self, process_instance_id: &str) -> Result<Vec<String>, EngineError> {
        Ok(self.execution_tree(process_instance_id)?.active_activity_ids())
    }

    pub fn historic_process_instance(
        &self,
        process_instance_id: &str,
    ) -> Option<HistoricProcessInstance> {
        self.store().get_history(process_instance_id)
    }

    pub fn history(&self) -> Vec<HistoricProcessInstance> {
        self.store().history()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn stats(&self) -> StoreStats {
        self.store().stats()
    }

    pub fn sync(&self) -> Result<(), EngineError> {
        Ok(self.store().sync()?)
    }

    /// Snapshots the store and compacts the WAL behind the snapshot.
    pub fn checkpoint(&self) -> Result<CheckpointResult, EngineError> {
        Ok(self.store().checkpoint()?)
    }

    pub fn close(&self) -> Result<(), EngineError> {
        Ok(self.store().close()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;
    use tokenflow_core::{DelegateError, JobKind, ManualClock, ProcessInstanceState};
    use tokenflow_storage::StoreConfig;

    fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn single_execution_at(engine: &ProcessEngine, pid: &str, activity: &str) -> String {
        engine
            .executions(pid)
            .into_iter()
            .find(|e| e.is_active && e.activity_id.as_deref() == Some(activity))
            .map(|e| e.id)
            .unwrap_or_else(|| panic!("no active execution at {}", activity))
    }

    #[test]
    fn test_take_listener_fires_once_and_instance_ends() {
        let taken = Arc::new(Mutex::new(0u32));
        let mut registry = BehaviorRegistry::new();
        let counter = Arc::clone(&taken);
        registry.register_listener("count", move |_| {
            *counter.lock() += 1;
            Ok(())
        });
        let engine = ProcessEngine::builder().registry(registry).build();
        engine
            .deploy(
                "straight",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "end", "listeners": ["count"]}
                    ]
                }),
            )
            .unwrap();

        let pid = engine
            .start_process_instance("straight", None, BTreeMap::new())
            .unwrap();

        assert_eq!(*taken.lock(), 1);
        assert!(engine.executions(&pid).is_empty());
        assert!(engine.jobs().is_empty());
        let history = engine.historic_process_instance(&pid).unwrap();
        assert_eq!(history.state, ProcessInstanceState::Completed);
        assert!(history.end_time.is_some());
    }

    #[test]
    fn test_async_before_defers_behavior_to_job() {
        let calls = Arc::new(Mutex::new(0u32));
        let mut registry = BehaviorRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register_delegate("work", move |_| {
            *counter.lock() += 1;
            Ok(())
        });
        let engine = ProcessEngine::builder().registry(registry).build();
        engine
            .deploy(
                "deferred",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "task", "type": "serviceTask", "delegate": "work", "asyncBefore": true},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "task"},
                        {"id": "f2", "from": "task", "to": "end"}
                    ]
                }),
            )
            .unwrap();

        let pid = engine
            .start_process_instance("deferred", None, BTreeMap::new())
            .unwrap();
        assert_eq!(*calls.lock(), 0);

        let jobs = engine.jobs();
        assert_eq!(jobs.len(), 1);
        let execution = single_execution_at(&engine, &pid, "task");
        assert_eq!(jobs[0].execution_id, execution);
        assert!(matches!(jobs[0].kind, JobKind::AsyncContinuation { .. }));

        engine.execute_job(&jobs[0].id).unwrap();
        assert_eq!(*calls.lock(), 1);
        assert!(engine.jobs().is_empty());
        assert!(engine.executions(&pid).is_empty());
    }

    #[test]
    fn test_parallel_branches_complete_independently() {
        let engine = ProcessEngine::builder().build();
        engine
            .deploy(
                "parallel",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "fork", "type": "parallelGateway"},
                        {"id": "a", "type": "userTask"},
                        {"id": "b", "type": "userTask"},
                        {"id": "join", "type": "parallelGateway"},
                        {"id": "after", "type": "userTask"},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "fork"},
                        {"id": "fa", "from": "fork", "to": "a"},
                        {"id": "fb", "from": "fork", "to": "b"},
                        {"id": "ja", "from": "a", "to": "join"},
                        {"id": "jb", "from": "b", "to": "join"},
                        {"id": "f2", "from": "join", "to": "after"},
                        {"id": "f3", "from": "after", "to": "end"}
                    ]
                }),
            )
            .unwrap();

        let pid = engine
            .start_process_instance("parallel", None, BTreeMap::new())
            .unwrap();
        assert_eq!(engine.active_activity_ids(&pid).unwrap(), vec!["a", "b"]);

        let tree = engine.execution_tree(&pid).unwrap();
        let children = tree.children(&pid).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.is_concurrent));
        assert!(!tree.root().unwrap().is_active);

        engine
            .signal(&single_execution_at(&engine, &pid, "a"))
            .unwrap();
        assert_eq!(engine.active_activity_ids(&pid).unwrap(), vec!["b"]);

        engine
            .signal(&single_execution_at(&engine, &pid, "b"))
            .unwrap();
        let tree = engine.execution_tree(&pid).unwrap();
        assert_eq!(tree.len(), 1);
        let root = tree.root().unwrap();
        assert!(root.is_active);
        assert_eq!(root.activity_id.as_deref(), Some("after"));

        engine.signal(&pid).unwrap();
        assert!(engine.executions(&pid).is_empty());
    }

    #[test]
    fn test_stale_signal_loses_optimistic_lock() {
        let engine = ProcessEngine::builder().build();
        engine
            .deploy(
                "wait",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "task", "type": "userTask"},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "task"},
                        {"id": "f2", "from": "task", "to": "end"}
                    ]
                }),
            )
            .unwrap();
        let pid = engine
            .start_process_instance("wait", None, BTreeMap::new())
            .unwrap();

        // A writer that read the root before the signal committed.
        let stale = engine.execution(&pid).unwrap();
        engine.signal(&pid).unwrap();

        let mut set = tokenflow_storage::ChangeSet::new("Stale");
        set.update(stale);
        let err = engine.store().commit(set).unwrap_err();
        assert!(err.is_optimistic_lock());
    }

    #[test]
    fn test_variables_are_scoped() {
        let engine = ProcessEngine::builder().build();
        engine
            .deploy(
                "scoped",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "sub", "type": "subProcess"},
                        {"id": "sub_start", "type": "startEvent", "parent": "sub"},
                        {"id": "inner", "type": "userTask", "parent": "sub"},
                        {"id": "sub_end", "type": "endEvent", "parent": "sub"},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "sub"},
                        {"id": "s1", "from": "sub_start", "to": "inner"},
                        {"id": "s2", "from": "inner", "to": "sub_end"},
                        {"id": "f2", "from": "sub", "to": "end"}
                    ]
                }),
            )
            .unwrap();
        let pid = engine
            .start_process_instance("scoped", None, vars(&[("amount", json!(10))]))
            .unwrap();
        let inner = single_execution_at(&engine, &pid, "inner");

        engine
            .set_variables(&inner, vars(&[("amount", json!(20))]))
            .unwrap();
        engine
            .set_variables_local(&inner, vars(&[("note", json!("scoped"))]))
            .unwrap();

        assert_eq!(engine.variable(&pid, "amount").unwrap(), Some(json!(20)));
        assert_eq!(engine.variable(&pid, "note").unwrap(), None);
        assert_eq!(
            engine.variables(&inner).unwrap(),
            vars(&[("amount", json!(20)), ("note", json!("scoped"))])
        );

        engine.signal(&inner).unwrap();
        assert!(engine.executions(&pid).is_empty());
    }

    #[test]
    fn test_retries_exhaust_after_n_plus_one_attempts() {
        let attempts = Arc::new(Mutex::new(0u32));
        let mut registry = BehaviorRegistry::new();
        let counter = Arc::clone(&attempts);
        registry.register_delegate("flaky", move |_| {
            *counter.lock() += 1;
            Err(DelegateError::failed("downstream unavailable"))
        });
        let clock = Arc::new(ManualClock::default());
        let engine = ProcessEngine::builder()
            .registry(registry)
            .clock(clock.clone())
            .backoff(crate::backoff::RetryBackoff::Fixed { delay_ms: 1_000 })
            .build();
        engine
            .deploy(
                "retry",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "call", "type": "serviceTask", "delegate": "flaky", "asyncBefore": true, "retries": 2},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "call"},
                        {"id": "f2", "from": "call", "to": "end"}
                    ]
                }),
            )
            .unwrap();
        let pid = engine
            .start_process_instance("retry", None, BTreeMap::new())
            .unwrap();
        let job_id = engine.jobs()[0].id.clone();

        for attempt in 1..=3u32 {
            assert!(engine.execute_job(&job_id).is_err());
            let job = engine.job(&job_id).unwrap();
            assert_eq!(job.attempts, attempt);
            assert_eq!(
                job.exception_message.as_deref(),
                Some("core error: delegate failed in activity call: downstream unavailable")
            );
            if attempt < 3 {
                assert_eq!(job.retries, 2 - attempt);
                assert_eq!(job.due_date, clock.now() + Duration::seconds(1));
                assert!(job.incident_id.is_none());
            } else {
                assert_eq!(job.retries, 0);
                assert!(job.incident_id.is_some());
            }
        }
        assert_eq!(*attempts.lock(), 3);

        clock.advance(Duration::hours(1));
        assert!(engine
            .store()
            .find_acquirable_jobs(clock.now(), 10)
            .is_empty());
        let incidents = engine.incidents_for_process_instance(&pid);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].activity_id, "call");

        engine.set_job_retries(&job_id, 1).unwrap();
        assert!(engine.incidents().is_empty());
        assert_eq!(
            engine.store().find_acquirable_jobs(clock.now(), 10).len(),
            1
        );
    }

    #[test]
    fn test_repeated_failure_keeps_one_incident() {
        let attempts = Arc::new(Mutex::new(0u32));
        let mut registry = BehaviorRegistry::new();
        let counter = Arc::clone(&attempts);
        registry.register_delegate("down", move |_| {
            let mut n = counter.lock();
            *n += 1;
            Err(DelegateError::failed(format!("attempt {}", *n)))
        });
        let engine = ProcessEngine::builder().registry(registry).build();
        engine
            .deploy(
                "fragile",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "call", "type": "serviceTask", "delegate": "down", "asyncBefore": true, "retries": 0},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "call"},
                        {"id": "f2", "from": "call", "to": "end"}
                    ]
                }),
            )
            .unwrap();
        engine
            .start_process_instance("fragile", None, BTreeMap::new())
            .unwrap();
        let job_id = engine.jobs()[0].id.clone();

        assert!(engine.execute_job(&job_id).is_err());
        let first = engine.incidents();
        assert_eq!(first.len(), 1);

        // Re-running by hand fails again; the open incident is reused.
        assert!(engine.execute_job(&job_id).is_err());
        let incidents = engine.incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].id, first[0].id);
        assert!(incidents[0].message.ends_with("attempt 2"));

        let job = engine.job(&job_id).unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.retries, 0);
        assert_eq!(job.incident_id.as_deref(), Some(first[0].id.as_str()));
    }

    #[test]
    fn test_failed_listener_reruns_whole_event_after_retry() {
        let calls: Arc<Mutex<BTreeMap<&'static str, u32>>> = Arc::default();
        let mut registry = BehaviorRegistry::new();
        for name in ["before", "first", "after"] {
            let calls = Arc::clone(&calls);
            registry.register_listener(name, move |_| {
                *calls.lock().entry(name).or_default() += 1;
                Ok(())
            });
        }
        let flaky = Arc::clone(&calls);
        registry.register_listener("flaky", move |_| {
            let mut calls = flaky.lock();
            let n = calls.entry("flaky").or_default();
            *n += 1;
            if *n == 1 {
                return Err(DelegateError::failed("listener hiccup"));
            }
            Ok(())
        });
        let engine = ProcessEngine::builder().registry(registry).build();
        engine
            .deploy(
                "listened",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "task", "type": "receiveTask", "asyncAfter": true,
                         "listeners": {"start": ["before"], "end": ["first", "flaky"]}},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "task"},
                        {"id": "f2", "from": "task", "to": "end", "listeners": ["after"]}
                    ]
                }),
            )
            .unwrap();
        let pid = engine
            .start_process_instance("listened", None, BTreeMap::new())
            .unwrap();
        let task = single_execution_at(&engine, &pid, "task");
        engine.signal(&task).unwrap();
        let job_id = engine.jobs()[0].id.clone();

        assert!(engine.execute_job(&job_id).is_err());
        // Nothing the failed attempt did was committed.
        let parked = engine.execution(&task).unwrap();
        assert_eq!(parked.listener_index, 0);
        assert!(parked.event_name.is_none());
        assert_eq!(engine.job(&job_id).unwrap().attempts, 1);

        engine.execute_job(&job_id).unwrap();
        assert!(engine.executions(&pid).is_empty());
        assert!(engine.jobs().is_empty());

        let calls = calls.lock();
        assert_eq!(calls.get("before"), Some(&1));
        assert_eq!(calls.get("first"), Some(&2));
        assert_eq!(calls.get("flaky"), Some(&2));
        assert_eq!(calls.get("after"), Some(&1));
    }

    #[test]
    fn test_timer_fires_when_due() {
        let clock = Arc::new(ManualClock::default());
        let engine = ProcessEngine::builder().clock(clock.clone()).build();
        engine
            .deploy(
                "timed",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "wait", "type": "timer", "durationMs": 60000},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "wait"},
                        {"id": "f2", "from": "wait", "to": "end"}
                    ]
                }),
            )
            .unwrap();
        let pid = engine
            .start_process_instance("timed", None, BTreeMap::new())
            .unwrap();
        let job = engine.jobs_for_process_instance(&pid).remove(0);
        assert_eq!(job.due_date, clock.now() + Duration::minutes(1));
        assert!(engine
            .store()
            .find_acquirable_jobs(clock.now(), 10)
            .is_empty());

        clock.advance(Duration::minutes(1));
        let due = engine.store().find_acquirable_jobs(clock.now(), 10);
        assert_eq!(due.len(), 1);
        engine.execute_job(&due[0].id).unwrap();
        assert!(engine.executions(&pid).is_empty());
    }

    fn review_with_timer(cancel_activity: bool) -> Value {
        json!({
            "activities": [
                {"id": "start", "type": "startEvent"},
                {"id": "review", "type": "userTask"},
                {"id": "expire", "type": "boundaryTimer", "attachedTo": "review",
                 "durationMs": 1800000, "cancelActivity": cancel_activity},
                {"id": "expired", "type": "userTask"},
                {"id": "after", "type": "userTask"}
            ],
            "flows": [
                {"id": "f1", "from": "start", "to": "review"},
                {"id": "f2", "from": "review", "to": "after"},
                {"id": "f3", "from": "expire", "to": "expired"}
            ]
        })
    }

    #[test]
    fn test_boundary_timer_interrupts_waiting_task() {
        let clock = Arc::new(ManualClock::default());
        let engine = ProcessEngine::builder().clock(clock.clone()).build();
        engine.deploy("review", &review_with_timer(true)).unwrap();
        let pid = engine
            .start_process_instance("review", None, BTreeMap::new())
            .unwrap();

        let jobs = engine.jobs_for_process_instance(&pid);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind.name(), "boundary-timer");
        assert_eq!(jobs[0].due_date, clock.now() + Duration::minutes(30));

        clock.advance(Duration::minutes(30));
        let due = engine.store().find_acquirable_jobs(clock.now(), 10);
        assert_eq!(due.len(), 1);
        engine.execute_job(&due[0].id).unwrap();

        assert_eq!(engine.active_activity_ids(&pid).unwrap(), vec!["expired"]);
        assert_eq!(engine.executions(&pid).len(), 1);
        assert!(engine.jobs_for_process_instance(&pid).is_empty());
    }

    #[test]
    fn test_non_interrupting_boundary_timer_keeps_task_waiting() {
        let clock = Arc::new(ManualClock::default());
        let engine = ProcessEngine::builder().clock(clock.clone()).build();
        engine.deploy("review", &review_with_timer(false)).unwrap();
        let pid = engine
            .start_process_instance("review", None, BTreeMap::new())
            .unwrap();

        clock.advance(Duration::minutes(31));
        let job = engine.jobs_for_process_instance(&pid).remove(0);
        engine.execute_job(&job.id).unwrap();
        assert_eq!(
            engine.active_activity_ids(&pid).unwrap(),
            vec!["expired", "review"]
        );

        engine
            .signal(&single_execution_at(&engine, &pid, "review"))
            .unwrap();
        assert_eq!(
            engine.active_activity_ids(&pid).unwrap(),
            vec!["after", "expired"]
        );
    }

    #[test]
    fn test_boundary_timer_deleted_when_host_completes() {
        let engine = ProcessEngine::builder().build();
        engine.deploy("review", &review_with_timer(true)).unwrap();
        let pid = engine
            .start_process_instance("review", None, BTreeMap::new())
            .unwrap();
        let timer = engine.jobs_for_process_instance(&pid).remove(0);

        engine.signal(&pid).unwrap();
        assert_eq!(engine.active_activity_ids(&pid).unwrap(), vec!["after"]);
        assert!(engine.jobs_for_process_instance(&pid).is_empty());
        assert!(engine.job(&timer.id).is_none());
    }

    #[test]
    fn test_parallel_multi_instance_completes_after_every_instance() {
        let engine = ProcessEngine::builder().build();
        engine
            .deploy(
                "packing",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "pack", "type": "userTask",
                         "multiInstance": {"collection": "items", "elementVariable": "item"}},
                        {"id": "ship", "type": "userTask"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "pack"},
                        {"id": "f2", "from": "pack", "to": "ship"}
                    ]
                }),
            )
            .unwrap();
        let pid = engine
            .start_process_instance("packing", None, vars(&[("items", json!(["a", "b", "c"]))]))
            .unwrap();
        assert_eq!(
            engine.active_activity_ids(&pid).unwrap(),
            vec!["pack", "pack", "pack"]
        );

        let instances: Vec<Execution> = engine
            .executions(&pid)
            .into_iter()
            .filter(|e| e.is_active && e.activity_id.as_deref() == Some("pack"))
            .collect();
        let mut items: Vec<Value> = instances
            .iter()
            .map(|e| engine.variable(&e.id, "item").unwrap().unwrap())
            .collect();
        items.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
        assert_eq!(items, vec![json!("a"), json!("b"), json!("c")]);

        // Each instance completes in its own command.
        for (done, instance) in instances.iter().enumerate() {
            assert_eq!(engine.variable(&pid, "nrOfCompletedInstances").unwrap(), Some(json!(done)));
            engine.signal(&instance.id).unwrap();
        }
        assert_eq!(engine.active_activity_ids(&pid).unwrap(), vec!["ship"]);
        assert_eq!(engine.executions(&pid).len(), 1);
        assert_eq!(engine.variable(&pid, "nrOfInstances").unwrap(), None);
    }

    #[test]
    fn test_suspension_blocks_signals_and_jobs() {
        let engine = ProcessEngine::builder().build();
        engine
            .deploy(
                "suspendable",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "task", "type": "userTask", "asyncAfter": true},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "task"},
                        {"id": "f2", "from": "task", "to": "end"}
                    ]
                }),
            )
            .unwrap();
        let pid = engine
            .start_process_instance("suspendable", None, BTreeMap::new())
            .unwrap();

        engine.suspend_process_instance(&pid).unwrap();
        assert!(matches!(engine.signal(&pid), Err(EngineError::Suspended(_))));
        assert_eq!(
            engine.historic_process_instance(&pid).unwrap().state,
            ProcessInstanceState::Suspended
        );

        engine.activate_process_instance(&pid).unwrap();
        engine.signal(&pid).unwrap();

        // asyncAfter parked the token behind a job; suspend again.
        let job = engine.jobs_for_process_instance(&pid).remove(0);
        engine.suspend_process_instance(&pid).unwrap();
        assert!(engine.job(&job.id).unwrap().suspended);
        assert!(engine
            .store()
            .find_acquirable_jobs(engine.now() + Duration::seconds(1), 10)
            .is_empty());
        assert!(matches!(
            engine.execute_job(&job.id),
            Err(EngineError::Suspended(_))
        ));
        assert_eq!(engine.job(&job.id).unwrap().attempts, 0);

        engine.activate_process_instance(&pid).unwrap();
        engine.execute_job(&job.id).unwrap();
        assert!(engine.executions(&pid).is_empty());
        assert_eq!(
            engine.historic_process_instance(&pid).unwrap().state,
            ProcessInstanceState::Completed
        );
    }

    #[test]
    fn test_delete_instance_removes_runtime_state() {
        let engine = ProcessEngine::builder().build();
        engine
            .deploy(
                "deletable",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "wait", "type": "timer", "durationMs": 1000},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "wait"},
                        {"id": "f2", "from": "wait", "to": "end"}
                    ]
                }),
            )
            .unwrap();
        let pid = engine
            .start_process_instance("deletable", Some("order-7"), BTreeMap::new())
            .unwrap();
        assert_eq!(engine.jobs().len(), 1);

        engine
            .delete_process_instance(&pid, Some("cancelled"))
            .unwrap();
        assert!(engine.executions(&pid).is_empty());
        assert!(engine.jobs().is_empty());
        let history = engine.historic_process_instance(&pid).unwrap();
        assert_eq!(history.state, ProcessInstanceState::Deleted);
        assert_eq!(history.delete_reason.as_deref(), Some("cancelled"));
        assert_eq!(history.business_key.as_deref(), Some("order-7"));

        assert!(matches!(
            engine.delete_process_instance(&pid, None),
            Err(EngineError::ProcessInstanceNotFound(_))
        ));
    }

    #[test]
    fn test_delete_job_rejects_locked_job() {
        let engine = ProcessEngine::builder().build();
        engine
            .deploy(
                "timer",
                &json!({
                    "activities": [
                        {"id": "start", "type": "startEvent"},
                        {"id": "wait", "type": "timer", "durationMs": 0},
                        {"id": "end", "type": "endEvent"}
                    ],
                    "flows": [
                        {"id": "f1", "from": "start", "to": "wait"},
                        {"id": "f2", "from": "wait", "to": "end"}
                    ]
                }),
            )
            .unwrap();
        engine
            .start_process_instance("timer", None, BTreeMap::new())
            .unwrap();
        let job = engine.jobs().remove(0);
        let locked = engine
            .store()
            .try_lock_job(&job.id, job.revision, "worker", engine.now() + Duration::minutes(5))
            .unwrap();

        assert!(matches!(
            engine.delete_job(&job.id),
            Err(EngineError::JobLocked { .. })
        ));
        assert!(matches!(
            engine.execute_job(&job.id),
            Err(EngineError::JobLocked { .. })
        ));

        engine.store().unlock_job(&locked).unwrap();
        engine.delete_job(&job.id).unwrap();
        assert!(engine.jobs().is_empty());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let document = json!({
            "activities": [
                {"id": "start", "type": "startEvent"},
                {"id": "fork", "type": "parallelGateway"},
                {"id": "a", "type": "userTask"},
                {"id": "b", "type": "timer", "durationMs": 5000},
                {"id": "join", "type": "parallelGateway"},
                {"id": "end", "type": "endEvent"}
            ],
            "flows": [
                {"id": "f1", "from": "start", "to": "fork"},
                {"id": "fa", "from": "fork", "to": "a"},
                {"id": "fb", "from": "fork", "to": "b"},
                {"id": "ja", "from": "a", "to": "join"},
                {"id": "jb", "from": "b", "to": "join"},
                {"id": "f2", "from": "join", "to": "end"}
            ]
        });

        let (pid, before, jobs_before) = {
            let store = Arc::new(EngineStore::open(StoreConfig::new(dir.path())).unwrap());
            let engine = ProcessEngine::builder().store(store).build();
            engine.deploy("reload", &document).unwrap();
            let pid = engine
                .start_process_instance("reload", Some("b-1"), vars(&[("x", json!(1))]))
                .unwrap();
            let a = single_execution_at(&engine, &pid, "a");
            engine.signal(&a).unwrap();
            let before = engine.executions(&pid);
            let jobs = engine.jobs();
            engine.close().unwrap();
            (pid, before, jobs)
        };

        let store = Arc::new(EngineStore::open(StoreConfig::new(dir.path())).unwrap());
        let engine = ProcessEngine::builder().store(store).build();
        assert_eq!(engine.executions(&pid), before);
        assert_eq!(engine.jobs(), jobs_before);
        assert_eq!(engine.variable(&pid, "x").unwrap(), Some(json!(1)));

        engine.execute_job(&jobs_before[0].id).unwrap();
        assert!(engine.executions(&pid).is_empty());
        assert_eq!(
            engine.historic_process_instance(&pid).unwrap().state,
            ProcessInstanceState::Completed
        );
    }

    #[test]
    fn test_deploy_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("approval.json"),
            json!({
                "activities": [
                    {"id": "start", "type": "startEvent"},
                    {"id": "end", "type": "endEvent"}
                ],
                "flows": [{"id": "f1", "from": "start", "to": "end"}]
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let engine = ProcessEngine::builder().build();
        let results = engine.deploy_directory(dir.path()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "approval");
        assert!(results[0].created);

        let again = engine.deploy_directory(dir.path()).unwrap();
        assert!(!again[0].created);
        assert_eq!(engine.definitions().len(), 1);
    }
}
