//! The engine's built-in commands.

use crate::command::Command;
use crate::context::CommandContext;
use crate::error::EngineError;
use serde_json::Value;
use std::collections::BTreeMap;
use tokenflow_core::{Incident, JobKind};
use tokenflow_storage::DeployResult;

/// Deploys a definition document.
///
/// The definition write is committed by the store immediately and does not
/// take part in the command's change set.
#[derive(Debug, Clone)]
pub struct DeployCommand {
    pub key: String,
    pub document: Value,
}

impl Command for DeployCommand {
    type Output = DeployResult;

    fn name(&self) -> &'static str {
        "Deploy"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<DeployResult, EngineError> {
        let result = ctx.store().deploy_definition(&self.key, &self.document)?;
        let definition = ctx.services().definition(&result.key, result.version)?;
        let missing = ctx.services().registry().missing_references(&definition);
        if !missing.is_empty() {
            tracing::warn!(
                key = %result.key,
                version = result.version,
                missing = ?missing,
                "definition references names with nothing registered"
            );
        }
        Ok(result)
    }
}

/// Starts a process instance and runs it to its first wait states.
#[derive(Debug, Clone, Default)]
pub struct StartProcessInstanceCommand {
    pub key: String,
    /// Latest version when `None`.
    pub version: Option<u32>,
    pub business_key: Option<String>,
    pub variables: BTreeMap<String, Value>,
}

impl StartProcessInstanceCommand {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

impl Command for StartProcessInstanceCommand {
    type Output = String;

    fn name(&self) -> &'static str {
        "StartProcessInstance"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<String, EngineError> {
        let definition = match self.version {
            Some(version) => ctx.services().definition(&self.key, version)?,
            None => ctx.services().latest_definition(&self.key)?,
        };
        let pid =
            ctx.start_instance(definition, self.business_key.clone(), self.variables.clone())?;
        tracing::debug!(process_instance = %pid, key = %self.key, "process instance started");
        Ok(pid)
    }
}

/// Delivers a signal to an execution waiting in an activity.
#[derive(Debug, Clone)]
pub struct SignalCommand {
    pub execution_id: String,
}

impl Command for SignalCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "Signal"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        let pid = ctx.process_instance_of(&self.execution_id)?;
        let instance = ctx.load_instance(&pid)?;
        let execution = instance
            .tree
            .get(&self.execution_id)
            .map_err(|_| EngineError::ExecutionNotFound(self.execution_id.clone()))?;
        if execution.suspended {
            return Err(EngineError::Suspended(pid));
        }
        if !execution.is_active || execution.is_ended || execution.activity_id.is_none() {
            return Err(EngineError::NotWaiting(self.execution_id.clone()));
        }
        let execution_id = self.execution_id.as_str();
        ctx.run(&pid, |interpreter| interpreter.signal(execution_id))
    }
}

/// Sets variables as seen from an execution.
#[derive(Debug, Clone)]
pub struct SetVariablesCommand {
    pub execution_id: String,
    pub variables: BTreeMap<String, Value>,
    /// Write to the execution itself instead of the declaring scope.
    pub local: bool,
}

impl Command for SetVariablesCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "SetVariables"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        let pid = ctx.process_instance_of(&self.execution_id)?;
        let tree = &mut ctx.load_instance(&pid)?.tree;
        for (name, value) in &self.variables {
            if self.local {
                tree.set_variable_local(&self.execution_id, name, value.clone())?;
            } else {
                tree.set_variable(&self.execution_id, name, value.clone())?;
            }
        }
        Ok(())
    }
}

/// Runs a job: deletes it and continues its execution.
///
/// A job whose execution no longer sits in the job's activity is stale; it is
/// deleted without running anything.
#[derive(Debug, Clone)]
pub struct ExecuteJobCommand {
    pub job_id: String,
    /// Executor that holds the lock, if any.
    pub lock_owner: Option<String>,
}

impl Command for ExecuteJobCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "ExecuteJob"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        let store = ctx.store();
        let job = store
            .get_job(&self.job_id)
            .ok_or_else(|| EngineError::JobNotFound(self.job_id.clone()))?;
        if job.is_locked(ctx.now()) && job.lock_owner != self.lock_owner {
            return Err(EngineError::JobLocked {
                job_id: job.id.clone(),
                owner: job.lock_owner.clone().unwrap_or_default(),
            });
        }
        if job.suspended {
            return Err(EngineError::Suspended(job.process_instance_id.clone()));
        }

        ctx.delete_job(&job);
        if let Some(incident) = job.incident_id.as_deref().and_then(|id| store.get_incident(id)) {
            ctx.delete_incident(&incident);
        }

        let pid = job.process_instance_id.clone();
        let host = Some(job.kind.activity_id());
        let at_activity = match ctx.load_instance(&pid) {
            Ok(instance) => instance.tree.get(&job.execution_id).ok().map_or(false, |e| {
                // Timers of a subprocess live on the scope execution it created.
                e.activity_id.as_deref() == host
                    || (matches!(job.kind, JobKind::BoundaryTimer { .. })
                        && e.scope_activity_id.as_deref() == host)
            }),
            Err(EngineError::ProcessInstanceNotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if !at_activity {
            tracing::debug!(job = %job.id, execution = %job.execution_id, "dropping stale job");
            return Ok(());
        }

        tracing::debug!(job = %job.id, kind = job.kind.name(), execution = %job.execution_id, "executing job");
        match &job.kind {
            JobKind::AsyncContinuation { operation, .. } => {
                let operation = *operation;
                let execution_id = job.execution_id.as_str();
                ctx.run(&pid, |interpreter| interpreter.resume(operation, execution_id))
            }
            JobKind::Timer { .. } => ctx.execute_nested(&SignalCommand {
                execution_id: job.execution_id.clone(),
            }),
            JobKind::BoundaryTimer { boundary_id, .. } => {
                let execution_id = job.execution_id.as_str();
                ctx.run(&pid, |interpreter| {
                    interpreter.fire_boundary_timer(execution_id, boundary_id)
                })
            }
        }
    }
}

/// Records a job failure: retry later with backoff, or raise an incident.
///
/// A job that another owner has locked in the meantime is left alone; that
/// owner is running it now.
#[derive(Debug, Clone)]
pub struct HandleFailedJobCommand {
    pub job_id: String,
    pub message: String,
    /// Owner that ran the job; `None` for an admin execution.
    pub lock_owner: Option<String>,
}

impl Command for HandleFailedJobCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "HandleFailedJob"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        let store = ctx.store();
        let mut job = store
            .get_job(&self.job_id)
            .ok_or_else(|| EngineError::JobNotFound(self.job_id.clone()))?;
        let now = ctx.now();
        if job.is_locked(now) && job.lock_owner != self.lock_owner {
            tracing::warn!(
                job = %job.id,
                owner = job.lock_owner.as_deref().unwrap_or(""),
                error = %self.message,
                "job failed after its lock passed to another owner"
            );
            return Ok(());
        }

        job.attempts += 1;
        job.exception_message = Some(self.message.clone());
        job.unlock();

        if job.retries > 0 {
            job.retries -= 1;
            let delay = ctx.services().backoff.delay(job.attempts);
            job.due_date = now + to_chrono(delay);
            tracing::warn!(
                job = %job.id,
                retries_left = job.retries,
                due = %job.due_date,
                error = %self.message,
                "job failed, will retry"
            );
        } else if let Some(mut incident) =
            job.incident_id.as_deref().and_then(|id| store.get_incident(id))
        {
            incident.message = self.message.clone();
            tracing::error!(
                job = %job.id,
                incident = %incident.id,
                attempts = job.attempts,
                error = %self.message,
                "job failed again with an open incident"
            );
            ctx.update_incident(incident);
        } else {
            let incident = Incident::for_job(&job, self.message.clone(), now);
            job.incident_id = Some(incident.id.clone());
            tracing::error!(
                job = %job.id,
                incident = %incident.id,
                activity = %incident.activity_id,
                error = %self.message,
                "job retries exhausted, incident created"
            );
            ctx.insert_incident(incident);
        }
        ctx.update_job(job);
        Ok(())
    }
}

/// Sets a job's retries; positive retries resolve its incident.
#[derive(Debug, Clone)]
pub struct SetJobRetriesCommand {
    pub job_id: String,
    pub retries: u32,
}

impl Command for SetJobRetriesCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "SetJobRetries"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        let store = ctx.store();
        let mut job = store
            .get_job(&self.job_id)
            .ok_or_else(|| EngineError::JobNotFound(self.job_id.clone()))?;
        job.retries = self.retries;
        if self.retries > 0 {
            if let Some(incident_id) = job.incident_id.take() {
                if let Some(incident) = store.get_incident(&incident_id) {
                    tracing::info!(job = %job.id, incident = %incident_id, "incident resolved");
                    ctx.delete_incident(&incident);
                }
            }
        }
        ctx.update_job(job);
        Ok(())
    }
}

/// Deletes a job that no executor holds.
#[derive(Debug, Clone)]
pub struct DeleteJobCommand {
    pub job_id: String,
}

impl Command for DeleteJobCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "DeleteJob"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        let store = ctx.store();
        let job = store
            .get_job(&self.job_id)
            .ok_or_else(|| EngineError::JobNotFound(self.job_id.clone()))?;
        if job.is_locked(ctx.now()) {
            return Err(EngineError::JobLocked {
                job_id: job.id.clone(),
                owner: job.lock_owner.clone().unwrap_or_default(),
            });
        }
        if let Some(incident) = job.incident_id.as_deref().and_then(|id| store.get_incident(id)) {
            ctx.delete_incident(&incident);
        }
        ctx.delete_job(&job);
        Ok(())
    }
}

/// Flags every job of an instance as suspended or active.
#[derive(Debug, Clone)]
pub struct SetJobsSuspendedCommand {
    pub process_instance_id: String,
    pub suspended: bool,
}

impl Command for SetJobsSuspendedCommand {
    type Output = usize;

    fn name(&self) -> &'static str {
        "SetJobsSuspended"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<usize, EngineError> {
        let mut changed = 0;
        for mut job in ctx.store().jobs_for_process_instance(&self.process_instance_id) {
            if job.suspended != self.suspended {
                job.suspended = self.suspended;
                ctx.update_job(job);
                changed += 1;
            }
        }
        Ok(changed)
    }
}

/// Suspends a process instance: no signals, no job executions.
#[derive(Debug, Clone)]
pub struct SuspendProcessInstanceCommand {
    pub process_instance_id: String,
}

impl Command for SuspendProcessInstanceCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "SuspendProcessInstance"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        set_suspension(ctx, &self.process_instance_id, true)
    }
}

#[derive(Debug, Clone)]
pub struct ActivateProcessInstanceCommand {
    pub process_instance_id: String,
}

impl Command for ActivateProcessInstanceCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "ActivateProcessInstance"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        set_suspension(ctx, &self.process_instance_id, false)
    }
}

fn set_suspension(
    ctx: &mut CommandContext<'_>,
    process_instance_id: &str,
    suspended: bool,
) -> Result<(), EngineError> {
    let tree = &mut ctx.load_instance(process_instance_id)?.tree;
    let ids: Vec<String> = tree.executions().map(|e| e.id.clone()).collect();
    for id in ids {
        tree.get_mut(&id)?.suspended = suspended;
    }
    ctx.history_mut(process_instance_id)?.state = if suspended {
        tokenflow_core::ProcessInstanceState::Suspended
    } else {
        tokenflow_core::ProcessInstanceState::Active
    };
    let jobs = ctx.execute_nested(&SetJobsSuspendedCommand {
        process_instance_id: process_instance_id.to_string(),
        suspended,
    })?;
    tracing::info!(
        process_instance = process_instance_id,
        suspended,
        jobs,
        "process instance suspension changed"
    );
    Ok(())
}

/// Removes a process instance with its jobs and incidents. No listeners fire.
#[derive(Debug, Clone)]
pub struct DeleteProcessInstanceCommand {
    pub process_instance_id: String,
    pub reason: Option<String>,
}

impl Command for DeleteProcessInstanceCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "DeleteProcessInstance"
    }

    fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), EngineError> {
        ctx.delete_instance(&self.process_instance_id, self.reason.clone())?;
        tracing::info!(
            process_instance = %self.process_instance_id,
            reason = self.reason.as_deref().unwrap_or(""),
            "process instance deleted"
        );
        Ok(())
    }
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
