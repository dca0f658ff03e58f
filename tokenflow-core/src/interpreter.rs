//! The loop that drives atomic operations.
//!
//! The interpreter owns an agenda of continuations. Each step pops the front
//! continuation, runs it, and pushes the returned continuation back to the
//! front, so one branch runs to its wait state before the next starts. Forked
//! branches are appended to the back.

use crate::behavior::{BehaviorRegistry, DelegateExecution};
use crate::definition::{ActivityKind, ProcessDefinition};
use crate::error::CoreError;
use crate::execution::ExecutionTree;
use crate::job::{JobKind, JobRequest};
use crate::operation::{enter_boundary, handle_outcome, interrupt_host, AtomicOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What to do with a BPMN error that no boundary event catches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledErrorPolicy {
    /// Abort the command.
    Propagate,
    /// Log a warning and end the throwing execution.
    #[default]
    Log,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeSettings {
    pub unhandled_error: UnhandledErrorPolicy,
}

/// An operation scheduled for an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub operation: AtomicOperation,
    pub execution_id: String,
}

impl Continuation {
    pub fn new(operation: AtomicOperation, execution_id: impl Into<String>) -> Self {
        Self {
            operation,
            execution_id: execution_id.into(),
        }
    }
}

struct Step {
    continuation: Continuation,
    skip_async: bool,
}

/// Runs atomic operations against one execution tree for one command.
pub struct Interpreter<'a> {
    pub(crate) tree: &'a mut ExecutionTree,
    pub(crate) definition: &'a ProcessDefinition,
    pub(crate) registry: &'a BehaviorRegistry,
    pub(crate) settings: &'a RuntimeSettings,
    now: DateTime<Utc>,
    agenda: VecDeque<Step>,
    jobs: Vec<JobRequest>,
    /// (execution, host activity) pairs whose boundary timers are void.
    cancelled_timers: Vec<(String, String)>,
    steps: u64,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        tree: &'a mut ExecutionTree,
        definition: &'a ProcessDefinition,
        registry: &'a BehaviorRegistry,
        settings: &'a RuntimeSettings,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tree,
            definition,
            registry,
            settings,
            now,
            agenda: VecDeque::new(),
            jobs: Vec::new(),
            cancelled_timers: Vec::new(),
            steps: 0,
        }
    }

    /// Starts the process instance held by the tree.
    pub fn start(&mut self) -> Result<(), CoreError> {
        let root = self.tree.root_id().to_string();
        self.perform(AtomicOperation::ProcessStart, &root)
    }

    /// Runs `operation` and everything that follows until all branches wait.
    pub fn perform(
        &mut self,
        operation: AtomicOperation,
        execution_id: &str,
    ) -> Result<(), CoreError> {
        self.agenda.push_back(Step {
            continuation: Continuation::new(operation, execution_id),
            skip_async: false,
        });
        self.run()
    }

    /// Continues an operation from its async job; the async boundary that
    /// created the job is not checked again.
    pub fn resume(
        &mut self,
        operation: AtomicOperation,
        execution_id: &str,
    ) -> Result<(), CoreError> {
        self.agenda.push_back(Step {
            continuation: Continuation::new(operation, execution_id),
            skip_async: true,
        });
        self.run()
    }

    /// Delivers a signal to an execution waiting in an activity.
    pub fn signal(&mut self, execution_id: &str) -> Result<(), CoreError> {
        let execution = self.tree.get(execution_id)?;
        if !execution.is_active || execution.is_ended {
            return Err(CoreError::InconsistentTree {
                reason: format!("execution {} is not active", execution_id),
            });
        }
        let activity_id =
            execution
                .activity_id
                .clone()
                .ok_or_else(|| CoreError::NoCurrentActivity {
                    execution_id: execution_id.to_string(),
                })?;
        let definition = self.definition;
        let registry = self.registry;
        let behavior = registry.behavior(definition.activity(&activity_id)?.activity_type())?;
        tracing::debug!(execution = execution_id, activity = %activity_id, "signal");

        let outcome = {
            let mut delegate = self.delegate_execution(execution_id);
            behavior.signal(&mut delegate)?
        };
        if let Some(next) = handle_outcome(self, execution_id, outcome)? {
            self.agenda.push_back(Step {
                continuation: next,
                skip_async: false,
            });
        }
        self.run()
    }

    /// Fires a timer boundary event scheduled on `execution_id`.
    ///
    /// An interrupting timer cancels the host activity and continues from the
    /// boundary event; a non-interrupting one starts a concurrent branch there
    /// and leaves the host waiting. A timer whose host was already left is
    /// ignored.
    pub fn fire_boundary_timer(
        &mut self,
        execution_id: &str,
        boundary_id: &str,
    ) -> Result<(), CoreError> {
        let definition = self.definition;
        let boundary = definition.activity(boundary_id)?;
        let (host_id, interrupting) = match &boundary.kind {
            ActivityKind::BoundaryTimer {
                attached_to,
                cancel_activity,
                ..
            } => (attached_to.as_str(), *cancel_activity),
            _ => {
                return Err(CoreError::InvalidDefinition {
                    reason: format!("'{}' is not a timer boundary event", boundary_id),
                })
            }
        };
        let host = definition.activity(host_id)?;

        let execution = self.tree.get(execution_id)?;
        let at_host = execution.activity_id.as_deref() == Some(host_id);
        let token = if execution.is_multi_instance_root && at_host {
            execution_id.to_string()
        } else if execution.scope_activity_id.as_deref() == Some(host_id) {
            execution
                .parent_id
                .clone()
                .ok_or_else(|| CoreError::InconsistentTree {
                    reason: format!("scope execution {} has no parent", execution_id),
                })?
        } else if at_host && execution.is_active {
            execution_id.to_string()
        } else {
            tracing::debug!(
                execution = execution_id,
                boundary = boundary_id,
                "host already left, timer ignored"
            );
            return Ok(());
        };
        tracing::debug!(
            execution = execution_id,
            host = host_id,
            boundary = boundary_id,
            interrupting,
            "boundary timer fired"
        );

        let next = if interrupting {
            let continuing = interrupt_host(self, execution_id, host)?;
            enter_boundary(self, &continuing, boundary_id)?
        } else {
            let token = self.tree.get(&token)?;
            let fork_from = match (&token.parent_id, token.is_concurrent) {
                (Some(parent), true) => parent.clone(),
                _ => token.id.clone(),
            };
            let branch = self.tree.create_concurrent_child(&fork_from)?;
            enter_boundary(self, &branch, boundary_id)?
        };
        if let Some(next) = next {
            self.agenda.push_back(Step {
                continuation: next,
                skip_async: false,
            });
        }
        self.run()
    }

    fn run(&mut self) -> Result<(), CoreError> {
        while let Some(step) = self.agenda.pop_front() {
            let Continuation {
                operation,
                execution_id,
            } = step.continuation;

            // Branches removed by an interrupt or a completion condition.
            if !self.tree.contains(&execution_id) {
                tracing::trace!(
                    operation = operation.name(),
                    execution = %execution_id,
                    "execution gone, continuation dropped"
                );
                continue;
            }

            if !step.skip_async
                && operation.is_async(self.tree.get(&execution_id)?, self.definition)?
            {
                self.schedule_async(operation, &execution_id)?;
                continue;
            }

            self.steps += 1;
            tracing::trace!(
                operation = operation.name(),
                execution = %execution_id,
                "atomic operation"
            );
            if let Some(next) = operation.execute(self, &execution_id)? {
                self.agenda.push_front(Step {
                    continuation: next,
                    skip_async: false,
                });
            }
        }
        Ok(())
    }

    fn schedule_async(
        &mut self,
        operation: AtomicOperation,
        execution_id: &str,
    ) -> Result<(), CoreError> {
        let activity_id = self
            .tree
            .get(execution_id)?
            .activity_id
            .clone()
            .ok_or_else(|| CoreError::NoCurrentActivity {
                execution_id: execution_id.to_string(),
            })?;
        tracing::debug!(
            operation = operation.name(),
            execution = execution_id,
            activity = %activity_id,
            "async continuation"
        );
        self.schedule_job(
            execution_id,
            JobKind::AsyncContinuation {
                operation,
                activity_id,
            },
            None,
        )
    }

    pub(crate) fn schedule_job(
        &mut self,
        execution_id: &str,
        kind: JobKind,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let retries = self.definition.activity(kind.activity_id())?.retries;
        self.jobs.push(JobRequest {
            execution_id: execution_id.to_string(),
            kind,
            due_date,
            retries,
        });
        Ok(())
    }

    /// Drops boundary timers of `activity_id` scheduled on `execution_id`,
    /// both the ones requested in this run and, through
    /// [`take_cancelled_timers`](Self::take_cancelled_timers), stored ones.
    pub(crate) fn cancel_timers(&mut self, execution_id: &str, activity_id: &str) {
        self.jobs.retain(|job| {
            !(job.execution_id == execution_id
                && matches!(&job.kind, JobKind::BoundaryTimer { activity_id: host, .. } if host == activity_id))
        });
        let key = (execution_id.to_string(), activity_id.to_string());
        if !self.cancelled_timers.contains(&key) {
            tracing::debug!(execution = execution_id, host = activity_id, "boundary timers cancelled");
            self.cancelled_timers.push(key);
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn push_branch(&mut self, continuation: Continuation) {
        self.agenda.push_back(Step {
            continuation,
            skip_async: false,
        });
    }

    pub(crate) fn delegate_execution(&mut self, execution_id: &str) -> DelegateExecution<'_> {
        DelegateExecution::new(
            &mut *self.tree,
            execution_id,
            self.definition,
            self.registry,
            self.now,
        )
    }

    /// Jobs requested so far, in creation order.
    pub fn jobs(&self) -> &[JobRequest] {
        &self.jobs
    }

    pub fn take_jobs(&mut self) -> Vec<JobRequest> {
        std::mem::take(&mut self.jobs)
    }

    /// Hosts left or interrupted during this run, as (execution, activity).
    /// Stored boundary timer jobs matching a pair are obsolete.
    pub fn take_cancelled_timers(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.cancelled_timers)
    }

    /// Number of operations executed.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}
