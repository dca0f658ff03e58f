//! Jobs and incidents.

use crate::operation::AtomicOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retries a job gets when neither the activity nor the engine says otherwise.
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Resumes `operation` on the job's execution.
    AsyncContinuation {
        operation: AtomicOperation,
        activity_id: String,
    },
    /// Fires the timer the execution waits in.
    Timer { activity_id: String },
    /// Fires a timer boundary event of the host activity.
    BoundaryTimer {
        activity_id: String,
        boundary_id: String,
    },
}

impl JobKind {
    pub fn activity_id(&self) -> &str {
        match self {
            JobKind::AsyncContinuation { activity_id, .. } => activity_id,
            JobKind::Timer { activity_id } => activity_id,
            JobKind::BoundaryTimer { activity_id, .. } => activity_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::AsyncContinuation { .. } => "async-continuation",
            JobKind::Timer { .. } => "timer",
            JobKind::BoundaryTimer { .. } => "boundary-timer",
        }
    }
}

/// A unit of deferred work picked up by the job executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub process_instance_id: String,
    pub execution_id: String,
    pub definition_key: String,
    pub kind: JobKind,
    pub due_date: DateTime<Utc>,
    /// Failures still tolerated before an incident is raised.
    pub retries: u32,
    /// Failures so far; drives the backoff.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expiration: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revision: u64,
}

impl Job {
    pub fn new(
        request: JobRequest,
        process_instance_id: &str,
        definition_key: &str,
        now: DateTime<Utc>,
        default_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            process_instance_id: process_instance_id.to_string(),
            execution_id: request.execution_id,
            definition_key: definition_key.to_string(),
            kind: request.kind,
            due_date: request.due_date.unwrap_or(now),
            retries: request.retries.unwrap_or(default_retries),
            attempts: 0,
            lock_owner: None,
            lock_expiration: None,
            exception_message: None,
            suspended: false,
            incident_id: None,
            created_at: now,
            revision: 0,
        }
    }

    /// Locked by a worker whose lock has not yet expired.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration) {
            (Some(_), Some(expiration)) => expiration > now,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Eligible for acquisition at `now`.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.due_date <= now
            && !self.is_locked(now)
            && !self.suspended
            && self.incident_id.is_none()
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration = None;
    }
}

/// A job the interpreter wants created when the command commits.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub execution_id: String,
    pub kind: JobKind,
    /// `None` means due immediately.
    pub due_date: Option<DateTime<Utc>>,
    /// Per-activity retries, engine default when `None`.
    pub retries: Option<u32>,
}

/// Raised when a job runs out of retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub job_id: String,
    pub process_instance_id: String,
    pub execution_id: String,
    pub activity_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revision: u64,
}

impl Incident {
    pub fn for_job(job: &Job, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            process_instance_id: job.process_instance_id.clone(),
            execution_id: job.execution_id.clone(),
            activity_id: job.kind.activity_id().to_string(),
            message: message.into(),
            created_at: now,
            revision: 0,
        }
    }
}
