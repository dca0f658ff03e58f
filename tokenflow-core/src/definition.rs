//! Process definitions.
//!
//! Processes are deployed as a JSON document:
//!
//! ```json
//! {
//!   "name": "order",
//!   "listeners": {"start": ["audit"]},
//!   "activities": [
//!     {"id": "start", "type": "startEvent"},
//!     {"id": "charge", "type": "serviceTask", "delegate": "charge", "asyncBefore": true},
//!     {"id": "declined", "type": "boundaryError", "attachedTo": "charge", "errorCode": "DECLINED"},
//!     {"id": "review", "type": "userTask", "multiInstance": {"collection": "reviewers", "elementVariable": "reviewer"}},
//!     {"id": "remind", "type": "boundaryTimer", "attachedTo": "review", "durationMs": 86400000, "cancelActivity": false},
//!     {"id": "end", "type": "endEvent"}
//!   ],
//!   "flows": [
//!     {"id": "f1", "from": "start", "to": "charge", "listeners": ["audit"]},
//!     {"id": "f2", "from": "charge", "to": "end", "condition": "amount < 1000"}
//!   ]
//! }
//! ```
//!
//! Activities nest inside a `subProcess` through their `parent` field.
//! A `multiInstance` block runs the activity once per element of a
//! collection variable (or a fixed number of times), all instances in
//! parallel.

use crate::condition::Condition;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Activity type plus type-specific attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActivityKind {
    StartEvent,
    EndEvent,
    ErrorEndEvent {
        #[serde(rename = "errorCode")]
        error_code: String,
    },
    ServiceTask {
        delegate: String,
    },
    UserTask,
    ReceiveTask,
    ExclusiveGateway {
        /// Flow taken when no condition matches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    ParallelGateway,
    SubProcess,
    Timer {
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    BoundaryError {
        #[serde(rename = "attachedTo")]
        attached_to: String,
        /// `None` catches every error code.
        #[serde(rename = "errorCode", default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    /// Fires once `durationMs` after the host activity was entered.
    BoundaryTimer {
        #[serde(rename = "attachedTo")]
        attached_to: String,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        /// Interrupting timers cancel the host; others start a parallel branch.
        #[serde(rename = "cancelActivity", default = "interrupting")]
        cancel_activity: bool,
    },
}

fn interrupting() -> bool {
    true
}

/// Data-free discriminant of [`ActivityKind`], used as the behavior
/// registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityType {
    StartEvent,
    EndEvent,
    ErrorEndEvent,
    ServiceTask,
    UserTask,
    ReceiveTask,
    ExclusiveGateway,
    ParallelGateway,
    SubProcess,
    Timer,
    BoundaryError,
    BoundaryTimer,
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ActivityKind {
    pub fn activity_type(&self) -> ActivityType {
        match self {
            ActivityKind::StartEvent => ActivityType::StartEvent,
            ActivityKind::EndEvent => ActivityType::EndEvent,
            ActivityKind::ErrorEndEvent { .. } => ActivityType::ErrorEndEvent,
            ActivityKind::ServiceTask { .. } => ActivityType::ServiceTask,
            ActivityKind::UserTask => ActivityType::UserTask,
            ActivityKind::ReceiveTask => ActivityType::ReceiveTask,
            ActivityKind::ExclusiveGateway { .. } => ActivityType::ExclusiveGateway,
            ActivityKind::ParallelGateway => ActivityType::ParallelGateway,
            ActivityKind::SubProcess => ActivityType::SubProcess,
            ActivityKind::Timer { .. } => ActivityType::Timer,
            ActivityKind::BoundaryError { .. } => ActivityType::BoundaryError,
            ActivityKind::BoundaryTimer { .. } => ActivityType::BoundaryTimer,
        }
    }

    /// Host activity of a boundary event.
    pub fn attached_to(&self) -> Option<&str> {
        match self {
            ActivityKind::BoundaryError { attached_to, .. }
            | ActivityKind::BoundaryTimer { attached_to, .. } => Some(attached_to),
            _ => None,
        }
    }

    /// Activities that can wait, and so can carry timers or run multi-instance.
    fn is_task_like(&self) -> bool {
        matches!(
            self,
            ActivityKind::ServiceTask { .. }
                | ActivityKind::UserTask
                | ActivityKind::ReceiveTask
                | ActivityKind::SubProcess
                | ActivityKind::Timer { .. }
        )
    }
}

/// Instance count of a multi-instance activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopCardinality {
    Fixed(u32),
    /// Name of a variable holding the count.
    Variable(String),
}

/// Parallel multi-instance characteristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_cardinality: Option<LoopCardinality>,
    /// Variable holding an array; one instance runs per element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Local variable each instance gets its element in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_variable: Option<String>,
    /// Checked after every completed instance; cancels the rest once true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_condition: Option<String>,
}

/// Listener names per lifecycle event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventListeners {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub end: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRaw {
    pub id: String,
    #[serde(flatten)]
    pub kind: ActivityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub async_before: bool,
    #[serde(default)]
    pub async_after: bool,
    /// Retries for jobs created at this activity; engine default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default)]
    pub listeners: EventListeners,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRaw {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Listeners notified with the `take` event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<String>,
}

/// Definition document as deployed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinitionRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub activities: Vec<ActivityRaw>,
    #[serde(default)]
    pub flows: Vec<FlowRaw>,
    /// Process-level `start` and `end` listeners.
    #[serde(default)]
    pub listeners: EventListeners,
}

/// A validated activity with its graph links resolved.
#[derive(Debug, Clone)]
pub struct Activity {
    pub id: String,
    pub kind: ActivityKind,
    /// Containing subprocess, `None` at process level.
    pub parent: Option<String>,
    pub async_before: bool,
    pub async_after: bool,
    pub retries: Option<u32>,
    pub listeners: EventListeners,
    /// Outgoing flow ids in document order.
    pub outgoing: Vec<String>,
    pub incoming: Vec<String>,
    /// Boundary events attached to this activity, error and timer alike.
    pub boundary_events: Vec<String>,
    pub multi_instance: Option<MultiInstance>,
    pub completion_condition: Option<Condition>,
}

impl Activity {
    /// Scope activities get their own execution and variable namespace.
    pub fn is_scope(&self) -> bool {
        matches!(self.kind, ActivityKind::SubProcess)
    }

    pub fn activity_type(&self) -> ActivityType {
        self.kind.activity_type()
    }

    pub fn is_multi_instance(&self) -> bool {
        self.multi_instance.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub destination: String,
    pub condition: Option<Condition>,
    pub listeners: Vec<String>,
}

/// A deployed, validated process definition.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub key: String,
    pub version: u32,
    pub checksum: String,
    pub listeners: EventListeners,
    activities: HashMap<String, Activity>,
    flows: HashMap<String, SequenceFlow>,
    pub raw: ProcessDefinitionRaw,
}

impl ProcessDefinition {
    pub fn from_json(
        key: impl Into<String>,
        version: u32,
        json: &serde_json::Value,
    ) -> Result<Self, CoreError> {
        let raw: ProcessDefinitionRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(key, version, raw)
    }

    /// Validates the document and builds the activity graph.
    pub fn from_raw(
        key: impl Into<String>,
        version: u32,
        raw: ProcessDefinitionRaw,
    ) -> Result<Self, CoreError> {
        let key = key.into();
        let mut activities: HashMap<String, Activity> = HashMap::new();

        for a in &raw.activities {
            if a.id.is_empty() {
                return Err(invalid("activity with empty id"));
            }
            let completion_condition = match &a.multi_instance {
                Some(mi) => {
                    check_multi_instance(a, mi)?;
                    mi.completion_condition
                        .as_deref()
                        .map(Condition::parse)
                        .transpose()?
                }
                None => None,
            };
            let activity = Activity {
                id: a.id.clone(),
                kind: a.kind.clone(),
                parent: a.parent.clone(),
                async_before: a.async_before,
                async_after: a.async_after,
                retries: a.retries,
                listeners: a.listeners.clone(),
                outgoing: Vec::new(),
                incoming: Vec::new(),
                boundary_events: Vec::new(),
                multi_instance: a.multi_instance.clone(),
                completion_condition,
            };
            if activities.insert(a.id.clone(), activity).is_some() {
                return Err(invalid(format!("duplicate activity id '{}'", a.id)));
            }
        }

        // Parents must be subprocesses and must not form a cycle.
        for a in &raw.activities {
            if let Some(parent) = &a.parent {
                match activities.get(parent) {
                    Some(p) if p.is_scope() => {}
                    Some(_) => {
                        return Err(invalid(format!(
                            "parent '{}' of activity '{}' is not a subProcess",
                            parent, a.id
                        )))
                    }
                    None => {
                        return Err(invalid(format!(
                            "activity '{}' references unknown parent '{}'",
                            a.id, parent
                        )))
                    }
                }
            }
            let mut seen = HashSet::new();
            let mut cursor = a.parent.as_deref();
            while let Some(p) = cursor {
                if !seen.insert(p) || p == a.id {
                    return Err(invalid(format!("cyclic nesting at activity '{}'", a.id)));
                }
                cursor = activities.get(p).and_then(|x| x.parent.as_deref());
            }
        }

        for a in &raw.activities {
            if let Some(attached_to) = a.kind.attached_to() {
                let host_parent = match activities.get(attached_to) {
                    Some(host) if host.id != a.id && host.kind.attached_to().is_none() => {
                        if matches!(a.kind, ActivityKind::BoundaryTimer { .. })
                            && !host.kind.is_task_like()
                        {
                            return Err(invalid(format!(
                                "timer boundary event '{}' cannot be attached to '{}'",
                                a.id, attached_to
                            )));
                        }
                        host.parent.clone()
                    }
                    _ => {
                        return Err(invalid(format!(
                            "boundary event '{}' attached to unknown activity '{}'",
                            a.id, attached_to
                        )))
                    }
                };
                if host_parent != a.parent {
                    return Err(invalid(format!(
                        "boundary event '{}' must share the scope of '{}'",
                        a.id, attached_to
                    )));
                }
                if let Some(host) = activities.get_mut(attached_to) {
                    host.boundary_events.push(a.id.clone());
                }
            }
        }

        let mut flows = HashMap::new();
        for f in &raw.flows {
            let (source_parent, dest_chain) = match (activities.get(&f.from), activities.get(&f.to)) {
                (Some(s), Some(_)) => (s.parent.clone(), ancestors(&activities, &f.to)),
                _ => {
                    return Err(invalid(format!(
                        "flow '{}' references unknown activity ({} -> {})",
                        f.id, f.from, f.to
                    )))
                }
            };
            // Flows may enter nested scopes but never leave their own.
            if let Some(sp) = &source_parent {
                if !dest_chain.iter().any(|p| p == sp) {
                    return Err(invalid(format!(
                        "flow '{}' leaves the scope '{}' of its source",
                        f.id, sp
                    )));
                }
            }
            let condition = f.condition.as_deref().map(Condition::parse).transpose()?;
            let flow = SequenceFlow {
                id: f.id.clone(),
                source: f.from.clone(),
                destination: f.to.clone(),
                condition,
                listeners: f.listeners.clone(),
            };
            if flows.insert(f.id.clone(), flow).is_some() {
                return Err(invalid(format!("duplicate flow id '{}'", f.id)));
            }
            if let Some(s) = activities.get_mut(&f.from) {
                s.outgoing.push(f.id.clone());
            }
            if let Some(d) = activities.get_mut(&f.to) {
                d.incoming.push(f.id.clone());
            }
        }

        for a in activities.values() {
            if let ActivityKind::ExclusiveGateway {
                default: Some(default),
            } = &a.kind
            {
                if !a.outgoing.contains(default) {
                    return Err(invalid(format!(
                        "default flow '{}' is not an outgoing flow of '{}'",
                        default, a.id
                    )));
                }
            }
            if a.kind.attached_to().is_some() && !a.incoming.is_empty() {
                return Err(invalid(format!(
                    "boundary event '{}' cannot have incoming flows",
                    a.id
                )));
            }
        }

        // Every scope (process and each subprocess) needs exactly one start event.
        let mut scopes: Vec<Option<String>> = vec![None];
        scopes.extend(
            activities
                .values()
                .filter(|a| a.is_scope())
                .map(|a| Some(a.id.clone())),
        );
        for scope in scopes {
            let starts = activities
                .values()
                .filter(|a| a.parent == scope && matches!(a.kind, ActivityKind::StartEvent))
                .count();
            if starts != 1 {
                return Err(invalid(format!(
                    "scope '{}' has {} start events, expected exactly one",
                    scope.as_deref().unwrap_or(&key),
                    starts
                )));
            }
        }

        let canonical = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&canonical));

        Ok(Self {
            key,
            version,
            checksum,
            listeners: raw.listeners.clone(),
            activities,
            flows,
            raw,
        })
    }

    /// Computes the checksum a document would get without validating it.
    pub fn checksum_of(json: &serde_json::Value) -> Result<String, CoreError> {
        let raw: ProcessDefinitionRaw = serde_json::from_value(json.clone())?;
        let canonical = serde_json::to_vec(&raw)?;
        Ok(format!("{:08x}", crc32c::crc32c(&canonical)))
    }

    /// `key:version`, the id stored on executions.
    pub fn id(&self) -> String {
        format!("{}:{}", self.key, self.version)
    }

    pub fn to_json(&self) -> Result<serde_json::Value, CoreError> {
        Ok(serde_json::to_value(&self.raw)?)
    }

    pub fn activity(&self, id: &str) -> Result<&Activity, CoreError> {
        self.activities
            .get(id)
            .ok_or_else(|| CoreError::ActivityNotFound {
                activity_id: id.to_string(),
            })
    }

    pub fn flow(&self, id: &str) -> Result<&SequenceFlow, CoreError> {
        self.flows.get(id).ok_or_else(|| CoreError::FlowNotFound {
            flow_id: id.to_string(),
        })
    }

    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.activities.values()
    }

    /// The start event directly inside `scope` (`None` for the process).
    pub fn initial(&self, scope: Option<&str>) -> Result<&Activity, CoreError> {
        self.activities
            .values()
            .find(|a| a.parent.as_deref() == scope && matches!(a.kind, ActivityKind::StartEvent))
            .ok_or_else(|| invalid(format!("no start event in scope {:?}", scope)))
    }

    /// Whether `activity` is `ancestor` or nested somewhere inside it.
    pub fn is_within(&self, activity: &str, ancestor: &str) -> bool {
        ancestors(&self.activities, activity)
            .iter()
            .any(|a| a == ancestor)
            || activity == ancestor
    }

    /// Resolves which scope to enter first when moving to `destination`.
    ///
    /// Walks up from `destination` through its parent activities and stops
    /// below `outer` (or at process level), so the outer-most scope that must
    /// be created comes back first. Returns `destination` itself when it sits
    /// directly inside `outer`.
    pub fn find_next_scope<'a>(
        &'a self,
        outer: Option<&str>,
        destination: &'a str,
    ) -> Result<&'a Activity, CoreError> {
        let mut next = self.activity(destination)?;
        while let Some(parent) = next.parent.as_deref() {
            if Some(parent) == outer {
                break;
            }
            next = self.activity(parent)?;
        }
        Ok(next)
    }
}

/// Parent chain of an activity, innermost first, excluding the activity.
fn ancestors(activities: &HashMap<String, Activity>, id: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut cursor = activities.get(id).and_then(|a| a.parent.clone());
    while let Some(p) = cursor {
        if chain.contains(&p) {
            break;
        }
        cursor = activities.get(&p).and_then(|a| a.parent.clone());
        chain.push(p);
    }
    chain
}

fn check_multi_instance(activity: &ActivityRaw, mi: &MultiInstance) -> Result<(), CoreError> {
    if !activity.kind.is_task_like() {
        return Err(invalid(format!(
            "activity '{}' cannot be multi-instance",
            activity.id
        )));
    }
    if mi.loop_cardinality.is_some() == mi.collection.is_some() {
        return Err(invalid(format!(
            "multi-instance activity '{}' needs exactly one of loopCardinality and collection",
            activity.id
        )));
    }
    if mi.element_variable.is_some() && mi.collection.is_none() {
        return Err(invalid(format!(
            "multi-instance activity '{}' sets elementVariable without a collection",
            activity.id
        )));
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidDefinition {
        reason: reason.into(),
    }
}
