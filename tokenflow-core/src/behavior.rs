//! Activity behaviors, delegates and execution listeners.
//!
//! Each activity type maps to an [`ActivityBehavior`] in the
//! [`BehaviorRegistry`]. Behaviors never move tokens themselves; they report a
//! [`BehaviorOutcome`] and the interpreter schedules the atomic operations
//! that follow from it.

use crate::definition::{Activity, ActivityKind, ActivityType, ProcessDefinition};
use crate::error::{CoreError, DelegateError};
use crate::execution::{Execution, ExecutionTree};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What the interpreter does after a behavior ran.
#[derive(Debug, Clone, PartialEq)]
pub enum BehaviorOutcome {
    /// Stay in the activity until signalled.
    Wait,
    /// Stay in the activity; a timer job signals it at `due`.
    WaitTimer { due: DateTime<Utc> },
    /// Leave through the given flows.
    Leave(Vec<String>),
    /// Leave without taking any flow.
    End,
    /// Wait for the other branches arriving at this gateway.
    Join,
    /// Start the subprocess at its start event.
    EnterScope { initial: String },
    /// Throw a BPMN error.
    Error { code: String, message: String },
}

/// View of one execution handed to behaviors, delegates and listeners.
pub struct DelegateExecution<'a> {
    tree: &'a mut ExecutionTree,
    execution_id: String,
    definition: &'a ProcessDefinition,
    registry: &'a BehaviorRegistry,
    now: DateTime<Utc>,
}

impl<'a> DelegateExecution<'a> {
    pub fn new(
        tree: &'a mut ExecutionTree,
        execution_id: impl Into<String>,
        definition: &'a ProcessDefinition,
        registry: &'a BehaviorRegistry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tree,
            execution_id: execution_id.into(),
            definition,
            registry,
            now,
        }
    }

    pub fn id(&self) -> &str {
        &self.execution_id
    }

    pub fn execution(&self) -> Result<&Execution, CoreError> {
        self.tree.get(&self.execution_id)
    }

    pub fn process_instance_id(&self) -> &str {
        self.tree.process_instance_id()
    }

    pub fn business_key(&self) -> Option<String> {
        self.tree.root().ok().and_then(|r| r.business_key.clone())
    }

    pub fn activity_id(&self) -> Option<String> {
        self.execution().ok().and_then(|e| e.activity_id.clone())
    }

    /// The activity the execution occupies.
    pub fn activity(&self) -> Result<&'a Activity, CoreError> {
        let activity_id = self
            .execution()?
            .activity_id
            .clone()
            .ok_or_else(|| CoreError::NoCurrentActivity {
                execution_id: self.execution_id.clone(),
            })?;
        self.definition.activity(&activity_id)
    }

    pub fn definition(&self) -> &'a ProcessDefinition {
        self.definition
    }

    pub fn event_name(&self) -> Option<String> {
        self.execution().ok().and_then(|e| e.event_name.clone())
    }

    pub fn event_source(&self) -> Option<String> {
        self.execution().ok().and_then(|e| e.event_source.clone())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.tree
            .get_variable(&self.execution_id, name)
            .ok()
            .flatten()
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.tree
            .has_variable(&self.execution_id, name)
            .unwrap_or(false)
    }

    pub fn variables(&self) -> Result<BTreeMap<String, Value>, CoreError> {
        self.tree.variables(&self.execution_id)
    }

    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<(), CoreError> {
        self.tree.set_variable(&self.execution_id, name, value)
    }

    pub fn set_variable_local(&mut self, name: &str, value: Value) -> Result<(), CoreError> {
        self.tree.set_variable_local(&self.execution_id, name, value)
    }

    pub fn remove_variable(&mut self, name: &str) -> Result<Option<Value>, CoreError> {
        self.tree.remove_variable(&self.execution_id, name)
    }

    /// Whether this is one of the parallel instances of a multi-instance
    /// activity, which leave through the activity's body instead of its flows.
    pub fn is_multi_instance_child(&self) -> bool {
        match (self.tree.multi_instance_body(&self.execution_id), self.execution()) {
            (Ok(Some(body)), Ok(execution)) => body.activity_id == execution.activity_id,
            _ => false,
        }
    }

    /// Evaluates a flow's condition against the visible variables.
    pub fn condition_holds(&self, flow_id: &str) -> Result<bool, CoreError> {
        let flow = self.definition.flow(flow_id)?;
        Ok(match &flow.condition {
            Some(condition) => condition.evaluate(&|name| self.get_variable(name)),
            None => true,
        })
    }

    pub(crate) fn registry(&self) -> &'a BehaviorRegistry {
        self.registry
    }
}

impl From<CoreError> for DelegateError {
    fn from(err: CoreError) -> Self {
        DelegateError::Failed(err.to_string())
    }
}

/// Behavior of one activity type.
pub trait ActivityBehavior: Send + Sync {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError>;

    /// Called when a waiting execution is signalled.
    fn signal(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        Err(CoreError::SignalNotSupported {
            activity_id: execution.activity_id().unwrap_or_default(),
        })
    }
}

/// Business logic behind a `serviceTask`.
pub trait Delegate: Send + Sync {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<(), DelegateError>;
}

/// Callback notified on `start`, `end` and `take` events.
pub trait ExecutionListener: Send + Sync {
    fn notify(&self, execution: &mut DelegateExecution<'_>) -> Result<(), DelegateError>;
}

struct FnDelegate<F>(F);

impl<F> Delegate for FnDelegate<F>
where
    F: Fn(&mut DelegateExecution<'_>) -> Result<(), DelegateError> + Send + Sync,
{
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<(), DelegateError> {
        (self.0)(execution)
    }
}

struct FnListener<F>(F);

impl<F> ExecutionListener for FnListener<F>
where
    F: Fn(&mut DelegateExecution<'_>) -> Result<(), DelegateError> + Send + Sync,
{
    fn notify(&self, execution: &mut DelegateExecution<'_>) -> Result<(), DelegateError> {
        (self.0)(execution)
    }
}

/// Maps activity types, delegate names and listener names to code.
pub struct BehaviorRegistry {
    behaviors: HashMap<ActivityType, Arc<dyn ActivityBehavior>>,
    delegates: HashMap<String, Arc<dyn Delegate>>,
    listeners: HashMap<String, Arc<dyn ExecutionListener>>,
}

impl BehaviorRegistry {
    /// A registry with no behaviors at all.
    pub fn empty() -> Self {
        Self {
            behaviors: HashMap::new(),
            delegates: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    /// A registry with the built-in behavior of every activity type.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_behavior(ActivityType::StartEvent, TakeOutgoingBehavior);
        registry.register_behavior(ActivityType::BoundaryError, TakeOutgoingBehavior);
        registry.register_behavior(ActivityType::BoundaryTimer, TakeOutgoingBehavior);
        registry.register_behavior(ActivityType::EndEvent, EndEventBehavior);
        registry.register_behavior(ActivityType::ErrorEndEvent, ErrorEndEventBehavior);
        registry.register_behavior(ActivityType::ServiceTask, ServiceTaskBehavior);
        registry.register_behavior(ActivityType::UserTask, WaitStateBehavior);
        registry.register_behavior(ActivityType::ReceiveTask, WaitStateBehavior);
        registry.register_behavior(ActivityType::ExclusiveGateway, ExclusiveGatewayBehavior);
        registry.register_behavior(ActivityType::ParallelGateway, ParallelGatewayBehavior);
        registry.register_behavior(ActivityType::SubProcess, SubProcessBehavior);
        registry.register_behavior(ActivityType::Timer, TimerBehavior);
        registry
    }

    pub fn register_behavior(
        &mut self,
        activity_type: ActivityType,
        behavior: impl ActivityBehavior + 'static,
    ) -> &mut Self {
        self.behaviors.insert(activity_type, Arc::new(behavior));
        self
    }

    pub fn register_delegate<F>(&mut self, name: impl Into<String>, delegate: F) -> &mut Self
    where
        F: Fn(&mut DelegateExecution<'_>) -> Result<(), DelegateError> + Send + Sync + 'static,
    {
        self.delegates
            .insert(name.into(), Arc::new(FnDelegate(delegate)));
        self
    }

    pub fn register_delegate_impl(
        &mut self,
        name: impl Into<String>,
        delegate: impl Delegate + 'static,
    ) -> &mut Self {
        self.delegates.insert(name.into(), Arc::new(delegate));
        self
    }

    pub fn register_listener<F>(&mut self, name: impl Into<String>, listener: F) -> &mut Self
    where
        F: Fn(&mut DelegateExecution<'_>) -> Result<(), DelegateError> + Send + Sync + 'static,
    {
        self.listeners
            .insert(name.into(), Arc::new(FnListener(listener)));
        self
    }

    pub fn register_listener_impl(
        &mut self,
        name: impl Into<String>,
        listener: impl ExecutionListener + 'static,
    ) -> &mut Self {
        self.listeners.insert(name.into(), Arc::new(listener));
        self
    }

    pub fn behavior(&self, activity_type: ActivityType) -> Result<&dyn ActivityBehavior, CoreError> {
        self.behaviors
            .get(&activity_type)
            .map(|b| b.as_ref())
            .ok_or_else(|| CoreError::MissingBehavior {
                activity_type: activity_type.to_string(),
            })
    }

    pub fn delegate(&self, name: &str) -> Result<&dyn Delegate, CoreError> {
        self.delegates
            .get(name)
            .map(|d| d.as_ref())
            .ok_or_else(|| CoreError::UnknownDelegate {
                name: name.to_string(),
            })
    }

    pub fn listener(&self, name: &str) -> Result<&dyn ExecutionListener, CoreError> {
        self.listeners
            .get(name)
            .map(|l| l.as_ref())
            .ok_or_else(|| CoreError::UnknownListener {
                name: name.to_string(),
            })
    }

    /// Names referenced by `definition` that have nothing registered.
    pub fn missing_references(&self, definition: &ProcessDefinition) -> Vec<String> {
        let mut missing = Vec::new();
        let check_listener = |name: &String, missing: &mut Vec<String>| {
            if !self.listeners.contains_key(name) {
                missing.push(format!("listener '{}'", name));
            }
        };
        for name in definition
            .listeners
            .start
            .iter()
            .chain(definition.listeners.end.iter())
        {
            check_listener(name, &mut missing);
        }
        for activity in definition.activities() {
            for name in activity
                .listeners
                .start
                .iter()
                .chain(activity.listeners.end.iter())
            {
                check_listener(name, &mut missing);
            }
            for flow_id in &activity.outgoing {
                if let Ok(flow) = definition.flow(flow_id) {
                    for name in &flow.listeners {
                        check_listener(name, &mut missing);
                    }
                }
            }
            if let ActivityKind::ServiceTask { delegate } = &activity.kind {
                if !self.delegates.contains_key(delegate) {
                    missing.push(format!("delegate '{}'", delegate));
                }
            }
        }
        missing.sort();
        missing.dedup();
        missing
    }
}

impl Default for BehaviorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorRegistry")
            .field("behaviors", &self.behaviors.len())
            .field("delegates", &self.delegates.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Leaves through every outgoing flow whose condition holds.
pub fn take_outgoing(execution: &DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
    let activity = execution.activity()?;
    if activity.outgoing.is_empty() || execution.is_multi_instance_child() {
        return Ok(BehaviorOutcome::End);
    }
    let mut flows = Vec::new();
    for flow_id in &activity.outgoing {
        if execution.condition_holds(flow_id)? {
            flows.push(flow_id.clone());
        }
    }
    if flows.is_empty() {
        return Err(CoreError::NoOutgoingSequenceFlow {
            activity_id: activity.id.clone(),
        });
    }
    Ok(BehaviorOutcome::Leave(flows))
}

/// Start events and boundary events pass straight through.
pub struct TakeOutgoingBehavior;

impl ActivityBehavior for TakeOutgoingBehavior {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        take_outgoing(execution)
    }
}

pub struct EndEventBehavior;

impl ActivityBehavior for EndEventBehavior {
    fn execute(&self, _: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        Ok(BehaviorOutcome::End)
    }
}

pub struct ErrorEndEventBehavior;

impl ActivityBehavior for ErrorEndEventBehavior {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        let activity = execution.activity()?;
        match &activity.kind {
            ActivityKind::ErrorEndEvent { error_code } => Ok(BehaviorOutcome::Error {
                code: error_code.clone(),
                message: format!("error end event '{}'", activity.id),
            }),
            _ => Err(CoreError::MissingBehavior {
                activity_type: activity.activity_type().to_string(),
            }),
        }
    }
}

/// Runs the named delegate, then leaves.
pub struct ServiceTaskBehavior;

impl ActivityBehavior for ServiceTaskBehavior {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        let activity = execution.activity()?;
        let name = match &activity.kind {
            ActivityKind::ServiceTask { delegate } => delegate,
            _ => {
                return Err(CoreError::MissingBehavior {
                    activity_type: activity.activity_type().to_string(),
                })
            }
        };
        let delegate = execution.registry().delegate(name)?;
        match delegate.execute(execution) {
            Ok(()) => take_outgoing(execution),
            Err(DelegateError::Bpmn { code, message }) => {
                Ok(BehaviorOutcome::Error { code, message })
            }
            Err(DelegateError::Failed(message)) => Err(CoreError::DelegateFailed {
                activity_id: activity.id.clone(),
                message,
            }),
        }
    }
}

/// User and receive tasks wait for a signal.
pub struct WaitStateBehavior;

impl ActivityBehavior for WaitStateBehavior {
    fn execute(&self, _: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        Ok(BehaviorOutcome::Wait)
    }

    fn signal(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        take_outgoing(execution)
    }
}

/// Takes the first flow whose condition holds, else the default flow.
pub struct ExclusiveGatewayBehavior;

impl ActivityBehavior for ExclusiveGatewayBehavior {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        let activity = execution.activity()?;
        let default = match &activity.kind {
            ActivityKind::ExclusiveGateway { default } => default.as_ref(),
            _ => None,
        };
        for flow_id in &activity.outgoing {
            if Some(flow_id) == default {
                continue;
            }
            if execution.condition_holds(flow_id)? {
                return Ok(BehaviorOutcome::Leave(vec![flow_id.clone()]));
            }
        }
        match default {
            Some(flow_id) => Ok(BehaviorOutcome::Leave(vec![flow_id.clone()])),
            None => Err(CoreError::NoOutgoingSequenceFlow {
                activity_id: activity.id.clone(),
            }),
        }
    }
}

/// Forks on every outgoing flow; joins when there is more than one incoming.
pub struct ParallelGatewayBehavior;

impl ActivityBehavior for ParallelGatewayBehavior {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        let activity = execution.activity()?;
        if activity.incoming.len() > 1 {
            return Ok(BehaviorOutcome::Join);
        }
        if activity.outgoing.is_empty() {
            return Ok(BehaviorOutcome::End);
        }
        Ok(BehaviorOutcome::Leave(activity.outgoing.clone()))
    }
}

pub struct SubProcessBehavior;

impl ActivityBehavior for SubProcessBehavior {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        let activity = execution.activity()?;
        let initial = execution.definition().initial(Some(&activity.id))?;
        Ok(BehaviorOutcome::EnterScope {
            initial: initial.id.clone(),
        })
    }
}

/// Intermediate timer: waits until the duration elapsed.
pub struct TimerBehavior;

impl ActivityBehavior for TimerBehavior {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        let activity = execution.activity()?;
        match &activity.kind {
            ActivityKind::Timer { duration_ms } => {
                let millis = i64::try_from(*duration_ms).unwrap_or(i64::MAX);
                let due = execution
                    .now()
                    .checked_add_signed(Duration::milliseconds(millis))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                Ok(BehaviorOutcome::WaitTimer { due })
            }
            _ => Err(CoreError::MissingBehavior {
                activity_type: activity.activity_type().to_string(),
            }),
        }
    }

    fn signal(&self, execution: &mut DelegateExecution<'_>) -> Result<BehaviorOutcome, CoreError> {
        take_outgoing(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> ProcessDefinition {
        ProcessDefinition::from_json(
            "p",
            1,
            &json!({
                "activities": [
                    {"id": "start", "type": "startEvent"},
                    {"id": "route", "type": "exclusiveGateway", "default": "low"},
                    {"id": "charge", "type": "serviceTask", "delegate": "charge"},
                    {"id": "wait", "type": "timer", "durationMs": 1500},
                    {"id": "end", "type": "endEvent"}
                ],
                "flows": [
                    {"id": "f1", "from": "start", "to": "route"},
                    {"id": "low", "from": "route", "to": "end"},
                    {"id": "high", "from": "route", "to": "charge", "condition": "amount > 100"},
                    {"id": "f2", "from": "charge", "to": "wait"},
                    {"id": "f3", "from": "wait", "to": "end"}
                ]
            }),
        )
        .unwrap()
    }

    fn run(
        registry: &BehaviorRegistry,
        definition: &ProcessDefinition,
        tree: &mut ExecutionTree,
        activity: &str,
    ) -> Result<BehaviorOutcome, CoreError> {
        let root = tree.root_id().to_string();
        tree.set_activity(&root, Some(activity)).unwrap();
        let activity_type = definition.activity(activity).unwrap().activity_type();
        let behavior = registry.behavior(activity_type).unwrap();
        let mut execution = DelegateExecution::new(tree, root, definition, registry, Utc::now());
        behavior.execute(&mut execution)
    }

    #[test]
    fn test_exclusive_gateway_routes() {
        let def = definition();
        let registry = BehaviorRegistry::new();
        let mut tree = ExecutionTree::new_process_instance(&def, None);
        let root = tree.root_id().to_string();

        tree.set_variable(&root, "amount", json!(500)).unwrap();
        assert_eq!(
            run(&registry, &def, &mut tree, "route").unwrap(),
            BehaviorOutcome::Leave(vec!["high".into()])
        );

        tree.set_variable(&root, "amount", json!(5)).unwrap();
        assert_eq!(
            run(&registry, &def, &mut tree, "route").unwrap(),
            BehaviorOutcome::Leave(vec!["low".into()])
        );
    }

    #[test]
    fn test_service_task_delegate_outcomes() {
        let def = definition();
        let mut registry = BehaviorRegistry::new();
        registry.register_delegate("charge", |execution: &mut DelegateExecution<'_>| {
            match execution.get_variable("mode").and_then(|v| v.as_str().map(String::from)) {
                Some(mode) if mode == "decline" => Err(DelegateError::bpmn("DECLINED", "no funds")),
                Some(mode) if mode == "crash" => Err(DelegateError::failed("gateway down")),
                _ => {
                    execution.set_variable("charged", json!(true))?;
                    Ok(())
                }
            }
        });
        let mut tree = ExecutionTree::new_process_instance(&def, None);
        let root = tree.root_id().to_string();

        assert_eq!(
            run(&registry, &def, &mut tree, "charge").unwrap(),
            BehaviorOutcome::Leave(vec!["f2".into()])
        );
        assert_eq!(tree.get_variable(&root, "charged").unwrap(), Some(json!(true)));

        tree.set_variable(&root, "mode", json!("decline")).unwrap();
        assert!(matches!(
            run(&registry, &def, &mut tree, "charge").unwrap(),
            BehaviorOutcome::Error { code, .. } if code == "DECLINED"
        ));

        tree.set_variable(&root, "mode", json!("crash")).unwrap();
        assert!(matches!(
            run(&registry, &def, &mut tree, "charge"),
            Err(CoreError::DelegateFailed { .. })
        ));
    }

    #[test]
    fn test_timer_due_date_and_unknown_delegate() {
        let def = definition();
        let registry = BehaviorRegistry::new();
        let mut tree = ExecutionTree::new_process_instance(&def, None);

        match run(&registry, &def, &mut tree, "wait").unwrap() {
            BehaviorOutcome::WaitTimer { due } => assert!(due > Utc::now()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            run(&registry, &def, &mut tree, "charge"),
            Err(CoreError::UnknownDelegate { .. })
        ));
        assert_eq!(
            registry.missing_references(&def),
            vec!["delegate 'charge'".to_string()]
        );
    }

    #[test]
    fn test_empty_registry_reports_missing_behavior() {
        let def = definition();
        let registry = BehaviorRegistry::empty();
        assert!(matches!(
            registry.behavior(ActivityType::StartEvent),
            Err(CoreError::MissingBehavior { .. })
        ));
        assert!(registry.behavior(def.activity("start").unwrap().activity_type()).is_err());
    }
}
