//! Atomic operations.
//!
//! An operation is one indivisible step applied to one execution. Operations
//! carry no state of their own: everything needed to continue after a crash
//! or an async boundary is in the execution (current activity, transition,
//! pending transitions, event name and listener index).

use crate::behavior::{take_outgoing, BehaviorOutcome, DelegateExecution};
use crate::definition::{Activity, ActivityKind, LoopCardinality, MultiInstance, ProcessDefinition};
use crate::error::CoreError;
use crate::execution::Execution;
use crate::interpreter::{Continuation, Interpreter, UnhandledErrorPolicy};
use crate::job::JobKind;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AtomicOperation {
    ProcessStart,
    ActivityNotifyListenerStart,
    ActivityExecute,
    ActivityNotifyListenerEnd,
    TransitionDestroyScope,
    TransitionNotifyListenerTake,
    TransitionCreateScope,
    TransitionNotifyListenerStart,
    ActivityEnd,
    ProcessEnd,
}

const EVENT_START: &str = "start";
const EVENT_END: &str = "end";
const EVENT_TAKE: &str = "take";

const NR_OF_INSTANCES: &str = "nrOfInstances";
const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
const LOOP_COUNTER: &str = "loopCounter";

impl AtomicOperation {
    pub fn name(&self) -> &'static str {
        match self {
            AtomicOperation::ProcessStart => "process-start",
            AtomicOperation::ActivityNotifyListenerStart => "activity-notify-listener-start",
            AtomicOperation::ActivityExecute => "activity-execute",
            AtomicOperation::ActivityNotifyListenerEnd => "activity-notify-listener-end",
            AtomicOperation::TransitionDestroyScope => "transition-destroy-scope",
            AtomicOperation::TransitionNotifyListenerTake => "transition-notify-listener-take",
            AtomicOperation::TransitionCreateScope => "transition-create-scope",
            AtomicOperation::TransitionNotifyListenerStart => "transition-notify-listener-start",
            AtomicOperation::ActivityEnd => "activity-end",
            AtomicOperation::ProcessEnd => "process-end",
        }
    }

    /// Whether this step must run in a job instead of inline.
    ///
    /// Only a fresh entry can be async: once listeners started notifying, the
    /// step is finished in the same transaction.
    pub fn is_async(
        &self,
        execution: &Execution,
        definition: &ProcessDefinition,
    ) -> Result<bool, CoreError> {
        if execution.listener_index != 0 || execution.event_name.is_some() {
            return Ok(false);
        }
        let activity = match (self, &execution.activity_id) {
            (AtomicOperation::ActivityExecute, Some(id))
            | (AtomicOperation::ActivityNotifyListenerEnd, Some(id)) => definition.activity(id)?,
            _ => return Ok(false),
        };
        Ok(match self {
            AtomicOperation::ActivityExecute => activity.async_before,
            AtomicOperation::ActivityNotifyListenerEnd => activity.async_after,
            _ => false,
        })
    }

    pub(crate) fn execute(
        self,
        interpreter: &mut Interpreter<'_>,
        execution_id: &str,
    ) -> Result<Option<Continuation>, CoreError> {
        match self {
            AtomicOperation::ProcessStart => process_start(interpreter, execution_id),
            AtomicOperation::ActivityNotifyListenerStart => {
                activity_notify_start(interpreter, execution_id)
            }
            AtomicOperation::ActivityExecute => activity_execute(interpreter, execution_id),
            AtomicOperation::ActivityNotifyListenerEnd => {
                activity_notify_end(interpreter, execution_id)
            }
            AtomicOperation::TransitionDestroyScope => {
                transition_destroy_scope(interpreter, execution_id)
            }
            AtomicOperation::TransitionNotifyListenerTake => {
                transition_notify_take(interpreter, execution_id)
            }
            AtomicOperation::TransitionCreateScope => {
                transition_create_scope(interpreter, execution_id)
            }
            AtomicOperation::TransitionNotifyListenerStart => {
                transition_notify_start(interpreter, execution_id)
            }
            AtomicOperation::ActivityEnd => activity_end(interpreter, execution_id),
            AtomicOperation::ProcessEnd => process_end(interpreter, execution_id),
        }
    }
}

fn next(operation: AtomicOperation, execution_id: &str) -> Option<Continuation> {
    Some(Continuation::new(operation, execution_id))
}

/// Invokes the listener at the execution's listener index.
///
/// Returns `true` when a listener ran and the operation has to be re-entered,
/// `false` once every listener was notified and the event is cleared.
fn notify_next_listener(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    event: &str,
    source: &str,
    listeners: &[String],
) -> Result<bool, CoreError> {
    let execution = interpreter.tree.get_mut(execution_id)?;
    let index = execution.listener_index;
    let Some(name) = listeners.get(index) else {
        execution.clear_event();
        return Ok(false);
    };
    execution.event_name = Some(event.to_string());
    execution.event_source = Some(source.to_string());

    let registry = interpreter.registry;
    let listener = registry.listener(name)?;
    tracing::debug!(
        execution = execution_id,
        listener = %name,
        event,
        source,
        index,
        "notifying listener"
    );
    let mut delegate = interpreter.delegate_execution(execution_id);
    listener
        .notify(&mut delegate)
        .map_err(|e| CoreError::ListenerFailed {
            listener: name.clone(),
            event: event.to_string(),
            message: e.to_string(),
        })?;

    interpreter.tree.get_mut(execution_id)?.listener_index = index + 1;
    Ok(true)
}

fn current_activity<'d>(
    definition: &'d ProcessDefinition,
    execution: &Execution,
) -> Result<&'d Activity, CoreError> {
    let id = execution
        .activity_id
        .as_deref()
        .ok_or_else(|| CoreError::NoCurrentActivity {
            execution_id: execution.id.clone(),
        })?;
    definition.activity(id)
}

fn process_start(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    if notify_next_listener(
        interpreter,
        execution_id,
        EVENT_START,
        &definition.key,
        &definition.listeners.start,
    )? {
        return Ok(next(AtomicOperation::ProcessStart, execution_id));
    }
    let initial = definition.initial(None)?;
    interpreter
        .tree
        .set_activity(execution_id, Some(&initial.id))?;
    Ok(next(AtomicOperation::ActivityNotifyListenerStart, execution_id))
}

fn activity_notify_start(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    let activity = current_activity(definition, interpreter.tree.get(execution_id)?)?;
    if notify_next_listener(
        interpreter,
        execution_id,
        EVENT_START,
        &activity.id,
        &activity.listeners.start,
    )? {
        return Ok(next(AtomicOperation::ActivityNotifyListenerStart, execution_id));
    }
    Ok(next(AtomicOperation::ActivityExecute, execution_id))
}

fn activity_execute(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    let activity = current_activity(definition, interpreter.tree.get(execution_id)?)?;
    let registry = interpreter.registry;
    let behavior = registry.behavior(activity.activity_type())?;
    tracing::debug!(
        execution = execution_id,
        activity = %activity.id,
        activity_type = %activity.activity_type(),
        "executing activity"
    );
    // Instances share the timers scheduled on their body.
    if instance_body(interpreter, execution_id)?.is_none() {
        schedule_boundary_timers(interpreter, execution_id, activity)?;
    }
    let outcome = {
        let mut delegate = interpreter.delegate_execution(execution_id);
        behavior.execute(&mut delegate)?
    };
    handle_outcome(interpreter, execution_id, outcome)
}

/// Turns a behavior outcome into the next step.
pub(crate) fn handle_outcome(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    outcome: BehaviorOutcome,
) -> Result<Option<Continuation>, CoreError> {
    match outcome {
        BehaviorOutcome::Wait => Ok(None),
        BehaviorOutcome::WaitTimer { due } => {
            let activity_id = interpreter
                .tree
                .get(execution_id)?
                .activity_id
                .clone()
                .ok_or_else(|| CoreError::NoCurrentActivity {
                    execution_id: execution_id.to_string(),
                })?;
            interpreter.schedule_job(execution_id, JobKind::Timer { activity_id }, Some(due))?;
            Ok(None)
        }
        BehaviorOutcome::Leave(flows) => {
            interpreter.tree.get_mut(execution_id)?.pending_transitions = flows;
            Ok(next(AtomicOperation::ActivityNotifyListenerEnd, execution_id))
        }
        BehaviorOutcome::End => {
            interpreter
                .tree
                .get_mut(execution_id)?
                .pending_transitions
                .clear();
            Ok(next(AtomicOperation::ActivityNotifyListenerEnd, execution_id))
        }
        BehaviorOutcome::Join => join(interpreter, execution_id),
        BehaviorOutcome::EnterScope { initial } => {
            interpreter.tree.set_activity(execution_id, Some(&initial))?;
            Ok(next(AtomicOperation::ActivityNotifyListenerStart, execution_id))
        }
        BehaviorOutcome::Error { code, message } => {
            handle_bpmn_error(interpreter, execution_id, &code, &message)
        }
    }
}

fn activity_notify_end(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    let activity = current_activity(definition, interpreter.tree.get(execution_id)?)?;
    if notify_next_listener(
        interpreter,
        execution_id,
        EVENT_END,
        &activity.id,
        &activity.listeners.end,
    )? {
        return Ok(next(AtomicOperation::ActivityNotifyListenerEnd, execution_id));
    }
    Ok(next(AtomicOperation::TransitionDestroyScope, execution_id))
}

fn transition_destroy_scope(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    if let Some(body) = instance_body(interpreter, execution_id)? {
        return complete_instance(interpreter, execution_id, &body);
    }

    let execution = interpreter.tree.get(execution_id)?;
    let activity_id = execution.activity_id.clone();
    let transitions = execution.pending_transitions.clone();
    if let Some(id) = &activity_id {
        cancel_boundary_timers(interpreter, execution_id, id)?;
    }

    let execution = interpreter.tree.get(execution_id)?;
    // Leaving a subprocess: its scope execution goes away and the parent
    // carries on from the subprocess activity.
    let leaving_scope = execution.is_scope
        && !execution.is_root()
        && execution.scope_activity_id.is_some()
        && execution.scope_activity_id == activity_id;
    let current = if leaving_scope {
        let parent_id = execution
            .parent_id
            .clone()
            .ok_or_else(|| CoreError::InconsistentTree {
                reason: format!("scope execution {} has no parent", execution_id),
            })?;
        interpreter.tree.remove(execution_id)?;
        let parent = interpreter.tree.get_mut(&parent_id)?;
        parent.activity_id = activity_id.clone();
        parent.is_active = true;
        tracing::debug!(execution = execution_id, parent = %parent_id, "scope destroyed");
        parent_id
    } else {
        execution_id.to_string()
    };

    interpreter
        .tree
        .get_mut(&current)?
        .pending_transitions
        .clear();

    match transitions.as_slice() {
        [] => Ok(next(AtomicOperation::ActivityEnd, &current)),
        [flow] => {
            interpreter.tree.get_mut(&current)?.transition_id = Some(flow.clone());
            Ok(next(AtomicOperation::TransitionNotifyListenerTake, &current))
        }
        flows => fork(interpreter, &current, activity_id.as_deref(), flows),
    }
}

/// Splits the token into one concurrent execution per outgoing flow.
fn fork(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    activity_id: Option<&str>,
    flows: &[String],
) -> Result<Option<Continuation>, CoreError> {
    let execution = interpreter.tree.get(execution_id)?;
    let mut branches = Vec::with_capacity(flows.len());

    if execution.is_concurrent {
        // Reuse the arriving branch for the first flow, add siblings for the rest.
        let parent_id = execution
            .parent_id
            .clone()
            .ok_or_else(|| CoreError::InconsistentTree {
                reason: format!("concurrent execution {} has no parent", execution_id),
            })?;
        branches.push(execution_id.to_string());
        for _ in 1..flows.len() {
            branches.push(interpreter.tree.create_concurrent_child(&parent_id)?);
        }
    } else {
        for _ in flows {
            branches.push(interpreter.tree.create_concurrent_child(execution_id)?);
        }
        let root = interpreter.tree.get_mut(execution_id)?;
        root.is_active = false;
        root.activity_id = None;
    }

    for (branch, flow) in branches.iter().zip(flows) {
        let execution = interpreter.tree.get_mut(branch)?;
        execution.activity_id = activity_id.map(str::to_string);
        execution.transition_id = Some(flow.clone());
        execution.is_active = true;
    }
    tracing::debug!(execution = execution_id, branches = branches.len(), "forked");

    let mut branches = branches.into_iter();
    let first = branches.next();
    for branch in branches {
        interpreter.push_branch(Continuation::new(
            AtomicOperation::TransitionNotifyListenerTake,
            &branch,
        ));
    }
    Ok(first.map(|id| Continuation::new(AtomicOperation::TransitionNotifyListenerTake, &id)))
}

fn transition_id(execution: &Execution) -> Result<&str, CoreError> {
    execution
        .transition_id
        .as_deref()
        .ok_or_else(|| CoreError::InconsistentTree {
            reason: format!("execution {} is not taking a transition", execution.id),
        })
}

fn transition_notify_take(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    let flow = definition.flow(transition_id(interpreter.tree.get(execution_id)?)?)?;
    if notify_next_listener(interpreter, execution_id, EVENT_TAKE, &flow.id, &flow.listeners)? {
        return Ok(next(AtomicOperation::TransitionNotifyListenerTake, execution_id));
    }
    let source = definition.activity(&flow.source)?;
    let target = definition.find_next_scope(source.parent.as_deref(), &flow.destination)?;
    interpreter.tree.set_activity(execution_id, Some(&target.id))?;
    Ok(next(AtomicOperation::TransitionCreateScope, execution_id))
}

fn transition_create_scope(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    let execution = interpreter.tree.get(execution_id)?;
    let activity = current_activity(definition, execution)?;
    if let Some(mi) = &activity.multi_instance {
        if !execution.is_multi_instance_root
            && interpreter.tree.multi_instance_body(execution_id)?.is_none()
        {
            return expand_multi_instance(interpreter, execution_id, activity, mi);
        }
    }
    if !activity.is_scope() {
        return Ok(next(AtomicOperation::TransitionNotifyListenerStart, execution_id));
    }

    let transition = execution.transition_id.clone();
    let child_id = interpreter
        .tree
        .create_scope_child(execution_id, &activity.id)?;
    interpreter.tree.get_mut(&child_id)?.transition_id = transition;
    let parent = interpreter.tree.get_mut(execution_id)?;
    parent.is_active = false;
    parent.transition_id = None;
    tracing::debug!(
        execution = execution_id,
        scope = %child_id,
        activity = %activity.id,
        "scope created"
    );
    Ok(next(AtomicOperation::TransitionNotifyListenerStart, &child_id))
}

fn transition_notify_start(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    let activity = current_activity(definition, interpreter.tree.get(execution_id)?)?;
    if notify_next_listener(
        interpreter,
        execution_id,
        EVENT_START,
        &activity.id,
        &activity.listeners.start,
    )? {
        return Ok(next(AtomicOperation::TransitionNotifyListenerStart, execution_id));
    }

    let flow = definition.flow(transition_id(interpreter.tree.get(execution_id)?)?)?;
    if flow.destination == activity.id {
        interpreter.tree.get_mut(execution_id)?.transition_id = None;
        return Ok(next(AtomicOperation::ActivityExecute, execution_id));
    }
    // Destination is nested further down; enter the next scope on the way.
    let target = definition.find_next_scope(Some(&activity.id), &flow.destination)?;
    interpreter.tree.set_activity(execution_id, Some(&target.id))?;
    Ok(next(AtomicOperation::TransitionCreateScope, execution_id))
}

fn activity_end(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    if let Some(body) = instance_body(interpreter, execution_id)? {
        return complete_instance(interpreter, execution_id, &body);
    }

    let execution = interpreter.tree.get(execution_id)?;

    if execution.is_concurrent {
        let activity_id = execution.activity_id.clone();
        let parent_id = execution
            .parent_id
            .clone()
            .ok_or_else(|| CoreError::InconsistentTree {
                reason: format!("concurrent execution {} has no parent", execution_id),
            })?;
        interpreter.tree.remove_leaf(execution_id)?;
        interpreter.tree.force_update(&parent_id);

        let parent = interpreter.tree.get_mut(&parent_id)?;
        // An active parent is still busy at its own activity.
        if !parent.children.is_empty() || parent.is_active {
            return Ok(None);
        }
        // Last branch gone: the parent takes over and ends in its place.
        parent.is_active = true;
        parent.activity_id = activity_id;
        return Ok(next(AtomicOperation::ActivityEnd, &parent_id));
    }

    // Branches spawned by a non-interrupting boundary event are still running;
    // the last of them ends in this execution's place.
    let branches_running = interpreter
        .tree
        .children(execution_id)?
        .iter()
        .any(|c| c.is_concurrent && c.is_active);
    if branches_running {
        let execution = interpreter.tree.get_mut(execution_id)?;
        execution.is_active = false;
        execution.activity_id = None;
        tracing::debug!(execution = execution_id, "waiting for boundary branches");
        return Ok(None);
    }

    let execution = interpreter.tree.get(execution_id)?;
    if execution.is_root() {
        return Ok(next(AtomicOperation::ProcessEnd, execution_id));
    }

    let Some(scope_activity) = execution.scope_activity_id.clone() else {
        return Err(CoreError::InconsistentTree {
            reason: format!(
                "execution {} is neither concurrent, root nor a scope",
                execution_id
            ),
        });
    };
    // Everything inside the subprocess finished: complete the subprocess.
    interpreter
        .tree
        .set_activity(execution_id, Some(&scope_activity))?;
    let outcome = {
        let delegate = interpreter.delegate_execution(execution_id);
        take_outgoing(&delegate)?
    };
    tracing::debug!(execution = execution_id, activity = %scope_activity, "scope completed");
    handle_outcome(interpreter, execution_id, outcome)
}

fn process_end(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    if notify_next_listener(
        interpreter,
        execution_id,
        EVENT_END,
        &definition.key,
        &definition.listeners.end,
    )? {
        return Ok(next(AtomicOperation::ProcessEnd, execution_id));
    }

    // Branches parked at a join that can no longer fire end with the process.
    let children = interpreter.tree.get(execution_id)?.children.clone();
    for child in children {
        interpreter.tree.remove(&child)?;
    }
    let root = interpreter.tree.get_mut(execution_id)?;
    root.is_active = false;
    root.is_ended = true;
    root.activity_id = None;
    root.transition_id = None;
    tracing::debug!(process_instance = execution_id, "process instance ended");
    Ok(None)
}

/// Parks the arriving branch and fires the gateway once every incoming flow
/// delivered a token.
fn join(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    let execution = interpreter.tree.get(execution_id)?;
    let gateway = current_activity(definition, execution)?;

    if !execution.is_concurrent {
        interpreter.tree.get_mut(execution_id)?.pending_transitions = gateway.outgoing.clone();
        return Ok(next(AtomicOperation::ActivityNotifyListenerEnd, execution_id));
    }

    let parent_id = execution
        .parent_id
        .clone()
        .ok_or_else(|| CoreError::InconsistentTree {
            reason: format!("concurrent execution {} has no parent", execution_id),
        })?;
    interpreter.tree.get_mut(execution_id)?.is_active = false;
    // Two branches arriving in separate transactions must conflict on the
    // shared parent so that one of them sees the other.
    interpreter.tree.force_update(&parent_id);

    let (joined, others): (Vec<&Execution>, Vec<&Execution>) = interpreter
        .tree
        .children(&parent_id)?
        .into_iter()
        .partition(|c| !c.is_active && c.activity_id.as_deref() == Some(gateway.id.as_str()));
    let joined: Vec<String> = joined.into_iter().map(|c| c.id.clone()).collect();
    let others_remaining = !others.is_empty() || interpreter.tree.get(&parent_id)?.is_active;

    if joined.len() < gateway.incoming.len() {
        tracing::debug!(
            execution = execution_id,
            gateway = %gateway.id,
            arrived = joined.len(),
            expected = gateway.incoming.len(),
            "waiting at join"
        );
        return Ok(None);
    }

    let continuing = if others_remaining {
        for id in joined.iter().filter(|id| id.as_str() != execution_id) {
            interpreter.tree.remove_leaf(id)?;
        }
        execution_id.to_string()
    } else {
        for id in &joined {
            interpreter.tree.remove_leaf(id)?;
        }
        parent_id
    };
    let execution = interpreter.tree.get_mut(&continuing)?;
    execution.is_active = true;
    execution.activity_id = Some(gateway.id.clone());
    execution.pending_transitions = gateway.outgoing.clone();
    tracing::debug!(execution = %continuing, gateway = %gateway.id, "join fired");
    Ok(next(AtomicOperation::ActivityNotifyListenerEnd, &continuing))
}

/// Routes a BPMN error to the nearest matching error boundary event.
fn handle_bpmn_error(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    code: &str,
    message: &str,
) -> Result<Option<Continuation>, CoreError> {
    let definition = interpreter.definition;
    let thrower = current_activity(definition, interpreter.tree.get(execution_id)?)?;

    let mut host = Some(thrower);
    let mut caught = None;
    while let Some(activity) = host {
        let boundary = activity.boundary_events.iter().find_map(|id| {
            let boundary = definition.activity(id).ok()?;
            match &boundary.kind {
                ActivityKind::BoundaryError { error_code, .. }
                    if error_code.as_deref().map_or(true, |c| c == code) =>
                {
                    Some(boundary)
                }
                _ => None,
            }
        });
        if let Some(boundary) = boundary {
            caught = Some((activity, boundary));
            break;
        }
        host = match &activity.parent {
            Some(parent) => Some(definition.activity(parent)?),
            None => None,
        };
    }

    let Some((host, boundary)) = caught else {
        return match interpreter.settings.unhandled_error {
            UnhandledErrorPolicy::Propagate => Err(CoreError::UnhandledBpmnError {
                activity_id: thrower.id.clone(),
                code: code.to_string(),
                message: message.to_string(),
            }),
            UnhandledErrorPolicy::Log => {
                tracing::warn!(
                    execution = execution_id,
                    activity = %thrower.id,
                    code,
                    message,
                    "unhandled BPMN error, ending execution"
                );
                cancel_boundary_timers(interpreter, execution_id, &thrower.id)?;
                interpreter
                    .tree
                    .get_mut(execution_id)?
                    .pending_transitions
                    .clear();
                Ok(next(AtomicOperation::ActivityEnd, execution_id))
            }
        };
    };

    tracing::debug!(
        execution = execution_id,
        code,
        host = %host.id,
        boundary = %boundary.id,
        "BPMN error caught"
    );

    let continuing = interrupt_host(interpreter, execution_id, host)?;
    enter_boundary(interpreter, &continuing, &boundary.id)
}

/// Cancels the host activity `execution_id` runs in, returning the execution
/// that carries on from the host's boundary event.
///
/// A scope host loses its scope execution, a multi-instance host loses every
/// instance. Branches spawned by non-interrupting events are kept.
pub(crate) fn interrupt_host(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    host: &Activity,
) -> Result<String, CoreError> {
    let execution = interpreter.tree.get(execution_id)?;
    let candidate = if execution.is_multi_instance_root
        && execution.activity_id.as_deref() == Some(host.id.as_str())
    {
        execution_id.to_string()
    } else if host.is_scope() {
        interpreter
            .tree
            .find_scope_execution_for(execution_id, &host.id)?
            .map(|scope| scope.id.clone())
            .ok_or_else(|| CoreError::InconsistentTree {
                reason: format!("no scope execution for activity {}", host.id),
            })?
    } else {
        execution_id.to_string()
    };

    let body = match interpreter.tree.multi_instance_body(&candidate)? {
        Some(body) => Some(body.id.clone()),
        None if interpreter.tree.get(&candidate)?.is_multi_instance_root => Some(candidate.clone()),
        None => None,
    };
    if let Some(body) = body {
        cancel_boundary_timers(interpreter, &body, &host.id)?;
        for instance in instance_children(interpreter, &body)? {
            interpreter.tree.remove(&instance)?;
        }
        clear_multi_instance(interpreter, &body)?;
        tracing::debug!(execution = %body, host = %host.id, "multi-instance activity interrupted");
        return Ok(body);
    }

    cancel_boundary_timers(interpreter, &candidate, &host.id)?;
    if !host.is_scope() {
        return Ok(candidate);
    }
    // Cancel the whole scope the boundary is attached to.
    let parent_id = interpreter
        .tree
        .get(&candidate)?
        .parent_id
        .clone()
        .ok_or_else(|| CoreError::InconsistentTree {
            reason: format!("scope execution {} has no parent", candidate),
        })?;
    interpreter.tree.remove(&candidate)?;
    Ok(parent_id)
}

/// Moves `execution_id` onto a boundary event and starts it.
pub(crate) fn enter_boundary(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    boundary_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    let execution = interpreter.tree.get_mut(execution_id)?;
    execution.is_active = true;
    execution.activity_id = Some(boundary_id.to_string());
    execution.pending_transitions.clear();
    execution.transition_id = None;
    execution.clear_event();
    Ok(next(AtomicOperation::ActivityNotifyListenerStart, execution_id))
}

fn has_timer_boundary(definition: &ProcessDefinition, activity: &Activity) -> bool {
    activity.boundary_events.iter().any(|id| {
        definition
            .activity(id)
            .map(|b| matches!(b.kind, ActivityKind::BoundaryTimer { .. }))
            .unwrap_or(false)
    })
}

fn schedule_boundary_timers(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    activity: &Activity,
) -> Result<(), CoreError> {
    let definition = interpreter.definition;
    for boundary_id in &activity.boundary_events {
        let boundary = definition.activity(boundary_id)?;
        if let ActivityKind::BoundaryTimer { duration_ms, .. } = &boundary.kind {
            let due = due_after(interpreter.now(), *duration_ms);
            tracing::debug!(
                execution = execution_id,
                host = %activity.id,
                boundary = %boundary_id,
                due = %due,
                "boundary timer scheduled"
            );
            interpreter.schedule_job(
                execution_id,
                JobKind::BoundaryTimer {
                    activity_id: activity.id.clone(),
                    boundary_id: boundary_id.clone(),
                },
                Some(due),
            )?;
        }
    }
    Ok(())
}

fn cancel_boundary_timers(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    activity_id: &str,
) -> Result<(), CoreError> {
    let definition = interpreter.definition;
    if has_timer_boundary(definition, definition.activity(activity_id)?) {
        interpreter.cancel_timers(execution_id, activity_id);
    }
    Ok(())
}

fn due_after(now: DateTime<Utc>, duration_ms: u64) -> DateTime<Utc> {
    let millis = i64::try_from(duration_ms).unwrap_or(i64::MAX);
    now.checked_add_signed(Duration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// =========================================================================
// Multi-instance
// =========================================================================

/// The body an execution completes when it leaves its activity, if the
/// execution is a multi-instance instance sitting at that activity.
fn instance_body(
    interpreter: &Interpreter<'_>,
    execution_id: &str,
) -> Result<Option<String>, CoreError> {
    let execution = interpreter.tree.get(execution_id)?;
    Ok(match interpreter.tree.multi_instance_body(execution_id)? {
        Some(body) if body.activity_id == execution.activity_id => Some(body.id.clone()),
        _ => None,
    })
}

fn instance_children(
    interpreter: &Interpreter<'_>,
    body_id: &str,
) -> Result<Vec<String>, CoreError> {
    let mut instances = Vec::new();
    for child in interpreter.tree.children(body_id)? {
        if interpreter.tree.multi_instance_body(&child.id)?.is_some() {
            instances.push(child.id.clone());
        }
    }
    Ok(instances)
}

fn instance_elements(
    interpreter: &Interpreter<'_>,
    execution_id: &str,
    activity: &Activity,
    mi: &MultiInstance,
) -> Result<Vec<Option<Value>>, CoreError> {
    let bad = |reason: String| CoreError::InvalidMultiInstance {
        activity_id: activity.id.clone(),
        reason,
    };
    if let Some(cardinality) = &mi.loop_cardinality {
        let count = match cardinality {
            LoopCardinality::Fixed(n) => u64::from(*n),
            LoopCardinality::Variable(name) => interpreter
                .tree
                .get_variable(execution_id, name)?
                .and_then(|v| v.as_u64())
                .ok_or_else(|| bad(format!("'{}' is not a non-negative integer", name)))?,
        };
        let count = usize::try_from(count).map_err(|_| bad(format!("{} instances", count)))?;
        return Ok(vec![None; count]);
    }
    let name = mi
        .collection
        .as_deref()
        .ok_or_else(|| bad("neither loopCardinality nor collection".into()))?;
    match interpreter.tree.get_variable(execution_id, name)? {
        Some(Value::Array(items)) => Ok(items.into_iter().map(Some).collect()),
        Some(_) => Err(bad(format!("collection '{}' is not an array", name))),
        None => Err(bad(format!("collection '{}' is not set", name))),
    }
}

/// Turns the arriving token into the body of a parallel multi-instance
/// activity and starts one instance per element.
fn expand_multi_instance(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    activity: &Activity,
    mi: &MultiInstance,
) -> Result<Option<Continuation>, CoreError> {
    let elements = instance_elements(interpreter, execution_id, activity, mi)?;
    let transition = interpreter.tree.get(execution_id)?.transition_id.clone();

    if elements.is_empty() {
        tracing::debug!(execution = execution_id, activity = %activity.id, "no instances to run");
        let outcome = {
            let delegate = interpreter.delegate_execution(execution_id);
            take_outgoing(&delegate)?
        };
        let execution = interpreter.tree.get_mut(execution_id)?;
        execution.transition_id = None;
        execution.pending_transitions = match outcome {
            BehaviorOutcome::Leave(flows) => flows,
            _ => Vec::new(),
        };
        return Ok(next(AtomicOperation::TransitionDestroyScope, execution_id));
    }

    let total = elements.len();
    {
        let body = interpreter.tree.get_mut(execution_id)?;
        body.is_multi_instance_root = true;
        body.is_active = false;
        body.transition_id = None;
    }
    let tree = &mut *interpreter.tree;
    tree.set_variable_local(execution_id, NR_OF_INSTANCES, json!(total))?;
    tree.set_variable_local(execution_id, NR_OF_ACTIVE_INSTANCES, json!(total))?;
    tree.set_variable_local(execution_id, NR_OF_COMPLETED_INSTANCES, json!(0))?;
    schedule_boundary_timers(interpreter, execution_id, activity)?;

    let mut instances = Vec::with_capacity(total);
    for (index, element) in elements.into_iter().enumerate() {
        let instance = if activity.is_scope() {
            interpreter.tree.create_scope_child(execution_id, &activity.id)?
        } else {
            interpreter.tree.create_concurrent_child(execution_id)?
        };
        interpreter.tree.get_mut(&instance)?.transition_id = transition.clone();
        interpreter
            .tree
            .set_variable_local(&instance, LOOP_COUNTER, json!(index))?;
        if let (Some(name), Some(element)) = (&mi.element_variable, element) {
            interpreter.tree.set_variable_local(&instance, name, element)?;
        }
        instances.push(instance);
    }
    tracing::debug!(
        execution = execution_id,
        activity = %activity.id,
        instances = total,
        "multi-instance activity started"
    );

    let mut instances = instances.into_iter();
    let first = instances.next();
    for instance in instances {
        interpreter.push_branch(Continuation::new(
            AtomicOperation::TransitionNotifyListenerStart,
            &instance,
        ));
    }
    Ok(first.map(|id| Continuation::new(AtomicOperation::TransitionNotifyListenerStart, &id)))
}

fn counter(interpreter: &Interpreter<'_>, body_id: &str, name: &str) -> Result<u64, CoreError> {
    Ok(interpreter
        .tree
        .get_variable_local(body_id, name)?
        .and_then(|v| v.as_u64())
        .unwrap_or(0))
}

/// Removes a finished instance and, once every instance is done or the
/// completion condition holds, leaves the activity through the body.
fn complete_instance(
    interpreter: &mut Interpreter<'_>,
    execution_id: &str,
    body_id: &str,
) -> Result<Option<Continuation>, CoreError> {
    interpreter.tree.remove(execution_id)?;
    // Instances finishing in separate transactions conflict on the body.
    interpreter.tree.force_update(body_id);

    let completed = counter(interpreter, body_id, NR_OF_COMPLETED_INSTANCES)? + 1;
    let active = counter(interpreter, body_id, NR_OF_ACTIVE_INSTANCES)?.saturating_sub(1);
    interpreter
        .tree
        .set_variable_local(body_id, NR_OF_COMPLETED_INSTANCES, json!(completed))?;
    interpreter
        .tree
        .set_variable_local(body_id, NR_OF_ACTIVE_INSTANCES, json!(active))?;

    let definition = interpreter.definition;
    let activity = current_activity(definition, interpreter.tree.get(body_id)?)?;
    let remaining = instance_children(interpreter, body_id)?;
    let condition_met = match &activity.completion_condition {
        Some(condition) => {
            let tree = &*interpreter.tree;
            condition.evaluate(&|name| tree.get_variable(body_id, name).ok().flatten())
        }
        None => false,
    };
    if !remaining.is_empty() && !condition_met {
        tracing::debug!(
            execution = body_id,
            activity = %activity.id,
            completed,
            active,
            "instance completed"
        );
        return Ok(None);
    }

    for instance in remaining {
        interpreter.tree.remove(&instance)?;
    }
    clear_multi_instance(interpreter, body_id)?;
    interpreter.tree.get_mut(body_id)?.is_active = true;
    let outcome = {
        let delegate = interpreter.delegate_execution(body_id);
        take_outgoing(&delegate)?
    };
    interpreter.tree.get_mut(body_id)?.pending_transitions = match outcome {
        BehaviorOutcome::Leave(flows) => flows,
        _ => Vec::new(),
    };
    tracing::debug!(
        execution = body_id,
        activity = %activity.id,
        completed,
        "multi-instance activity completed"
    );
    Ok(next(AtomicOperation::TransitionDestroyScope, body_id))
}

fn clear_multi_instance(interpreter: &mut Interpreter<'_>, body_id: &str) -> Result<(), CoreError> {
    let body = interpreter.tree.get_mut(body_id)?;
    body.is_multi_instance_root = false;
    for name in [NR_OF_INSTANCES, NR_OF_ACTIVE_INSTANCES, NR_OF_COMPLETED_INSTANCES] {
        body.variables.remove(name);
    }
    Ok(())
}
