//! The execution tree of a process instance.
//!
//! Executions live in an arena keyed by id and refer to each other by id.
//! The root execution's id doubles as the process instance id.

use crate::definition::ProcessDefinition;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A token in the execution tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub process_instance_id: String,
    pub definition_key: String,
    pub definition_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Child ids in creation order.
    #[serde(default)]
    pub children: Vec<String>,

    /// Activity the token currently occupies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,

    /// Subprocess this scope execution was created for. `None` for the root
    /// and for non-scope executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_activity_id: Option<String>,

    /// Sequence flow being taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_id: Option<String>,

    /// Flows selected when the current activity was left.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_transitions: Vec<String>,

    pub is_concurrent: bool,
    pub is_scope: bool,
    pub is_active: bool,
    pub is_ended: bool,
    #[serde(default)]
    pub suspended: bool,
    /// Waits for the parallel instances of a multi-instance activity, which
    /// are its children at the same activity.
    #[serde(default)]
    pub is_multi_instance_root: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,

    /// Lifecycle event whose listeners are being notified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_source: Option<String>,
    /// Next listener to invoke for `event_name`.
    #[serde(default)]
    pub listener_index: usize,

    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    /// Optimistic-lock version, maintained by the store.
    #[serde(default)]
    pub revision: u64,
}

impl Execution {
    fn child_of(parent: &Execution) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            process_instance_id: parent.process_instance_id.clone(),
            definition_key: parent.definition_key.clone(),
            definition_version: parent.definition_version,
            parent_id: Some(parent.id.clone()),
            children: Vec::new(),
            activity_id: None,
            scope_activity_id: None,
            transition_id: None,
            pending_transitions: Vec::new(),
            is_concurrent: false,
            is_scope: false,
            is_active: true,
            is_ended: false,
            suspended: parent.suspended,
            is_multi_instance_root: false,
            business_key: None,
            event_name: None,
            event_source: None,
            listener_index: 0,
            variables: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Resets listener bookkeeping after an event finished notifying.
    pub fn clear_event(&mut self) {
        self.event_name = None;
        self.event_source = None;
        self.listener_index = 0;
    }
}

/// Arena holding every execution of one process instance.
#[derive(Debug, Clone)]
pub struct ExecutionTree {
    root_id: String,
    executions: BTreeMap<String, Execution>,
    /// Executions that must be written at flush even if unchanged.
    forced: BTreeSet<String>,
}

impl ExecutionTree {
    /// Creates a tree holding a fresh, unstarted root execution.
    pub fn new_process_instance(
        definition: &ProcessDefinition,
        business_key: Option<String>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let root = Execution {
            id: id.clone(),
            process_instance_id: id.clone(),
            definition_key: definition.key.clone(),
            definition_version: definition.version,
            parent_id: None,
            children: Vec::new(),
            activity_id: None,
            scope_activity_id: None,
            transition_id: None,
            pending_transitions: Vec::new(),
            is_concurrent: false,
            is_scope: true,
            is_active: true,
            is_ended: false,
            suspended: false,
            is_multi_instance_root: false,
            business_key,
            event_name: None,
            event_source: None,
            listener_index: 0,
            variables: BTreeMap::new(),
            revision: 0,
        };
        let mut executions = BTreeMap::new();
        executions.insert(id.clone(), root);
        Self {
            root_id: id,
            executions,
            forced: BTreeSet::new(),
        }
    }

    /// Rebuilds a tree from persisted executions and checks its invariants.
    pub fn from_executions(executions: Vec<Execution>) -> Result<Self, CoreError> {
        let roots: Vec<&Execution> = executions.iter().filter(|e| e.is_root()).collect();
        let root_id = match roots.as_slice() {
            [root] => root.id.clone(),
            _ => {
                return Err(inconsistent(format!(
                    "expected exactly one root execution, found {}",
                    roots.len()
                )))
            }
        };
        let tree = Self {
            root_id,
            executions: executions.into_iter().map(|e| (e.id.clone(), e)).collect(),
            forced: BTreeSet::new(),
        };
        tree.check_consistency()?;
        Ok(tree)
    }

    /// Verifies the structural invariants of the tree.
    pub fn check_consistency(&self) -> Result<(), CoreError> {
        let root = self.root()?;
        for execution in self.executions.values() {
            if execution.process_instance_id != root.process_instance_id {
                return Err(inconsistent(format!(
                    "execution {} belongs to process instance {}",
                    execution.id, execution.process_instance_id
                )));
            }
            if let Some(parent_id) = &execution.parent_id {
                let parent = self.get(parent_id)?;
                if !parent.children.contains(&execution.id) {
                    return Err(inconsistent(format!(
                        "parent {} does not list child {}",
                        parent_id, execution.id
                    )));
                }
            } else if execution.id != self.root_id {
                return Err(inconsistent(format!("second root {}", execution.id)));
            }
            for child_id in &execution.children {
                let child = self.get(child_id)?;
                if child.parent_id.as_deref() != Some(execution.id.as_str()) {
                    return Err(inconsistent(format!(
                        "child {} does not point back to {}",
                        child_id, execution.id
                    )));
                }
                if execution.is_ended && child.is_active {
                    return Err(inconsistent(format!(
                        "ended execution {} has active child {}",
                        execution.id, child_id
                    )));
                }
            }
            if execution.is_concurrent && execution.is_scope {
                return Err(inconsistent(format!(
                    "concurrent execution {} is marked as scope",
                    execution.id
                )));
            }
        }
        Ok(())
    }

    pub fn process_instance_id(&self) -> &str {
        &self.root_id
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn root(&self) -> Result<&Execution, CoreError> {
        self.get(&self.root_id)
    }

    pub fn get(&self, id: &str) -> Result<&Execution, CoreError> {
        self.executions
            .get(id)
            .ok_or_else(|| CoreError::ExecutionNotFound {
                execution_id: id.to_string(),
            })
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Execution, CoreError> {
        self.executions
            .get_mut(id)
            .ok_or_else(|| CoreError::ExecutionNotFound {
                execution_id: id.to_string(),
            })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.executions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    pub fn into_executions(self) -> Vec<Execution> {
        self.executions.into_values().collect()
    }

    /// Creates a non-concurrent child and links it into its parent.
    pub fn create_child(&mut self, parent_id: &str) -> Result<String, CoreError> {
        let child = Execution::child_of(self.get(parent_id)?);
        let child_id = child.id.clone();
        self.get_mut(parent_id)?.children.push(child_id.clone());
        self.executions.insert(child_id.clone(), child);
        Ok(child_id)
    }

    /// Creates the scope execution for entering `scope_activity`.
    pub fn create_scope_child(
        &mut self,
        parent_id: &str,
        scope_activity: &str,
    ) -> Result<String, CoreError> {
        let child_id = self.create_child(parent_id)?;
        let child = self.get_mut(&child_id)?;
        child.is_scope = true;
        child.scope_activity_id = Some(scope_activity.to_string());
        child.activity_id = Some(scope_activity.to_string());
        Ok(child_id)
    }

    /// Creates a concurrent child positioned at the parent's activity.
    pub fn create_concurrent_child(&mut self, parent_id: &str) -> Result<String, CoreError> {
        let activity = self.get(parent_id)?.activity_id.clone();
        let child_id = self.create_child(parent_id)?;
        let child = self.get_mut(&child_id)?;
        child.is_concurrent = true;
        child.activity_id = activity;
        Ok(child_id)
    }

    pub fn set_activity(&mut self, id: &str, activity_id: Option<&str>) -> Result<(), CoreError> {
        self.get_mut(id)?.activity_id = activity_id.map(str::to_string);
        Ok(())
    }

    pub fn parent(&self, id: &str) -> Result<Option<&Execution>, CoreError> {
        match &self.get(id)?.parent_id {
            Some(parent_id) => Ok(Some(self.get(parent_id)?)),
            None => Ok(None),
        }
    }

    pub fn children(&self, id: &str) -> Result<Vec<&Execution>, CoreError> {
        self.get(id)?
            .children
            .iter()
            .map(|child_id| self.get(child_id))
            .collect()
    }

    pub fn is_concurrent(&self, id: &str) -> Result<bool, CoreError> {
        Ok(self.get(id)?.is_concurrent)
    }

    /// The multi-instance body `id` is one instance of, if any.
    ///
    /// Instances of a task sit at the body's activity; instances of a
    /// subprocess are scope executions created for it.
    pub fn multi_instance_body(&self, id: &str) -> Result<Option<&Execution>, CoreError> {
        let execution = self.get(id)?;
        Ok(match self.parent(id)? {
            Some(parent)
                if parent.is_multi_instance_root
                    && parent.activity_id.is_some()
                    && (parent.activity_id == execution.activity_id
                        || parent.activity_id == execution.scope_activity_id) =>
            {
                Some(parent)
            }
            _ => None,
        })
    }

    /// Nearest ancestor-or-self that owns a variable scope.
    pub fn scope_execution(&self, id: &str) -> Result<&Execution, CoreError> {
        let mut current = self.get(id)?;
        while !current.is_scope {
            match &current.parent_id {
                Some(parent_id) => current = self.get(parent_id)?,
                None => break,
            }
        }
        Ok(current)
    }

    /// Nearest ancestor-or-self created for `scope_activity`.
    pub fn find_scope_execution_for(
        &self,
        id: &str,
        scope_activity: &str,
    ) -> Result<Option<&Execution>, CoreError> {
        let mut cursor = Some(self.get(id)?);
        while let Some(execution) = cursor {
            if execution.scope_activity_id.as_deref() == Some(scope_activity) {
                return Ok(Some(execution));
            }
            cursor = self.parent(&execution.id)?;
        }
        Ok(None)
    }

    /// Removes an execution and, recursively, all of its children.
    pub fn remove(&mut self, id: &str) -> Result<Vec<Execution>, CoreError> {
        if id == self.root_id {
            return Err(inconsistent("the root execution cannot be removed"));
        }
        self.detach(id)?;
        let mut removed = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(next) = stack.pop() {
            if let Some(execution) = self.executions.remove(&next) {
                stack.extend(execution.children.iter().cloned());
                self.forced.remove(&next);
                removed.push(execution);
            }
        }
        Ok(removed)
    }

    /// Removes a single execution that has no children.
    pub fn remove_leaf(&mut self, id: &str) -> Result<Execution, CoreError> {
        let execution = self.get(id)?;
        if execution.is_root() {
            return Err(inconsistent("the root execution cannot be removed"));
        }
        if !execution.children.is_empty() {
            let active = self.children(id)?.iter().any(|c| c.is_active);
            return Err(if active {
                CoreError::ExecutionHasActiveChildren {
                    execution_id: id.to_string(),
                }
            } else {
                inconsistent(format!("execution {} still has children", id))
            });
        }
        self.detach(id)?;
        self.forced.remove(id);
        self.executions
            .remove(id)
            .ok_or_else(|| CoreError::ExecutionNotFound {
                execution_id: id.to_string(),
            })
    }

    fn detach(&mut self, id: &str) -> Result<(), CoreError> {
        if let Some(parent_id) = self.get(id)?.parent_id.clone() {
            self.get_mut(&parent_id)?.children.retain(|c| c != id);
        }
        Ok(())
    }

    /// Marks an execution for writing at flush even when unchanged, so that
    /// concurrent transactions touching it conflict.
    pub fn force_update(&mut self, id: &str) {
        self.forced.insert(id.to_string());
    }

    pub fn is_forced(&self, id: &str) -> bool {
        self.forced.contains(id)
    }

    /// Ids of active executions and the activity they occupy.
    pub fn active_activity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .executions
            .values()
            .filter(|e| e.is_active && !e.is_ended)
            .filter_map(|e| e.activity_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Ids of `id` and everything below it, parents before children.
    pub fn subtree(&self, id: &str) -> Result<Vec<String>, CoreError> {
        let mut out = Vec::new();
        let mut queue = vec![id.to_string()];
        while let Some(next) = queue.pop() {
            let execution = self.get(&next)?;
            queue.extend(execution.children.iter().rev().cloned());
            out.push(next);
        }
        Ok(out)
    }
}

fn inconsistent(reason: impl Into<String>) -> CoreError {
    CoreError::InconsistentTree {
        reason: reason.into(),
    }
}
