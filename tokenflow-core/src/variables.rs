//! Hierarchical variable scopes on the execution tree.
//!
//! Lookups walk from an execution towards the root. Writes land on the
//! closest execution that already declares the name, falling back to the
//! closest scope execution.

use crate::error::CoreError;
use crate::execution::ExecutionTree;
use serde_json::Value;
use std::collections::BTreeMap;

impl ExecutionTree {
    pub fn get_variable(&self, execution_id: &str, name: &str) -> Result<Option<Value>, CoreError> {
        Ok(self.declaring_execution(execution_id, name)?.and_then(|id| {
            self.get(&id)
                .ok()
                .and_then(|e| e.variables.get(name).cloned())
        }))
    }

    pub fn has_variable(&self, execution_id: &str, name: &str) -> Result<bool, CoreError> {
        Ok(self.declaring_execution(execution_id, name)?.is_some())
    }

    pub fn get_variable_local(
        &self,
        execution_id: &str,
        name: &str,
    ) -> Result<Option<Value>, CoreError> {
        Ok(self.get(execution_id)?.variables.get(name).cloned())
    }

    /// Writes through to the declaring scope, or creates the variable in the
    /// nearest scope execution.
    pub fn set_variable(
        &mut self,
        execution_id: &str,
        name: &str,
        value: Value,
    ) -> Result<(), CoreError> {
        let target = match self.declaring_execution(execution_id, name)? {
            Some(id) => id,
            None => self.scope_execution(execution_id)?.id.clone(),
        };
        tracing::trace!(execution = %target, variable = name, "variable set");
        self.get_mut(&target)?
            .variables
            .insert(name.to_string(), value);
        Ok(())
    }

    /// Writes to the execution itself, shadowing any outer declaration.
    pub fn set_variable_local(
        &mut self,
        execution_id: &str,
        name: &str,
        value: Value,
    ) -> Result<(), CoreError> {
        tracing::trace!(execution = execution_id, variable = name, "local variable set");
        self.get_mut(execution_id)?
            .variables
            .insert(name.to_string(), value);
        Ok(())
    }

    /// Removes the closest declaration of `name`, returning its value.
    pub fn remove_variable(
        &mut self,
        execution_id: &str,
        name: &str,
    ) -> Result<Option<Value>, CoreError> {
        match self.declaring_execution(execution_id, name)? {
            Some(id) => {
                tracing::trace!(execution = %id, variable = name, "variable removed");
                Ok(self.get_mut(&id)?.variables.remove(name))
            }
            None => Ok(None),
        }
    }

    /// Every visible variable; closer scopes shadow outer ones.
    pub fn variables(&self, execution_id: &str) -> Result<BTreeMap<String, Value>, CoreError> {
        let mut chain = Vec::new();
        let mut cursor = Some(self.get(execution_id)?);
        while let Some(execution) = cursor {
            chain.push(execution);
            cursor = self.parent(&execution.id)?;
        }

        let mut merged = BTreeMap::new();
        for execution in chain.into_iter().rev() {
            for (name, value) in &execution.variables {
                merged.insert(name.clone(), value.clone());
            }
        }
        Ok(merged)
    }

    pub fn variables_local(
        &self,
        execution_id: &str,
    ) -> Result<BTreeMap<String, Value>, CoreError> {
        Ok(self.get(execution_id)?.variables.clone())
    }

    fn declaring_execution(
        &self,
        execution_id: &str,
        name: &str,
    ) -> Result<Option<String>, CoreError> {
        let mut cursor = Some(self.get(execution_id)?);
        while let Some(execution) = cursor {
            if execution.variables.contains_key(name) {
                return Ok(Some(execution.id.clone()));
            }
            cursor = self.parent(&execution.id)?;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use crate::definition::ProcessDefinition;
    use crate::execution::ExecutionTree;
    use proptest::prelude::*;
    use serde_json::json;

    fn tree() -> ExecutionTree {
        let def = ProcessDefinition::from_json(
            "p",
            1,
            &json!({"activities": [{"id": "start", "type": "startEvent"}]}),
        )
        .unwrap();
        ExecutionTree::new_process_instance(&def, None)
    }

    #[test]
    fn test_lookup_recurses_to_parent() {
        let mut tree = tree();
        let root = tree.root_id().to_string();
        let child = tree.create_concurrent_child(&root).unwrap();

        tree.set_variable_local(&root, "amount", json!(10)).unwrap();
        assert_eq!(tree.get_variable(&child, "amount").unwrap(), Some(json!(10)));
        assert!(tree.has_variable(&child, "amount").unwrap());
        assert!(!tree.has_variable(&child, "missing").unwrap());
        assert_eq!(tree.get_variable_local(&child, "amount").unwrap(), None);
    }

    #[test]
    fn test_set_writes_through_to_declaring_scope() {
        let mut tree = tree();
        let root = tree.root_id().to_string();
        let branch = tree.create_concurrent_child(&root).unwrap();

        tree.set_variable_local(&root, "count", json!(1)).unwrap();
        tree.set_variable(&branch, "count", json!(2)).unwrap();
        assert_eq!(tree.get_variable_local(&root, "count").unwrap(), Some(json!(2)));
        assert!(tree.variables_local(&branch).unwrap().is_empty());
    }

    #[test]
    fn test_new_variable_lands_in_nearest_scope() {
        let mut tree = tree();
        let root = tree.root_id().to_string();
        let branch = tree.create_concurrent_child(&root).unwrap();
        let scope = tree.create_scope_child(&branch, "sub").unwrap();

        // Concurrent executions are not scopes, so the root receives it.
        tree.set_variable(&branch, "a", json!("x")).unwrap();
        assert_eq!(tree.get_variable_local(&root, "a").unwrap(), Some(json!("x")));

        tree.set_variable(&scope, "b", json!(true)).unwrap();
        assert_eq!(tree.get_variable_local(&scope, "b").unwrap(), Some(json!(true)));
        assert_eq!(tree.get_variable(&root, "b").unwrap(), None);
    }

    #[test]
    fn test_local_shadows_outer() {
        let mut tree = tree();
        let root = tree.root_id().to_string();
        let scope = tree.create_scope_child(&root, "sub").unwrap();

        tree.set_variable_local(&root, "x", json!(1)).unwrap();
        tree.set_variable_local(&scope, "x", json!(2)).unwrap();
        tree.set_variable_local(&root, "y", json!(3)).unwrap();

        assert_eq!(tree.get_variable(&scope, "x").unwrap(), Some(json!(2)));
        assert_eq!(tree.get_variable(&root, "x").unwrap(), Some(json!(1)));

        let merged = tree.variables(&scope).unwrap();
        assert_eq!(merged.get("x"), Some(&json!(2)));
        assert_eq!(merged.get("y"), Some(&json!(3)));

        assert_eq!(tree.remove_variable(&scope, "x").unwrap(), Some(json!(2)));
        assert_eq!(tree.get_variable(&scope, "x").unwrap(), Some(json!(1)));
    }

    proptest! {
        /// A read from any execution returns the value of the closest
        /// declaring ancestor.
        #[test]
        fn prop_closest_declaration_wins(
            depth in 1usize..6,
            declared in prop::collection::vec(any::<bool>(), 6),
            values in prop::collection::vec(any::<i64>(), 6),
        ) {
            let mut tree = tree();
            let mut chain = vec![tree.root_id().to_string()];
            for _ in 0..depth {
                let parent = chain.last().unwrap().clone();
                chain.push(tree.create_scope_child(&parent, "sub").unwrap());
            }
            for (i, id) in chain.iter().enumerate() {
                if declared[i] {
                    tree.set_variable_local(id, "v", json!(values[i])).unwrap();
                }
            }
            let leaf = chain.last().unwrap();
            let expected = (0..chain.len())
                .rev()
                .find(|i| declared[*i])
                .map(|i| json!(values[i]));
            prop_assert_eq!(tree.get_variable(leaf, "v").unwrap(), expected.clone());
            prop_assert_eq!(tree.variables(leaf).unwrap().get("v").cloned(), expected);
        }
    }
}
