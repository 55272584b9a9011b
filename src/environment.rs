use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Run-scoped user variables, addressed in templates with the `$` sigil.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Environment {
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

/// An executor's view of the environment for one invocation.
///
/// Reads see the snapshot plus this invocation's own writes; writes are kept so
/// the orchestrator can apply them to the run's single environment afterwards.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentHandle {
    local: Environment,
    writes: Vec<(String, Value)>,
}

impl EnvironmentHandle {
    pub fn new(snapshot: Environment) -> Self {
        Self {
            local: snapshot,
            writes: Vec::new(),
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.local
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.local.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.local.set(name.clone(), value.clone());
        self.writes.push((name, value));
    }

    pub fn writes(&self) -> &[(String, Value)] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<(String, Value)> {
        self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handle_records_writes_and_updates_local_copy() {
        let env = Environment::new().with_variable("A", json!(1));
        let mut handle = EnvironmentHandle::new(env.clone());
        handle.set("B", json!("two"));

        assert_eq!(handle.get("B"), Some(&json!("two")));
        assert_eq!(handle.get("A"), Some(&json!(1)));
        assert_eq!(handle.writes(), &[("B".to_string(), json!("two"))]);
        // the snapshot itself is untouched
        assert!(!env.contains("B"));
    }

    #[test]
    fn test_environment_deserializes_without_variables() {
        let env: Environment = serde_json::from_value(json!({})).unwrap();
        assert!(env.is_empty());
    }
}
