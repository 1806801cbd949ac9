//! Per-task variable store and `${name}` interpolation.

mod expr;
mod interp;

pub use expr::{eval_expression, looks_like_expression};
pub use interp::{
    eval_assign_rhs, find_references, interpolate, resolve_parameter, Reference, Resolved,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::VmError;

/// Name of the distinguished variable that completes a goal.
pub const FINAL_ANSWER: &str = "final_answer";

/// Whether a string is a legal variable name (letters, digits, underscore).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Mapping from variable name to value.
///
/// Backed by a `BTreeMap` so snapshots serialize in a stable key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableStore {
    vars: BTreeMap<String, Value>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Read a variable. Absent keys are errors; the interpolator uses
    /// [`VariableStore::get_opt`] instead and downgrades to a warning.
    pub fn get(&self, name: &str) -> Result<&Value, VmError> {
        self.vars.get(name).ok_or_else(|| VmError::unresolved(name))
    }

    pub fn get_opt(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Create or overwrite a variable.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Result<(), VmError> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(VmError::validation(format!(
                "invalid variable name '{}'",
                name
            )));
        }
        self.vars.insert(name, value);
        Ok(())
    }

    /// Apply a batch of writes atomically. Either all writes land or none.
    pub fn apply(&mut self, writes: BTreeMap<String, Value>) -> Result<(), VmError> {
        for name in writes.keys() {
            if !is_valid_name(name) {
                return Err(VmError::validation(format!(
                    "invalid variable name '{}'",
                    name
                )));
            }
        }
        self.vars.extend(writes);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.vars
    }
}

impl FromIterator<(String, Value)> for VariableStore {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_absent_variable_is_an_error() {
        let store = VariableStore::new();
        let err = store.get("missing").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::UnresolvedVariable);
    }

    #[test]
    fn test_set_rejects_invalid_names() {
        let mut store = VariableStore::new();
        assert!(store.set("ok_name_1", json!(1)).is_ok());
        assert!(store.set("bad-name", json!(1)).is_err());
        assert!(store.set("", json!(1)).is_err());
        assert!(store.set("with space", json!(1)).is_err());
    }

    #[test]
    fn test_insertion_overwrites() {
        let mut store = VariableStore::new();
        store.set("x", json!(1)).unwrap();
        store.set("x", json!("two")).unwrap();
        assert_eq!(store.get("x").unwrap(), &json!("two"));
    }

    #[test]
    fn test_snapshot_serializes_with_sorted_keys() {
        let mut store = VariableStore::new();
        store.set("zeta", json!(1)).unwrap();
        store.set("alpha", json!(2)).unwrap();
        let json = serde_json::to_string(&store).unwrap();
        assert!(json.find("alpha").unwrap() < json.find("zeta").unwrap());
    }
}
