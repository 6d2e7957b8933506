//! Hierarchical variable scopes.
//!
//! A child scope starts as a full copy of its parent. Reads and writes stay
//! local; only [`VariableScope::propagate`] writes through to the parent.

use serde_json::Value;
use std::collections::BTreeMap;

/// Flat name → value map.
pub type Variables = BTreeMap<String, Value>;

#[derive(Debug, Default)]
pub struct VariableScope<'p> {
    parent: Option<&'p mut Variables>,
    vars: Variables,
}

impl VariableScope<'static> {
    /// A root scope without parent.
    pub fn new(vars: Variables) -> Self {
        Self { parent: None, vars }
    }
}

impl<'p> VariableScope<'p> {
    /// A child scope holding a copy of every entry of `parent`.
    pub fn child_of(parent: &'p mut Variables) -> Self {
        let vars = parent.clone();
        Self {
            parent: Some(parent),
            vars,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.vars.insert(name.into(), value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Write into the parent scope only. Silently ignored without a parent.
    pub fn propagate(&mut self, name: impl Into<String>, value: Value) {
        if let Some(parent) = self.parent.as_deref_mut() {
            parent.insert(name.into(), value);
        }
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub fn variables(&self) -> &Variables {
        &self.vars
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.vars
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl Clone for VariableScope<'static> {
    fn clone(&self) -> Self {
        Self::new(self.vars.clone())
    }
}
