//! Named configuration parameters with an immutability flag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// A single configuration entry.
///
/// Once a locked parameter is visible to a scope, neither that scope nor any
/// descendant may redefine a parameter with the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub locked: bool,
}

impl Parameter {
    /// Creates an unlocked parameter.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            locked: false,
        }
    }

    /// Creates a locked parameter.
    pub fn locked(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            locked: true,
            ..Self::new(name, value)
        }
    }
}

/// Parameters owned by one configuration node, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    entries: BTreeMap<String, Parameter>,
}

impl ParameterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.get(name)
    }

    /// Returns `true` if this store holds `name` with `locked = true`.
    pub fn is_locked(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|p| p.locked)
    }

    /// Inserts or replaces an entry. Lock checks are the caller's job since
    /// they depend on the ancestor chain.
    pub(crate) fn insert(&mut self, param: Parameter) -> Option<Parameter> {
        self.entries.insert(param.name.clone(), param)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
