//! Animator parameter replication.
//!
//! Avatars replicate a small set of named animator parameters along with their
//! pose. Triggers are one-shot state transitions and are not replicated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A replicated animator parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AnimValue {
    Float(f32),
    Bool(bool),
    Int(i32),
}

/// Named animator parameters, ordered by name for stable encoding.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnimParams {
    values: BTreeMap<String, AnimValue>,
}

impl AnimParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: AnimValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<AnimValue> {
        self.values.get(name).copied()
    }

    pub fn float(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            AnimValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            AnimValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            AnimValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Overwrites every parameter present in `other`, keeping the rest.
    pub fn merge_from(&mut self, other: &AnimParams) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), *value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, AnimValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
