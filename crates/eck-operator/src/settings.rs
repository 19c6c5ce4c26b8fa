//! Layered YAML configuration
//!
//! Settings are normalized so that `a.b: 1` and `a: {b: 1}` are the same
//! tree. Merging is deep: maps merge key by key, lists are appended and
//! scalars are replaced by the later layer.

use crate::error::{OperatorError, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Normalized configuration tree
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanonicalConfig {
    root: Map<String, Value>,
}

impl CanonicalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from any JSON value, expanding dotted keys.
    ///
    /// `null` gives an empty config, any other non-object is rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match expand(value) {
            Value::Object(root) => Ok(Self { root }),
            Value::Null => Ok(Self::new()),
            other => Err(OperatorError::InvalidConfig(format!(
                "configuration must be a map, got {other}"
            ))),
        }
    }

    /// Parse YAML bytes
    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::new());
        }
        let value: Value = serde_yaml::from_slice(bytes)
            .map_err(|e| OperatorError::InvalidConfig(format!("cannot parse YAML: {e}")))?;
        Self::from_value(value)
    }

    /// Build from `(dotted.key, value)` pairs
    pub fn from_pairs<I, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<Value>,
    {
        let mut cfg = Self::new();
        for (key, value) in pairs {
            cfg.set(key, value.into());
        }
        cfg
    }

    /// Set a value at a dotted path, creating intermediate maps
    pub fn set(&mut self, path: &str, value: Value) {
        let mut parts = path.split('.').peekable();
        let mut current = &mut self.root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                current.insert(part.to_string(), expand(value));
                return;
            }
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(map) = entry else {
                return;
            };
            current = map;
        }
    }

    /// Value at a dotted path
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        parts.try_fold(self.root.get(first)?, |value, part| value.get(part))
    }

    /// True if a non-empty value exists at `path`
    pub fn has_child(&self, path: &str) -> bool {
        match self.get(path) {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(_) => true,
        }
    }

    /// Deserialize the tree into a typed view
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.root.clone()))?)
    }

    /// Deep-merge `other` into `self`, `other` wins on scalar conflicts
    pub fn merge_with(&mut self, other: &CanonicalConfig) {
        merge_maps(&mut self.root, &other.root);
    }

    /// Render as YAML with keys sorted at every level
    pub fn render(&self) -> Result<Vec<u8>> {
        if self.root.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_yaml::to_string(&self.root)?.into_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

fn expand(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut expanded = Map::new();
            for (key, value) in map {
                let value = expand(value);
                let mut parts: Vec<&str> = key.split('.').collect();
                let last = parts.pop().unwrap_or_default();
                let nested = parts.iter().rev().fold(
                    Map::from_iter([(last.to_string(), value)]),
                    |inner, part| Map::from_iter([(part.to_string(), Value::Object(inner))]),
                );
                merge_maps(&mut expanded, &nested);
            }
            Value::Object(expanded)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(expand).collect()),
        other => other,
    }
}

fn merge_maps(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_maps(existing, incoming);
            }
            (Some(Value::Array(existing)), Value::Array(incoming)) => {
                existing.extend(incoming.iter().cloned());
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
