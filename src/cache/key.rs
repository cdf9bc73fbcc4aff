//! Deterministic cache keys for function-level caching
//!
//! A key is `{namespace}:{function}:{digest}` where the digest is the hex
//! SHA-256 of the canonical JSON of `[namespace, function, args, kwargs]`.
//! The readable prefix only serves `clear(Some(namespace))`; identity comes
//! from the digest, so a `:` inside the namespace or function name cannot
//! make two calls collide. Keyword arguments and object fields are sorted
//! before hashing, so their order never changes the key.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::ResilienceError;

/// Builds a cache key from a function identity and its arguments
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    namespace: Option<String>,
    function: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    error: Option<String>,
}

impl KeyBuilder {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            namespace: None,
            function: function.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            error: None,
        }
    }

    /// Prefix the key so it can be dropped with `clear(Some(namespace))`
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Append a positional argument
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => self.args.push(canonicalize(value)),
            Err(err) => self.record_error(err),
        }
        self
    }

    /// Set a keyword argument; insertion order is irrelevant
    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.kwargs.insert(name.into(), canonicalize(value));
            }
            Err(err) => self.record_error(err),
        }
        self
    }

    pub fn build(self) -> Result<String, ResilienceError> {
        if let Some(err) = self.error {
            return Err(ResilienceError::validation(format!(
                "cache key argument for {} is not serializable: {err}",
                self.function
            )));
        }

        let kwargs: Map<String, Value> = self.kwargs.into_iter().collect();
        let canonical = Value::Array(vec![
            self.namespace.clone().map_or(Value::Null, Value::String),
            Value::String(self.function.clone()),
            Value::Array(self.args),
            Value::Object(kwargs),
        ]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());

        Ok(match self.namespace {
            Some(ns) => format!("{ns}:{}:{}", self.function, hex::encode(digest)),
            None => format!("{}:{}", self.function, hex::encode(digest)),
        })
    }

    fn record_error(&mut self, err: serde_json::Error) {
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
    }
}

/// Rebuild `value` with object keys in sorted order at every depth
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(String, Value)> = map.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
