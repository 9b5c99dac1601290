//! Process-wide shared state
//!
//! A key/value map owned by the root bus. Every operation is one atomic
//! step under a bounded-wait lock; components inside worker processes reach
//! the same map through their link to the parent.

use crate::process::child::ChildLink;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use types::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SharedStateError {
    /// Lock not acquired within the configured bound
    #[error("Shared state lock not acquired within {timeout_ms}ms")]
    LockTimeout { timeout_ms: u64 },

    #[error("Shared state key '{key}' holds {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: String,
        found: String,
    },

    /// Bus or parent link is gone
    #[error("Shared state unavailable: {0}")]
    Unavailable(String),
}

/// One atomic operation on the map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateOp {
    Get { key: String, default: Value },
    Set { key: String, value: Value },
    Update { entries: BTreeMap<String, Value> },
    Increment { key: String, step: Value, default: Value },
    Append { key: String, value: Value, max_length: Option<usize> },
    Pop { key: String, default: Value },
    Delete { key: String },
    Keys,
    Items,
    Size,
    Clear,
}

pub struct SharedState {
    entries: Mutex<BTreeMap<String, Value>>,
    lock_timeout: Duration,
}

impl SharedState {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            lock_timeout,
        }
    }

    pub fn apply(&self, op: StateOp) -> Result<Value> {
        let mut entries = self
            .entries
            .try_lock_for(self.lock_timeout)
            .ok_or(SharedStateError::LockTimeout {
                timeout_ms: self.lock_timeout.as_millis() as u64,
            })?;

        Ok(match op {
            StateOp::Get { key, default } => entries.get(&key).cloned().unwrap_or(default),
            StateOp::Set { key, value } => {
                entries.insert(key, value);
                Value::Nil
            }
            StateOp::Update { entries: updates } => {
                entries.extend(updates);
                Value::Nil
            }
            StateOp::Increment { key, step, default } => {
                let current = entries.get(&key).cloned().unwrap_or(default);
                let next = add(&key, &current, &step)?;
                entries.insert(key, next.clone());
                next
            }
            StateOp::Append {
                key,
                value,
                max_length,
            } => {
                let list = entries.entry(key.clone()).or_insert(Value::List(Vec::new()));
                if list.is_nil() {
                    *list = Value::List(Vec::new());
                }
                let Value::List(items) = list else {
                    return Err(SharedStateError::TypeMismatch {
                        key,
                        expected: "list".to_string(),
                        found: list.type_name().to_string(),
                    });
                };
                items.push(value);
                if let Some(max) = max_length {
                    let excess = items.len().saturating_sub(max);
                    items.drain(..excess);
                }
                Value::from(items.len())
            }
            StateOp::Pop { key, default } => entries.remove(&key).unwrap_or(default),
            StateOp::Delete { key } => Value::Bool(entries.remove(&key).is_some()),
            StateOp::Keys => Value::List(entries.keys().map(|k| Value::from(k.as_str())).collect()),
            StateOp::Items => Value::Map(entries.clone()),
            StateOp::Size => Value::from(entries.len()),
            StateOp::Clear => {
                entries.clear();
                Value::Nil
            }
        })
    }
}

fn add(key: &str, current: &Value, step: &Value) -> Result<Value> {
    match (current, step) {
        (Value::Int(a), Value::Int(b)) => Ok(a
            .checked_add(*b)
            .map(Value::Int)
            .unwrap_or(Value::Float(*a as f64 + *b as f64))),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (a, b) = (current.as_f64().unwrap_or(0.0), step.as_f64().unwrap_or(0.0));
            Ok(Value::Float(a + b))
        }
        _ => Err(SharedStateError::TypeMismatch {
            key: key.to_string(),
            expected: "number".to_string(),
            found: if matches!(current, Value::Int(_) | Value::Float(_)) {
                step.type_name().to_string()
            } else {
                current.type_name().to_string()
            },
        }),
    }
}

type Result<T> = std::result::Result<T, SharedStateError>;

#[derive(Clone)]
enum StateRoute {
    Local(Arc<SharedState>),
    Remote(Arc<ChildLink>),
    Detached,
}

/// Typed access to the shared map from anywhere on the bus
#[derive(Clone)]
pub struct SharedStateHandle {
    route: StateRoute,
}

impl SharedStateHandle {
    pub(crate) fn local(state: Arc<SharedState>) -> Self {
        Self {
            route: StateRoute::Local(state),
        }
    }

    pub(crate) fn remote(link: Arc<ChildLink>) -> Self {
        Self {
            route: StateRoute::Remote(link),
        }
    }

    pub(crate) fn detached() -> Self {
        Self {
            route: StateRoute::Detached,
        }
    }

    pub fn apply(&self, op: StateOp) -> Result<Value> {
        match &self.route {
            StateRoute::Local(state) => state.apply(op),
            StateRoute::Remote(link) => link.state(op),
            StateRoute::Detached => Err(SharedStateError::Unavailable("handle is detached".into())),
        }
    }

    pub fn get(&self, key: &str, default: impl Into<Value>) -> Result<Value> {
        self.apply(StateOp::Get {
            key: key.to_string(),
            default: default.into(),
        })
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.apply(StateOp::Set {
            key: key.to_string(),
            value: value.into(),
        })
        .map(drop)
    }

    pub fn update(&self, entries: BTreeMap<String, Value>) -> Result<()> {
        self.apply(StateOp::Update { entries }).map(drop)
    }

    /// Add `step` to the value at `key` (or to `default`); returns the new value
    pub fn increment(
        &self,
        key: &str,
        step: impl Into<Value>,
        default: impl Into<Value>,
    ) -> Result<Value> {
        self.apply(StateOp::Increment {
            key: key.to_string(),
            step: step.into(),
            default: default.into(),
        })
    }

    /// Push onto the list at `key`, trimming the oldest items past `max_length`
    pub fn append(
        &self,
        key: &str,
        value: impl Into<Value>,
        max_length: Option<usize>,
    ) -> Result<usize> {
        let len = self.apply(StateOp::Append {
            key: key.to_string(),
            value: value.into(),
            max_length,
        })?;
        Ok(len.as_i64().unwrap_or(0) as usize)
    }

    pub fn pop(&self, key: &str, default: impl Into<Value>) -> Result<Value> {
        self.apply(StateOp::Pop {
            key: key.to_string(),
            default: default.into(),
        })
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.apply(StateOp::Delete {
            key: key.to_string(),
        })?;
        Ok(existed.as_bool().unwrap_or(false))
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let keys = self.apply(StateOp::Keys)?;
        Ok(keys
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect())
    }

    pub fn items(&self) -> Result<BTreeMap<String, Value>> {
        let items = self.apply(StateOp::Items)?;
        Ok(items.as_map().cloned().unwrap_or_default())
    }

    pub fn size(&self) -> Result<usize> {
        let size = self.apply(StateOp::Size)?;
        Ok(size.as_i64().unwrap_or(0) as usize)
    }

    pub fn clear(&self) -> Result<()> {
        self.apply(StateOp::Clear).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SharedStateHandle {
        SharedStateHandle::local(Arc::new(SharedState::new(Duration::from_millis(50))))
    }

    #[test]
    fn test_basic_map_operations() {
        let state = handle();
        assert_eq!(state.get("mode", "idle").unwrap(), Value::from("idle"));
        state.set("mode", "live").unwrap();
        assert_eq!(state.get("mode", Value::Nil).unwrap(), Value::from("live"));

        let mut batch = BTreeMap::new();
        batch.insert("a".to_string(), Value::Int(1));
        batch.insert("b".to_string(), Value::Int(2));
        state.update(batch).unwrap();
        assert_eq!(state.keys().unwrap(), vec!["a", "b", "mode"]);
        assert_eq!(state.size().unwrap(), 3);

        assert_eq!(state.pop("a", 0).unwrap(), Value::Int(1));
        assert_eq!(state.pop("a", 0).unwrap(), Value::Int(0));
        assert!(state.delete("b").unwrap());
        assert!(!state.delete("b").unwrap());
        assert_eq!(state.items().unwrap().len(), 1);
        state.clear().unwrap();
        assert_eq!(state.size().unwrap(), 0);
    }

    #[test]
    fn test_increment_numeric_only() {
        let state = handle();
        assert_eq!(state.increment("hits", 1, 0).unwrap(), Value::Int(1));
        assert_eq!(state.increment("hits", 2, 0).unwrap(), Value::Int(3));
        assert_eq!(state.increment("ratio", 0.5, 1).unwrap(), Value::Float(1.5));

        state.set("name", "x").unwrap();
        assert!(matches!(
            state.increment("name", 1, 0),
            Err(SharedStateError::TypeMismatch { expected, .. }) if expected == "number"
        ));
    }

    #[test]
    fn test_append_trims_oldest() {
        let state = handle();
        for i in 0..5 {
            state.append("recent", i, Some(3)).unwrap();
        }
        assert_eq!(
            state.get("recent", Value::Nil).unwrap(),
            Value::List(vec![Value::Int(2), Value::Int(3), Value::Int(4)])
        );

        state.set("scalar", 1).unwrap();
        assert!(state.append("scalar", 2, None).is_err());
    }

    #[test]
    fn test_lock_timeout_is_distinct() {
        let shared = Arc::new(SharedState::new(Duration::from_millis(10)));
        let _held = shared.entries.lock();
        assert_eq!(
            shared.apply(StateOp::Size),
            Err(SharedStateError::LockTimeout { timeout_ms: 10 })
        );
    }
}
