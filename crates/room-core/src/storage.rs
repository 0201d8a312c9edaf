//! Replicated room storage and its deterministic merge operations.
//!
//! Pure data, no I/O. The host applies every operation in arrival order and
//! broadcasts the resulting value at the touched key; clients apply the same
//! operation optimistically and are later overwritten by that broadcast.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Unknown array operation: {0}")]
    UnknownOperation(String),
}

/// Merge operation applied to the array stored at a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ArrayOp {
    /// Append unconditionally.
    Add,
    /// Append unless a structurally equal element is already present.
    AddUnique,
    /// Remove the first structurally equal element.
    RemoveMatching,
    /// Replace the first structurally equal element with the update value.
    UpdateMatching,
}

impl ArrayOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::AddUnique => "add-unique",
            Self::RemoveMatching => "remove-matching",
            Self::UpdateMatching => "update-matching",
        }
    }
}

impl Display for ArrayOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArrayOp {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "add-unique" => Ok(Self::AddUnique),
            "remove-matching" => Ok(Self::RemoveMatching),
            "update-matching" => Ok(Self::UpdateMatching),
            other => Err(StorageError::UnknownOperation(other.to_string())),
        }
    }
}

impl TryFrom<String> for ArrayOp {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArrayOp> for String {
    fn from(op: ArrayOp) -> Self {
        op.as_str().to_string()
    }
}

/// One storage mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageOp {
    /// Last-write-wins scalar set.
    Set { key: String, value: Value },
    /// Array merge at `key`.
    Array {
        key: String,
        op: ArrayOp,
        value: Value,
        update_value: Option<Value>,
    },
}

impl StorageOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Array { key, .. } => key,
        }
    }
}

/// Outcome of applying a [`StorageOp`].
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub key: String,
    /// Value now stored at `key`; this is what the host broadcasts.
    pub value: Value,
    /// False when the operation left the stored value structurally unchanged.
    pub changed: bool,
}

/// Structural equality over storage values.
///
/// Numbers compare by numeric value (`1 == 1.0`), arrays element-wise in
/// order, objects by key set and per-key value. Used for both change
/// suppression and array element matching.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => false,
    }
}

/// Key/value room state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Storage {
    entries: BTreeMap<String, Value>,
}

impl PartialEq for Storage {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(k, v)| {
                other
                    .entries
                    .get(k)
                    .is_some_and(|other| values_equal(v, other))
            })
    }
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build storage from a JSON object. Non-object values yield empty storage.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => Self::default(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Replace the whole map. Returns whether anything changed.
    pub fn replace(&mut self, snapshot: Storage) -> bool {
        let changed = *self != snapshot;
        *self = snapshot;
        changed
    }

    /// Apply one operation in place.
    ///
    /// Infallible: an unknown array op never gets this far, it is rejected
    /// when the op string or wire message is parsed.
    pub fn apply(&mut self, op: &StorageOp) -> Applied {
        match op {
            StorageOp::Set { key, value } => self.set(key, value.clone()),
            StorageOp::Array {
                key,
                op,
                value,
                update_value,
            } => {
                let current = match self.entries.get(key) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                let next = merge_array(current, *op, value, update_value.as_ref());
                self.set(key, Value::Array(next))
            }
        }
    }

    fn set(&mut self, key: &str, value: Value) -> Applied {
        let changed = self
            .entries
            .get(key)
            .is_none_or(|previous| !values_equal(previous, &value));
        self.entries.insert(key.to_string(), value.clone());
        Applied {
            key: key.to_string(),
            value,
            changed,
        }
    }
}

impl FromIterator<(String, Value)> for Storage {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl From<Value> for Storage {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

fn merge_array(
    mut items: Vec<Value>,
    op: ArrayOp,
    value: &Value,
    update_value: Option<&Value>,
) -> Vec<Value> {
    match op {
        ArrayOp::Add => items.push(value.clone()),
        ArrayOp::AddUnique => {
            if position_of(&items, value).is_none() {
                items.push(value.clone());
            }
        }
        ArrayOp::RemoveMatching => {
            if let Some(index) = position_of(&items, value) {
                items.remove(index);
            }
        }
        ArrayOp::UpdateMatching => {
            if let (Some(index), Some(replacement)) = (position_of(&items, value), update_value) {
                items[index] = replacement.clone();
            }
        }
    }
    items
}

fn position_of(items: &[Value], value: &Value) -> Option<usize> {
    items.iter().position(|item| values_equal(item, value))
}
