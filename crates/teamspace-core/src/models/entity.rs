use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{APPEND_FIELDS, SCOPE_FIELD};

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Synchronized tables of the workspace backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    Message,
    Task,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Message => "Message",
            Table::Task => "Task",
        }
    }

    pub fn scope_field(&self) -> &'static str {
        SCOPE_FIELD
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synchronized record (message, task). Owned by the backend; the client
/// only ever holds copies of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub scope_key: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub updated_at: u64,
}

impl Entity {
    pub fn new(id: impl Into<String>, scope_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scope_key: scope_key.into(),
            fields: Map::new(),
            updated_at: 0,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Overwrite the fields present in `patch`, leaving the others untouched.
    /// Append fields gain the patch's entries they do not already hold.
    pub fn merge_fields(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if APPEND_FIELDS.contains(&key.as_str()) {
                if let (Some(Value::Array(current)), Value::Array(added)) =
                    (self.fields.get_mut(key), value)
                {
                    for entry in added {
                        if !current.contains(entry) {
                            current.push(entry.clone());
                        }
                    }
                    continue;
                }
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

/// One change delivered by a shape feed.
///
/// Within a scope, operations arrive in non-decreasing `sequence` order but may
/// be delivered more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub kind: OpKind,
    pub entity_id: String,
    pub snapshot: Entity,
    pub sequence: u64,
}

impl Operation {
    pub fn new(kind: OpKind, snapshot: Entity, sequence: u64) -> Self {
        Self {
            kind,
            entity_id: snapshot.id.clone(),
            snapshot,
            sequence,
        }
    }

    pub fn insert(snapshot: Entity, sequence: u64) -> Self {
        Self::new(OpKind::Insert, snapshot, sequence)
    }

    pub fn update(snapshot: Entity, sequence: u64) -> Self {
        Self::new(OpKind::Update, snapshot, sequence)
    }

    pub fn delete(snapshot: Entity, sequence: u64) -> Self {
        Self::new(OpKind::Delete, snapshot, sequence)
    }

    pub fn scope_key(&self) -> &str {
        &self.snapshot.scope_key
    }

    /// Correlation key carried by the snapshot in `field`, if any
    pub fn correlation_key(&self, field: &str) -> Option<&str> {
        self.snapshot.field_str(field)
    }
}
