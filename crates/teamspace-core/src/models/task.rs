use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Map, Value};

use super::entity::Entity;
use crate::constants::{fields, SCOPE_FIELD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Low" => Ok(Priority::Low),
            "Medium" => Ok(Priority::Medium),
            "High" => Ok(Priority::High),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
        };
        f.write_str(name)
    }
}

/// Kanban card as rendered by the task board
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub project_id: String,
    pub status_id: String,
    pub priority: Priority,
}

impl Task {
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        let priority = entity
            .field_str(fields::PRIORITY)
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();

        Some(Self {
            id: entity.id.clone(),
            name: entity.field_str(fields::NAME)?.to_string(),
            description: entity.field_str(fields::DESCRIPTION).map(str::to_string),
            project_id: entity.scope_key.clone(),
            status_id: entity.field_str(fields::STATUS_ID)?.to_string(),
            priority,
        })
    }

    /// Create payload for a new task in `status_id` of `project_id`
    pub fn payload(name: &str, project_id: &str, status_id: &str) -> Value {
        let mut payload = Map::new();
        payload.insert(fields::NAME.to_string(), Value::from(name));
        payload.insert(SCOPE_FIELD.to_string(), Value::from(project_id));
        payload.insert(fields::STATUS_ID.to_string(), Value::from(status_id));
        payload.insert(
            fields::PRIORITY.to_string(),
            Value::from(Priority::default().to_string()),
        );
        Value::Object(payload)
    }
}
