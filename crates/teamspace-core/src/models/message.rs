use serde::Serialize;
use serde_json::{Map, Value};

use super::entity::Entity;
use crate::constants::{fields, SCOPE_FIELD};

/// Chat message row as rendered by the chat view
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub project_id: String,
    pub sender_id: Option<String>,
    pub created_at: Option<u64>,
    pub read_by_user_ids: Vec<String>,
}

impl Message {
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        let content = entity.field_str(fields::CONTENT)?.to_string();
        Some(Self {
            id: entity.id.clone(),
            content,
            project_id: entity.scope_key.clone(),
            sender_id: entity.field_str(fields::SENDER_ID).map(str::to_string),
            created_at: entity.field(fields::CREATED_AT).and_then(Value::as_u64),
            read_by_user_ids: entity
                .field(fields::READ_BY_USER_IDS)
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Create payload for a new message in `project_id`
    pub fn payload(content: &str, project_id: &str) -> Value {
        let mut payload = Map::new();
        payload.insert(fields::CONTENT.to_string(), Value::from(content));
        payload.insert(SCOPE_FIELD.to_string(), Value::from(project_id));
        Value::Object(payload)
    }

    /// Update payload recording that `user_id` has read the message
    pub fn read_receipt(user_id: &str) -> Value {
        let mut payload = Map::new();
        payload.insert(
            fields::READ_BY_USER_IDS.to_string(),
            Value::Array(vec![Value::from(user_id)]),
        );
        Value::Object(payload)
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by_user_ids.iter().any(|id| id == user_id)
    }
}
