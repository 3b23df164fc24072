use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::entity::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Where a pending create is shown before the feed confirms it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Placement {
    /// End of the list (chat)
    #[default]
    Append,
    /// Right after another entity (kanban drop position)
    After(String),
}

/// A local edit as issued by the UI, before the coordinator has accepted it
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub kind: MutationKind,
    pub entity_id: String,
    pub payload: Value,
    pub mutation_id: Option<String>,
    pub placement: Placement,
}

impl MutationRequest {
    pub fn create(entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MutationKind::Create,
            entity_id: entity_id.into(),
            payload,
            mutation_id: None,
            placement: Placement::Append,
        }
    }

    /// Create with a freshly generated id (the id doubles as correlation key)
    pub fn create_new(payload: Value) -> Self {
        Self::create(uuid::Uuid::new_v4().to_string(), payload)
    }

    pub fn update(entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MutationKind::Update,
            entity_id: entity_id.into(),
            payload,
            mutation_id: None,
            placement: Placement::Append,
        }
    }

    pub fn with_mutation_id(mut self, mutation_id: impl Into<String>) -> Self {
        self.mutation_id = Some(mutation_id.into());
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }
}

/// A pending local edit tracked by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMutation {
    pub mutation_id: String,
    pub entity_id: String,
    pub scope_key: String,
    pub kind: MutationKind,
    /// Validated payload, without the correlation field
    pub payload: Map<String, Value>,
    pub status: MutationStatus,
    pub issued_at: u64,
    pub placement: Placement,
}

impl ClientMutation {
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    /// Transient entity rendered for a pending create
    pub fn optimistic_entity(&self) -> Entity {
        let mut entity = Entity::new(self.entity_id.clone(), self.scope_key.clone());
        entity.merge_fields(&self.payload);
        entity.updated_at = self.issued_at;
        entity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_new_generates_uuid_id() {
        let request = MutationRequest::create_new(json!({"content": "Hello team"}));
        assert_eq!(request.kind, MutationKind::Create);
        assert!(uuid::Uuid::parse_str(&request.entity_id).is_ok());
        assert!(request.mutation_id.is_none());
    }

    #[test]
    fn test_optimistic_entity_uses_payload_fields() {
        let mutation = ClientMutation {
            mutation_id: "m1".to_string(),
            entity_id: "m1".to_string(),
            scope_key: "proj_1".to_string(),
            kind: MutationKind::Create,
            payload: json!({"content": "Hello team", "projectId": "proj_1"})
                .as_object()
                .cloned()
                .unwrap(),
            status: MutationStatus::Pending,
            issued_at: 42,
            placement: Placement::Append,
        };

        let entity = mutation.optimistic_entity();
        assert_eq!(entity.id, "m1");
        assert_eq!(entity.scope_key, "proj_1");
        assert_eq!(entity.field_str("content"), Some("Hello team"));
        assert_eq!(entity.updated_at, 42);
    }
}
