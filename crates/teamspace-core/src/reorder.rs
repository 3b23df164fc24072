//! Kanban drop handling: "entity X now belongs to group Y".

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::coordinator::{MutationCoordinator, PendingMutation};
use crate::error::SyncError;
use crate::models::MutationRequest;

/// Turns drop intents into single-field update mutations
#[derive(Clone)]
pub struct ReorderController {
    coordinator: MutationCoordinator,
    group_field: String,
}

impl ReorderController {
    /// Groups by the coordinator's configured group field
    pub fn new(coordinator: MutationCoordinator) -> Self {
        let group_field = coordinator.config().group_field.clone();
        Self {
            coordinator,
            group_field,
        }
    }

    pub fn with_group_field(mut self, field: impl Into<String>) -> Self {
        self.group_field = field.into();
        self
    }

    pub fn group_field(&self) -> &str {
        &self.group_field
    }

    /// Fire-and-forget move. The card changes column before this returns;
    /// if the write later fails the card goes back and the failure is logged.
    pub fn on_moved(&self, entity_id: &str, target_group: &str) -> Result<(), SyncError> {
        let Some(pending) = self.move_entity(entity_id, target_group)? else {
            return Ok(());
        };

        let entity_id = entity_id.to_string();
        let target_group = target_group.to_string();
        tokio::spawn(async move {
            match pending.await {
                Ok(_) => debug!(
                    entity_id = %entity_id,
                    target_group = %target_group,
                    "Move confirmed"
                ),
                Err(err) if err.is_silent() => {}
                Err(err) => warn!(
                    entity_id = %entity_id,
                    target_group = %target_group,
                    error = %err,
                    "Move failed"
                ),
            }
        });
        Ok(())
    }

    /// Like [`on_moved`](Self::on_moved) but hands back the pending mutation.
    /// Returns `None` when the entity is already in `target_group`.
    pub fn move_entity(
        &self,
        entity_id: &str,
        target_group: &str,
    ) -> Result<Option<PendingMutation>, SyncError> {
        let current = self
            .coordinator
            .projector()
            .entity(entity_id)
            .ok_or_else(|| SyncError::UnknownEntity {
                entity_id: entity_id.to_string(),
            })?;

        if current.entity.field_str(&self.group_field) == Some(target_group) {
            debug!(entity_id, target_group, "Already in target group");
            return Ok(None);
        }

        let mut payload = Map::new();
        payload.insert(self.group_field.clone(), Value::from(target_group));
        self.coordinator
            .submit(MutationRequest::update(entity_id, Value::Object(payload)))
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::WriteError;
    use crate::models::{Entity, Table};
    use crate::projector::{ProjectedEntity, RowStatus};
    use crate::test_support::{wait_for_projection, Harness};

    fn group_ids(
        groups: &std::collections::BTreeMap<String, Vec<ProjectedEntity>>,
        group: &str,
    ) -> Vec<String> {
        groups
            .get(group)
            .map(|rows| rows.iter().map(|row| row.entity.id.clone()).collect())
            .unwrap_or_default()
    }

    async fn board(backend: MemoryBackend) -> (Harness, ReorderController) {
        backend.insert_remote(
            Table::Task,
            Entity::new("task_5", "proj_1")
                .with_field("name", "Ship kanban")
                .with_field("statusId", "status_todo"),
        );
        backend.insert_remote(
            Table::Task,
            Entity::new("task_6", "proj_1")
                .with_field("name", "Write docs")
                .with_field("statusId", "status_todo"),
        );
        let harness = Harness::start(Table::Task, backend).await;
        harness.wait_for_row("task_6").await;
        let reorder = ReorderController::new(harness.coordinator.clone());
        (harness, reorder)
    }

    #[tokio::test]
    async fn test_drag_lands_immediately_then_confirms() {
        let (harness, reorder) = board(MemoryBackend::new()).await;

        reorder.on_moved("task_5", "status_done").unwrap();

        let groups = harness.projector.project_by_group("proj_1", "statusId");
        assert_eq!(group_ids(&groups, "status_done"), vec!["task_5"]);
        assert_eq!(group_ids(&groups, "status_todo"), vec!["task_6"]);

        wait_for_projection(&harness.projector, |p| {
            p.entity("task_5")
                .is_some_and(|row| row.status == RowStatus::Confirmed)
        })
        .await;
        let server = harness.backend.get(Table::Task, "task_5").unwrap();
        assert_eq!(server.field_str("statusId"), Some("status_done"));
        assert_eq!(server.field_str("name"), Some("Ship kanban"));
    }

    #[tokio::test]
    async fn test_failed_move_returns_card() {
        let backend = MemoryBackend::new();
        backend.reject_writes_for(
            "task_5",
            WriteError::Rejected {
                status: 500,
                message: "Failed to update task".to_string(),
            },
        );
        let (harness, reorder) = board(backend).await;

        reorder.on_moved("task_5", "status_done").unwrap();
        let groups = harness.projector.project_by_group("proj_1", "statusId");
        assert_eq!(group_ids(&groups, "status_done"), vec!["task_5"]);

        wait_for_projection(&harness.projector, |p| {
            group_ids(&p.project_by_group("proj_1", "statusId"), "status_todo")
                == vec!["task_5".to_string(), "task_6".to_string()]
        })
        .await;
        let row = harness.projector.entity("task_5").unwrap();
        assert_eq!(row.status, RowStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_move_to_same_group_is_noop() {
        let (harness, reorder) = board(MemoryBackend::new()).await;

        assert!(reorder.move_entity("task_5", "status_todo").unwrap().is_none());
        reorder.on_moved("task_5", "status_todo").unwrap();
        assert!(harness.backend.writes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_entity() {
        let (_harness, reorder) = board(MemoryBackend::new()).await;
        assert_eq!(
            reorder.on_moved("task_404", "status_done").unwrap_err(),
            SyncError::UnknownEntity {
                entity_id: "task_404".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_custom_group_field() {
        let (harness, reorder) = board(MemoryBackend::new()).await;
        let reorder = reorder.with_group_field("priority");
        assert_eq!(reorder.group_field(), "priority");

        let pending = reorder.move_entity("task_5", "High").unwrap().unwrap();
        pending.await.unwrap();

        let server = harness.backend.get(Table::Task, "task_5").unwrap();
        assert_eq!(server.field_str("priority"), Some("High"));
        assert_eq!(server.field_str("statusId"), Some("status_todo"));
    }
}
