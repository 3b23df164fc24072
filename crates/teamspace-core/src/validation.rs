//! Local payload checks, run before any optimistic state is applied.
//!
//! Limits follow the workspace app's message and task schemas: a message is
//! 1..=500 characters, a task needs a name and a status column, a task
//! priority is one of Low/Medium/High, and a read receipt names at least one
//! user.

use serde_json::{Map, Value};

use crate::config::SyncConfig;
use crate::constants::fields;
use crate::error::SyncError;
use crate::models::{MutationKind, Priority, Table};

/// Validate a mutation payload and return it as an object map
pub fn validate(
    table: Table,
    kind: MutationKind,
    entity_id: &str,
    payload: &Value,
    config: &SyncConfig,
) -> Result<Map<String, Value>, SyncError> {
    if entity_id.trim().is_empty() {
        return Err(SyncError::invalid("entity id must not be empty"));
    }

    let object = payload
        .as_object()
        .ok_or_else(|| SyncError::invalid("payload must be a JSON object"))?;
    if object.is_empty() {
        return Err(SyncError::invalid("payload must not be empty"));
    }
    if object.contains_key(&config.correlation_field) {
        return Err(SyncError::invalid(format!(
            "{} is reserved for the correlation key",
            config.correlation_field
        )));
    }
    if let Some(id) = object.get(fields::ID) {
        if id.as_str() != Some(entity_id) {
            return Err(SyncError::invalid("payload id does not match the entity id"));
        }
    }

    let creating = kind == MutationKind::Create;
    check_text(object, table.scope_field(), creating)?;

    match table {
        Table::Message => check_message(object, creating, config.max_message_length)?,
        Table::Task => check_task(object, creating)?,
    }

    Ok(object.clone())
}

fn check_message(
    object: &Map<String, Value>,
    creating: bool,
    max_length: usize,
) -> Result<(), SyncError> {
    if let Some(readers) = object.get(fields::READ_BY_USER_IDS) {
        let valid = readers.as_array().is_some_and(|ids| {
            !ids.is_empty()
                && ids
                    .iter()
                    .all(|id| id.as_str().is_some_and(|id| !id.trim().is_empty()))
        });
        if !valid {
            return Err(SyncError::invalid(format!(
                "{} must be a non-empty list of user ids",
                fields::READ_BY_USER_IDS
            )));
        }
    }

    match object.get(fields::CONTENT) {
        Some(Value::String(content)) => {
            let length = content.trim().chars().count();
            if length == 0 {
                return Err(SyncError::invalid("message content must not be empty"));
            }
            if length > max_length {
                return Err(SyncError::invalid(format!(
                    "message content is {} characters, limit is {}",
                    length, max_length
                )));
            }
            Ok(())
        }
        Some(_) => Err(SyncError::invalid("message content must be a string")),
        None if creating => Err(SyncError::invalid("message content is required")),
        None => Ok(()),
    }
}

fn check_task(object: &Map<String, Value>, creating: bool) -> Result<(), SyncError> {
    check_text(object, fields::NAME, creating)?;
    check_text(object, fields::STATUS_ID, creating)?;

    if let Some(priority) = object.get(fields::PRIORITY) {
        let parsed = priority
            .as_str()
            .map(str::parse::<Priority>)
            .ok_or_else(|| SyncError::invalid("priority must be a string"))?;
        parsed.map_err(SyncError::invalid)?;
    }

    match object.get(fields::DESCRIPTION) {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(SyncError::invalid("description must be a string")),
    }
}

/// A required (on create) or optional (on update) non-empty string field
fn check_text(object: &Map<String, Value>, field: &str, required: bool) -> Result<(), SyncError> {
    match object.get(field) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(()),
        Some(_) => Err(SyncError::invalid(format!(
            "{} must be a non-empty string",
            field
        ))),
        None if required => Err(SyncError::invalid(format!("{} is required", field))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(
        table: Table,
        kind: MutationKind,
        payload: Value,
    ) -> Result<Map<String, Value>, SyncError> {
        validate(table, kind, "entity_1", &payload, &SyncConfig::default())
    }

    #[test]
    fn test_valid_message_create() {
        let payload = check(
            Table::Message,
            MutationKind::Create,
            json!({"content": "Hello team", "projectId": "proj_1"}),
        )
        .unwrap();
        assert_eq!(payload["content"], "Hello team");
    }

    #[test]
    fn test_message_content_limits() {
        let blank = check(
            Table::Message,
            MutationKind::Create,
            json!({"content": "   ", "projectId": "proj_1"}),
        );
        assert!(matches!(blank, Err(SyncError::InvalidPayload { .. })));

        let long = "x".repeat(501);
        let too_long = check(
            Table::Message,
            MutationKind::Create,
            json!({"content": long, "projectId": "proj_1"}),
        );
        assert!(matches!(too_long, Err(SyncError::InvalidPayload { .. })));
    }

    #[test]
    fn test_message_create_requires_project() {
        let result = check(Table::Message, MutationKind::Create, json!({"content": "hi"}));
        assert_eq!(
            result.unwrap_err(),
            SyncError::invalid("projectId is required")
        );
    }

    #[test]
    fn test_read_receipt_update() {
        let receipt = |readers: Value| {
            check(
                Table::Message,
                MutationKind::Update,
                json!({ "readByUserIds": readers }),
            )
        };
        assert!(receipt(json!(["user_1"])).is_ok());
        assert!(receipt(json!([])).is_err());
        assert!(receipt(json!([""])).is_err());
        assert!(receipt(json!("user_1")).is_err());
    }

    #[test]
    fn test_task_update_only_checks_present_fields() {
        let update = |payload: Value| check(Table::Task, MutationKind::Update, payload);
        assert!(update(json!({"statusId": "status_done"})).is_ok());
        assert!(update(json!({"statusId": ""})).is_err());
        assert!(update(json!({"priority": "Urgent"})).is_err());
    }

    #[test]
    fn test_task_create_requires_name_and_status() {
        let result = check(
            Table::Task,
            MutationKind::Create,
            json!({"name": "Ship it", "projectId": "proj_1"}),
        );
        assert_eq!(result.unwrap_err(), SyncError::invalid("statusId is required"));
    }

    #[test]
    fn test_rejects_reserved_and_mismatched_fields() {
        let update = |payload: Value| check(Table::Task, MutationKind::Update, payload);
        assert!(update(json!({"clientMutationId": "abc", "name": "x"})).is_err());
        assert!(update(json!({"id": "other", "name": "x"})).is_err());
        assert!(update(json!({})).is_err());
        assert!(update(json!("name")).is_err());
    }

    #[test]
    fn test_rejects_empty_entity_id() {
        let result = validate(
            Table::Task,
            MutationKind::Update,
            " ",
            &json!({"name": "x"}),
            &SyncConfig::default(),
        );
        assert!(result.is_err());
    }
}
