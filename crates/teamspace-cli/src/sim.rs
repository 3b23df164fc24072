//! Scripted runs of the sync engine against an in-process backend.
//!
//! Each run captures the projection right after the optimistic apply and
//! again once the mutation settles, so the hand-off from local to
//! authoritative state can be inspected.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use teamspace_core::backend::MemoryBackend;
use teamspace_core::models::{Message, Task};
use teamspace_core::{
    Entity, MutationEvent, MutationRequest, ProjectedEntity, ShapeSpec, SyncConfig, SyncError,
    SyncRuntime, Table, WriteError,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

pub struct SimOptions {
    pub project: String,
    /// Make the backend reject the write
    pub reject: bool,
    /// Delay before the backend handles the write
    pub latency: Duration,
}

fn seed(backend: &MemoryBackend, project: &str) {
    backend.insert_remote(
        Table::Message,
        Entity::new("msg_welcome", project)
            .with_field("content", "Welcome to the project")
            .with_field("senderId", "user_admin"),
    );

    let tasks = [
        ("task_4", "Draft roadmap", "status_todo"),
        ("task_5", "Ship kanban", "status_todo"),
        ("task_6", "Write docs", "status_doing"),
    ];
    for (id, name, status) in tasks {
        backend.insert_remote(
            Table::Task,
            Entity::new(id, project)
                .with_field("name", name)
                .with_field("statusId", status)
                .with_field("priority", "Medium"),
        );
    }
}

async fn start(
    backend: &MemoryBackend,
    table: Table,
    project: &str,
    config: SyncConfig,
) -> Result<SyncRuntime> {
    let runtime = SyncRuntime::start(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        ShapeSpec::new(table, [project]),
        config,
    )
    .await
    .context("Failed to open shape")?;
    runtime
        .wait_until_live()
        .await
        .context("Shape never became live")?;
    Ok(runtime)
}

fn rejection(message: &str) -> WriteError {
    WriteError::Rejected {
        status: 500,
        message: message.to_string(),
    }
}

fn chat(rows: &[ProjectedEntity]) -> Value {
    rows.iter()
        .map(|row| json!({ "status": row.status, "message": Message::from_entity(&row.entity) }))
        .collect()
}

fn board(runtime: &SyncRuntime, project: &str, field: &str) -> BTreeMap<String, Vec<Value>> {
    runtime
        .projector()
        .project_by_group(project, field)
        .into_iter()
        .map(|(group, rows)| {
            let cards = rows
                .iter()
                .map(|row| json!({ "status": row.status, "task": Task::from_entity(&row.entity) }))
                .collect();
            (group, cards)
        })
        .collect()
}

fn outcome(result: &Result<Entity, SyncError>) -> Value {
    match result {
        Ok(entity) => json!({ "status": "confirmed", "entity": entity }),
        Err(err) => json!({
            "status": "failed",
            "error": err.to_string(),
            "retryable": err.is_retryable(),
        }),
    }
}

/// Send one chat message and report the chat view before and after
pub async fn send_message(
    config: SyncConfig,
    content: &str,
    options: &SimOptions,
) -> Result<Value> {
    let backend = MemoryBackend::new();
    seed(&backend, &options.project);
    let runtime = start(&backend, Table::Message, &options.project, config).await?;

    let request = MutationRequest::create_new(Message::payload(content, &options.project));
    if options.reject {
        backend.reject_writes_for(&request.entity_id, rejection("Failed to create message"));
    }
    backend.queue_write_delays([options.latency]);

    let pending = runtime.submit(request)?;
    info!(entity_id = pending.entity_id(), "Message submitted");
    let optimistic = chat(&runtime.project(&options.project));

    let result = pending.await;
    let settled = chat(&runtime.project(&options.project));

    let report = json!({
        "optimistic": optimistic,
        "settled": settled,
        "outcome": outcome(&result),
        "server": backend.rows(Table::Message, &options.project),
        "stats": runtime.stats(),
    });
    runtime.shutdown();
    Ok(report)
}

/// Drag one card to another column and report the board before and after
pub async fn move_task(
    config: SyncConfig,
    task_id: &str,
    target_group: &str,
    options: &SimOptions,
) -> Result<Value> {
    let backend = MemoryBackend::new();
    seed(&backend, &options.project);
    let wait_limit = config.confirmation_timeout() + options.latency + Duration::from_secs(1);
    let runtime = start(&backend, Table::Task, &options.project, config).await?;
    let group_field = runtime.reorder().group_field().to_string();

    if options.reject {
        backend.reject_writes_for(task_id, rejection("Failed to update task"));
    }
    backend.queue_write_delays([options.latency]);

    let before = board(&runtime, &options.project, &group_field);
    let already_there = runtime
        .projector()
        .entity(task_id)
        .is_some_and(|row| row.entity.field_str(&group_field) == Some(target_group));

    let mut events = runtime.events();
    runtime.on_moved(task_id, target_group)?;
    let optimistic = board(&runtime, &options.project, &group_field);

    let settled_event = if already_there {
        None
    } else {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(MutationEvent::Issued { .. }) | Err(RecvError::Lagged(_)) => continue,
                    Ok(event) if event.entity_id() == task_id => return Ok(event),
                    Ok(_) => continue,
                    Err(RecvError::Closed) => bail!("Event channel closed"),
                }
            }
        };
        Some(
            tokio::time::timeout(wait_limit, wait)
                .await
                .context("Move did not settle")??,
        )
    };

    let report = json!({
        "before": before,
        "optimistic": optimistic,
        "settled": board(&runtime, &options.project, &group_field),
        "event": settled_event,
        "server": backend.rows(Table::Task, &options.project),
        "stats": runtime.stats(),
    });
    runtime.shutdown();
    Ok(report)
}
