//! In-process stand-in for the workspace backend.
//!
//! Keeps every table in memory, stamps each committed change with a global
//! sequence, and serves shape feeds with a snapshot (or resume backlog)
//! followed by live operations. Failure knobs let tests and the CLI simulate
//! rejected writes, slow writes, a lagging feed, duplicate delivery and
//! dropped connections.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use super::{EntityWriter, ShapeFeed, ShapeMessage, ShapeSource, ShapeSpec, WriteAck, WriteRequest};
use crate::constants::fields;
use crate::error::{FeedError, WriteError};
use crate::models::{now_millis, Entity, MutationKind, OpKind, Operation, Table};

#[derive(Debug, Clone)]
struct StoredRow {
    entity: Entity,
    created_sequence: u64,
    last_sequence: u64,
    /// Mutation that created the row (None for rows written by other clients)
    created_by: Option<String>,
}

struct LiveFeed {
    spec: ShapeSpec,
    tx: mpsc::UnboundedSender<Result<ShapeMessage, FeedError>>,
}

#[derive(Default)]
struct ServerState {
    sequence: u64,
    tables: HashMap<Table, HashMap<String, StoredRow>>,
    log: Vec<(Table, Operation)>,
    feeds: Vec<LiveFeed>,

    // Failure injection
    write_delays: VecDeque<Duration>,
    rejections: HashMap<String, WriteError>,
    failing_opens: usize,
    hold_feed: bool,
    held: Vec<(Table, Operation)>,
    duplicate_delivery: bool,

    writes: Vec<WriteRequest>,
}

impl ServerState {
    fn commit(
        &mut self,
        table: Table,
        kind: OpKind,
        entity: Entity,
        created_by: Option<String>,
    ) -> Operation {
        self.sequence += 1;
        let sequence = self.sequence;
        let rows = self.tables.entry(table).or_default();

        match kind {
            OpKind::Insert => {
                rows.insert(
                    entity.id.clone(),
                    StoredRow {
                        entity: entity.clone(),
                        created_sequence: sequence,
                        last_sequence: sequence,
                        created_by,
                    },
                );
            }
            OpKind::Update => {
                if let Some(row) = rows.get_mut(&entity.id) {
                    row.entity = entity.clone();
                    row.last_sequence = sequence;
                }
            }
            OpKind::Delete => {
                rows.remove(&entity.id);
            }
        }

        let op = Operation::new(kind, entity, sequence);
        self.log.push((table, op.clone()));
        if self.hold_feed {
            self.held.push((table, op.clone()));
        } else {
            self.deliver(table, &op);
        }
        op
    }

    fn deliver(&mut self, table: Table, op: &Operation) {
        let copies = if self.duplicate_delivery { 2 } else { 1 };
        self.feeds.retain(|feed| {
            if feed.spec.table != table || !feed.spec.matches(&op.snapshot) {
                return !feed.tx.is_closed();
            }
            (0..copies).all(|_| {
                feed.tx
                    .unbounded_send(Ok(ShapeMessage::Operation(op.clone())))
                    .is_ok()
            })
        });
    }

    fn apply_write(&mut self, request: &WriteRequest) -> Result<WriteAck, WriteError> {
        if let Some(rejection) = self.rejections.get(&request.entity_id) {
            return Err(rejection.clone());
        }

        let payload = normalize(request.table, &request.payload);
        let existing = self
            .tables
            .get(&request.table)
            .and_then(|rows| rows.get(&request.entity_id))
            .cloned();

        match request.kind {
            MutationKind::Create => {
                if let Some(row) = existing {
                    // Replayed create of the same mutation is accepted as-is
                    if row.created_by.as_deref() == Some(request.mutation_id.as_str()) {
                        return Ok(WriteAck {
                            entity_id: request.entity_id.clone(),
                        });
                    }
                    return Err(WriteError::Rejected {
                        status: 409,
                        message: format!("{} {} already exists", request.table, request.entity_id),
                    });
                }

                let scope_key = payload
                    .get(request.table.scope_field())
                    .and_then(Value::as_str)
                    .ok_or_else(|| WriteError::Rejected {
                        status: 400,
                        message: format!("{} is required", request.table.scope_field()),
                    })?
                    .to_string();

                let now = now_millis();
                let mut entity = Entity::new(request.entity_id.clone(), scope_key);
                entity.merge_fields(&payload);
                entity.fields.remove(fields::ID);
                entity
                    .fields
                    .entry(fields::CREATED_AT)
                    .or_insert_with(|| Value::from(now));
                entity.updated_at = now;

                self.commit(
                    request.table,
                    OpKind::Insert,
                    entity,
                    Some(request.mutation_id.clone()),
                );
            }
            MutationKind::Update => {
                let row = existing.ok_or_else(|| WriteError::Rejected {
                    status: 404,
                    message: format!("{} {} not found", request.table, request.entity_id),
                })?;

                let mut entity = row.entity;
                entity.merge_fields(&payload);
                entity.updated_at = now_millis();
                self.commit(request.table, OpKind::Update, entity, None);
            }
        }

        Ok(WriteAck {
            entity_id: request.entity_id.clone(),
        })
    }
}

/// Server-side normalization applied before a row is stored
fn normalize(table: Table, payload: &Map<String, Value>) -> Map<String, Value> {
    let mut payload = payload.clone();
    if table == Table::Message {
        if let Some(Value::String(content)) = payload.get_mut(fields::CONTENT) {
            *content = content.trim().to_string();
        }
    }
    payload
}

/// In-memory backend implementing both the shape feed and the write endpoint
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as if another client had written it
    pub fn insert_remote(&self, table: Table, mut entity: Entity) -> Operation {
        if entity.updated_at == 0 {
            entity.updated_at = now_millis();
        }
        self.state.lock().commit(table, OpKind::Insert, entity, None)
    }

    /// Patch a row as if another client had written it
    pub fn update_remote(
        &self,
        table: Table,
        entity_id: &str,
        patch: &Map<String, Value>,
    ) -> Option<Operation> {
        let mut state = self.state.lock();
        let mut entity = state.tables.get(&table)?.get(entity_id)?.entity.clone();
        entity.merge_fields(patch);
        entity.updated_at = now_millis();
        Some(state.commit(table, OpKind::Update, entity, None))
    }

    /// Delete a row as if another client had removed it
    pub fn delete_remote(&self, table: Table, entity_id: &str) -> Option<Operation> {
        let mut state = self.state.lock();
        let entity = state.tables.get(&table)?.get(entity_id)?.entity.clone();
        Some(state.commit(table, OpKind::Delete, entity, None))
    }

    pub fn get(&self, table: Table, entity_id: &str) -> Option<Entity> {
        let state = self.state.lock();
        state
            .tables
            .get(&table)
            .and_then(|rows| rows.get(entity_id))
            .map(|row| row.entity.clone())
    }

    /// Rows of `table` in `scope_key`, in creation order
    pub fn rows(&self, table: Table, scope_key: &str) -> Vec<Entity> {
        let state = self.state.lock();
        let Some(rows) = state.tables.get(&table) else {
            return Vec::new();
        };
        let mut rows: Vec<&StoredRow> = rows
            .values()
            .filter(|row| row.entity.scope_key == scope_key)
            .collect();
        rows.sort_by_key(|row| row.created_sequence);
        rows.into_iter().map(|row| row.entity.clone()).collect()
    }

    /// Latest committed sequence
    pub fn cursor(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Every write request received so far, in arrival order
    pub fn writes(&self) -> Vec<WriteRequest> {
        self.state.lock().writes.clone()
    }

    /// Delay the next writes, one delay per write in arrival order
    pub fn queue_write_delays<I: IntoIterator<Item = Duration>>(&self, delays: I) {
        self.state.lock().write_delays.extend(delays);
    }

    /// Reject every write targeting `entity_id` with `error`
    pub fn reject_writes_for(&self, entity_id: &str, error: WriteError) {
        self.state
            .lock()
            .rejections
            .insert(entity_id.to_string(), error);
    }

    pub fn clear_rejections(&self) {
        self.state.lock().rejections.clear();
    }

    /// Make the next `count` shape opens fail
    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().failing_opens = count;
    }

    /// While held, committed operations are stored but not pushed to feeds.
    /// Releasing delivers the held backlog in order.
    pub fn hold_feed(&self, hold: bool) {
        let mut state = self.state.lock();
        state.hold_feed = hold;
        if !hold {
            let held = std::mem::take(&mut state.held);
            for (table, op) in held {
                state.deliver(table, &op);
            }
        }
    }

    /// Push every live operation twice (at-least-once delivery)
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.state.lock().duplicate_delivery = enabled;
    }

    /// Drop every open feed with a transport error
    pub fn disconnect_feeds(&self, reason: &str) {
        let mut state = self.state.lock();
        debug!(feeds = state.feeds.len(), reason, "Disconnecting shape feeds");
        for feed in state.feeds.drain(..) {
            let _ = feed.tx.unbounded_send(Err(FeedError::Transport {
                message: reason.to_string(),
            }));
        }
    }

    pub fn live_feed_count(&self) -> usize {
        let mut state = self.state.lock();
        state.feeds.retain(|feed| !feed.tx.is_closed());
        state.feeds.len()
    }
}

impl ShapeSource for MemoryBackend {
    fn open_shape<'a>(
        &'a self,
        spec: &'a ShapeSpec,
        resume_after: Option<u64>,
    ) -> BoxFuture<'a, Result<ShapeFeed, FeedError>> {
        let mut state = self.state.lock();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Box::pin(future::ready(Err(FeedError::Unavailable {
                message: format!("shape {} unavailable", spec),
            })));
        }

        let backlog: Vec<Operation> = match resume_after {
            Some(cursor) => state
                .log
                .iter()
                .filter(|(table, op)| {
                    *table == spec.table && op.sequence > cursor && spec.matches(&op.snapshot)
                })
                .map(|(_, op)| op.clone())
                .collect(),
            None => {
                let mut rows: Vec<&StoredRow> = state
                    .tables
                    .get(&spec.table)
                    .map(|rows| rows.values().filter(|row| spec.matches(&row.entity)).collect())
                    .unwrap_or_default();
                rows.sort_by_key(|row| row.created_sequence);
                rows.into_iter()
                    .map(|row| Operation::insert(row.entity.clone(), row.last_sequence))
                    .collect()
            }
        };

        debug!(
            shape = %spec,
            resume_after = ?resume_after,
            backlog = backlog.len(),
            "Opening shape feed"
        );

        let (tx, rx) = mpsc::unbounded();
        for op in backlog {
            let _ = tx.unbounded_send(Ok(ShapeMessage::Operation(op)));
        }
        let _ = tx.unbounded_send(Ok(ShapeMessage::UpToDate {
            cursor: state.sequence,
        }));
        state.feeds.push(LiveFeed {
            spec: spec.clone(),
            tx,
        });

        Box::pin(future::ready(Ok(rx.boxed())))
    }
}

impl EntityWriter for MemoryBackend {
    fn write_entity<'a>(
        &'a self,
        request: &'a WriteRequest,
    ) -> BoxFuture<'a, Result<WriteAck, WriteError>> {
        let delay = {
            let mut state = self.state.lock();
            state.writes.push(request.clone());
            state.write_delays.pop_front()
        };

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let result = self.state.lock().apply_write(request);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::StreamExt;
    use serde_json::json;

    fn create_message(id: &str, content: &str) -> WriteRequest {
        WriteRequest {
            mutation_id: id.to_string(),
            table: Table::Message,
            kind: MutationKind::Create,
            entity_id: id.to_string(),
            payload: json!({"content": content, "projectId": "proj_1"})
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    async fn next_op(feed: &mut ShapeFeed) -> Operation {
        match feed.next().await {
            Some(Ok(ShapeMessage::Operation(op))) => op,
            other => panic!("expected operation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_then_live_tail() {
        let backend = MemoryBackend::new();
        backend.insert_remote(
            Table::Message,
            Entity::new("m0", "proj_1").with_field("content", "first"),
        );
        backend.insert_remote(
            Table::Message,
            Entity::new("x0", "proj_2").with_field("content", "other"),
        );

        let spec = ShapeSpec::new(Table::Message, ["proj_1"]);
        let mut feed = backend.open_shape(&spec, None).await.unwrap();

        assert_eq!(next_op(&mut feed).await.entity_id, "m0");
        assert_eq!(
            feed.next().await,
            Some(Ok(ShapeMessage::UpToDate { cursor: 2 }))
        );

        backend.write_entity(&create_message("m1", "  Hello team  ")).await.unwrap();
        let op = next_op(&mut feed).await;
        assert_eq!(op.kind, OpKind::Insert);
        assert_eq!(op.sequence, 3);
        // Server trims the content
        assert_eq!(op.snapshot.field_str("content"), Some("Hello team"));
    }

    #[tokio::test]
    async fn test_resume_replays_only_after_cursor() {
        let backend = MemoryBackend::new();
        backend.insert_remote(Table::Task, Entity::new("t1", "proj_1").with_field("name", "a"));
        backend.insert_remote(Table::Task, Entity::new("t2", "proj_1").with_field("name", "b"));
        backend.update_remote(Table::Task, "t1", json!({"name": "a2"}).as_object().unwrap());

        let spec = ShapeSpec::new(Table::Task, ["proj_1"]);
        let mut feed = backend.open_shape(&spec, Some(1)).await.unwrap();

        let first = next_op(&mut feed).await;
        assert_eq!((first.entity_id.as_str(), first.sequence), ("t2", 2));
        let second = next_op(&mut feed).await;
        assert_eq!((second.kind, second.sequence), (OpKind::Update, 3));
    }

    #[tokio::test]
    async fn test_rejected_write_commits_nothing() {
        let backend = MemoryBackend::new();
        backend.reject_writes_for(
            "m1",
            WriteError::Rejected {
                status: 500,
                message: "Failed to create".to_string(),
            },
        );

        let result = backend.write_entity(&create_message("m1", "Hello team")).await;
        assert!(matches!(result, Err(WriteError::Rejected { status: 500, .. })));
        assert!(backend.get(Table::Message, "m1").is_none());
        assert_eq!(backend.cursor(), 0);
        assert_eq!(backend.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_mutation() {
        let backend = MemoryBackend::new();
        let request = create_message("m1", "Hello team");
        backend.write_entity(&request).await.unwrap();
        backend.write_entity(&request).await.unwrap();
        assert_eq!(backend.cursor(), 1);

        let mut conflicting = request.clone();
        conflicting.mutation_id = "other".to_string();
        let result = backend.write_entity(&conflicting).await;
        assert!(matches!(result, Err(WriteError::Rejected { status: 409, .. })));
    }

    #[tokio::test]
    async fn test_held_feed_releases_in_order() {
        let backend = MemoryBackend::new();
        let spec = ShapeSpec::new(Table::Message, ["proj_1"]);
        let mut feed = backend.open_shape(&spec, None).await.unwrap();
        assert!(matches!(feed.next().await, Some(Ok(ShapeMessage::UpToDate { .. }))));

        backend.hold_feed(true);
        backend.write_entity(&create_message("m1", "one")).await.unwrap();
        backend.write_entity(&create_message("m2", "two")).await.unwrap();
        backend.hold_feed(false);

        assert_eq!(next_op(&mut feed).await.entity_id, "m1");
        assert_eq!(next_op(&mut feed).await.entity_id, "m2");
    }

    #[tokio::test]
    async fn test_disconnect_ends_feed_with_error() {
        let backend = MemoryBackend::new();
        let spec = ShapeSpec::new(Table::Message, ["proj_1"]);
        let mut feed = backend.open_shape(&spec, None).await.unwrap();
        feed.next().await;

        backend.disconnect_feeds("connection reset");
        assert!(matches!(feed.next().await, Some(Err(FeedError::Transport { .. }))));
        assert!(feed.next().await.is_none());
        assert_eq!(backend.live_feed_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_next_opens() {
        let backend = MemoryBackend::new();
        backend.fail_next_opens(1);
        let spec = ShapeSpec::new(Table::Message, ["proj_1"]);
        assert!(backend.open_shape(&spec, None).await.is_err());
        assert!(backend.open_shape(&spec, None).await.is_ok());
    }
}
