//! Merged view of the authoritative feed state and the pending overlay.
//!
//! Authoritative rows are kept per scope in feed arrival order. Pending
//! mutations from the ledger are laid over them at read time, so removing a
//! failed mutation reverts exactly the fields it touched.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::backend::ShapeMessage;
use crate::constants::fields;
use crate::error::SyncError;
use crate::ledger::MutationLedger;
use crate::models::{
    ClientMutation, Entity, MutationKind, MutationStatus, OpKind, Operation, Placement,
};
use crate::shape::ShapeHandle;
use crate::stats::SharedSyncStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    /// At least one local mutation on this row is not yet confirmed
    Pending,
    Confirmed,
}

/// One row of a rendered list
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedEntity {
    pub entity: Entity,
    pub status: RowStatus,
    /// Latest pending mutation on the row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<String>,
}

#[derive(Debug)]
struct AuthoritativeRow {
    entity: Entity,
    arrival: u64,
    last_sequence: u64,
}

#[derive(Debug, Default)]
struct ScopeRows {
    order: BTreeMap<u64, String>,
    rows: HashMap<String, AuthoritativeRow>,
}

#[derive(Debug, Default)]
struct ProjectorState {
    scopes: HashMap<String, ScopeRows>,
    /// entity id -> scope holding its authoritative row
    locations: HashMap<String, String>,
    /// entity id -> sequence of the delete that removed it
    tombstones: HashMap<String, u64>,
    next_arrival: u64,
    /// Last handle whose snapshot (or backlog) has been fully applied
    synced_handle: Option<u64>,
    ledger: MutationLedger,
}

impl ProjectorState {
    fn last_sequence(&self, entity_id: &str) -> Option<u64> {
        let live = self.locations.get(entity_id).and_then(|scope| {
            self.scopes
                .get(scope)
                .and_then(|rows| rows.rows.get(entity_id))
                .map(|row| row.last_sequence)
        });
        live.or_else(|| self.tombstones.get(entity_id).copied())
    }

    fn row(&self, entity_id: &str) -> Option<&AuthoritativeRow> {
        let scope = self.locations.get(entity_id)?;
        self.scopes.get(scope)?.rows.get(entity_id)
    }

    fn remove_row(&mut self, entity_id: &str) -> Option<AuthoritativeRow> {
        let scope = self.locations.remove(entity_id)?;
        let rows = self.scopes.get_mut(&scope)?;
        let row = rows.rows.remove(entity_id)?;
        rows.order.remove(&row.arrival);
        Some(row)
    }

    fn apply(&mut self, op: &Operation) -> bool {
        if let Some(last) = self.last_sequence(&op.entity_id) {
            if op.sequence <= last {
                return false;
            }
        }

        match op.kind {
            OpKind::Insert | OpKind::Update => {
                let scope = op.scope_key().to_string();
                let same_scope = self.locations.get(&op.entity_id) == Some(&scope);
                if same_scope {
                    if let Some(row) = self
                        .scopes
                        .get_mut(&scope)
                        .and_then(|rows| rows.rows.get_mut(&op.entity_id))
                    {
                        row.entity = op.snapshot.clone();
                        row.last_sequence = op.sequence;
                        return true;
                    }
                }

                // New row, resurrected row, or a row that changed scope
                self.remove_row(&op.entity_id);
                self.tombstones.remove(&op.entity_id);
                self.next_arrival += 1;
                let arrival = self.next_arrival;
                let rows = self.scopes.entry(scope.clone()).or_default();
                rows.order.insert(arrival, op.entity_id.clone());
                rows.rows.insert(
                    op.entity_id.clone(),
                    AuthoritativeRow {
                        entity: op.snapshot.clone(),
                        arrival,
                        last_sequence: op.sequence,
                    },
                );
                self.locations.insert(op.entity_id.clone(), scope);
            }
            OpKind::Delete => {
                self.remove_row(&op.entity_id);
                self.tombstones.insert(op.entity_id.clone(), op.sequence);
            }
        }
        true
    }

    /// Drop rows of `scopes` that a fresh snapshot did not re-deliver
    fn prune(&mut self, scopes: &BTreeSet<String>, seen: &HashSet<String>) -> usize {
        let stale: Vec<String> = scopes
            .iter()
            .filter_map(|scope| self.scopes.get(scope))
            .flat_map(|rows| rows.rows.keys())
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();

        for id in &stale {
            if let Some(row) = self.remove_row(id) {
                self.tombstones.insert(id.clone(), row.last_sequence);
            }
        }
        stale.len()
    }

    fn project(&self, scope_key: &str) -> Vec<ProjectedEntity> {
        let pending: Vec<&ClientMutation> = self
            .ledger
            .pending()
            .filter(|m| m.scope_key == scope_key)
            .collect();

        let overlay = |entity: &mut Entity, entity_id: &str| -> Option<String> {
            let mut latest = None;
            for mutation in pending.iter().filter(|m| m.entity_id == entity_id) {
                entity.merge_fields(&mutation.payload);
                latest = Some(mutation.mutation_id.clone());
            }
            latest
        };

        let mut projected = Vec::new();
        if let Some(rows) = self.scopes.get(scope_key) {
            for id in rows.order.values() {
                let Some(row) = rows.rows.get(id) else {
                    continue;
                };
                let mut entity = row.entity.clone();
                let mutation_id = overlay(&mut entity, id);
                projected.push(ProjectedEntity {
                    entity,
                    status: if mutation_id.is_some() {
                        RowStatus::Pending
                    } else {
                        RowStatus::Confirmed
                    },
                    mutation_id,
                });
            }
        }

        // Creates the feed has not shown yet, in issue order
        let unseen_creates = pending.iter().filter(|m| {
            m.kind == MutationKind::Create && !self.locations.contains_key(&m.entity_id)
        });
        for create in unseen_creates {
            let mut entity = create.optimistic_entity();
            entity.fields.remove(fields::ID);
            let mutation_id = overlay(&mut entity, &create.entity_id);
            let row = ProjectedEntity {
                entity,
                status: RowStatus::Pending,
                mutation_id,
            };

            let anchor = match &create.placement {
                Placement::Append => None,
                Placement::After(anchor_id) => projected
                    .iter()
                    .position(|p| &p.entity.id == anchor_id),
            };
            match anchor {
                Some(index) => projected.insert(index + 1, row),
                None => projected.push(row),
            }
        }

        projected
    }

    fn scope_of(&self, entity_id: &str) -> Option<String> {
        self.locations.get(entity_id).cloned().or_else(|| {
            self.ledger
                .pending_for_entity(entity_id)
                .find(|m| m.kind == MutationKind::Create)
                .map(|m| m.scope_key.clone())
        })
    }
}

/// Combines the authoritative feed state with pending optimistic mutations
/// into the lists the UI renders, and publishes a revision on every visible
/// change.
pub struct MergedViewProjector {
    state: Mutex<ProjectorState>,
    revision: watch::Sender<u64>,
    stats: SharedSyncStats,
}

impl Default for MergedViewProjector {
    fn default() -> Self {
        Self::new(SharedSyncStats::new())
    }
}

impl MergedViewProjector {
    pub fn new(stats: SharedSyncStats) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(ProjectorState::default()),
            revision,
            stats,
        }
    }

    fn publish(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Merge one feed operation. Returns false (and publishes nothing) for a
    /// redelivered or stale operation.
    pub fn apply(&self, op: &Operation) -> bool {
        let applied = self.state.lock().apply(op);
        if applied {
            trace!(
                entity_id = %op.entity_id,
                sequence = op.sequence,
                kind = op.kind.as_str(),
                "Applied operation"
            );
            self.stats.record_operation(op.kind);
            self.publish();
        } else {
            self.stats.record_duplicate();
        }
        applied
    }

    /// Ordered rows of `scope_key`: authoritative order, then pending creates
    pub fn project(&self, scope_key: &str) -> Vec<ProjectedEntity> {
        self.state.lock().project(scope_key)
    }

    /// Rows of `scope_key` grouped by the value of `field` (kanban columns).
    /// Rows without the field are grouped under the empty key.
    pub fn project_by_group(
        &self,
        scope_key: &str,
        field: &str,
    ) -> BTreeMap<String, Vec<ProjectedEntity>> {
        let mut groups: BTreeMap<String, Vec<ProjectedEntity>> = BTreeMap::new();
        for row in self.project(scope_key) {
            let key = row.entity.field_str(field).unwrap_or_default().to_string();
            groups.entry(key).or_default().push(row);
        }
        groups
    }

    /// Merged row for one entity
    pub fn entity(&self, entity_id: &str) -> Option<ProjectedEntity> {
        let state = self.state.lock();
        let scope = state.scope_of(entity_id)?;
        state
            .project(&scope)
            .into_iter()
            .find(|row| row.entity.id == entity_id)
    }

    pub fn scope_of(&self, entity_id: &str) -> Option<String> {
        self.state.lock().scope_of(entity_id)
    }

    /// The feed's copy of an entity, without any overlay
    pub fn authoritative(&self, entity_id: &str) -> Option<Entity> {
        self.state.lock().row(entity_id).map(|row| row.entity.clone())
    }

    pub fn mutation(&self, mutation_id: &str) -> Option<ClientMutation> {
        self.state.lock().ledger.get(mutation_id).cloned()
    }

    pub fn mutation_status(&self, mutation_id: &str) -> Option<MutationStatus> {
        self.state.lock().ledger.status(mutation_id)
    }

    pub fn pending_mutations(&self) -> Vec<ClientMutation> {
        self.state.lock().ledger.pending().cloned().collect()
    }

    /// True once the snapshot (or resume backlog) of handle `handle_id` has
    /// been fully applied
    pub fn is_synced_with(&self, handle_id: u64) -> bool {
        self.state.lock().synced_handle == Some(handle_id)
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Observe revisions; a change means some projection may differ
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub(crate) fn track(&self, mutation: ClientMutation) -> Result<(), SyncError> {
        self.state.lock().ledger.record(mutation)?;
        self.publish();
        Ok(())
    }

    /// Apply the confirming operation (if given) and mark the mutation
    /// confirmed in one step, so the row never flips back to its old state
    pub(crate) fn confirm(&self, mutation_id: &str, op: Option<&Operation>) -> bool {
        let (applied, confirmed) = {
            let mut state = self.state.lock();
            let applied = op.is_some_and(|op| state.apply(op));
            (applied, state.ledger.mark_confirmed(mutation_id))
        };
        if let (true, Some(op)) = (applied, op) {
            self.stats.record_operation(op.kind);
        }
        if applied || confirmed {
            self.publish();
        }
        confirmed
    }

    /// Mark the mutation failed, which removes its overlay
    pub(crate) fn fail(&self, mutation_id: &str) -> bool {
        let failed = self.state.lock().ledger.mark_failed(mutation_id);
        if failed {
            self.publish();
        }
        failed
    }

    /// Feed this projection from one handle until it ends
    pub fn attach(self: &Arc<Self>, handle: &ShapeHandle) -> JoinHandle<()> {
        let projector = self.clone();
        let messages = handle.from_open();
        let id = handle.id();
        let fresh = handle.is_fresh();
        let scopes = handle.spec().scopes.clone();
        tokio::spawn(async move { projector.consume(id, messages, fresh, scopes).await })
    }

    /// Feed this projection from whichever handle is current, following
    /// reconnects until the publisher goes away
    pub fn follow(
        self: &Arc<Self>,
        mut handles: watch::Receiver<Option<ShapeHandle>>,
    ) -> JoinHandle<()> {
        let projector = self.clone();
        tokio::spawn(async move {
            loop {
                let current = {
                    let handle = handles.borrow_and_update();
                    handle
                        .as_ref()
                        .map(|h| (h.id(), h.from_open(), h.is_fresh(), h.spec().scopes.clone()))
                };
                if let Some((id, messages, fresh, scopes)) = current {
                    projector.consume(id, messages, fresh, scopes).await;
                }
                if handles.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    async fn consume(
        &self,
        handle_id: u64,
        mut messages: BoxStream<'static, ShapeMessage>,
        fresh: bool,
        scopes: BTreeSet<String>,
    ) {
        let mut seen: Option<HashSet<String>> = fresh.then(HashSet::new);
        while let Some(message) = messages.next().await {
            match message {
                ShapeMessage::Operation(op) => {
                    if let Some(seen) = seen.as_mut() {
                        seen.insert(op.entity_id.clone());
                    }
                    self.apply(&op);
                }
                ShapeMessage::UpToDate { cursor } => {
                    let pruned = {
                        let mut state = self.state.lock();
                        state.synced_handle = Some(handle_id);
                        seen.take()
                            .map_or(0, |seen| state.prune(&scopes, &seen))
                    };
                    if pruned > 0 {
                        debug!(pruned, "Pruned rows missing from fresh snapshot");
                    }
                    debug!(handle = handle_id, cursor, "Projection up to date");
                    self.publish();
                }
            }
        }
    }
}
