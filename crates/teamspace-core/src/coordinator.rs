//! Optimistic mutation coordinator.
//!
//! `submit` applies a mutation to the projection before returning, then a
//! spawned task sends the remote write and waits until the shape feed shows
//! the result. The returned [`PendingMutation`] resolves only when both have
//! happened, so a caller never acts on an entity that is not yet visible in
//! the subscribed views.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{EntityWriter, WriteRequest};
use crate::config::SyncConfig;
use crate::error::{SyncError, WriteError};
use crate::events::MutationEvent;
use crate::matcher::{MatchCanceller, MatchCriteria, PendingMatch, StreamMatcher};
use crate::models::{
    now_millis, ClientMutation, Entity, MutationKind, MutationRequest, MutationStatus, Operation,
    Table,
};
use crate::projector::MergedViewProjector;
use crate::shape::ShapeHandle;
use crate::stats::SharedSyncStats;
use crate::validation;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of a submitted mutation: the confirmed entity as the feed shows it
pub struct PendingMutation {
    mutation_id: String,
    entity_id: String,
    task: JoinHandle<Result<Entity, SyncError>>,
}

impl PendingMutation {
    pub fn mutation_id(&self) -> &str {
        &self.mutation_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl std::fmt::Debug for PendingMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMutation")
            .field("mutation_id", &self.mutation_id)
            .field("entity_id", &self.entity_id)
            .finish()
    }
}

impl Future for PendingMutation {
    type Output = Result<Entity, SyncError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.task
            .poll_unpin(cx)
            .map(|joined| joined.unwrap_or(Err(SyncError::TornDown)))
    }
}

/// Tail of the per-entity write chain
struct ChainLink {
    ticket: u64,
    done: oneshot::Receiver<()>,
}

struct CoordinatorInner {
    table: Table,
    config: SyncConfig,
    writer: Arc<dyn EntityWriter>,
    projector: Arc<MergedViewProjector>,
    handles: watch::Receiver<Option<ShapeHandle>>,
    chains: Mutex<HashMap<String, ChainLink>>,
    next_ticket: AtomicU64,
    outstanding: Mutex<HashMap<String, MatchCanceller>>,
    events: broadcast::Sender<MutationEvent>,
    torn_down: AtomicBool,
    stats: SharedSyncStats,
}

/// Issues optimistic mutations for one table
#[derive(Clone)]
pub struct MutationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl MutationCoordinator {
    pub fn new(
        table: Table,
        config: SyncConfig,
        writer: Arc<dyn EntityWriter>,
        projector: Arc<MergedViewProjector>,
        handles: watch::Receiver<Option<ShapeHandle>>,
        stats: SharedSyncStats,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(CoordinatorInner {
                table,
                config,
                writer,
                projector,
                handles,
                chains: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
                outstanding: Mutex::new(HashMap::new()),
                events,
                torn_down: AtomicBool::new(false),
                stats,
            }),
        }
    }

    pub fn table(&self) -> Table {
        self.inner.table
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn projector(&self) -> &Arc<MergedViewProjector> {
        &self.inner.projector
    }

    pub fn events(&self) -> broadcast::Receiver<MutationEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.is_torn_down()
    }

    /// Apply `request` optimistically and start its remote write.
    ///
    /// Everything that must be visible to the next render (validation, the
    /// pending record, the overlay, the confirmation waiter) happens before
    /// this returns. Local errors are returned here, before any state changes.
    pub fn submit(&self, request: MutationRequest) -> Result<PendingMutation, SyncError> {
        let inner = &self.inner;
        if inner.is_torn_down() {
            return Err(SyncError::TornDown);
        }

        let payload = validation::validate(
            inner.table,
            request.kind,
            &request.entity_id,
            &request.payload,
            &inner.config,
        )?;
        let entity_id = request.entity_id;

        let (mutation_id, scope_key) = match request.kind {
            MutationKind::Create => {
                let mutation_id = request.mutation_id.unwrap_or_else(|| entity_id.clone());
                if mutation_id != entity_id {
                    return Err(SyncError::invalid(
                        "a create is correlated by its entity id; mutation id must match",
                    ));
                }
                if inner.projector.authoritative(&entity_id).is_some() {
                    return Err(SyncError::DuplicateCreate { entity_id });
                }
                let scope_key = payload
                    .get(inner.table.scope_field())
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SyncError::invalid(format!("{} is required", inner.table.scope_field()))
                    })?
                    .to_string();
                (mutation_id, scope_key)
            }
            MutationKind::Update => {
                let mutation_id = request
                    .mutation_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let scope_key = inner.projector.scope_of(&entity_id).ok_or_else(|| {
                    SyncError::UnknownEntity {
                        entity_id: entity_id.clone(),
                    }
                })?;
                (mutation_id, scope_key)
            }
        };

        let handle = inner.handles.borrow().clone().ok_or(SyncError::TornDown)?;

        let mutation = ClientMutation {
            mutation_id: mutation_id.clone(),
            entity_id: entity_id.clone(),
            scope_key,
            kind: request.kind,
            payload,
            status: MutationStatus::Pending,
            issued_at: now_millis(),
            placement: request.placement,
        };
        inner.projector.track(mutation.clone())?;

        let criteria = inner.criteria_for(&mutation);
        let pending_match = StreamMatcher::register(&handle, criteria.clone());
        inner.watch_match(&mutation_id, &pending_match);
        let link = inner.enqueue(&entity_id);

        let mut write_payload = mutation.payload.clone();
        if mutation.kind == MutationKind::Update {
            write_payload.insert(
                inner.config.correlation_field.clone(),
                Value::from(mutation_id.clone()),
            );
        }
        let write = WriteRequest {
            mutation_id: mutation_id.clone(),
            table: inner.table,
            kind: mutation.kind,
            entity_id: entity_id.clone(),
            payload: write_payload,
        };

        info!(
            mutation_id = %mutation_id,
            entity_id = %entity_id,
            kind = ?mutation.kind,
            "Mutation issued"
        );
        inner.stats.record_issued();
        inner.emit(MutationEvent::Issued {
            mutation_id: mutation_id.clone(),
            entity_id: entity_id.clone(),
            kind: mutation.kind,
        });

        let task = tokio::spawn(
            inner
                .clone()
                .drive(mutation, write, criteria, pending_match, link),
        );

        Ok(PendingMutation {
            mutation_id,
            entity_id,
            task,
        })
    }

    /// Wait again for the feed to show a mutation whose confirmation timed
    /// out. Already-visible authoritative state counts as confirmation.
    pub fn retry_confirmation(&self, mutation_id: &str) -> Result<PendingMutation, SyncError> {
        let inner = &self.inner;
        if inner.is_torn_down() {
            return Err(SyncError::TornDown);
        }

        let mutation = inner
            .projector
            .mutation(mutation_id)
            .filter(|m| m.status != MutationStatus::Failed)
            .ok_or_else(|| SyncError::UnknownMutation {
                mutation_id: mutation_id.to_string(),
            })?;

        debug!(mutation_id, entity_id = %mutation.entity_id, "Retrying confirmation");
        let entity_id = mutation.entity_id.clone();
        let criteria = inner.criteria_for(&mutation);
        let deadline = Instant::now() + inner.config.confirmation_timeout();
        let task = tokio::spawn(inner.clone().reconfirm(mutation, criteria, deadline));

        Ok(PendingMutation {
            mutation_id: mutation_id.to_string(),
            entity_id,
            task,
        })
    }

    /// Cancel every outstanding confirmation wait. In-flight writes still
    /// complete but their results are discarded.
    pub fn shutdown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let outstanding: Vec<MatchCanceller> =
            self.inner.outstanding.lock().drain().map(|(_, c)| c).collect();
        for canceller in &outstanding {
            canceller.cancel();
        }
        info!(
            table = %self.inner.table,
            cancelled = outstanding.len(),
            "Mutation coordinator torn down"
        );
    }
}

impl CoordinatorInner {
    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn emit(&self, event: MutationEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn criteria_for(&self, mutation: &ClientMutation) -> MatchCriteria {
        match mutation.kind {
            MutationKind::Create => MatchCriteria::insert_of(mutation.entity_id.clone()),
            MutationKind::Update => MatchCriteria::correlated_update(
                mutation.entity_id.clone(),
                self.config.correlation_field.clone(),
                mutation.mutation_id.clone(),
            ),
        }
    }

    fn watch_match(&self, mutation_id: &str, pending: &PendingMatch) {
        self.outstanding
            .lock()
            .insert(mutation_id.to_string(), pending.canceller());
        // Lost a race with shutdown
        if self.is_torn_down() {
            pending.cancel();
        }
    }

    fn unwatch(&self, mutation_id: &str) {
        self.outstanding.lock().remove(mutation_id);
    }

    /// Join the write chain of `entity_id`
    fn enqueue(
        &self,
        entity_id: &str,
    ) -> (u64, Option<oneshot::Receiver<()>>, oneshot::Sender<()>) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        let previous = self
            .chains
            .lock()
            .insert(
                entity_id.to_string(),
                ChainLink {
                    ticket,
                    done: done_rx,
                },
            )
            .map(|link| link.done);
        (ticket, previous, done_tx)
    }

    fn release(&self, entity_id: &str, ticket: u64) {
        let mut chains = self.chains.lock();
        if chains.get(entity_id).is_some_and(|link| link.ticket == ticket) {
            chains.remove(entity_id);
        }
    }

    async fn drive(
        self: Arc<Self>,
        mutation: ClientMutation,
        request: WriteRequest,
        criteria: MatchCriteria,
        mut pending_match: PendingMatch,
        (ticket, previous, done): (u64, Option<oneshot::Receiver<()>>, oneshot::Sender<()>),
    ) -> Result<Entity, SyncError> {
        let mutation_id = mutation.mutation_id.as_str();

        // Same-entity writes go out in issue order
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        if self.is_torn_down() {
            let _ = done.send(());
            self.release(&mutation.entity_id, ticket);
            return Err(SyncError::TornDown);
        }

        // The feed may show the change before the write call returns
        let mut matched: Option<Result<Operation, SyncError>> = None;
        let written = {
            let mut write = self.writer.write_entity(&request);
            loop {
                tokio::select! {
                    result = &mut write => break result,
                    outcome = &mut pending_match, if matched.is_none() => matched = Some(outcome),
                }
            }
        };

        let _ = done.send(());
        self.release(&mutation.entity_id, ticket);

        if self.is_torn_down() {
            debug!(mutation_id, "Discarding write result after teardown");
            return Err(SyncError::TornDown);
        }

        if let Err(err) = written {
            return match matched {
                Some(Ok(op)) => {
                    warn!(
                        mutation_id,
                        error = %err,
                        "Write reported failure after the feed confirmed it"
                    );
                    self.finish_confirmed(&mutation, Some(&op))
                }
                _ => Err(self.finish_failed(&mutation, err)),
            };
        }

        let deadline = Instant::now() + self.config.confirmation_timeout();
        let outcome = match matched {
            Some(outcome) => outcome,
            None => self.await_match(mutation_id, pending_match, deadline).await,
        };
        self.resolve(&mutation, &criteria, outcome, deadline).await
    }

    async fn reconfirm(
        self: Arc<Self>,
        mutation: ClientMutation,
        criteria: MatchCriteria,
        deadline: Instant,
    ) -> Result<Entity, SyncError> {
        if mutation.status == MutationStatus::Confirmed {
            return self
                .projector
                .authoritative(&mutation.entity_id)
                .ok_or(SyncError::UnknownEntity {
                    entity_id: mutation.entity_id.clone(),
                });
        }
        // Same path as a dropped subscription: check what is visible, then
        // re-register with replay on the current handle
        self.resolve(&mutation, &criteria, Err(SyncError::SubscriptionClosed), deadline)
            .await
    }

    async fn await_match(
        &self,
        mutation_id: &str,
        pending_match: PendingMatch,
        deadline: Instant,
    ) -> Result<Operation, SyncError> {
        tokio::time::timeout_at(deadline, pending_match)
            .await
            .unwrap_or_else(|_| {
                Err(SyncError::ConfirmationTimeout {
                    mutation_id: mutation_id.to_string(),
                })
            })
    }

    /// Turn a match outcome into the mutation's final result, re-registering
    /// on the supervisor's current handle while the subscription keeps closing
    async fn resolve(
        &self,
        mutation: &ClientMutation,
        criteria: &MatchCriteria,
        mut outcome: Result<Operation, SyncError>,
        deadline: Instant,
    ) -> Result<Entity, SyncError> {
        let mutation_id = mutation.mutation_id.as_str();
        loop {
            if self.is_torn_down() {
                return Err(SyncError::TornDown);
            }
            match outcome {
                Ok(op) => return self.finish_confirmed(mutation, Some(&op)),
                Err(SyncError::SubscriptionClosed) => {
                    if self.visible_confirmation(mutation) {
                        return self.finish_confirmed(mutation, None);
                    }
                    let handle = match self.next_live_handle(mutation_id, deadline).await {
                        Ok(handle) => handle,
                        // Publisher gave up: nothing left to re-register on
                        Err(SyncError::SubscriptionClosed) => {
                            self.unwatch(mutation_id);
                            return Err(SyncError::SubscriptionClosed);
                        }
                        Err(err) => {
                            outcome = Err(err);
                            continue;
                        }
                    };
                    debug!(mutation_id, handle = handle.id(), "Re-registering confirmation wait");
                    let pending_match =
                        StreamMatcher::register_replaying(&handle, criteria.clone());
                    drop(handle);
                    self.watch_match(mutation_id, &pending_match);
                    outcome = self.await_match(mutation_id, pending_match, deadline).await;
                }
                Err(SyncError::ConfirmationTimeout { .. }) => {
                    self.unwatch(mutation_id);
                    warn!(mutation_id, entity_id = %mutation.entity_id, "Confirmation timed out");
                    self.stats.record_timeout();
                    self.emit(MutationEvent::ConfirmationTimedOut {
                        mutation_id: mutation_id.to_string(),
                        entity_id: mutation.entity_id.clone(),
                    });
                    return Err(SyncError::ConfirmationTimeout {
                        mutation_id: mutation_id.to_string(),
                    });
                }
                Err(err) => {
                    self.unwatch(mutation_id);
                    return Err(err);
                }
            }
        }
    }

    /// The projection already holds the server's copy of this mutation
    fn visible_confirmation(&self, mutation: &ClientMutation) -> bool {
        let Some(entity) = self.projector.authoritative(&mutation.entity_id) else {
            return false;
        };
        match mutation.kind {
            MutationKind::Create => true,
            MutationKind::Update => {
                entity.field_str(&self.config.correlation_field)
                    == Some(mutation.mutation_id.as_str())
            }
        }
    }

    /// Current handle once it is not ended, bounded by `deadline`
    async fn next_live_handle(
        &self,
        mutation_id: &str,
        deadline: Instant,
    ) -> Result<ShapeHandle, SyncError> {
        let mut handles = self.handles.clone();
        let wait = async {
            loop {
                let current = handles.borrow_and_update().clone();
                match current {
                    None => return Err(SyncError::TornDown),
                    Some(handle) if !handle.state().is_ended() => return Ok(handle),
                    Some(_) => {
                        if handles.changed().await.is_err() {
                            return Err(SyncError::SubscriptionClosed);
                        }
                    }
                }
            }
        };
        match tokio::time::timeout_at(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::ConfirmationTimeout {
                mutation_id: mutation_id.to_string(),
            }),
        }
    }

    fn finish_confirmed(
        &self,
        mutation: &ClientMutation,
        op: Option<&Operation>,
    ) -> Result<Entity, SyncError> {
        let mutation_id = mutation.mutation_id.as_str();
        self.unwatch(mutation_id);
        if self.is_torn_down() {
            return Err(SyncError::TornDown);
        }

        if self.projector.confirm(mutation_id, op) {
            info!(mutation_id, entity_id = %mutation.entity_id, "Mutation confirmed");
            self.stats.record_confirmed();
            self.emit(MutationEvent::Confirmed {
                mutation_id: mutation_id.to_string(),
                entity_id: mutation.entity_id.clone(),
            });
        }

        op.map(|op| op.snapshot.clone())
            .or_else(|| self.projector.authoritative(&mutation.entity_id))
            .ok_or_else(|| SyncError::UnknownEntity {
                entity_id: mutation.entity_id.clone(),
            })
    }

    fn finish_failed(&self, mutation: &ClientMutation, err: WriteError) -> SyncError {
        let mutation_id = mutation.mutation_id.as_str();
        self.unwatch(mutation_id);
        if self.projector.fail(mutation_id) {
            warn!(
                mutation_id,
                entity_id = %mutation.entity_id,
                error = %err,
                "Mutation failed, rolled back"
            );
            self.stats.record_failed();
            self.emit(MutationEvent::Failed {
                mutation_id: mutation_id.to_string(),
                entity_id: mutation.entity_id.clone(),
                message: err.to_string(),
            });
        }
        SyncError::WriteRejected {
            mutation_id: mutation_id.to_string(),
            source: err,
        }
    }
}
