//! Fan-out wait primitive over a shape handle.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

use crate::backend::ShapeMessage;
use crate::error::SyncError;
use crate::models::{OpKind, Operation};
use crate::shape::ShapeHandle;

type Predicate = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

/// Which operation a waiter is looking for
#[derive(Clone)]
pub struct MatchCriteria {
    kinds: HashSet<OpKind>,
    predicate: Predicate,
}

impl fmt::Debug for MatchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchCriteria")
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

impl MatchCriteria {
    pub fn new<I, F>(kinds: I, predicate: F) -> Self
    where
        I: IntoIterator<Item = OpKind>,
        F: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        Self {
            kinds: kinds.into_iter().collect(),
            predicate: Arc::new(predicate),
        }
    }

    /// The insert of `entity_id` (creates correlate on the entity id)
    pub fn insert_of(entity_id: impl Into<String>) -> Self {
        let entity_id = entity_id.into();
        Self::new([OpKind::Insert], move |op| op.entity_id == entity_id)
    }

    /// An operation on `entity_id` whose snapshot carries `mutation_id` in
    /// `field`. Inserts count too: a fresh snapshot re-delivers updated rows
    /// as inserts.
    pub fn correlated_update(
        entity_id: impl Into<String>,
        field: impl Into<String>,
        mutation_id: impl Into<String>,
    ) -> Self {
        let entity_id = entity_id.into();
        let field = field.into();
        let mutation_id = mutation_id.into();
        Self::new([OpKind::Update, OpKind::Insert], move |op| {
            op.entity_id == entity_id && op.correlation_key(&field) == Some(mutation_id.as_str())
        })
    }

    pub fn matches(&self, op: &Operation) -> bool {
        self.kinds.contains(&op.kind) && (self.predicate)(op)
    }
}

/// Cancels a [`PendingMatch`] from anywhere (view unmount, coordinator teardown)
#[derive(Debug, Clone)]
pub struct MatchCanceller(AbortHandle);

impl MatchCanceller {
    pub fn cancel(&self) {
        self.0.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_aborted()
    }
}

/// Resolves with the first operation satisfying its criteria.
///
/// Fails with [`SyncError::SubscriptionClosed`] if the handle ends first.
///
/// A cancelled wait is meant to be discarded, not handled. It still has to
/// yield something if polled, so it yields [`SyncError::Cancelled`], which
/// [`SyncError::is_silent`] reports so callers can drop it without surfacing
/// an error.
pub struct PendingMatch {
    future: Abortable<BoxFuture<'static, Result<Operation, SyncError>>>,
    abort: AbortHandle,
}

impl fmt::Debug for PendingMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingMatch")
            .field("cancelled", &self.abort.is_aborted())
            .finish()
    }
}

impl PendingMatch {
    pub fn canceller(&self) -> MatchCanceller {
        MatchCanceller(self.abort.clone())
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }
}

impl Future for PendingMatch {
    type Output = Result<Operation, SyncError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future
            .poll_unpin(cx)
            .map(|outcome| outcome.unwrap_or(Err(SyncError::Cancelled)))
    }
}

pub struct StreamMatcher;

impl StreamMatcher {
    /// Wait for an operation delivered after this call.
    ///
    /// The waiter is registered before returning, so nothing emitted after
    /// `register` is missed even if the future is first polled much later.
    pub fn register(handle: &ShapeHandle, criteria: MatchCriteria) -> PendingMatch {
        Self::wait(handle.messages(), criteria)
    }

    /// Like [`register`](Self::register), but also considers the handle's
    /// retained history. Used when re-registering after the operation may
    /// already have been delivered.
    pub fn register_replaying(handle: &ShapeHandle, criteria: MatchCriteria) -> PendingMatch {
        Self::wait(handle.replay(), criteria)
    }

    fn wait(
        mut messages: BoxStream<'static, ShapeMessage>,
        criteria: MatchCriteria,
    ) -> PendingMatch {
        let future = async move {
            while let Some(message) = messages.next().await {
                if let ShapeMessage::Operation(op) = message {
                    if criteria.matches(&op) {
                        return Ok(op);
                    }
                }
            }
            Err(SyncError::SubscriptionClosed)
        }
        .boxed();

        let (abort, registration) = AbortHandle::new_pair();
        PendingMatch {
            future: Abortable::new(future, registration),
            abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, ShapeSpec};
    use crate::models::{Entity, Table};
    use crate::shape::ShapeSubscription;
    use serde_json::json;

    async fn live_handle(backend: &MemoryBackend) -> ShapeHandle {
        let handle = ShapeSubscription::new(Arc::new(backend.clone()))
            .open(ShapeSpec::new(Table::Task, ["proj_1"]))
            .await
            .unwrap();
        handle.wait_until_live().await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_independent_waiters_each_resolve() {
        let backend = MemoryBackend::new();
        let handle = live_handle(&backend).await;

        let first = StreamMatcher::register(&handle, MatchCriteria::insert_of("t1"));
        let second = StreamMatcher::register(&handle, MatchCriteria::insert_of("t2"));
        let both = StreamMatcher::register(
            &handle,
            MatchCriteria::new([OpKind::Insert], |op| op.scope_key() == "proj_1"),
        );

        backend.insert_remote(Table::Task, Entity::new("t1", "proj_1"));
        backend.insert_remote(Table::Task, Entity::new("t2", "proj_1"));

        assert_eq!(first.await.unwrap().entity_id, "t1");
        assert_eq!(second.await.unwrap().entity_id, "t2");
        // Matching t1 for `first` did not consume it
        assert_eq!(both.await.unwrap().entity_id, "t1");
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let backend = MemoryBackend::new();
        let handle = live_handle(&backend).await;
        backend.insert_remote(Table::Task, Entity::new("t1", "proj_1"));

        let pending = StreamMatcher::register(
            &handle,
            MatchCriteria::new([OpKind::Update], |op| op.entity_id == "t1"),
        );
        backend.insert_remote(Table::Task, Entity::new("t2", "proj_1"));
        backend.update_remote(Table::Task, "t1", json!({"name": "x"}).as_object().unwrap());

        let op = pending.await.unwrap();
        assert_eq!((op.kind, op.entity_id.as_str()), (OpKind::Update, "t1"));
    }

    #[tokio::test]
    async fn test_correlated_update() {
        let backend = MemoryBackend::new();
        let handle = live_handle(&backend).await;
        backend.insert_remote(Table::Task, Entity::new("t1", "proj_1"));

        let pending = StreamMatcher::register(
            &handle,
            MatchCriteria::correlated_update("t1", "clientMutationId", "mut_b"),
        );
        for mutation_id in ["mut_a", "mut_b"] {
            let patch = json!({ "clientMutationId": mutation_id });
            backend.update_remote(Table::Task, "t1", patch.as_object().unwrap());
        }

        assert_eq!(pending.await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_closed_handle_rejects() {
        let backend = MemoryBackend::new();
        let handle = live_handle(&backend).await;

        let pending = StreamMatcher::register(&handle, MatchCriteria::insert_of("never"));
        backend.disconnect_feeds("gone");

        assert_eq!(pending.await, Err(SyncError::SubscriptionClosed));
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_discarded() {
        let backend = MemoryBackend::new();
        let handle = live_handle(&backend).await;

        let pending = StreamMatcher::register(&handle, MatchCriteria::insert_of("t1"));
        let canceller = pending.canceller();
        canceller.cancel();
        assert!(canceller.is_cancelled());

        backend.insert_remote(Table::Task, Entity::new("t1", "proj_1"));
        let outcome = pending.await;
        assert_eq!(outcome, Err(SyncError::Cancelled));
        assert!(outcome.unwrap_err().is_silent());
    }

    #[tokio::test]
    async fn test_replaying_sees_earlier_operation() {
        let backend = MemoryBackend::new();
        let handle = live_handle(&backend).await;
        let delivered = StreamMatcher::register(&handle, MatchCriteria::insert_of("t1"));
        backend.insert_remote(Table::Task, Entity::new("t1", "proj_1"));
        delivered.await.unwrap();

        let pending = StreamMatcher::register_replaying(&handle, MatchCriteria::insert_of("t1"));
        assert_eq!(pending.await.unwrap().entity_id, "t1");
    }
}
