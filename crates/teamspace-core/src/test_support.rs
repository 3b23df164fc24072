use std::sync::Arc;
use std::time::Duration;

use crate::backend::{MemoryBackend, ShapeSpec};
use crate::config::SyncConfig;
use crate::coordinator::MutationCoordinator;
use crate::models::Table;
use crate::projector::MergedViewProjector;
use crate::shape::ShapeSubscription;
use crate::stats::SharedSyncStats;
use crate::supervisor::ShapeSupervisor;

/// Wait (bounded) until `condition` holds for the projector, re-checking on
/// every published revision
pub(crate) async fn wait_for_projection<F>(projector: &MergedViewProjector, condition: F)
where
    F: Fn(&MergedViewProjector) -> bool,
{
    let mut revisions = projector.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if condition(projector) {
                return;
            }
            if revisions.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "projection condition not reached");
    assert!(condition(projector), "projection condition not reached");
}

/// Engine pieces wired against an in-memory backend, shape scoped to `proj_1`
pub(crate) struct Harness {
    pub backend: MemoryBackend,
    /// Dropping it shuts the feed down
    _supervisor: ShapeSupervisor,
    pub projector: Arc<MergedViewProjector>,
    pub coordinator: MutationCoordinator,
    pub stats: SharedSyncStats,
}

impl Harness {
    pub async fn start(table: Table, backend: MemoryBackend) -> Self {
        Self::start_with(table, backend, SyncConfig::default()).await
    }

    pub async fn start_with(table: Table, backend: MemoryBackend, config: SyncConfig) -> Self {
        let stats = SharedSyncStats::new();
        let supervisor = ShapeSupervisor::start(
            ShapeSubscription::new(Arc::new(backend.clone())),
            ShapeSpec::new(table, ["proj_1"]),
            config.reconnect.clone(),
            stats.clone(),
        )
        .await
        .expect("shape opens");

        let projector = Arc::new(MergedViewProjector::new(stats.clone()));
        projector.follow(supervisor.handles());

        let coordinator = MutationCoordinator::new(
            table,
            config,
            Arc::new(backend.clone()),
            projector.clone(),
            supervisor.handles(),
            stats.clone(),
        );

        if let Some(handle) = supervisor.current() {
            handle.wait_until_live().await.expect("shape goes live");
            let id = handle.id();
            drop(handle);
            wait_for_projection(&projector, |p| p.is_synced_with(id)).await;
        }

        Self {
            backend,
            _supervisor: supervisor,
            projector,
            coordinator,
            stats,
        }
    }

    pub async fn wait_for_row(&self, entity_id: &str) {
        wait_for_projection(&self.projector, |p| p.authoritative(entity_id).is_some()).await;
    }
}
