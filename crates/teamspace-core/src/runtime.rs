use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::{EntityWriter, ShapeSource, ShapeSpec};
use crate::config::SyncConfig;
use crate::coordinator::{MutationCoordinator, PendingMutation};
use crate::error::{FeedError, SyncError};
use crate::events::MutationEvent;
use crate::models::MutationRequest;
use crate::projector::{MergedViewProjector, ProjectedEntity};
use crate::reorder::ReorderController;
use crate::shape::{ShapeHandle, ShapeSubscription};
use crate::stats::{SharedSyncStats, SyncStats};
use crate::supervisor::ShapeSupervisor;

/// One synchronized table for a set of scopes: the supervised shape, its
/// merged projection, and the coordinator issuing mutations against it.
///
/// This is what a view owns; dropping or shutting it down releases the feed.
pub struct SyncRuntime {
    spec: ShapeSpec,
    supervisor: ShapeSupervisor,
    projector: Arc<MergedViewProjector>,
    coordinator: MutationCoordinator,
    reorder: ReorderController,
    follower: JoinHandle<()>,
    stats: SharedSyncStats,
}

impl SyncRuntime {
    pub async fn start(
        source: Arc<dyn ShapeSource>,
        writer: Arc<dyn EntityWriter>,
        spec: ShapeSpec,
        config: SyncConfig,
    ) -> Result<Self, FeedError> {
        let stats = SharedSyncStats::new();
        let supervisor = ShapeSupervisor::start(
            ShapeSubscription::new(source),
            spec.clone(),
            config.reconnect.clone(),
            stats.clone(),
        )
        .await?;

        let projector = Arc::new(MergedViewProjector::new(stats.clone()));
        let follower = projector.follow(supervisor.handles());

        let coordinator = MutationCoordinator::new(
            spec.table,
            config,
            writer,
            projector.clone(),
            supervisor.handles(),
            stats.clone(),
        );
        let reorder = ReorderController::new(coordinator.clone());

        info!(shape = %spec, "Sync runtime started");
        Ok(Self {
            spec,
            supervisor,
            projector,
            coordinator,
            reorder,
            follower,
            stats,
        })
    }

    pub fn spec(&self) -> &ShapeSpec {
        &self.spec
    }

    pub fn projector(&self) -> &Arc<MergedViewProjector> {
        &self.projector
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn reorder(&self) -> &ReorderController {
        &self.reorder
    }

    pub fn current_handle(&self) -> Option<ShapeHandle> {
        self.supervisor.current()
    }

    /// Resolves once the current handle's snapshot is in the projection
    pub async fn wait_until_live(&self) -> Result<(), SyncError> {
        let handle = self.current_handle().ok_or(SyncError::TornDown)?;
        handle.wait_until_live().await?;

        let mut revisions = self.projector.subscribe();
        while !self.projector.is_synced_with(handle.id()) {
            if revisions.changed().await.is_err() {
                return Err(SyncError::TornDown);
            }
        }
        Ok(())
    }

    pub fn submit(&self, request: MutationRequest) -> Result<PendingMutation, SyncError> {
        self.coordinator.submit(request)
    }

    pub fn project(&self, scope_key: &str) -> Vec<ProjectedEntity> {
        self.projector.project(scope_key)
    }

    pub fn on_moved(&self, entity_id: &str, target_group: &str) -> Result<(), SyncError> {
        self.reorder.on_moved(entity_id, target_group)
    }

    pub fn events(&self) -> broadcast::Receiver<MutationEvent> {
        self.coordinator.events()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    /// Cancel outstanding waits and release the feed
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        self.supervisor.shutdown();
        info!(shape = %self.spec, "Sync runtime shut down");
    }
}

impl Drop for SyncRuntime {
    fn drop(&mut self) {
        self.coordinator.shutdown();
        self.follower.abort();
    }
}
