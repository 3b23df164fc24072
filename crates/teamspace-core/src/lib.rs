pub mod backend;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ledger;
pub mod matcher;
pub mod models;
pub mod projector;
pub mod reorder;
pub mod runtime;
pub mod shape;
pub mod stats;
pub mod supervisor;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export the engine surface at crate root for convenience
pub use backend::{EntityWriter, ShapeMessage, ShapeSource, ShapeSpec, WriteAck, WriteRequest};
pub use config::{ReconnectConfig, SyncConfig};
pub use coordinator::{MutationCoordinator, PendingMutation};
pub use error::{FeedError, SyncError, WriteError};
pub use events::MutationEvent;
pub use matcher::{MatchCanceller, MatchCriteria, PendingMatch, StreamMatcher};
pub use models::{
    ClientMutation, Entity, MutationKind, MutationRequest, MutationStatus, OpKind, Operation,
    Placement, Table,
};
pub use projector::{MergedViewProjector, ProjectedEntity, RowStatus};
pub use reorder::ReorderController;
pub use runtime::SyncRuntime;
pub use shape::{ShapeHandle, ShapeState, ShapeSubscription};
pub use stats::{SharedSyncStats, SyncStats};
pub use supervisor::ShapeSupervisor;
