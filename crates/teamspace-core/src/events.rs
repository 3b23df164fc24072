use serde::Serialize;

use crate::models::MutationKind;

/// Per-mutation status change, published for the UI layer to render
/// (spinner, revert + toast, "still syncing" hint).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MutationEvent {
    Issued {
        mutation_id: String,
        entity_id: String,
        kind: MutationKind,
    },
    Confirmed {
        mutation_id: String,
        entity_id: String,
    },
    /// Remote write failed; the optimistic overlay has been removed
    Failed {
        mutation_id: String,
        entity_id: String,
        message: String,
    },
    /// Write succeeded but the feed has not shown it yet. The overlay stays.
    ConfirmationTimedOut {
        mutation_id: String,
        entity_id: String,
    },
}

impl MutationEvent {
    pub fn mutation_id(&self) -> &str {
        match self {
            MutationEvent::Issued { mutation_id, .. }
            | MutationEvent::Confirmed { mutation_id, .. }
            | MutationEvent::Failed { mutation_id, .. }
            | MutationEvent::ConfirmationTimedOut { mutation_id, .. } => mutation_id,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            MutationEvent::Issued { entity_id, .. }
            | MutationEvent::Confirmed { entity_id, .. }
            | MutationEvent::Failed { entity_id, .. }
            | MutationEvent::ConfirmationTimedOut { entity_id, .. } => entity_id,
        }
    }
}
