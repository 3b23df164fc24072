use thiserror::Error;

/// Failure of a remote write, as reported by an [`crate::EntityWriter`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("write rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("transport error: {message}")]
    Transport { message: String },
}

/// Failure of a shape feed, as reported by a [`crate::ShapeSource`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("feed transport error: {message}")]
    Transport { message: String },
    #[error("feed unavailable: {message}")]
    Unavailable { message: String },
}

/// Errors surfaced by the sync engine to the UI layer.
///
/// `Cancelled` and `TornDown` are silent: they mean the caller went away and
/// nothing should be rendered for them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("mutation {mutation_id} rejected: {source}")]
    WriteRejected {
        mutation_id: String,
        source: WriteError,
    },
    #[error("mutation {mutation_id} not yet confirmed by the feed")]
    ConfirmationTimeout { mutation_id: String },
    #[error("subscription closed before a matching operation arrived")]
    SubscriptionClosed,
    #[error("invalid payload: {message}")]
    InvalidPayload { message: String },
    #[error("entity {entity_id} already has a pending create")]
    DuplicateCreate { entity_id: String },
    #[error("unknown entity: {entity_id}")]
    UnknownEntity { entity_id: String },
    #[error("unknown mutation: {mutation_id}")]
    UnknownMutation { mutation_id: String },
    #[error("wait cancelled")]
    Cancelled,
    #[error("coordinator torn down")]
    TornDown,
}

impl SyncError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        SyncError::InvalidPayload {
            message: message.into(),
        }
    }

    /// True for outcomes that must not be shown to the user
    pub fn is_silent(&self) -> bool {
        matches!(self, SyncError::Cancelled | SyncError::TornDown)
    }

    /// True when resubmitting (or retrying the match) can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::WriteRejected { .. }
                | SyncError::ConfirmationTimeout { .. }
                | SyncError::SubscriptionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_errors() {
        assert!(SyncError::Cancelled.is_silent());
        assert!(SyncError::TornDown.is_silent());
        assert!(!SyncError::SubscriptionClosed.is_silent());
    }

    #[test]
    fn test_write_rejected_message_includes_cause() {
        let err = SyncError::WriteRejected {
            mutation_id: "m1".to_string(),
            source: WriteError::Rejected {
                status: 403,
                message: "You do not have access to this project".to_string(),
            },
        };
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "mutation m1 rejected: write rejected (403): You do not have access to this project"
        );
    }
}
