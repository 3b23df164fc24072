//! Engine-wide constants
//!
//! Centralized location for field names and tuning values that are
//! shared by the coordinator, the projector and the backends.

/// Field every synchronized table is scoped by (the project a row belongs to)
pub const SCOPE_FIELD: &str = "projectId";

/// Payload field carrying the correlation key of an update mutation.
/// Creates correlate on the entity id itself.
pub const CORRELATION_FIELD: &str = "clientMutationId";

/// Field a kanban card is grouped by (its status column)
pub const GROUP_FIELD: &str = "statusId";

/// How long a written mutation may wait for its feed confirmation
pub const CONFIRMATION_TIMEOUT_MS: u64 = 10_000;

/// Longest chat message accepted by the composer
pub const MAX_MESSAGE_LENGTH: usize = 500;

/// Number of feed messages a shape handle keeps for late subscribers
pub const REPLAY_CAPACITY: usize = 1024;

/// Settled (confirmed or failed) mutations kept around for status queries
pub const SETTLED_MUTATION_CAPACITY: usize = 512;

// Reconnect backoff defaults
pub const RECONNECT_INITIAL_DELAY_MS: u64 = 250;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const RECONNECT_MULTIPLIER: u32 = 2;

/// Field names of the synchronized tables
pub mod fields {
    pub const CONTENT: &str = "content";
    pub const SENDER_ID: &str = "senderId";
    pub const CREATED_AT: &str = "createdAt";
    pub const NAME: &str = "name";
    pub const DESCRIPTION: &str = "description";
    pub const STATUS_ID: &str = "statusId";
    pub const PRIORITY: &str = "priority";
    pub const ID: &str = "id";
    pub const READ_BY_USER_IDS: &str = "readByUserIds";
}

/// List fields whose updates add entries instead of replacing the list
pub const APPEND_FIELDS: &[&str] = &[fields::READ_BY_USER_IDS];
