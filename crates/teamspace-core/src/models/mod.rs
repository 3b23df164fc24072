pub mod entity;
pub mod message;
pub mod mutation;
pub mod task;

pub use entity::{now_millis, Entity, OpKind, Operation, Table};
pub use message::Message;
pub use mutation::{ClientMutation, MutationKind, MutationRequest, MutationStatus, Placement};
pub use task::{Priority, Task};
