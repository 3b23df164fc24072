//! Interfaces consumed from the workspace backend: the shape feed
//! (`openShape`) and the write endpoint (`writeEntity`).

pub mod http;
pub mod memory;

use std::collections::BTreeSet;
use std::fmt;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{FeedError, WriteError};
use crate::models::{Entity, MutationKind, Operation, Table};

pub use http::HttpEntityWriter;
pub use memory::MemoryBackend;

/// Stream of feed messages for one opened shape
pub type ShapeFeed = BoxStream<'static, Result<ShapeMessage, FeedError>>;

/// A filtered collection: rows of `table` whose scope key is one of `scopes`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeSpec {
    pub table: Table,
    pub scopes: BTreeSet<String>,
}

impl ShapeSpec {
    pub fn new<I, S>(table: Table, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table,
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.scopes.contains(&entity.scope_key)
    }

    /// Where-clause in the backend's shape syntax
    pub fn where_clause(&self) -> String {
        let scopes = self
            .scopes
            .iter()
            .map(|scope| format!("'{}'", scope.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            r#"ARRAY["{}"]::text[] <@ ARRAY[{}]::text[]"#,
            self.table.scope_field(),
            scopes
        )
    }
}

impl fmt::Display for ShapeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#""{}" where {}"#, self.table, self.where_clause())
    }
}

/// One item of a shape feed
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeMessage {
    Operation(Operation),
    /// The initial snapshot (or resumed backlog) has been fully delivered;
    /// `cursor` is the feed position a later resume can start after.
    UpToDate { cursor: u64 },
}

impl ShapeMessage {
    pub fn sequence(&self) -> u64 {
        match self {
            ShapeMessage::Operation(op) => op.sequence,
            ShapeMessage::UpToDate { cursor } => *cursor,
        }
    }
}

/// Server-pushed change feed (`openShape`).
///
/// With `resume_after = None` the feed starts with a consistent snapshot of
/// every matching row; with a cursor it replays the operations after it.
/// Either way it then tails live changes until the connection drops.
pub trait ShapeSource: Send + Sync {
    fn open_shape<'a>(
        &'a self,
        spec: &'a ShapeSpec,
        resume_after: Option<u64>,
    ) -> BoxFuture<'a, Result<ShapeFeed, FeedError>>;
}

/// Remote write carrying the mutation's correlation key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub mutation_id: String,
    pub table: Table,
    pub kind: MutationKind,
    pub entity_id: String,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub entity_id: String,
}

/// Request/response write endpoint (`writeEntity`)
pub trait EntityWriter: Send + Sync {
    fn write_entity<'a>(
        &'a self,
        request: &'a WriteRequest,
    ) -> BoxFuture<'a, Result<WriteAck, WriteError>>;
}
