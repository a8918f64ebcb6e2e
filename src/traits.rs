use serde_json::Value;

use crate::document::Document;
use crate::document::Query;
use crate::error::DbError;
use crate::types::LogId;
use crate::types::TailPoll;

/// Opens database connections. One connector is shared by the pool and the replicator; each of them then owns the
/// connections it opened exclusively.
pub trait Connector: Send + Sync + 'static {
    /// Human readable address, for logs and errors.
    fn address(&self) -> String;

    fn connect(&self) -> Result<Box<dyn Connection>, DbError>;
}

/// A live connection to the document database. Closed when dropped.
pub trait Connection: Send {
    fn find(&mut self, collection: &str, query: &Query) -> Result<Vec<Document>, DbError>;

    fn insert(&mut self, collection: &str, document: &Document) -> Result<(), DbError>;

    /// Returns the number of affected documents. With `upsert` a missing document is created and counted.
    fn update(&mut self, collection: &str, filter: &Document, update: &Document, upsert: bool)
        -> Result<u64, DbError>;

    fn delete(&mut self, collection: &str, filter: &Document) -> Result<u64, DbError>;

    fn ensure_index(&mut self, collection: &str, keys: &Document, unique: bool) -> Result<(), DbError>;

    /// Execute a raw database command and return its reply document.
    fn run_command(&mut self, command: &Document) -> Result<Document, DbError>;

    /// Position of the most recent document in a collection, if any.
    fn latest_position(&mut self, collection: &str) -> Result<Option<LogId>, DbError>;

    /// Open a tailing cursor returning documents inserted strictly after `after` (or everything if `None`).
    fn tail(&mut self, collection: &str, after: Option<LogId>) -> Result<Box<dyn TailCursor>, DbError>;
}

pub trait TailCursor: Send {
    fn poll(&mut self) -> Result<TailPoll, DbError>;
}

/// A cache the [`Replicator`](crate::replicator::Replicator) keeps in sync with the database.
pub trait Replicable: Send + Sync + 'static {
    /// Cache name for logging.
    fn name(&self) -> &str;

    /// The collection whose change-log entries apply to this cache.
    fn collection(&self) -> &str;

    /// Bulk-load every row. Must leave the current content intact on failure.
    fn populate(&self) -> bool;

    /// Re-read one row and reconcile it with the cache. Must be idempotent.
    fn replicate(&self, id: &Value) -> bool;
}
