use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::document::Document;

/// Position of a document in a collection's insertion order. Only compared and stored, never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub u64);

impl Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One document read from a tailed collection.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id:       LogId,
    pub document: Document,
}

impl LogEntry {
    /// Name of the collection the logged change applies to.
    pub fn collection(&self) -> Option<&str> {
        self.document.get("collection").and_then(Value::as_str)
    }

    /// Identifier of the changed row.
    pub fn row_id(&self) -> Option<&Value> {
        self.document.get("id")
    }
}

/// Result of polling a tailing cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum TailPoll {
    Entry(LogEntry),
    /// Nothing new yet.
    Empty,
    /// The server dropped the cursor; it has to be reopened from the last seen position.
    Dead,
}

/// Lifecycle of the replicator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ReplicatorState {
    /// Never started.
    Idle,
    Disconnected,
    Populating,
    Tailing,
    Stopped,
}
