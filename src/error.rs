use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by the database layer.
///
/// These never escape a [`Task`](crate::task::Task) or a single replicator cycle as panics or unwinding; they are
/// logged where they happen and travel back to a caller only as a resolved signal value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    /// The database cannot be reached; raised when a worker or the replicator (re)connects.
    #[error("connection to {address} failed: {message}")]
    Connection { address: String, message: String },

    /// A single database operation failed: bad filter, constraint violation, transient server error.
    #[error("{op} on '{collection}' failed: {message}")]
    Operation {
        op:         &'static str,
        collection: String,
        message:    String,
    },

    /// The server has discarded a tailing cursor.
    #[error("tailing cursor on '{0}' is dead")]
    CursorDead(String),

    /// Entries following the tailing position were evicted from a capped collection before they were read.
    #[error("lost the tailing position in '{0}': entries were evicted before they were read")]
    PositionLost(String),

    /// A completion signal lost its promise before the value was produced.
    #[error("the task was dropped before producing a result")]
    Abandoned,
}

impl DbError {
    pub fn connection(address: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            address: address.into(),
            message: message.to_string(),
        }
    }

    pub fn operation(op: &'static str, collection: impl Into<String>, message: impl ToString) -> Self {
        Self::Operation {
            op,
            collection: collection.into(),
            message: message.to_string(),
        }
    }

    #[inline]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Logical failures of the identity cache API. These are expected conditions, not database faults.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("{0} doesn't exist")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A synchronous round-trip to the database failed. Treat as transient; it does not mean "absent".
    #[error("database unavailable: {0}")]
    Unavailable(#[from] DbError),

    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("the pool has already been started")]
    AlreadyStarted,

    #[error("failed to start database thread pool: {0}")]
    NoWorkers(#[source] DbError),
}

#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error("initial population of cache '{0}' failed")]
    PopulateFailed(String),

    #[error("the replicator has already been started")]
    AlreadyStarted,

    #[error("cannot start the replicator thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Read {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot build {what}: {source}")]
    Builder {
        what:   &'static str,
        #[source]
        source: fieldx::error::FieldXError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Replicator(#[from] ReplicatorError),

    #[error(transparent)]
    Db(#[from] DbError),
}
