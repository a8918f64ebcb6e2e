//! # idcache
//!
//! Replicated in-process caches of user and group identities, kept in front of a document database by a
//! self-scaling pool of worker threads.
//!
//! # The Basics
//!
//! Every process of a cluster keeps the complete set of users and groups in memory. Lookups never leave the process;
//! changes are applied locally first and persisted asynchronously:
//!
//! - A caller mutates a cache, e.g. with [`IdentityCache::create`](cache::IdentityCache::create).
//! - The cache updates its maps at once and queues a write [`Task`](task::Task) on the [`Pool`](pool::Pool).
//! - A [`Worker`](worker::Worker) executes the task over its own database connection and appends a note naming the
//!   changed row to a capped change log.
//! - The [`Replicator`](replicator::Replicator) of every process tails that log and asks the owning cache to reload
//!   the row, so all processes converge on what the database holds.
//!
//! The pool grows by one worker when its queue stays longer than the contention threshold and shrinks back to one
//! worker once it has been idle. Shutting it down drains the queue first, so no accepted write is lost.
//!
//! # Database Access
//!
//! The crate talks to the database only through the [`Connector`](traits::Connector),
//! [`Connection`](traits::Connection) and [`TailCursor`](traits::TailCursor) traits. An in-memory implementation,
//! [`MemoryDatabase`](backend::memory::MemoryDatabase), is provided for tests and for the bundled simulation; it also
//! models outages, expiring cursors and capped collections.
//!
//! # Wiring It Together
//!
//! [`Storage`](storage::Storage) starts the pool, prepares the change log and indexes, loads both caches and starts
//! replicating, all from one [`Config`](config::Config).
//!
//! The `simulation` feature adds the `idcache-sim` binary, which runs several nodes over one shared database with
//! concurrent random mutations and then verifies that every node converged.

pub mod backend;
pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod pool;
pub mod queue;
pub mod record;
pub mod replicator;
pub mod signal;
#[cfg(feature = "simulation")]
pub mod simulation;
pub mod storage;
pub mod task;
pub mod traits;
pub mod types;
pub mod worker;

pub use serde_json;

#[doc(inline)]
pub use cache::IdentityCache;
#[doc(inline)]
pub use pool::Pool;
#[doc(inline)]
pub use replicator::Replicator;
#[doc(inline)]
pub use storage::Storage;

pub mod prelude {
    pub use crate::backend::memory::MemoryDatabase;
    pub use crate::cache::IdentityCache;
    pub use crate::config::Config;
    pub use crate::config::DatabaseConfig;
    pub use crate::config::PoolConfig;
    pub use crate::config::ReplicatorConfig;
    pub use crate::doc;
    pub use crate::document::Document;
    pub use crate::document::Query;
    pub use crate::error::*;
    pub use crate::pool::Pool;
    pub use crate::record::Group;
    pub use crate::record::Record;
    pub use crate::record::User;
    pub use crate::replicator::Replicator;
    pub use crate::signal::Signal;
    pub use crate::storage::Storage;
    pub use crate::task::Task;
    pub use crate::traits::*;
    pub use crate::types::*;
}
