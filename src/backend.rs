//! Database backends.
//!
//! Anything implementing [`Connector`] can back the pool and the replicator. The crate ships
//! [`MemoryDatabase`](memory::MemoryDatabase), an in-process document store used by tests and by the simulation,
//! and with the `mongodb` feature a MongoDB connector.
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

#[doc(inline)]
pub use crate::traits::Connection;
#[doc(inline)]
pub use crate::traits::Connector;
#[doc(inline)]
pub use crate::traits::TailCursor;
#[doc(inline)]
pub use crate::types::LogEntry;
#[doc(inline)]
pub use crate::types::LogId;
#[doc(inline)]
pub use crate::types::TailPoll;

/// Tell whether a command reply reports success.
pub fn reply_ok(reply: &crate::document::Document) -> bool {
    match reply.get("ok") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(v) => v.as_f64().is_some_and(|n| n != 0.0),
        None => false,
    }
}
