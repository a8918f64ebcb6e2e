//! A cluster simulation: several nodes share one in-memory database, random clients mutate users and groups through
//! every node at once, and at the end each node must hold exactly what the database holds.

pub mod client;
pub mod sim_app;

use thiserror::Error;

pub type Result<T, E = SimError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("node {node} did not converge on {kind}s within {waited:?}: {detail}")]
    Diverged {
        node:   usize,
        kind:   &'static str,
        waited: std::time::Duration,
        detail: String,
    },

    #[error("client {0} panicked")]
    ClientPanicked(usize),

    #[error(transparent)]
    Storage(#[from] crate::error::StorageError),

    #[error(transparent)]
    Config(#[from] crate::error::ConfigError),
}
