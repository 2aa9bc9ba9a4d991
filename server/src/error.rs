//! Errors surfaced by the network driver.
//!
//! The per-client state never fails; these only cover binding, socket I/O and
//! frame encoding on the outer loop.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Network error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode packet: {0}")]
    Encode(#[from] bincode::Error),
}
