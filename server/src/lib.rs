//! # Vehicle Sync Server Library
//!
//! This library holds the per-connection state of the multiplayer vehicle
//! server and the registry used to find connected clients. Every connected
//! participant owns a set of vehicles, their last reported positions, a queue
//! of packets waiting to be sent and the socket they arrive on.
//!
//! ## Core Responsibilities
//!
//! ### Per-Client State
//! A [`Client`] is touched concurrently by several threads: its own reader
//! (spawning, editing and moving vehicles), the broadcast thread (reading
//! every client's vehicles and positions) and the housekeeping thread
//! (checking ping age and disconnecting). State is split into independently
//! locked parts so that high-frequency position updates never wait on
//! vehicle spawns or on the outbound queue.
//!
//! ### Client Lookup
//! The [`Server`] keeps weak handles to its clients. Looking a client up by id
//! skips clients that have already been destroyed, and registry membership
//! never keeps a disconnected client alive.
//!
//! ### Failure Tolerance
//! Nothing in the per-client API returns an error. Missing vehicles or
//! positions come back as `None`, deleting a vehicle twice is harmless, and
//! disconnecting an already closed socket is a no-op.
//!
//! ## Architecture Design
//!
//! ### Thread Per Connection
//! The network layer uses plain OS threads: one reader and one writer per
//! connection, plus one housekeeping and one broadcast thread per server.
//! Every critical section is short and none of them performs I/O.
//!
//! ### Lock Layout
//! Each client has three data locks (vehicles, positions, outbound queue)
//! that are never held together. The registry has its own read-write lock
//! and traversal runs on a snapshot, so callbacks may modify the registry.
//!
//! ## Module Organization
//!
//! ### Client Module (`client`)
//! Composes the per-client parts into one shareable unit:
//! - [`vehicles`]: vehicle list, id allocation, unicycle-aware car count
//! - [`positions`]: last raw position per vehicle id
//! - [`outbound`]: FIFO of encoded frames for the writer thread
//! - [`transport`]: socket with idempotent shutdown-then-close
//! - [`liveness`]: monotonic last-ping timestamp
//!
//! ### Server Module (`server`)
//! Registry of weak client handles with early-exit traversal, lookup by id,
//! broadcast helpers and ping timeout checks.
//!
//! ### Network Module (`network`)
//! TCP accept loop and the reader, writer, housekeeping and broadcast threads.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{NetworkServer, ServerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         host: "0.0.0.0".to_string(),
//!         port: 30814,
//!         ..Default::default()
//!     };
//!
//!     // Blocks in the accept loop; background threads handle broadcast
//!     // and ping timeouts
//!     NetworkServer::bind(config)?.run()?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod liveness;
pub mod network;
pub mod outbound;
pub mod positions;
pub mod server;
pub mod transport;
pub mod vehicles;

pub use client::Client;
pub use config::ServerConfig;
pub use error::ServerError;
pub use network::NetworkServer;
pub use server::Server;
pub use transport::{TcpTransport, Transport, TransportState};
pub use vehicles::VehicleData;
