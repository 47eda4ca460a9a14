//! MRP relay server: encrypted TCP sessions, credential log in, relay,
//! admin broadcast and offline message buffering.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
/// Server side of the key exchange and stream setup.
pub mod handshake;
/// Bitset id allocator for connections and users.
pub mod id_pool;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Argon2id password hashing.
pub mod password;
/// Live connections and the user → connection index.
pub mod registry;
pub mod router;
/// Accept loop and shared server state.
pub mod server;
pub mod store;
/// Client session tokens.
pub mod token;
pub mod transport;

pub use server::{run, run_with_shutdown, ServerState};
