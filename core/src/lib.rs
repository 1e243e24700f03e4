//! Shared core for the Sentinel endpoint processes.
//!
//! Everything the agent, supervisor, and helper must agree on lives here:
//! the wire frame model, the supervisor handshake files, local IPC framing,
//! the config/identity store, path resolution, and digest helpers.

pub mod backoff;
pub mod config;
pub mod frames;
pub mod handshake;
pub mod hashing;
pub mod ipc;
pub mod paths;
