//! Storage server implementation
//!
//! Owns a data directory of chunk payloads (one opaque file per chunk id,
//! uncommitted writes staged under `.tmp/`), participates as primary or
//! replica in two-phase writes, and reports liveness and capacity to the
//! coordinator.

pub mod chunk_store;
pub mod server;
pub mod two_phase;

pub use chunk_store::ChunkStore;
pub use server::{ShutdownHandle, StorageServer};
