//! # geofs
//!
//! A simplified distributed file store in the GFS mold, with one twist:
//! replica placement and client routing are driven by a weighted score
//! combining geographic proximity and free-space pressure.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             Coordinator                 │
//! │  (metadata, placement, control loops)   │
//! │   - file → chunk map, persisted JSON    │
//! │   - membership reaper                   │
//! │   - replication repair worker           │
//! └───────────┬─────────────────────────────┘
//!             │ framed TCP
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌──▼───────────┐
//! │ Storage 1  │   │ Storage 2  │   │ Storage 3    │
//! │ (chunks on │   │            │   │              │
//! │  disk, 2PC)│   │            │   │              │
//! └────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! Files are split into fixed-size chunks; each chunk is written through a
//! primary-driven two-phase commit across a ranked replica set and repaired
//! back to the target replica count when servers come and go.
//!
//! ## Usage
//!
//! ### Start the coordinator
//! ```bash
//! geofs-coordinator --config configs/geofs.toml
//! ```
//!
//! ### Start a storage server
//! ```bash
//! geofs-storage --config configs/geofs.toml --id store-1 --x 0 --y 0 --space 1024
//! ```
//!
//! ### Use the client
//! ```bash
//! geofs --config configs/geofs.toml --id cli-1 --x 5 --y 5 upload ./a.txt /r/a.txt
//! geofs --config configs/geofs.toml --id cli-1 --x 5 --y 5 download /r/a.txt ./out.txt
//! geofs --config configs/geofs.toml --id cli-1 --x 5 --y 5 ls
//! ```

pub mod client;
pub mod common;
pub mod coordinator;
pub mod storage;

// Re-export commonly used types
pub use client::Client;
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;
pub use storage::StorageServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
