//! Common utilities and types shared across geofs

pub mod config;
pub mod error;
pub mod hash;
pub mod message;
pub mod utils;
pub mod wire;

pub use config::{ClientConfig, Config, CoordinatorConfig, StorageServerConfig};
pub use error::{Error, ErrorKind, Result};
pub use hash::mint_chunk_id;
pub use message::{
    CoordRequest, CoordResponse, FileEntry, GraphClient, GraphData, GraphEdge, GraphNode,
    Location, StorageRequest, StorageResponse,
};
pub use utils::{format_bytes, retry_with_backoff, timestamp_now, timestamp_now_millis};
