//! Wire protocol messages
//!
//! Every request/response on every socket is one of these enums, encoded
//! with bincode inside a length-prefixed frame (see [`crate::common::wire`]).
//! The coordinator and the storage servers each speak their own
//! request/response pair; shared payload types live here too.

use crate::common::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A point in the planar topology. Distances between nodes are Euclidean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
}

impl Location {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Location) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Coordinator-side view of one file.
///
/// `chunk_ids` is the read order; `chunk_offsets` holds the live byte count
/// of each chunk; `pending_replication` maps chunk ids to the number of
/// additional replicas still wanted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub total_size: u64,
    pub chunk_ids: Vec<String>,
    pub chunk_locations: HashMap<String, Vec<String>>,
    pub chunk_offsets: HashMap<String, u64>,
    pub last_chunk_id: Option<String>,
    pub last_chunk_offset: u64,
    #[serde(default)]
    pub pending_replication: HashMap<String, usize>,
}

impl FileEntry {
    pub fn new(path: String) -> Self {
        Self {
            path,
            total_size: 0,
            chunk_ids: Vec::new(),
            chunk_locations: HashMap::new(),
            chunk_offsets: HashMap::new(),
            last_chunk_id: None,
            last_chunk_offset: 0,
            pending_replication: HashMap::new(),
        }
    }
}

/// One storage server in the topology snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub address: String,
    pub location: Location,
    pub space_limit: u64,
    pub used_bytes: u64,
}

/// One registered client in the topology snapshot, with its cached ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphClient {
    pub id: String,
    pub location: Location,
    pub ranked_servers: Vec<String>,
}

/// Euclidean distance between two registered nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub distance: f64,
}

/// Topology snapshot returned by `get_graph_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphData {
    pub servers: Vec<GraphNode>,
    pub clients: Vec<GraphClient>,
    pub edges: Vec<GraphEdge>,
}

/// Requests handled by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordRequest {
    RegisterStorageServer {
        id: String,
        address: String,
        location: Location,
        space_limit: u64,
    },
    RegisterClient {
        id: String,
        location: Location,
    },
    /// Liveness report. Storage servers include `location` and
    /// `space_limit` so an unknown address is re-registered in place.
    Heartbeat {
        address: String,
        used_bytes: u64,
        location: Option<Location>,
        space_limit: Option<u64>,
    },
    GetChunkServers {
        client_id: String,
        needed_bytes: u64,
    },
    GetReplicaLocations {
        client_id: String,
        chunk_id: String,
        size: u64,
        exclude: Vec<String>,
    },
    AddFile {
        path: String,
        size: u64,
        chunk_ids: Vec<String>,
    },
    UpdateFileMetadata {
        path: String,
        chunk_id: String,
        locations: Vec<String>,
        size_delta: u64,
    },
    UpdateChunkOffset {
        path: String,
        chunk_id: String,
        new_offset: u64,
    },
    GetFileMetadata {
        path: String,
    },
    ListFiles {
        prefix: Option<String>,
    },
    GetGraphData,
}

/// Responses from the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordResponse {
    Ok,
    ChunkServers { servers: Vec<String> },
    ReplicaLocations { servers: Vec<String> },
    FileMetadata { entry: Option<FileEntry> },
    Files { files: Vec<String> },
    Graph { data: GraphData },
    Error { kind: ErrorKind, message: String },
}

/// Requests handled by a storage server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageRequest {
    /// Canonical write path: this server acts as primary for a two-phase
    /// commit across itself and `replica_servers`.
    StoreChunk {
        chunk_id: String,
        file_path: String,
        data: Vec<u8>,
        replica_servers: Vec<String>,
        client_id: String,
    },
    /// Phase 1: stage the payload under `.tmp/`.
    PrepareChunk {
        chunk_id: String,
        data: Vec<u8>,
    },
    /// Phase 1 of an append: stage the tail bytes under `.tmp/<id>.append`.
    PrepareAppend {
        chunk_id: String,
        data: Vec<u8>,
        offset: u64,
    },
    /// Phase 2: promote the staged payload (rename, or seek-and-append).
    CommitChunk {
        chunk_id: String,
    },
    RollbackChunk {
        chunk_id: String,
    },
    RetrieveChunk {
        chunk_id: String,
        offset: Option<u64>,
        length: Option<u64>,
    },
    /// Append entry point: this server is primary for the tail chunk.
    AppendChunk {
        chunk_id: String,
        file_path: String,
        data: Vec<u8>,
        offset: u64,
        replica_servers: Vec<String>,
    },
    /// Repair push: read the local payload and drive a 2PC onto `targets`.
    ReplicateChunk {
        chunk_id: String,
        targets: Vec<String>,
    },
}

/// Responses from a storage server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageResponse {
    Ok,
    Stored {
        committed: Vec<String>,
    },
    Chunk {
        data: Vec<u8>,
    },
    Appended {
        committed: Vec<String>,
        new_offset: u64,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let a = Location::new(0.0, 0.0);
        let b = Location::new(3.0, 4.0);
        assert!((a.distance(&b) - 5.0).abs() < f64::EPSILON);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_file_entry_default_shape() {
        let entry = FileEntry::new("/r/a.txt".into());
        assert_eq!(entry.total_size, 0);
        assert!(entry.chunk_ids.is_empty());
        assert!(entry.last_chunk_id.is_none());
    }

    #[test]
    fn test_bincode_round_trip() {
        let req = CoordRequest::UpdateFileMetadata {
            path: "/r/a.txt".into(),
            chunk_id: "abc".into(),
            locations: vec!["127.0.0.1:7100".into()],
            size_delta: 42,
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: CoordRequest = bincode::deserialize(&bytes).unwrap();
        match back {
            CoordRequest::UpdateFileMetadata { size_delta, .. } => assert_eq!(size_delta, 42),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
