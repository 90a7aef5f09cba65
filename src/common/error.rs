//! Error types for geofs

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Transport ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Capacity ===
    #[error("Insufficient space: need {needed} bytes, {free} free")]
    InsufficientSpace { needed: u64, free: u64 },

    #[error("No storage servers available")]
    NoServersAvailable,

    // === State ===
    #[error("Unknown chunk: {0}")]
    UnknownChunk(String),

    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("Commit without prepare for chunk {0}")]
    CommitWithoutPrepare(String),

    #[error("Stale offset: current {current}, proposed {proposed}")]
    StaleOffset { current: u64, proposed: u64 },

    // === Integrity ===
    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("Chunk file missing: {0}")]
    ChunkMissing(String),

    // === Configuration ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === 2PC ===
    #[error("Prepare failed on {node}: {reason}")]
    PrepareFailed { node: String, reason: String },

    #[error("Partial failure: {committed_chunks:?} committed, {failed_chunk} failed")]
    PartialFailure {
        committed_chunks: Vec<String>,
        failed_chunk: String,
    },

    // === Generic ===
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire-level error classification, carried inside error responses so the
/// receiving side can rebuild a typed [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    InsufficientSpace,
    NoServersAvailable,
    UnknownChunk,
    UnknownFile,
    CommitWithoutPrepare,
    StaleOffset,
    Integrity,
    Internal,
}

impl Error {
    /// Is this a retryable error? A stale offset counts: it means a
    /// concurrent appender won the tail, and a retry will observe the
    /// fresh tail position.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::InsufficientSpace { .. }
                | Error::NoServersAvailable
                | Error::StaleOffset { .. }
        )
    }

    /// Classify for the wire. The structured payload is flattened to a
    /// kind + message pair; [`Error::from_wire`] rebuilds the typed variant
    /// on the other side.
    pub fn to_wire(&self) -> (ErrorKind, String) {
        let kind = match self {
            Error::Io(_) | Error::ConnectionFailed(_) | Error::Framing(_) | Error::Timeout(_) => {
                ErrorKind::Transport
            }
            Error::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Error::NoServersAvailable => ErrorKind::NoServersAvailable,
            Error::UnknownChunk(_) | Error::ChunkMissing(_) => ErrorKind::UnknownChunk,
            Error::UnknownFile(_) => ErrorKind::UnknownFile,
            Error::CommitWithoutPrepare(_) => ErrorKind::CommitWithoutPrepare,
            Error::StaleOffset { .. } => ErrorKind::StaleOffset,
            Error::MetadataCorrupted(_) => ErrorKind::Integrity,
            _ => ErrorKind::Internal,
        };
        (kind, self.to_string())
    }

    /// Rebuild a typed error from a wire kind + message pair.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Transport => Error::ConnectionFailed(message),
            ErrorKind::InsufficientSpace => Error::InsufficientSpace { needed: 0, free: 0 },
            ErrorKind::NoServersAvailable => Error::NoServersAvailable,
            ErrorKind::UnknownChunk => Error::UnknownChunk(message),
            ErrorKind::UnknownFile => Error::UnknownFile(message),
            ErrorKind::CommitWithoutPrepare => Error::CommitWithoutPrepare(message),
            ErrorKind::StaleOffset => Error::StaleOffset {
                current: 0,
                proposed: 0,
            },
            ErrorKind::Integrity => Error::MetadataCorrupted(message),
            ErrorKind::Internal => Error::Remote(message),
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("rpc".into()).is_retryable());
        assert!(Error::NoServersAvailable.is_retryable());
        assert!(Error::InsufficientSpace { needed: 10, free: 0 }.is_retryable());
        assert!(Error::StaleOffset { current: 5, proposed: 5 }.is_retryable());
        assert!(!Error::UnknownFile("/a".into()).is_retryable());
        assert!(!Error::CommitWithoutPrepare("c1".into()).is_retryable());
    }

    #[test]
    fn test_wire_round_trip_kinds() {
        let (kind, _) = Error::InsufficientSpace { needed: 5, free: 1 }.to_wire();
        assert_eq!(kind, ErrorKind::InsufficientSpace);
        assert!(matches!(
            Error::from_wire(kind, String::new()),
            Error::InsufficientSpace { .. }
        ));

        let (kind, msg) = Error::UnknownChunk("c9".into()).to_wire();
        assert_eq!(kind, ErrorKind::UnknownChunk);
        assert!(matches!(Error::from_wire(kind, msg), Error::UnknownChunk(_)));
    }
}
