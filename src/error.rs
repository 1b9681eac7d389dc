//! Error types for tapecast
//!
//! Failures are split by blast radius. [`TapeError`] integrity variants and
//! [`ReplicationError`] are scoped to a single peer connection: the session
//! that produced them is closed and everything else keeps running. Storage
//! variants ([`TapeError::is_fatal`]) mean the local database can no longer
//! be trusted and the process should stop.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the local tape store.
#[derive(Debug, Error)]
pub enum TapeError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bad key material: {0}")]
    Key(String),

    #[error("No tape initialized at {path}")]
    Uninitialized { path: PathBuf },

    #[error("Block {index} not found")]
    NotFound { index: u64 },

    #[error("Tape is opened read-only, only replicated blocks can be stored")]
    ReadOnly,

    #[error("Block {index} does not extend the local tape (next index is {expected})")]
    NonContiguous { index: u64, expected: u64 },

    #[error("Content hash mismatch at block {index}: expected {expected}, got {actual}")]
    BadContentHash {
        index: u64,
        expected: String,
        actual: String,
    },

    #[error("Chain link mismatch at block {index}: expected {expected}, got {actual}")]
    BrokenChain {
        index: u64,
        expected: String,
        actual: String,
    },

    #[error("Signature verification failed at block {index}")]
    BadSignature { index: u64 },
}

impl TapeError {
    /// True for verification failures on incoming data. These condemn the
    /// peer that sent the block, not the local store.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            TapeError::NonContiguous { .. }
                | TapeError::BadContentHash { .. }
                | TapeError::BrokenChain { .. }
                | TapeError::BadSignature { .. }
        )
    }

    /// True when the local database itself failed. The process cannot
    /// serve or accept blocks past this point.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TapeError::Database(_) | TapeError::Io(_) | TapeError::Serialization(_)
        )
    }
}

/// Protocol violations observed on a replication session.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Peer length report shrank from {was} to {now}")]
    LengthShrank { was: u64, now: u64 },

    #[error("Unexpected message in {state} state")]
    UnexpectedMessage { state: &'static str },
}

/// Errors from swarm addressing and peer discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid listen address {addr}: {reason}")]
    ListenAddr { addr: String, reason: String },

    #[error("Invalid peer address {addr}: {reason}")]
    PeerAddr { addr: String, reason: String },
}

/// Errors from candle ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Failed to encode record: {0}")]
    Encode(String),

    #[error("Failed to decode record: {0}")]
    Decode(String),

    #[error("Candle source closed")]
    Closed,
}
