//! # tapecast
//!
//! Signed append-only market-data tapes replicated over a libp2p swarm.
//!
//! One process holds a tape's Ed25519 writer key and appends candle
//! records to it; any number of peers discover the tape through a DHT
//! topic derived from its public key, pull the history they are missing,
//! and then follow new blocks live. Every block is hash-chained to its
//! predecessor and signed by the writer, so replicas can verify the whole
//! tape offline with nothing but the public key.
//!
//! The crate splits into:
//! - [`tape`]: persistent block storage with sequential readers/writers
//! - [`replication`]: the peer protocol and its session state machine
//! - [`p2p`]: libp2p transport, discovery, and the swarm event loop
//! - [`ingest`]: candle sources and the historical backfill walker

pub mod config;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod p2p;
pub mod replication;
pub mod tape;

pub use error::{DiscoveryError, IngestError, ReplicationError, TapeError};
pub use identity::{TapeKeypair, TapePublicKey, Topic};
pub use tape::{Block, BlockRef, TapeReader, TapeStore, TapeWriter};
