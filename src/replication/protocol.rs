//! Replication wire messages
//!
//! Sessions open with a `Hello` exchange that pins the topic and reports
//! lengths. A peer that is behind pulls with `Want` and receives `Blocks`
//! batches. Once caught up, the writer side streams new blocks as `Push`
//! requests which are acknowledged with `Ack`. `Reject` closes the
//! conversation with a reason.

use serde::{Deserialize, Serialize};

use crate::tape::Block;

/// Largest block range a single `Want` may ask for. Servers clamp to it.
pub const MAX_WANT_BATCH: u32 = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationRequest {
    /// Session opener. Carries the discovery topic of the tape the sender
    /// replicates and the sender's current length.
    Hello { topic: [u8; 32], length: u64 },
    /// Ask for blocks `start..start+max` (clamped server-side).
    Want { start: u64, max: u32 },
    /// Live forward of one freshly appended block.
    Push { block: Block },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationResponse {
    /// Handshake answer with the responder's topic and length.
    Hello { topic: [u8; 32], length: u64 },
    /// Answer to `Want`. Blocks are in tape order and may be fewer than
    /// asked for; `length` is the responder's length at serve time.
    Blocks { blocks: Vec<Block>, length: u64 },
    /// Answer to `Push` with the receiver's length after storing.
    Ack { length: u64 },
    /// The responder refuses to continue this session.
    Reject { reason: String },
}
