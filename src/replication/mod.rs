//! Tape replication: wire protocol, per-peer session state machine, and
//! the coordinator that ties sessions to storage and the swarm.

pub mod coordinator;
pub mod protocol;
pub mod session;

pub use coordinator::ReplicationCoordinator;
pub use protocol::{ReplicationRequest, ReplicationResponse, MAX_WANT_BATCH};
pub use session::{PeerSession, PushDisposition, SessionState, SyncDecision};
