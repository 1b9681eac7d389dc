//! libp2p networking: transport setup, composed behaviour, and the
//! channel-driven swarm event loop.

pub mod behaviour;
pub mod codec;
pub mod swarm;

pub use swarm::{SwarmCommand, SwarmDriver, SwarmEvent, SwarmStatus};
