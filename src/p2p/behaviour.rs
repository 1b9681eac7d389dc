//! Composed libp2p network behaviour
//!
//! Kademlia carries topic provider records for discovery, mDNS finds
//! peers on the local network, identify exchanges observed addresses,
//! and request-response runs the replication protocol itself.

use std::time::Duration;

use libp2p::kad::store::MemoryStore;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, identity::Keypair, kad, mdns, request_response, PeerId};

use crate::p2p::codec::{ReplicationCodec, ReplicationProtocol};
use crate::replication::protocol::{ReplicationRequest, ReplicationResponse};

const IDENTIFY_PROTOCOL: &str = "/tapecast/id/1.0.0";

type ReplicationEvent = request_response::Event<ReplicationRequest, ReplicationResponse>;

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "TapecastBehaviourEvent")]
pub struct TapecastBehaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub replication: request_response::Behaviour<ReplicationCodec>,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub identify: identify::Behaviour,
}

#[derive(Debug)]
pub enum TapecastBehaviourEvent {
    Kademlia(kad::Event),
    Replication(ReplicationEvent),
    Mdns(mdns::Event),
    Identify(identify::Event),
}

impl TapecastBehaviour {
    pub fn new(
        keypair: &Keypair,
        request_timeout: Duration,
        enable_mdns: bool,
    ) -> std::io::Result<Self> {
        let peer_id = PeerId::from(keypair.public());

        let mut kademlia = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
        // Serve provider records even on small swarms.
        kademlia.set_mode(Some(kad::Mode::Server));

        let replication = request_response::Behaviour::new(
            [(ReplicationProtocol, request_response::ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(request_timeout),
        );

        // Disabled mDNS binds no multicast sockets at all.
        let mdns = if enable_mdns {
            Some(mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?)
        } else {
            None
        };

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(format!("tapecast/{}", env!("CARGO_PKG_VERSION"))),
        );

        Ok(Self {
            kademlia,
            replication,
            mdns: Toggle::from(mdns),
            identify,
        })
    }
}

impl From<kad::Event> for TapecastBehaviourEvent {
    fn from(event: kad::Event) -> Self {
        TapecastBehaviourEvent::Kademlia(event)
    }
}

impl From<ReplicationEvent> for TapecastBehaviourEvent {
    fn from(event: ReplicationEvent) -> Self {
        TapecastBehaviourEvent::Replication(event)
    }
}

impl From<mdns::Event> for TapecastBehaviourEvent {
    fn from(event: mdns::Event) -> Self {
        TapecastBehaviourEvent::Mdns(event)
    }
}

impl From<identify::Event> for TapecastBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        TapecastBehaviourEvent::Identify(event)
    }
}
