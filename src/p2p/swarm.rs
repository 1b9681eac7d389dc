//! Swarm construction and event loop
//!
//! [`SwarmDriver`] owns the libp2p swarm. Everything else in the process
//! talks to it over channels: domain [`SwarmEvent`]s flow out to the
//! replication coordinator, [`SwarmCommand`]s flow back in. Joined topics
//! are tracked here so provider lookups can be refreshed on a timer;
//! announcements need no replay since Kademlia republishes provider
//! records itself.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ResponseChannel};
use libp2p::swarm::SwarmEvent as LibSwarmEvent;
use libp2p::{
    identify, identity::Keypair, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId, Swarm,
};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::P2pConfig;
use crate::error::DiscoveryError;
use crate::identity::Topic;
use crate::p2p::behaviour::{TapecastBehaviour, TapecastBehaviourEvent};
use crate::replication::protocol::{ReplicationRequest, ReplicationResponse};

const NODE_KEY_FILE: &str = "node_key";

/// Events surfaced to the replication layer.
pub enum SwarmEvent {
    PeerConnected {
        peer_id: PeerId,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    InboundRequest {
        peer_id: PeerId,
        request: ReplicationRequest,
        channel: ResponseChannel<ReplicationResponse>,
    },
    ResponseReceived {
        peer_id: PeerId,
        request_id: OutboundRequestId,
        response: ReplicationResponse,
    },
    OutboundFailure {
        peer_id: PeerId,
        request_id: OutboundRequestId,
        error: String,
    },
}

/// Commands accepted by the driver.
pub enum SwarmCommand {
    /// Start announcing and/or looking up a topic. Repeating a join only
    /// adds missing roles, it never duplicates DHT work.
    Join {
        topic: Topic,
        announce: bool,
        lookup: bool,
    },
    /// Stop providing and looking up a topic.
    Leave { topic: Topic },
    Dial {
        addr: Multiaddr,
    },
    SendRequest {
        peer_id: PeerId,
        request: ReplicationRequest,
    },
    SendResponse {
        channel: ResponseChannel<ReplicationResponse>,
        response: ReplicationResponse,
    },
    Disconnect {
        peer_id: PeerId,
    },
}

/// Snapshot of the swarm published through a watch channel.
#[derive(Debug, Clone)]
pub struct SwarmStatus {
    pub peer_id: PeerId,
    pub listen_addrs: Vec<Multiaddr>,
    pub connected_peers: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct TopicRoles {
    announce: bool,
    lookup: bool,
}

/// Owns the swarm and runs its event loop.
pub struct SwarmDriver {
    swarm: Swarm<TapecastBehaviour>,
    local_peer_id: PeerId,
    lookup_interval: Duration,
    topics: HashMap<Topic, TopicRoles>,
    status_tx: watch::Sender<SwarmStatus>,
}

impl SwarmDriver {
    /// Build the swarm: node key, transports, behaviour, listeners, and
    /// bootstrap dials.
    pub fn new(config: &P2pConfig, data_dir: &Path) -> anyhow::Result<Self> {
        let keypair = load_or_generate_node_key(data_dir)?;
        let local_peer_id = PeerId::from(keypair.public());
        info!(peer_id = %local_peer_id, "Local node identity");

        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .context("Failed to configure TCP transport")?
            .with_quic()
            .with_behaviour(|key| {
                TapecastBehaviour::new(key, request_timeout, config.enable_mdns)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            })
            .context("Failed to configure network behaviour")?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(Duration::from_secs(60))
            })
            .build();

        for addr in &config.listen_addrs {
            let multiaddr: Multiaddr =
                addr.parse()
                    .map_err(|e: libp2p::multiaddr::Error| DiscoveryError::ListenAddr {
                        addr: addr.clone(),
                        reason: e.to_string(),
                    })?;
            swarm
                .listen_on(multiaddr)
                .map_err(|e| DiscoveryError::ListenAddr {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
        }

        for addr in &config.bootstrap_peers {
            match parse_peer_addr(addr) {
                Ok((peer_id, multiaddr)) => {
                    info!(%peer_id, addr = %multiaddr, "Dialing bootstrap peer");
                    swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, multiaddr.clone());
                    if let Err(e) = swarm.dial(multiaddr) {
                        warn!(addr = %addr, error = %e, "Bootstrap dial failed");
                    }
                }
                Err(e) => warn!(addr = %addr, error = %e, "Skipping bootstrap peer"),
            }
        }

        let (status_tx, _) = watch::channel(SwarmStatus {
            peer_id: local_peer_id,
            listen_addrs: Vec::new(),
            connected_peers: 0,
        });

        Ok(Self {
            swarm,
            local_peer_id,
            lookup_interval: Duration::from_secs(config.lookup_interval_secs),
            topics: HashMap::new(),
            status_tx,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Watch the swarm's listen addresses and connection count.
    pub fn status(&self) -> watch::Receiver<SwarmStatus> {
        self.status_tx.subscribe()
    }

    /// Drive the swarm until shutdown or until the command channel closes.
    pub async fn run(
        mut self,
        event_tx: mpsc::Sender<SwarmEvent>,
        mut commands: mpsc::Receiver<SwarmCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut lookup_timer = tokio::time::interval(self.lookup_interval);
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event, &event_tx).await;
                }
                command = commands.recv() => match command {
                    Some(command) => self.apply_command(command),
                    None => break,
                },
                _ = lookup_timer.tick() => self.refresh_lookups(),
                _ = shutdown.recv() => {
                    info!("Swarm driver shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_swarm_event(
        &mut self,
        event: LibSwarmEvent<TapecastBehaviourEvent>,
        event_tx: &mpsc::Sender<SwarmEvent>,
    ) {
        match event {
            LibSwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening");
                self.publish_status();
            }
            LibSwarmEvent::ConnectionEstablished {
                peer_id,
                num_established,
                ..
            } => {
                debug!(%peer_id, connections = num_established.get(), "Connection established");
                self.publish_status();
                if num_established.get() == 1 {
                    let _ = event_tx.send(SwarmEvent::PeerConnected { peer_id }).await;
                }
            }
            LibSwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(%peer_id, remaining = num_established, cause = ?cause, "Connection closed");
                self.publish_status();
                if num_established == 0 {
                    let _ = event_tx
                        .send(SwarmEvent::PeerDisconnected { peer_id })
                        .await;
                }
            }
            LibSwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(peer = ?peer_id, error = %error, "Outgoing connection failed");
            }
            LibSwarmEvent::Behaviour(TapecastBehaviourEvent::Replication(event)) => {
                self.handle_replication_event(event, event_tx).await;
            }
            LibSwarmEvent::Behaviour(TapecastBehaviourEvent::Kademlia(event)) => {
                self.handle_kademlia_event(event);
            }
            LibSwarmEvent::Behaviour(TapecastBehaviourEvent::Mdns(event)) => {
                self.handle_mdns_event(event);
            }
            LibSwarmEvent::Behaviour(TapecastBehaviourEvent::Identify(event)) => {
                self.handle_identify_event(event);
            }
            _ => {}
        }
    }

    async fn handle_replication_event(
        &mut self,
        event: request_response::Event<ReplicationRequest, ReplicationResponse>,
        event_tx: &mpsc::Sender<SwarmEvent>,
    ) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let _ = event_tx
                        .send(SwarmEvent::InboundRequest {
                            peer_id: peer,
                            request,
                            channel,
                        })
                        .await;
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    let _ = event_tx
                        .send(SwarmEvent::ResponseReceived {
                            peer_id: peer,
                            request_id,
                            response,
                        })
                        .await;
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
            } => {
                let _ = event_tx
                    .send(SwarmEvent::OutboundFailure {
                        peer_id: peer,
                        request_id,
                        error: error.to_string(),
                    })
                    .await;
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, error = %error, "Inbound request failed");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        if let kad::Event::OutboundQueryProgressed { result, .. } = event {
            match result {
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    for peer_id in providers {
                        if peer_id == self.local_peer_id || self.swarm.is_connected(&peer_id) {
                            continue;
                        }
                        debug!(%peer_id, "Topic provider found, dialing");
                        if let Err(e) = self.swarm.dial(peer_id) {
                            debug!(%peer_id, error = %e, "Provider dial failed");
                        }
                    }
                }
                kad::QueryResult::GetProviders(Err(e)) => {
                    debug!(error = %e, "Provider lookup failed");
                }
                kad::QueryResult::StartProviding(Ok(_)) => {
                    debug!("Topic announced to the DHT");
                }
                kad::QueryResult::StartProviding(Err(e)) => {
                    debug!(error = %e, "Topic announce query failed");
                }
                _ => {}
            }
        }
    }

    fn handle_mdns_event(&mut self, event: mdns::Event) {
        match event {
            mdns::Event::Discovered(peers) => {
                // Only chase local peers while we are looking for someone.
                let looking = self.topics.values().any(|roles| roles.lookup);
                for (peer_id, addr) in peers {
                    debug!(%peer_id, %addr, "mDNS discovered peer");
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    if looking && !self.swarm.is_connected(&peer_id) {
                        if let Err(e) = self.swarm.dial(addr) {
                            debug!(%peer_id, error = %e, "mDNS dial failed");
                        }
                    }
                }
            }
            mdns::Event::Expired(peers) => {
                for (peer_id, addr) in peers {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .remove_address(&peer_id, &addr);
                }
            }
        }
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        if let identify::Event::Received { peer_id, info } = event {
            debug!(%peer_id, agent = %info.agent_version, "Identified peer");
            for addr in info.listen_addrs {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr);
            }
        }
    }

    fn apply_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Join {
                topic,
                announce,
                lookup,
            } => self.join_topic(topic, announce, lookup),
            SwarmCommand::Leave { topic } => self.leave_topic(topic),
            SwarmCommand::Dial { addr } => {
                if let Err(e) = self.swarm.dial(addr.clone()) {
                    warn!(%addr, error = %e, "Dial failed");
                }
            }
            SwarmCommand::SendRequest { peer_id, request } => {
                let _ = self
                    .swarm
                    .behaviour_mut()
                    .replication
                    .send_request(&peer_id, request);
            }
            SwarmCommand::SendResponse { channel, response } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .replication
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("Response channel closed before the reply was sent");
                }
            }
            SwarmCommand::Disconnect { peer_id } => {
                let _ = self.swarm.disconnect_peer_id(peer_id);
            }
        }
    }

    fn join_topic(&mut self, topic: Topic, announce: bool, lookup: bool) {
        let roles = self.topics.entry(topic).or_default();
        let newly_announce = announce && !roles.announce;
        let newly_lookup = lookup && !roles.lookup;
        roles.announce |= announce;
        roles.lookup |= lookup;

        if newly_announce {
            match self
                .swarm
                .behaviour_mut()
                .kademlia
                .start_providing(record_key(&topic))
            {
                Ok(_) => info!(topic = %topic, "Announcing topic"),
                Err(e) => warn!(topic = %topic, error = %e, "Failed to announce topic"),
            }
        }
        if newly_lookup {
            info!(topic = %topic, "Looking up topic providers");
            self.swarm
                .behaviour_mut()
                .kademlia
                .get_providers(record_key(&topic));
        }
    }

    fn leave_topic(&mut self, topic: Topic) {
        if let Some(roles) = self.topics.remove(&topic) {
            if roles.announce {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .stop_providing(&record_key(&topic));
            }
            info!(topic = %topic, "Left topic");
        }
    }

    fn refresh_lookups(&mut self) {
        let keys: Vec<kad::RecordKey> = self
            .topics
            .iter()
            .filter(|(_, roles)| roles.lookup)
            .map(|(topic, _)| record_key(topic))
            .collect();
        for key in keys {
            self.swarm.behaviour_mut().kademlia.get_providers(key);
        }
    }

    fn publish_status(&mut self) {
        let status = SwarmStatus {
            peer_id: self.local_peer_id,
            listen_addrs: self.swarm.listeners().cloned().collect(),
            connected_peers: self.swarm.connected_peers().count(),
        };
        self.status_tx.send_replace(status);
    }
}

fn record_key(topic: &Topic) -> kad::RecordKey {
    kad::RecordKey::new(topic.as_bytes())
}

/// Load the libp2p node key, creating one on first start. This key names
/// the node on the network and is unrelated to any tape key.
fn load_or_generate_node_key(data_dir: &Path) -> anyhow::Result<Keypair> {
    let key_path = data_dir.join(NODE_KEY_FILE);
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("Failed to read node key")?;
        let keypair =
            Keypair::from_protobuf_encoding(&bytes).context("Failed to decode node key")?;
        debug!(path = %key_path.display(), "Loaded node key");
        Ok(keypair)
    } else {
        let keypair = Keypair::generate_ed25519();
        std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        let bytes = keypair
            .to_protobuf_encoding()
            .context("Failed to encode node key")?;
        std::fs::write(&key_path, bytes).context("Failed to write node key")?;
        debug!(path = %key_path.display(), "Generated node key");
        Ok(keypair)
    }
}

/// Split a `/p2p/`-suffixed multiaddr into peer id and dial address.
fn parse_peer_addr(addr: &str) -> Result<(PeerId, Multiaddr), DiscoveryError> {
    let multiaddr: Multiaddr = addr.parse().map_err(|e: libp2p::multiaddr::Error| {
        DiscoveryError::PeerAddr {
            addr: addr.to_string(),
            reason: e.to_string(),
        }
    })?;

    let peer_id = multiaddr
        .iter()
        .find_map(|protocol| match protocol {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })
        .ok_or_else(|| DiscoveryError::PeerAddr {
            addr: addr.to_string(),
            reason: "missing /p2p/ component".to_string(),
        })?;

    let dial_addr: Multiaddr = multiaddr
        .iter()
        .filter(|protocol| !matches!(protocol, Protocol::P2p(_)))
        .collect();

    Ok((peer_id, dial_addr))
}
