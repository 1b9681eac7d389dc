//! Replication coordinator
//!
//! Sits between the tape store and the swarm. For every connected peer it
//! drives a [`PeerSession`]: hello on connect, pull rounds while behind,
//! then live forwarding of fresh appends. It also serves the other
//! direction, answering `Want` from local storage and feeding pushed
//! blocks through [`TapeStore::accept`], so a replica both consumes and
//! re-serves the tape.
//!
//! Verification failures and protocol violations close the offending
//! session and disconnect the peer; other sessions are untouched. Only a
//! storage failure ends the coordinator itself.

use std::collections::HashMap;
use std::sync::Arc;

use libp2p::request_response::ResponseChannel;
use libp2p::PeerId;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::TapeError;
use crate::identity::Topic;
use crate::p2p::swarm::{SwarmCommand, SwarmEvent};
use crate::replication::protocol::{ReplicationRequest, ReplicationResponse, MAX_WANT_BATCH};
use crate::replication::session::{PeerSession, PushDisposition, SessionState, SyncDecision};
use crate::tape::{Block, TapeReader, TapeStore};

pub struct ReplicationCoordinator {
    tape: Arc<TapeStore>,
    topic: Topic,
    sessions: HashMap<PeerId, PeerSession>,
    commands: mpsc::Sender<SwarmCommand>,
}

impl ReplicationCoordinator {
    pub fn new(tape: Arc<TapeStore>, commands: mpsc::Sender<SwarmCommand>) -> Self {
        let topic = tape.topic();
        Self {
            tape,
            topic,
            sessions: HashMap::new(),
            commands,
        }
    }

    /// Process swarm events and forward local appends until shutdown.
    /// Returns an error only for storage failures.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SwarmEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TapeError> {
        // Tail local appends from the current end; everything before it is
        // served through Want rounds instead.
        let mut tail = TapeReader::new(self.tape.clone(), self.tape.length(), true);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!(error = %e, "Storage failure during replication");
                            return Err(e);
                        }
                    }
                    None => break,
                },
                block = tail.next_block() => match block {
                    Ok(Some(block)) => self.forward_block(&block).await,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read local tail");
                        return Err(e);
                    }
                },
                _ = shutdown.recv() => {
                    info!("Replication coordinator shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: SwarmEvent) -> Result<(), TapeError> {
        match event {
            SwarmEvent::PeerConnected { peer_id } => {
                self.on_peer_connected(peer_id).await;
                Ok(())
            }
            SwarmEvent::PeerDisconnected { peer_id } => {
                if self.sessions.remove(&peer_id).is_some() {
                    info!(%peer_id, "Peer disconnected");
                }
                Ok(())
            }
            SwarmEvent::InboundRequest {
                peer_id,
                request,
                channel,
            } => self.on_request(peer_id, request, channel).await,
            SwarmEvent::ResponseReceived {
                peer_id, response, ..
            } => self.on_response(peer_id, response).await,
            SwarmEvent::OutboundFailure { peer_id, error, .. } => {
                warn!(%peer_id, error = %error, "Request to peer failed");
                self.close_session(peer_id, "transport failure").await;
                Ok(())
            }
        }
    }

    async fn on_peer_connected(&mut self, peer_id: PeerId) {
        let start_handshake = {
            let session = self
                .sessions
                .entry(peer_id)
                .or_insert_with(|| PeerSession::new(peer_id));
            if session.state() == SessionState::Connected {
                session.begin_handshake();
                true
            } else {
                false
            }
        };
        if start_handshake {
            info!(%peer_id, "Peer connected, sending hello");
            self.send_request(
                peer_id,
                ReplicationRequest::Hello {
                    topic: *self.topic.as_bytes(),
                    length: self.tape.length(),
                },
            )
            .await;
        }
    }

    async fn on_request(
        &mut self,
        peer_id: PeerId,
        request: ReplicationRequest,
        channel: ResponseChannel<ReplicationResponse>,
    ) -> Result<(), TapeError> {
        match request {
            ReplicationRequest::Hello { topic, length } => {
                if topic != *self.topic.as_bytes() {
                    warn!(%peer_id, "Peer replicates a different tape, rejecting");
                    self.respond(
                        channel,
                        ReplicationResponse::Reject {
                            reason: "unknown tape".to_string(),
                        },
                    )
                    .await;
                    self.close_session(peer_id, "topic mismatch").await;
                    return Ok(());
                }

                let local = self.tape.length();
                self.respond(
                    channel,
                    ReplicationResponse::Hello {
                        topic: *self.topic.as_bytes(),
                        length: local,
                    },
                )
                .await;

                let outcome = {
                    let session = self
                        .sessions
                        .entry(peer_id)
                        .or_insert_with(|| PeerSession::new(peer_id));
                    session.begin_handshake();
                    let before = session.state();
                    (before, session.on_remote_length(length, local))
                };
                self.apply_decision(peer_id, outcome.0, outcome.1).await;
                Ok(())
            }
            ReplicationRequest::Want { start, max } => self.serve_want(peer_id, start, max, channel).await,
            ReplicationRequest::Push { block } => self.on_push(peer_id, block, channel).await,
        }
    }

    /// Answer a pull with blocks from local storage, in order, clamped to
    /// the batch limit.
    async fn serve_want(
        &mut self,
        peer_id: PeerId,
        start: u64,
        max: u32,
        channel: ResponseChannel<ReplicationResponse>,
    ) -> Result<(), TapeError> {
        let length = self.tape.length();
        let end = length.min(start.saturating_add(max.min(MAX_WANT_BATCH) as u64));
        let mut blocks = Vec::new();
        let mut index = start;
        while index < end {
            blocks.push(self.tape.get(index).await?);
            index += 1;
        }
        debug!(%peer_id, start, served = blocks.len(), "Serving block range");

        // Asking from `start` implies the peer already holds that much.
        if let Some(session) = self.sessions.get_mut(&peer_id) {
            session.note_remote_at_least(start);
        }
        self.respond(channel, ReplicationResponse::Blocks { blocks, length })
            .await;
        Ok(())
    }

    async fn on_push(
        &mut self,
        peer_id: PeerId,
        block: Block,
        channel: ResponseChannel<ReplicationResponse>,
    ) -> Result<(), TapeError> {
        let local = self.tape.length();
        let index = block.index;
        let disposition = match self.sessions.get_mut(&peer_id) {
            Some(session) => session.on_push(index, local),
            None => {
                warn!(%peer_id, "Push before handshake, rejecting");
                self.respond(
                    channel,
                    ReplicationResponse::Reject {
                        reason: "handshake required".to_string(),
                    },
                )
                .await;
                return Ok(());
            }
        };

        match disposition {
            PushDisposition::Accept => match self.tape.accept(block).await {
                Ok(reference) => {
                    let length = self.tape.length();
                    debug!(%peer_id, index = reference.index, "Accepted pushed block");
                    if let Some(session) = self.sessions.get_mut(&peer_id) {
                        session.note_remote_at_least(length);
                    }
                    self.respond(channel, ReplicationResponse::Ack { length })
                        .await;
                    Ok(())
                }
                Err(e) if e.is_integrity() => {
                    warn!(%peer_id, index, error = %e, "Pushed block failed verification");
                    self.respond(
                        channel,
                        ReplicationResponse::Reject {
                            reason: e.to_string(),
                        },
                    )
                    .await;
                    self.close_session(peer_id, "block verification failed")
                        .await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            PushDisposition::AlreadyKnown => {
                self.respond(channel, ReplicationResponse::Ack { length: local })
                    .await;
                Ok(())
            }
            PushDisposition::Gap => {
                debug!(%peer_id, index, local, "Push beyond local tail, pulling the gap");
                self.respond(channel, ReplicationResponse::Ack { length: local })
                    .await;
                self.send_request(
                    peer_id,
                    ReplicationRequest::Want {
                        start: local,
                        max: MAX_WANT_BATCH,
                    },
                )
                .await;
                Ok(())
            }
        }
    }

    async fn on_response(
        &mut self,
        peer_id: PeerId,
        response: ReplicationResponse,
    ) -> Result<(), TapeError> {
        match response {
            ReplicationResponse::Hello { topic, length } => {
                if topic != *self.topic.as_bytes() {
                    warn!(%peer_id, "Peer answered for a different tape");
                    self.close_session(peer_id, "topic mismatch").await;
                    return Ok(());
                }
                let local = self.tape.length();
                let outcome = match self.sessions.get_mut(&peer_id) {
                    Some(session) => {
                        let before = session.state();
                        (before, session.on_remote_length(length, local))
                    }
                    None => return Ok(()),
                };
                self.apply_decision(peer_id, outcome.0, outcome.1).await;
                Ok(())
            }
            ReplicationResponse::Blocks { blocks, length } => {
                self.on_blocks(peer_id, blocks, length).await
            }
            ReplicationResponse::Ack { length } => {
                let local = self.tape.length();
                let outcome = match self.sessions.get_mut(&peer_id) {
                    Some(session) => {
                        let before = session.state();
                        (before, session.on_remote_length(length, local))
                    }
                    None => return Ok(()),
                };
                self.apply_decision(peer_id, outcome.0, outcome.1).await;
                Ok(())
            }
            ReplicationResponse::Reject { reason } => {
                warn!(%peer_id, reason = %reason, "Peer rejected the session");
                self.close_session(peer_id, "rejected by peer").await;
                Ok(())
            }
        }
    }

    /// Apply a pulled batch. Blocks already held locally are skipped so
    /// overlapping pull rounds stay harmless; everything else must verify
    /// and extend the tape.
    async fn on_blocks(
        &mut self,
        peer_id: PeerId,
        blocks: Vec<Block>,
        reported_length: u64,
    ) -> Result<(), TapeError> {
        if blocks.is_empty() {
            let syncing = self
                .sessions
                .get(&peer_id)
                .map(|s| matches!(s.state(), SessionState::Syncing { .. }))
                .unwrap_or(false);
            if syncing {
                warn!(%peer_id, "Peer reported blocks it will not serve");
                self.close_session(peer_id, "empty sync batch").await;
            }
            return Ok(());
        }

        let mut applied = 0u64;
        for block in blocks {
            if block.index < self.tape.length() {
                continue;
            }
            let index = block.index;
            match self.tape.accept(block).await {
                Ok(_) => applied += 1,
                Err(e) if e.is_integrity() => {
                    warn!(%peer_id, index, error = %e, "Pulled block failed verification");
                    self.close_session(peer_id, "block verification failed")
                        .await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let local = self.tape.length();
        if applied > 0 {
            debug!(%peer_id, applied, length = local, "Applied pulled blocks");
        }

        let outcome = match self.sessions.get_mut(&peer_id) {
            Some(session) => {
                session.note_remote_at_least(reported_length);
                let before = session.state();
                (before, Ok(session.advance(local)))
            }
            None => return Ok(()),
        };
        self.apply_decision(peer_id, outcome.0, outcome.1).await;
        Ok(())
    }

    async fn apply_decision(
        &mut self,
        peer_id: PeerId,
        before: SessionState,
        result: Result<SyncDecision, crate::error::ReplicationError>,
    ) {
        match result {
            Ok(SyncDecision::Fetch { start }) => {
                debug!(%peer_id, start, "Requesting blocks from peer");
                self.send_request(
                    peer_id,
                    ReplicationRequest::Want {
                        start,
                        max: MAX_WANT_BATCH,
                    },
                )
                .await;
            }
            Ok(SyncDecision::Live) => {
                let live_now = self
                    .sessions
                    .get(&peer_id)
                    .map(|s| s.is_live())
                    .unwrap_or(false);
                if live_now && before != SessionState::Live {
                    info!(%peer_id, length = self.tape.length(), "Replication live with peer");
                }
            }
            Err(e) => {
                warn!(%peer_id, error = %e, "Protocol violation");
                self.close_session(peer_id, "protocol violation").await;
            }
        }
    }

    /// Push a fresh local block to every live session that has not already
    /// seen it.
    async fn forward_block(&mut self, block: &Block) {
        let targets: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|session| {
                session.is_live()
                    && session
                        .remote_length()
                        .map_or(true, |remote| remote <= block.index)
            })
            .map(|session| session.peer_id())
            .collect();

        for peer_id in targets {
            debug!(%peer_id, index = block.index, "Forwarding block");
            self.send_request(
                peer_id,
                ReplicationRequest::Push {
                    block: block.clone(),
                },
            )
            .await;
        }
    }

    async fn close_session(&mut self, peer_id: PeerId, reason: &str) {
        if let Some(mut session) = self.sessions.remove(&peer_id) {
            session.close();
            warn!(%peer_id, reason, "Closing replication session");
            let _ = self
                .commands
                .send(SwarmCommand::Disconnect { peer_id })
                .await;
        }
    }

    async fn send_request(&self, peer_id: PeerId, request: ReplicationRequest) {
        if self
            .commands
            .send(SwarmCommand::SendRequest { peer_id, request })
            .await
            .is_err()
        {
            debug!("Swarm command channel closed");
        }
    }

    async fn respond(
        &self,
        channel: ResponseChannel<ReplicationResponse>,
        response: ReplicationResponse,
    ) {
        if self
            .commands
            .send(SwarmCommand::SendResponse { channel, response })
            .await
            .is_err()
        {
            debug!("Swarm command channel closed");
        }
    }
}
