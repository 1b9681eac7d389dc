//! Per-peer replication session state
//!
//! Pure state machine, no I/O. A session moves through
//! `Connected -> Handshaking -> Syncing -> Live` and ends in `Closed`.
//! Syncing pins its target at the length the peer reported during the
//! handshake; blocks pushed past the target while catching up reopen a
//! fresh sync round instead of being buffered.
//!
//! The session also remembers the highest length the peer ever reported.
//! A report below that is treated as a protocol violation, because an
//! append-only tape can never shrink.

use libp2p::PeerId;

use crate::error::ReplicationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up, no handshake yet.
    Connected,
    /// Hello sent, waiting for the peer's length.
    Handshaking,
    /// Pulling blocks until the local tape reaches `target`.
    Syncing { target: u64 },
    /// Caught up. New blocks flow as pushes.
    Live,
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Handshaking => "handshaking",
            SessionState::Syncing { .. } => "syncing",
            SessionState::Live => "live",
            SessionState::Closed => "closed",
        }
    }
}

/// What to do after learning the peer's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Behind the peer: request blocks starting at `start`.
    Fetch { start: u64 },
    /// Caught up, nothing to pull.
    Live,
}

/// How to treat a pushed block at a given index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDisposition {
    /// Extends the local tape, verify and store it.
    Accept,
    /// Already stored, acknowledge without writing.
    AlreadyKnown,
    /// Beyond the local tail; the gap must be pulled first.
    Gap,
}

pub struct PeerSession {
    peer_id: PeerId,
    state: SessionState,
    /// Highest length the peer ever reported.
    remote_length: Option<u64>,
}

impl PeerSession {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            state: SessionState::Connected,
            remote_length: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }

    pub fn remote_length(&self) -> Option<u64> {
        self.remote_length
    }

    /// Mark the handshake as sent.
    pub fn begin_handshake(&mut self) {
        if self.state == SessionState::Connected {
            self.state = SessionState::Handshaking;
        }
    }

    /// Process a length report from the peer (handshake or ack) and decide
    /// whether to pull.
    pub fn on_remote_length(
        &mut self,
        reported: u64,
        local_length: u64,
    ) -> Result<SyncDecision, ReplicationError> {
        if let Some(previous) = self.remote_length {
            if reported < previous {
                self.state = SessionState::Closed;
                return Err(ReplicationError::LengthShrank {
                    was: previous,
                    now: reported,
                });
            }
        }
        self.remote_length = Some(reported);

        match self.state {
            SessionState::Connected | SessionState::Handshaking => {
                if reported > local_length {
                    self.state = SessionState::Syncing { target: reported };
                    Ok(SyncDecision::Fetch {
                        start: local_length,
                    })
                } else {
                    self.state = SessionState::Live;
                    Ok(SyncDecision::Live)
                }
            }
            SessionState::Syncing { target } => {
                if local_length >= target {
                    self.state = SessionState::Live;
                    Ok(SyncDecision::Live)
                } else {
                    Ok(SyncDecision::Fetch {
                        start: local_length,
                    })
                }
            }
            SessionState::Live => Ok(SyncDecision::Live),
            SessionState::Closed => Err(ReplicationError::UnexpectedMessage {
                state: self.state.name(),
            }),
        }
    }

    /// Re-evaluate a syncing session after blocks were applied locally.
    pub fn advance(&mut self, local_length: u64) -> SyncDecision {
        match self.state {
            SessionState::Syncing { target } if local_length >= target => {
                self.state = SessionState::Live;
                SyncDecision::Live
            }
            SessionState::Syncing { .. } => SyncDecision::Fetch {
                start: local_length,
            },
            _ => SyncDecision::Live,
        }
    }

    /// Classify a pushed block by its index against the local length. A
    /// gap flips the session back to syncing with the pushed block as the
    /// new target.
    pub fn on_push(&mut self, index: u64, local_length: u64) -> PushDisposition {
        if index < local_length {
            return PushDisposition::AlreadyKnown;
        }
        if index == local_length {
            return PushDisposition::Accept;
        }
        let target = match self.state {
            SessionState::Syncing { target } => target.max(index + 1),
            _ => index + 1,
        };
        self.state = SessionState::Syncing { target };
        PushDisposition::Gap
    }

    /// Raise the remembered peer length without shrink-checking. Used for
    /// implicit signals such as the start of an inbound `Want`.
    pub fn note_remote_at_least(&mut self, length: u64) {
        if self.remote_length.map_or(true, |previous| length > previous) {
            self.remote_length = Some(length);
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PeerSession {
        PeerSession::new(PeerId::random())
    }

    #[test]
    fn test_behind_peer_fetches() {
        let mut s = session();
        s.begin_handshake();

        let decision = s.on_remote_length(10, 4).unwrap();
        assert_eq!(decision, SyncDecision::Fetch { start: 4 });
        assert_eq!(s.state(), SessionState::Syncing { target: 10 });
    }

    #[test]
    fn test_equal_length_goes_live_directly() {
        let mut s = session();
        s.begin_handshake();

        let decision = s.on_remote_length(7, 7).unwrap();
        assert_eq!(decision, SyncDecision::Live);
        assert!(s.is_live());
    }

    #[test]
    fn test_ahead_of_peer_goes_live() {
        // The peer is behind us; it pulls from us, we have nothing to do.
        let mut s = session();
        s.begin_handshake();

        let decision = s.on_remote_length(2, 9).unwrap();
        assert_eq!(decision, SyncDecision::Live);
        assert!(s.is_live());
    }

    #[test]
    fn test_sync_rounds_until_target() {
        let mut s = session();
        s.begin_handshake();
        s.on_remote_length(10, 0).unwrap();

        assert_eq!(s.advance(6), SyncDecision::Fetch { start: 6 });
        assert_eq!(s.state(), SessionState::Syncing { target: 10 });

        assert_eq!(s.advance(10), SyncDecision::Live);
        assert!(s.is_live());
    }

    #[test]
    fn test_shrinking_length_is_violation() {
        let mut s = session();
        s.begin_handshake();
        s.on_remote_length(10, 10).unwrap();

        let err = s.on_remote_length(7, 10).unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::LengthShrank { was: 10, now: 7 }
        ));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_push_at_tail_accepted() {
        let mut s = session();
        s.begin_handshake();
        s.on_remote_length(3, 3).unwrap();

        assert_eq!(s.on_push(3, 3), PushDisposition::Accept);
        assert_eq!(s.on_push(2, 4), PushDisposition::AlreadyKnown);
    }

    #[test]
    fn test_push_gap_reopens_sync() {
        let mut s = session();
        s.begin_handshake();
        s.on_remote_length(3, 3).unwrap();
        assert!(s.is_live());

        // Push for index 7 while we only hold 3 blocks.
        assert_eq!(s.on_push(7, 3), PushDisposition::Gap);
        assert_eq!(s.state(), SessionState::Syncing { target: 8 });

        // A later, further push can only raise the target.
        assert_eq!(s.on_push(9, 3), PushDisposition::Gap);
        assert_eq!(s.state(), SessionState::Syncing { target: 10 });
    }

    #[test]
    fn test_growth_during_sync_extends_via_reports() {
        let mut s = session();
        s.begin_handshake();
        s.on_remote_length(5, 0).unwrap();

        // The peer grew while we were pulling; the target stays pinned and
        // we go live at 5, relying on pushes to surface the rest.
        let decision = s.on_remote_length(8, 5).unwrap();
        assert_eq!(decision, SyncDecision::Live);
        assert!(s.is_live());
    }

    #[test]
    fn test_note_remote_only_raises() {
        let mut s = session();
        s.note_remote_at_least(4);
        assert_eq!(s.remote_length(), Some(4));
        s.note_remote_at_least(2);
        assert_eq!(s.remote_length(), Some(4));
        s.note_remote_at_least(9);
        assert_eq!(s.remote_length(), Some(9));
    }
}
