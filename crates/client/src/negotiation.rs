// Per-peer WebRTC negotiation using the "perfect negotiation" pattern.
//
// Both ends of a link derive the same roles from their user ids: the smaller
// id is polite. On an offer collision the impolite side ignores the incoming
// offer and the polite side rolls back its own. ICE candidates that arrive
// before a remote description are buffered and flushed in arrival order.

use anyhow::{anyhow, Result};
use callboard_common::{protocol::ws::ClientMessage, types::IceCandidate, types::UserId};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// The parts of an `RTCPeerConnection` the negotiation logic drives.
pub trait PeerConnection {
    fn create_offer(&mut self) -> Result<SessionDescription>;

    fn create_answer(&mut self) -> Result<SessionDescription>;

    fn set_local_description(&mut self, description: &SessionDescription) -> Result<()>;

    fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()>;

    /// Discards a pending local offer, returning to `Stable`.
    fn rollback(&mut self) -> Result<()>;

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    fn has_remote_description(&self) -> bool;

    fn close(&mut self);
}

/// Role for the local side of a link: the numerically smaller id is polite.
pub fn is_polite(local_user_id: UserId, remote_user_id: UserId) -> bool {
    local_user_id < remote_user_id
}

pub struct PeerLink<P: PeerConnection> {
    local_user_id: UserId,
    remote_user_id: UserId,
    room_user_id: UserId,
    polite: bool,
    making_offer: bool,
    ignore_offer: bool,
    /// Offer created by [`PeerLink::begin_offer`] and not yet applied.
    pending_offer: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    connection: P,
    closed: bool,
}

impl<P: PeerConnection> PeerLink<P> {
    pub fn new(local_user_id: UserId, remote_user_id: UserId, room_user_id: UserId, connection: P) -> Self {
        Self {
            local_user_id,
            remote_user_id,
            room_user_id,
            polite: is_polite(local_user_id, remote_user_id),
            making_offer: false,
            ignore_offer: false,
            pending_offer: None,
            pending_candidates: Vec::new(),
            connection,
            closed: false,
        }
    }

    pub fn remote_user_id(&self) -> UserId {
        self.remote_user_id
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn is_ignoring_offer(&self) -> bool {
        self.ignore_offer
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn connection(&self) -> &P {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Creates and applies a local offer in one step. Returns the frame to
    /// send, or `None` when an offer is already outstanding.
    pub fn on_negotiation_needed(&mut self) -> Result<Option<ClientMessage>> {
        if !self.begin_offer()? {
            return Ok(None);
        }
        self.complete_offer()
    }

    /// Creates a local offer without applying it. Until
    /// [`PeerLink::complete_offer`] runs the link is making an offer, so a
    /// remote offer delivered in between counts as a collision. Returns
    /// `false` when an offer is already outstanding.
    pub fn begin_offer(&mut self) -> Result<bool> {
        if self.closed {
            return Err(anyhow!("peer link to {} is closed", self.remote_user_id));
        }
        if self.making_offer || self.connection.signaling_state() != SignalingState::Stable {
            debug!(remote_user_id = self.remote_user_id, "negotiation already in flight");
            return Ok(false);
        }

        self.making_offer = true;
        match self.connection.create_offer() {
            Ok(offer) => {
                self.pending_offer = Some(offer);
                Ok(true)
            }
            Err(error) => {
                self.making_offer = false;
                Err(error)
            }
        }
    }

    /// Applies the offer from [`PeerLink::begin_offer`] and returns the frame
    /// to send. `None` when the offer was abandoned for a remote one.
    pub fn complete_offer(&mut self) -> Result<Option<ClientMessage>> {
        let result = match self.pending_offer.take() {
            Some(offer) if !self.closed => {
                self.connection.set_local_description(&offer).map(|()| {
                    Some(ClientMessage::WebrtcOffer {
                        room_user_id: self.room_user_id,
                        target_user_id: self.remote_user_id,
                        sdp: offer.sdp,
                    })
                })
            }
            _ => Ok(None),
        };
        self.making_offer = false;
        result
    }

    /// Applies a remote offer or answer. Returns the answer to send back
    /// when an offer was accepted.
    pub fn on_description(&mut self, description: SessionDescription) -> Result<Option<ClientMessage>> {
        if self.closed {
            return Ok(None);
        }

        let offer_collision = description.sdp_type == SdpType::Offer
            && (self.making_offer || self.connection.signaling_state() != SignalingState::Stable);
        self.ignore_offer = !self.polite && offer_collision;
        if self.ignore_offer {
            debug!(
                local_user_id = self.local_user_id,
                remote_user_id = self.remote_user_id,
                "ignoring colliding offer"
            );
            return Ok(None);
        }

        if offer_collision {
            debug!(
                local_user_id = self.local_user_id,
                remote_user_id = self.remote_user_id,
                "rolling back local offer"
            );
            // An offer still being created has not touched the connection.
            self.pending_offer = None;
            if self.connection.signaling_state() == SignalingState::HaveLocalOffer {
                self.connection.rollback()?;
            }
        }

        self.connection.set_remote_description(&description)?;
        self.flush_candidates();

        if description.sdp_type != SdpType::Offer {
            return Ok(None);
        }

        let answer = self.connection.create_answer()?;
        self.connection.set_local_description(&answer)?;
        Ok(Some(ClientMessage::WebrtcAnswer {
            room_user_id: self.room_user_id,
            target_user_id: self.remote_user_id,
            sdp: answer.sdp,
        }))
    }

    /// Applies or buffers a remote ICE candidate. Never fails: candidates
    /// for an ignored offer are dropped silently and a rejected one is logged.
    pub fn on_ice_candidate(&mut self, candidate: IceCandidate) {
        if self.closed || self.ignore_offer {
            return;
        }
        if !self.connection.has_remote_description() {
            self.pending_candidates.push(candidate);
            return;
        }
        self.apply_candidate(&candidate);
    }

    /// Wraps a locally gathered candidate for the remote side.
    pub fn local_candidate(&self, candidate: IceCandidate) -> ClientMessage {
        ClientMessage::WebrtcIceCandidate {
            room_user_id: self.room_user_id,
            target_user_id: self.remote_user_id,
            candidate,
        }
    }

    /// Tears the link down. Pending negotiation is abandoned.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.making_offer = false;
        self.ignore_offer = false;
        self.pending_offer = None;
        self.pending_candidates.clear();
        self.connection.close();
    }

    fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.apply_candidate(&candidate);
        }
    }

    fn apply_candidate(&mut self, candidate: &IceCandidate) {
        if let Err(error) = self.connection.add_ice_candidate(candidate) {
            warn!(error = %error, remote_user_id = self.remote_user_id, "failed to add ice candidate");
        }
    }
}
