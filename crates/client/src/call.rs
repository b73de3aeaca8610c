// One voice call: a mesh of peer links, one per remote participant, kept in
// step with the relay's `room-participants` snapshots.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use callboard_common::{
    protocol::ws::{ClientMessage, ServerMessage},
    types::{IceCandidate, RoomErrorCode, UserId},
};
use tracing::{debug, info, warn};

use crate::negotiation::{PeerConnection, PeerLink, SessionDescription};

/// Builds the peer connection for a newly discovered participant.
pub trait PeerConnectionFactory {
    type Connection: PeerConnection;

    fn create(&mut self, remote_user_id: UserId) -> Result<Self::Connection>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The local user left.
    Left,
    /// The local user ended their own room.
    Ended,
    /// The room was closed by its owner.
    RoomClosed,
    /// The relay no longer lists the local user as a participant.
    Removed,
    RoomError { code: RoomErrorCode, message: String },
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Joining { room_user_id: UserId },
    InCall { room_user_id: UserId },
    Ended { reason: EndReason },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemotePeerState {
    pub muted: bool,
    pub speaking: Option<bool>,
}

pub struct CallSession<F: PeerConnectionFactory> {
    local_user_id: UserId,
    factory: F,
    state: CallState,
    links: BTreeMap<UserId, PeerLink<F::Connection>>,
    peer_states: BTreeMap<UserId, RemotePeerState>,
    participants: Vec<UserId>,
}

impl<F: PeerConnectionFactory> CallSession<F> {
    pub fn new(local_user_id: UserId, factory: F) -> Self {
        Self {
            local_user_id,
            factory,
            state: CallState::Idle,
            links: BTreeMap::new(),
            peer_states: BTreeMap::new(),
            participants: Vec::new(),
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn room_user_id(&self) -> Option<UserId> {
        match self.state {
            CallState::Joining { room_user_id } | CallState::InCall { room_user_id } => {
                Some(room_user_id)
            }
            CallState::Idle | CallState::Ended { .. } => None,
        }
    }

    pub fn participants(&self) -> &[UserId] {
        &self.participants
    }

    pub fn link(&self, remote_user_id: UserId) -> Option<&PeerLink<F::Connection>> {
        self.links.get(&remote_user_id)
    }

    pub fn linked_users(&self) -> Vec<UserId> {
        self.links.keys().copied().collect()
    }

    pub fn peer_state(&self, remote_user_id: UserId) -> Option<RemotePeerState> {
        self.peer_states.get(&remote_user_id).copied()
    }

    /// Starts joining a room. Joining the local user's own id opens a room.
    pub fn join(&mut self, room_user_id: UserId) -> Result<ClientMessage> {
        if let Some(current) = self.room_user_id() {
            bail!("already in room {current}; leave it before joining {room_user_id}");
        }
        self.state = CallState::Joining { room_user_id };
        Ok(ClientMessage::JoinRoom { room_user_id })
    }

    /// Leaves the current room, dropping every link at once. `None` when not
    /// in a call.
    pub fn leave(&mut self) -> Option<ClientMessage> {
        self.room_user_id()?;
        self.finish(EndReason::Left);
        Some(ClientMessage::LeaveRoom {})
    }

    /// Ends the room the local user owns.
    pub fn end(&mut self) -> Result<ClientMessage> {
        match self.state {
            CallState::InCall { room_user_id } if room_user_id == self.local_user_id => {
                self.finish(EndReason::Ended);
                Ok(ClientMessage::EndRoom {})
            }
            CallState::InCall { room_user_id } => {
                bail!("room {room_user_id} is owned by another user")
            }
            _ => bail!("not in a call"),
        }
    }

    /// The presence socket dropped; the relay has already released the seat.
    pub fn on_disconnected(&mut self) {
        if self.room_user_id().is_some() {
            self.finish(EndReason::Disconnected);
        }
    }

    /// Applies a relay frame and returns the frames to send in response.
    pub fn handle(&mut self, message: &ServerMessage) -> Vec<ClientMessage> {
        match message {
            ServerMessage::RoomJoined { room_user_id, .. } => {
                if self.room_user_id() == Some(*room_user_id) {
                    info!(room_user_id, "joined call");
                    self.state = CallState::InCall { room_user_id: *room_user_id };
                }
                Vec::new()
            }
            ServerMessage::RoomParticipants { room_user_id, participant_user_ids, .. } => {
                self.reconcile(*room_user_id, participant_user_ids)
            }
            ServerMessage::RoomError { code, message } => {
                self.on_room_error(*code, message);
                Vec::new()
            }
            ServerMessage::WebrtcOffer { room_user_id, from_user_id, sdp, .. } => {
                self.on_remote_description(*room_user_id, *from_user_id, SessionDescription::offer(sdp.clone()))
            }
            ServerMessage::WebrtcAnswer { room_user_id, from_user_id, sdp, .. } => {
                self.on_remote_description(*room_user_id, *from_user_id, SessionDescription::answer(sdp.clone()))
            }
            ServerMessage::WebrtcIceCandidate { room_user_id, from_user_id, candidate, .. } => {
                if let Some(link) = self.routed_link(*room_user_id, *from_user_id) {
                    link.on_ice_candidate(candidate.clone());
                }
                Vec::new()
            }
            ServerMessage::WebrtcPeerState { room_user_id, from_user_id, muted, speaking, .. } => {
                if self.in_call_for(*room_user_id) {
                    self.peer_states
                        .insert(*from_user_id, RemotePeerState { muted: *muted, speaking: *speaking });
                }
                Vec::new()
            }
            ServerMessage::OnlineUsers { .. }
            | ServerMessage::RoomUserJoined { .. }
            | ServerMessage::IssueChanged { .. } => Vec::new(),
        }
    }

    /// Renegotiates with one peer, e.g. after a local track change.
    pub fn negotiation_needed(&mut self, remote_user_id: UserId) -> Result<Option<ClientMessage>> {
        match self.links.get_mut(&remote_user_id) {
            Some(link) => link.on_negotiation_needed(),
            None => bail!("no peer link to user {remote_user_id}"),
        }
    }

    pub fn local_ice_candidate(
        &self,
        remote_user_id: UserId,
        candidate: IceCandidate,
    ) -> Option<ClientMessage> {
        self.links.get(&remote_user_id).map(|link| link.local_candidate(candidate))
    }

    /// Announces the local mute/speaking state to the room.
    pub fn set_local_state(&self, muted: bool, speaking: Option<bool>) -> Option<ClientMessage> {
        match self.state {
            CallState::InCall { room_user_id } => {
                Some(ClientMessage::WebrtcPeerState { room_user_id, muted, speaking })
            }
            _ => None,
        }
    }

    fn in_call_for(&self, room_user_id: UserId) -> bool {
        self.state == CallState::InCall { room_user_id }
    }

    fn reconcile(&mut self, room_user_id: UserId, participant_user_ids: &[UserId]) -> Vec<ClientMessage> {
        if self.room_user_id() != Some(room_user_id) {
            return Vec::new();
        }
        if participant_user_ids.is_empty() {
            self.finish(EndReason::RoomClosed);
            return Vec::new();
        }
        if !participant_user_ids.contains(&self.local_user_id) {
            // A join that is still in flight has not been seated yet.
            if matches!(self.state, CallState::InCall { .. }) {
                self.finish(EndReason::Removed);
            }
            return Vec::new();
        }

        self.state = CallState::InCall { room_user_id };
        self.participants = participant_user_ids.to_vec();

        let remotes: BTreeSet<UserId> = participant_user_ids
            .iter()
            .copied()
            .filter(|user_id| *user_id != self.local_user_id)
            .collect();

        let departed: Vec<UserId> =
            self.links.keys().copied().filter(|user_id| !remotes.contains(user_id)).collect();
        for user_id in departed {
            if let Some(mut link) = self.links.remove(&user_id) {
                debug!(remote_user_id = user_id, "participant left; closing peer link");
                link.close();
            }
            self.peer_states.remove(&user_id);
        }

        let mut outbound = Vec::new();
        for user_id in remotes {
            if self.links.contains_key(&user_id) {
                continue;
            }
            let Some(link) = self.open_link(room_user_id, user_id) else {
                continue;
            };
            match link.on_negotiation_needed() {
                Ok(Some(offer)) => outbound.push(offer),
                Ok(None) => {}
                Err(error) => warn!(error = %error, remote_user_id = user_id, "failed to create offer"),
            }
        }
        outbound
    }

    fn on_remote_description(
        &mut self,
        room_user_id: UserId,
        from_user_id: UserId,
        description: SessionDescription,
    ) -> Vec<ClientMessage> {
        let kind = description.sdp_type.as_str();
        let Some(link) = self.routed_link(room_user_id, from_user_id) else {
            return Vec::new();
        };
        match link.on_description(description) {
            Ok(reply) => reply.into_iter().collect(),
            Err(error) => {
                warn!(error = %error, remote_user_id = from_user_id, kind, "failed to apply remote description");
                Vec::new()
            }
        }
    }

    /// The link a signaling frame belongs to. Frames may overtake the
    /// `room-participants` update that introduces their sender, so a link is
    /// opened on demand.
    fn routed_link(&mut self, room_user_id: UserId, from_user_id: UserId) -> Option<&mut PeerLink<F::Connection>> {
        if !self.in_call_for(room_user_id) || from_user_id == self.local_user_id {
            debug!(room_user_id, from_user_id, "dropping signal outside the current call");
            return None;
        }
        if !self.links.contains_key(&from_user_id)
            && self.open_link(room_user_id, from_user_id).is_none()
        {
            return None;
        }
        self.links.get_mut(&from_user_id)
    }

    fn open_link(&mut self, room_user_id: UserId, remote_user_id: UserId) -> Option<&mut PeerLink<F::Connection>> {
        match self.factory.create(remote_user_id) {
            Ok(connection) => {
                let link = PeerLink::new(self.local_user_id, remote_user_id, room_user_id, connection);
                Some(self.links.entry(remote_user_id).or_insert(link))
            }
            Err(error) => {
                warn!(error = %error, remote_user_id, "failed to create peer connection");
                None
            }
        }
    }

    fn on_room_error(&mut self, code: RoomErrorCode, message: &str) {
        // A rejected signal during a call leaves the call itself intact.
        if code == RoomErrorCode::SignalInvalid && matches!(self.state, CallState::InCall { .. }) {
            warn!(code = code.as_str(), message, "relay rejected a signal");
            return;
        }
        if self.room_user_id().is_some() {
            warn!(code = code.as_str(), message, "call ended by room error");
            self.finish(EndReason::RoomError { code, message: message.to_owned() });
        }
    }

    fn finish(&mut self, reason: EndReason) {
        for (_, mut link) in std::mem::take(&mut self.links) {
            link.close();
        }
        self.peer_states.clear();
        self.participants.clear();
        info!(?reason, "call finished");
        self.state = CallState::Ended { reason };
    }
}
