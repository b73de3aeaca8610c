// Organisation-scoped presence hub.
//
// Each organisation's connections and rooms sit behind one async mutex, so
// every transition for that organisation is serialized and every presence
// snapshot is taken from consistent state. Delivery never waits: frames go
// into bounded per-connection queues, and a connection whose queue is full
// or closed is evicted before the operation returns.

pub mod registry;
pub mod rooms;
pub mod signaling;

use std::{
    collections::{BTreeSet, HashMap},
    mem,
    sync::Arc,
};

use callboard_common::{
    protocol::ws::{ClientMessage, ServerMessage},
    types::{IssueAction, OrganisationId, UserId},
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use rooms::{LeaveOutcome, RoomBook, RoomError};

pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// An `issue-changed` fact published by the issue service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueChange {
    pub project_id: i64,
    pub issue_id: i64,
    pub action: IssueAction,
    pub actor_user_id: UserId,
}

pub struct PresenceHub {
    organisations: RwLock<HashMap<OrganisationId, Arc<Mutex<OrganisationState>>>>,
    outbound_capacity: usize,
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_QUEUE)
    }
}

impl PresenceHub {
    pub fn new(outbound_capacity: usize) -> Self {
        Self { organisations: RwLock::new(HashMap::new()), outbound_capacity: outbound_capacity.max(1) }
    }

    /// Creates the bounded queue a connection task drains into its socket.
    pub fn outbound_channel(&self) -> (mpsc::Sender<ServerMessage>, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(self.outbound_capacity)
    }

    pub async fn register(
        &self,
        organisation_id: OrganisationId,
        user_id: UserId,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> ConnectionHandle {
        let handle = ConnectionHandle { connection_id: Uuid::new_v4(), organisation_id, user_id };

        loop {
            let state = self.organisation(organisation_id).await;
            let mut state = state.lock().await;
            // Lost a race with retirement; fetch the replacement entry.
            if state.retired {
                continue;
            }

            state.registry.insert(handle.connection_id, user_id, outbound);
            info!(
                organisation_id,
                user_id,
                connection_id = %handle.connection_id,
                connections = state.registry.len(),
                "presence connection registered"
            );
            state.settle(true);
            return handle;
        }
    }

    /// Removes a connection. Leaves the room it joined, if any. No-op for a
    /// connection that is already gone.
    pub async fn unregister(&self, handle: &ConnectionHandle) {
        let Some(state) = self.existing(handle.organisation_id).await else {
            return;
        };

        let idle = {
            let mut state = state.lock().await;
            if state.registry.remove(handle.connection_id).is_none() {
                return;
            }
            info!(
                organisation_id = handle.organisation_id,
                user_id = handle.user_id,
                connection_id = %handle.connection_id,
                "presence connection unregistered"
            );
            if let Some(outcome) = state.rooms.disconnect(handle.user_id, handle.connection_id) {
                state.announce_leave(handle.user_id, outcome);
            }
            state.settle(true);
            state.is_idle()
        };

        if idle {
            self.retire(handle.organisation_id).await;
        }
    }

    pub async fn connections_for(&self, organisation_id: OrganisationId) -> Vec<ConnectionId> {
        match self.existing(organisation_id).await {
            Some(state) => state.lock().await.registry.connection_ids(),
            None => Vec::new(),
        }
    }

    pub async fn users_for(&self, organisation_id: OrganisationId) -> BTreeSet<UserId> {
        match self.existing(organisation_id).await {
            Some(state) => state.lock().await.registry.users(),
            None => BTreeSet::new(),
        }
    }

    /// `permitted` is the caller's current organisation membership.
    pub async fn join_room(
        &self,
        handle: &ConnectionHandle,
        room_user_id: UserId,
        permitted: bool,
    ) -> Result<(), RoomError> {
        let Some(state) = self.existing(handle.organisation_id).await else {
            return Ok(());
        };
        let mut state = state.lock().await;
        if !state.registry.contains(handle.connection_id) {
            return Ok(());
        }

        let outcome =
            state.rooms.join(handle.user_id, room_user_id, handle.connection_id, permitted)?;
        let organisation_id = state.organisation_id;
        let participants_frame = ServerMessage::RoomParticipants {
            organisation_id,
            room_user_id,
            participant_user_ids: outcome.participants.clone(),
        };
        let joined_frame = ServerMessage::RoomJoined { organisation_id, room_user_id };

        if outcome.rejoined {
            debug!(organisation_id, user_id = handle.user_id, room_user_id, "room rejoined");
            state.send_to_connection(handle.connection_id, joined_frame);
            state.send_to_connection(handle.connection_id, participants_frame);
            state.settle(false);
            return Ok(());
        }

        info!(
            organisation_id,
            user_id = handle.user_id,
            room_user_id,
            created = outcome.created,
            participants = outcome.participants.len(),
            "room joined"
        );
        state.send_to_users(
            &outcome.existing_participants,
            ServerMessage::RoomUserJoined { organisation_id, room_user_id, user_id: handle.user_id },
        );
        state.send_to_connection(handle.connection_id, joined_frame);
        state.send_to_users(&outcome.participants, participants_frame);
        state.settle(true);
        Ok(())
    }

    /// Leaves the caller's current room. Leaving while in no room is a no-op.
    pub async fn leave_room(&self, handle: &ConnectionHandle) {
        let Some(state) = self.existing(handle.organisation_id).await else {
            return;
        };
        let mut state = state.lock().await;
        if let Some(outcome) = state.rooms.leave(handle.user_id) {
            state.announce_leave(handle.user_id, outcome);
            state.settle(true);
        }
    }

    pub async fn end_room(&self, handle: &ConnectionHandle) -> Result<(), RoomError> {
        let Some(state) = self.existing(handle.organisation_id).await else {
            return Ok(());
        };
        let mut state = state.lock().await;

        let outcome = state.rooms.end(handle.user_id)?;
        info!(
            organisation_id = state.organisation_id,
            room_user_id = outcome.room_user_id,
            participants = outcome.former_participants.len(),
            "room ended"
        );

        let mut recipients = outcome.former_participants;
        if !recipients.contains(&handle.user_id) {
            recipients.push(handle.user_id);
        }
        let frame = ServerMessage::RoomParticipants {
            organisation_id: state.organisation_id,
            room_user_id: outcome.room_user_id,
            participant_user_ids: Vec::new(),
        };
        state.send_to_users(&recipients, frame);
        state.settle(true);
        Ok(())
    }

    /// Forwards an offer, answer, candidate or peer-state frame.
    pub async fn relay_signal(
        &self,
        handle: &ConnectionHandle,
        message: ClientMessage,
    ) -> Result<(), RoomError> {
        let Some(state) = self.existing(handle.organisation_id).await else {
            return Ok(());
        };
        let mut state = state.lock().await;

        let kind = message.kind();
        let route =
            signaling::route(&state.rooms, state.organisation_id, handle.user_id, message)?;
        let delivered = state.send_to_users(&route.recipients, route.message);
        debug!(
            organisation_id = handle.organisation_id,
            user_id = handle.user_id,
            kind,
            recipients = ?route.recipients,
            delivered,
            "signal relayed"
        );
        state.settle(false);
        Ok(())
    }

    /// Fans an `issue-changed` frame out to every connection of the organisation.
    /// Returns how many connections accepted it.
    pub async fn publish_issue_changed(
        &self,
        organisation_id: OrganisationId,
        change: IssueChange,
    ) -> usize {
        let Some(state) = self.existing(organisation_id).await else {
            return 0;
        };
        let mut state = state.lock().await;

        let delivered = state.broadcast(ServerMessage::IssueChanged {
            organisation_id,
            project_id: change.project_id,
            issue_id: change.issue_id,
            action: change.action,
            actor_user_id: change.actor_user_id,
        });
        state.settle(false);
        delivered
    }

    async fn organisation(&self, organisation_id: OrganisationId) -> Arc<Mutex<OrganisationState>> {
        if let Some(state) = self.existing(organisation_id).await {
            return state;
        }

        let mut organisations = self.organisations.write().await;
        Arc::clone(
            organisations
                .entry(organisation_id)
                .or_insert_with(|| Arc::new(Mutex::new(OrganisationState::new(organisation_id)))),
        )
    }

    async fn existing(&self, organisation_id: OrganisationId) -> Option<Arc<Mutex<OrganisationState>>> {
        self.organisations.read().await.get(&organisation_id).cloned()
    }

    async fn retire(&self, organisation_id: OrganisationId) {
        let mut organisations = self.organisations.write().await;
        let Some(state) = organisations.get(&organisation_id).cloned() else {
            return;
        };
        let mut state = state.lock().await;
        if state.is_idle() {
            state.retired = true;
            organisations.remove(&organisation_id);
            debug!(organisation_id, "organisation state retired");
        }
    }
}

struct OrganisationState {
    organisation_id: OrganisationId,
    registry: ConnectionRegistry,
    rooms: RoomBook,
    /// Connections whose queue rejected a frame during the current operation.
    dead: BTreeSet<ConnectionId>,
    retired: bool,
}

impl OrganisationState {
    fn new(organisation_id: OrganisationId) -> Self {
        Self {
            organisation_id,
            registry: ConnectionRegistry::default(),
            rooms: RoomBook::default(),
            dead: BTreeSet::new(),
            retired: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.registry.is_empty() && self.rooms.is_empty()
    }

    fn send_to_connection(&mut self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        if self.registry.try_send(connection_id, message) {
            true
        } else {
            self.dead.insert(connection_id);
            false
        }
    }

    fn send_to_users(&mut self, users: &[UserId], message: ServerMessage) -> usize {
        let recipients: Vec<ConnectionId> =
            users.iter().flat_map(|user_id| self.registry.connections_of(*user_id)).collect();
        self.send_to_connections(recipients, message)
    }

    fn broadcast(&mut self, message: ServerMessage) -> usize {
        let recipients = self.registry.connection_ids();
        self.send_to_connections(recipients, message)
    }

    fn send_to_connections(&mut self, recipients: Vec<ConnectionId>, message: ServerMessage) -> usize {
        let mut delivered = 0;
        for connection_id in recipients {
            if self.send_to_connection(connection_id, message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn presence_snapshot(&self) -> ServerMessage {
        ServerMessage::OnlineUsers {
            organisation_id: self.organisation_id,
            user_ids: self.registry.users().into_iter().collect(),
            in_call_user_ids: self.rooms.in_call_users().into_iter().collect(),
            in_call_room_owner_user_ids: self.rooms.owners().into_iter().collect(),
        }
    }

    /// Tells the leaver and the remaining participants about the new roster.
    fn announce_leave(&mut self, user_id: UserId, outcome: LeaveOutcome) {
        info!(
            organisation_id = self.organisation_id,
            user_id,
            room_user_id = outcome.room_user_id,
            closed = outcome.closed,
            "room left"
        );
        let frame = ServerMessage::RoomParticipants {
            organisation_id: self.organisation_id,
            room_user_id: outcome.room_user_id,
            participant_user_ids: outcome.remaining.clone(),
        };
        let mut recipients = outcome.remaining;
        recipients.push(user_id);
        self.send_to_users(&recipients, frame);
    }

    /// Evicts dead connections and broadcasts presence until nothing changes.
    fn settle(&mut self, mut presence_changed: bool) {
        loop {
            if !self.dead.is_empty() {
                for connection_id in mem::take(&mut self.dead) {
                    let Some(user_id) = self.registry.remove(connection_id) else {
                        continue;
                    };
                    warn!(
                        organisation_id = self.organisation_id,
                        user_id,
                        connection_id = %connection_id,
                        "evicting connection with full or closed outbound queue"
                    );
                    metrics::increment_evicted_connections();
                    if let Some(outcome) = self.rooms.disconnect(user_id, connection_id) {
                        self.announce_leave(user_id, outcome);
                    }
                    presence_changed = true;
                }
                continue;
            }

            if !presence_changed {
                return;
            }
            presence_changed = false;
            let snapshot = self.presence_snapshot();
            self.broadcast(snapshot);
            metrics::increment_presence_broadcasts();
        }
    }
}
