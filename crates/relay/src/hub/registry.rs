// Live presence connections of one organisation.

use std::collections::{BTreeSet, HashMap};

use callboard_common::{
    protocol::ws::ServerMessage,
    types::{OrganisationId, UserId},
};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Identifies a registered connection. Returned by `PresenceHub::register`
/// and passed back for every operation the connection performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub organisation_id: OrganisationId,
    pub user_id: UserId,
}

#[derive(Debug)]
struct Connection {
    user_id: UserId,
    outbound: mpsc::Sender<ServerMessage>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn insert(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        outbound: mpsc::Sender<ServerMessage>,
    ) {
        self.connections.insert(connection_id, Connection { user_id, outbound });
    }

    /// Removes a connection, returning the user it belonged to.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<UserId> {
        self.connections.remove(&connection_id).map(|connection| connection.user_id)
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Distinct users with at least one live connection.
    pub fn users(&self) -> BTreeSet<UserId> {
        self.connections.values().map(|connection| connection.user_id).collect()
    }

    /// Queues a message without waiting. Returns false when the connection is
    /// unknown or its queue is full or closed.
    pub fn try_send(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        match self.connections.get(&connection_id) {
            Some(connection) => connection.outbound.try_send(message).is_ok(),
            None => false,
        }
    }
}
