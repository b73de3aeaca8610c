// Presence connection: organisation-scoped WebSocket client with reconnection.
//
// Transport is abstracted via `PresenceTransport` for testability; the
// tungstenite implementation lives in `transport`. `next_event` reconnects
// after a fixed delay with no ceiling on attempts.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use callboard_common::{
    protocol::{
        validation::validate_client_message,
        ws::{ClientMessage, ServerMessage},
    },
    types::{OrganisationId, UserId},
};
use tracing::{debug, info};
use url::Url;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Relay base URL (e.g. "wss://relay.example.com").
    pub relay_url: String,
    pub organisation_id: OrganisationId,
    /// Organisation-scoped access token.
    pub access_token: String,
}

/// Builds `/v1/presence?organisationId=..&token=..` on the relay base URL.
pub fn presence_url(config: &PresenceConfig) -> Result<Url> {
    let mut url = Url::parse(&config.relay_url)
        .map_err(|error| anyhow!("invalid relay_url `{}`: {error}", config.relay_url))?;
    match url.scheme() {
        "wss" => {}
        "ws" if is_loopback_host(url.host_str()) => {}
        _ => return Err(anyhow!("relay_url must use wss (ws is allowed only for localhost testing)")),
    }

    url.set_path("/v1/presence");
    url.query_pairs_mut()
        .clear()
        .append_pair("organisationId", &config.organisation_id.to_string())
        .append_pair("token", &config.access_token);
    Ok(url)
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

// ── Transport trait ─────────────────────────────────────────────────

/// Abstraction over the WebSocket so the connection logic runs against mocks.
pub trait PresenceTransport {
    fn connect(&mut self, url: &Url) -> Result<()>;

    fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Next server frame (blocking). `None` on clean close.
    fn recv(&mut self) -> Result<Option<ServerMessage>>;

    fn close(&mut self);
}

// ── Connection state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Torn down by the caller; never reconnects.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Connected,
    Message(ServerMessage),
    /// Connection lost. [`PresenceConnection::next_event`] retries after
    /// [`RECONNECT_DELAY`].
    Disconnected { reason: String },
}

// ── Presence view ───────────────────────────────────────────────────

/// Local mirror of the relay's presence and room frames. Every update
/// replaces whole sets, so replays and duplicates are harmless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceView {
    online: BTreeSet<UserId>,
    in_call: BTreeSet<UserId>,
    room_owners: BTreeSet<UserId>,
    rooms: BTreeMap<UserId, BTreeSet<UserId>>,
}

impl PresenceView {
    /// Applies a frame. Returns whether anything changed.
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        let before = self.clone();
        match message {
            ServerMessage::OnlineUsers {
                user_ids, in_call_user_ids, in_call_room_owner_user_ids, ..
            } => {
                self.online = user_ids.iter().copied().collect();
                self.in_call = in_call_user_ids.iter().copied().collect();
                self.room_owners = in_call_room_owner_user_ids.iter().copied().collect();
                self.rooms.retain(|owner, _| self.room_owners.contains(owner));
            }
            ServerMessage::RoomParticipants { room_user_id, participant_user_ids, .. } => {
                if participant_user_ids.is_empty() {
                    self.rooms.remove(room_user_id);
                } else {
                    self.rooms.insert(*room_user_id, participant_user_ids.iter().copied().collect());
                }
            }
            ServerMessage::RoomUserJoined { room_user_id, user_id, .. } => {
                self.rooms.entry(*room_user_id).or_default().insert(*user_id);
            }
            _ => {}
        }
        *self != before
    }

    pub fn online_users(&self) -> &BTreeSet<UserId> {
        &self.online
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.online.contains(&user_id)
    }

    pub fn is_in_call(&self, user_id: UserId) -> bool {
        self.in_call.contains(&user_id)
    }

    pub fn owns_room(&self, user_id: UserId) -> bool {
        self.room_owners.contains(&user_id)
    }

    /// Last known participants of a room, if this client has seen them.
    pub fn participants(&self, room_user_id: UserId) -> Option<&BTreeSet<UserId>> {
        self.rooms.get(&room_user_id)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ── Connection ──────────────────────────────────────────────────────

pub struct PresenceConnection<T: PresenceTransport> {
    config: PresenceConfig,
    transport: T,
    state: ConnectionState,
    view: PresenceView,
    consecutive_failures: u32,
}

impl<T: PresenceTransport> PresenceConnection<T> {
    pub fn new(config: PresenceConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            state: ConnectionState::Disconnected,
            view: PresenceView::default(),
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn view(&self) -> &PresenceView {
        &self.view
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Opens (or reopens) the socket. A refused connection comes back as a
    /// `Disconnected` event; only a bad configuration is an error.
    pub fn connect(&mut self) -> Result<PresenceEvent> {
        if self.state == ConnectionState::Closed {
            return Err(anyhow!("presence connection was closed"));
        }
        let url = presence_url(&self.config)?;
        self.state = ConnectionState::Connecting;

        if let Err(error) = self.transport.connect(&url) {
            self.state = ConnectionState::Disconnected;
            self.consecutive_failures += 1;
            return Ok(PresenceEvent::Disconnected {
                reason: format!("WebSocket connection failed: {error}"),
            });
        }

        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
        info!(organisation_id = self.config.organisation_id, "presence connection established");
        Ok(PresenceEvent::Connected)
    }

    /// Validates and sends a client frame.
    pub fn send(&mut self, message: &ClientMessage) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(anyhow!("cannot send {}: not connected", message.kind()));
        }
        validate_client_message(message)?;
        self.transport.send(message)
    }

    /// Reads the next frame and folds it into the view.
    pub fn recv_event(&mut self) -> Result<Option<PresenceEvent>> {
        if self.state != ConnectionState::Connected {
            return Err(anyhow!("cannot receive: not connected"));
        }

        match self.transport.recv() {
            Ok(Some(message)) => {
                if self.view.apply(&message) {
                    debug!(kind = message.kind(), "presence view updated");
                }
                Ok(Some(PresenceEvent::Message(message)))
            }
            Ok(None) => Ok(Some(self.lost("connection closed by server".to_string()))),
            Err(error) => {
                self.transport.close();
                Ok(Some(self.lost(format!("receive failed: {error}"))))
            }
        }
    }

    /// Drives the connection, blocking until something happens: reads the
    /// next frame while connected, otherwise (re)connects. A retry after a
    /// lost connection or failed attempt waits [`RECONNECT_DELAY`] first.
    /// Returns `None` once [`PresenceConnection::disconnect`] has run.
    pub fn next_event(&mut self) -> Result<Option<PresenceEvent>> {
        self.next_event_with(std::thread::sleep)
    }

    /// [`PresenceConnection::next_event`] with the wait supplied by the caller.
    pub fn next_event_with(&mut self, mut sleep: impl FnMut(Duration)) -> Result<Option<PresenceEvent>> {
        match self.state {
            ConnectionState::Closed => Ok(None),
            ConnectionState::Connected => self.recv_event(),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                if self.consecutive_failures > 0 {
                    debug!(
                        organisation_id = self.config.organisation_id,
                        attempt = self.consecutive_failures,
                        "waiting before presence reconnect"
                    );
                    sleep(RECONNECT_DELAY);
                }
                self.connect().map(Some)
            }
        }
    }

    /// Explicit teardown. Suppresses reconnection.
    pub fn disconnect(&mut self) {
        self.transport.close();
        self.view.clear();
        self.state = ConnectionState::Closed;
    }

    pub fn reconnect_delay(&self) -> Duration {
        RECONNECT_DELAY
    }

    pub fn should_reconnect(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    fn lost(&mut self, reason: String) -> PresenceEvent {
        // The relay drops our room seat and presence with the socket.
        self.view.clear();
        self.state = ConnectionState::Disconnected;
        self.consecutive_failures += 1;
        PresenceEvent::Disconnected { reason }
    }
}
