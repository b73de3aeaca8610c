//! Client side of the callboard presence channel.
//!
//! [`presence`] keeps the organisation-scoped WebSocket open and mirrors the
//! relay's online and in-call sets. [`call`] drives one voice call on top of
//! it, holding a [`negotiation::PeerLink`] per remote participant.

pub mod call;
pub mod negotiation;
pub mod presence;
pub mod transport;
