// Core domain types shared by the relay and client crates.

use serde::{Deserialize, Serialize};

/// Organisation identifier (the tenant every connection is scoped to).
pub type OrganisationId = i64;

/// User identifier. Also identifies a room: a room is keyed by its owner.
pub type UserId = i64;

/// Codes carried by `room-error` frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomErrorCode {
    /// Acting on a room that does not exist.
    InvalidRoom,
    /// Acting on a room or user without the required membership.
    ForbiddenRoom,
    /// Joining a room while already participating in another one.
    InCall,
    /// Malformed, oversized or out-of-contract client message.
    SignalInvalid,
}

impl RoomErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRoom => "INVALID_ROOM",
            Self::ForbiddenRoom => "FORBIDDEN_ROOM",
            Self::InCall => "IN_CALL",
            Self::SignalInvalid => "SIGNAL_INVALID",
        }
    }
}

/// What happened to an issue in an `issue-changed` notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueAction {
    Created,
    Updated,
}

/// An ICE candidate as produced by `RTCPeerConnection.onicecandidate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}
