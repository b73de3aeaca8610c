// WebSocket frame types for the presence and call-signaling channel.
//
// Frames are JSON objects tagged by `type` (kebab-case) with camelCase
// fields. Client frames are decoded strictly: unknown fields are rejected.

use serde::{Deserialize, Serialize};

use crate::types::{IceCandidate, IssueAction, OrganisationId, RoomErrorCode, UserId};

/// Frames a browser sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase",
    deny_unknown_fields
)]
pub enum ClientMessage {
    /// Join (or, when `room_user_id` is the sender, open) a call room.
    JoinRoom { room_user_id: UserId },

    /// Leave whichever room the sender is in.
    LeaveRoom {},

    /// Close the room the sender owns, removing every participant.
    EndRoom {},

    WebrtcOffer { room_user_id: UserId, target_user_id: UserId, sdp: String },

    WebrtcAnswer { room_user_id: UserId, target_user_id: UserId, sdp: String },

    WebrtcIceCandidate { room_user_id: UserId, target_user_id: UserId, candidate: IceCandidate },

    /// Mute/speaking indicator, fanned out to the rest of the room.
    WebrtcPeerState {
        room_user_id: UserId,
        muted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speaking: Option<bool>,
    },
}

impl ClientMessage {
    /// Short label used for metrics and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom {} => "leave-room",
            Self::EndRoom {} => "end-room",
            Self::WebrtcOffer { .. } => "webrtc-offer",
            Self::WebrtcAnswer { .. } => "webrtc-answer",
            Self::WebrtcIceCandidate { .. } => "webrtc-ice-candidate",
            Self::WebrtcPeerState { .. } => "webrtc-peer-state",
        }
    }
}

/// Frames the relay sends to browsers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Presence snapshot for the whole organisation.
    OnlineUsers {
        organisation_id: OrganisationId,
        user_ids: Vec<UserId>,
        in_call_user_ids: Vec<UserId>,
        in_call_room_owner_user_ids: Vec<UserId>,
    },

    /// Full participant list of one room. Empty when the room has ended.
    RoomParticipants {
        organisation_id: OrganisationId,
        room_user_id: UserId,
        participant_user_ids: Vec<UserId>,
    },

    /// Sent to the joining user once they are in the room.
    RoomJoined { organisation_id: OrganisationId, room_user_id: UserId },

    /// Sent to the participants that were already in the room.
    RoomUserJoined { organisation_id: OrganisationId, room_user_id: UserId, user_id: UserId },

    RoomError { code: RoomErrorCode, message: String },

    IssueChanged {
        organisation_id: OrganisationId,
        project_id: i64,
        issue_id: i64,
        action: IssueAction,
        actor_user_id: UserId,
    },

    WebrtcOffer {
        organisation_id: OrganisationId,
        room_user_id: UserId,
        from_user_id: UserId,
        sdp: String,
    },

    WebrtcAnswer {
        organisation_id: OrganisationId,
        room_user_id: UserId,
        from_user_id: UserId,
        sdp: String,
    },

    WebrtcIceCandidate {
        organisation_id: OrganisationId,
        room_user_id: UserId,
        from_user_id: UserId,
        candidate: IceCandidate,
    },

    WebrtcPeerState {
        organisation_id: OrganisationId,
        room_user_id: UserId,
        from_user_id: UserId,
        muted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speaking: Option<bool>,
    },
}

impl ServerMessage {
    pub fn room_error(code: RoomErrorCode, message: impl Into<String>) -> Self {
        Self::RoomError { code, message: message.into() }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::OnlineUsers { .. } => "online-users",
            Self::RoomParticipants { .. } => "room-participants",
            Self::RoomJoined { .. } => "room-joined",
            Self::RoomUserJoined { .. } => "room-user-joined",
            Self::RoomError { .. } => "room-error",
            Self::IssueChanged { .. } => "issue-changed",
            Self::WebrtcOffer { .. } => "webrtc-offer",
            Self::WebrtcAnswer { .. } => "webrtc-answer",
            Self::WebrtcIceCandidate { .. } => "webrtc-ice-candidate",
            Self::WebrtcPeerState { .. } => "webrtc-peer-state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_uses_kebab_tag_and_camel_fields() {
        let value = serde_json::to_value(ClientMessage::JoinRoom { room_user_id: 1 }).unwrap();
        assert_eq!(value, json!({ "type": "join-room", "roomUserId": 1 }));
    }

    #[test]
    fn field_less_frames_serialize_to_bare_type() {
        let value = serde_json::to_value(ClientMessage::LeaveRoom {}).unwrap();
        assert_eq!(value, json!({ "type": "leave-room" }));
        let parsed: ClientMessage = serde_json::from_value(json!({ "type": "end-room" })).unwrap();
        assert_eq!(parsed, ClientMessage::EndRoom {});
    }

    #[test]
    fn client_frames_reject_unknown_fields() {
        let raw = json!({ "type": "join-room", "roomUserId": 1, "extra": true });
        assert!(serde_json::from_value::<ClientMessage>(raw).is_err());

        let raw = json!({ "type": "leave-room", "roomUserId": 1 });
        assert!(serde_json::from_value::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn client_frames_reject_wrong_types() {
        let raw = json!({ "type": "join-room", "roomUserId": "1" });
        assert!(serde_json::from_value::<ClientMessage>(raw).is_err());

        let raw = json!({ "type": "webrtc-peer-state", "roomUserId": 1, "muted": "yes" });
        assert!(serde_json::from_value::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn client_frames_reject_unknown_type() {
        let raw = json!({ "type": "ping" });
        assert!(serde_json::from_value::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn client_ice_candidate_parses_browser_shape() {
        let raw = json!({
            "type": "webrtc-ice-candidate",
            "roomUserId": 1,
            "targetUserId": 2,
            "candidate": { "candidate": "candidate:0 1 UDP 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0 }
        });
        match serde_json::from_value::<ClientMessage>(raw).unwrap() {
            ClientMessage::WebrtcIceCandidate { room_user_id, target_user_id, candidate } => {
                assert_eq!(room_user_id, 1);
                assert_eq!(target_user_id, 2);
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("expected ice candidate, got {other:?}"),
        }
    }

    #[test]
    fn online_users_serializes_expected_shape() {
        let value = serde_json::to_value(ServerMessage::OnlineUsers {
            organisation_id: 42,
            user_ids: vec![1, 2],
            in_call_user_ids: vec![1],
            in_call_room_owner_user_ids: vec![1],
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "online-users",
                "organisationId": 42,
                "userIds": [1, 2],
                "inCallUserIds": [1],
                "inCallRoomOwnerUserIds": [1]
            })
        );
    }

    #[test]
    fn peer_state_omits_speaking_when_absent() {
        let value = serde_json::to_value(ServerMessage::WebrtcPeerState {
            organisation_id: 42,
            room_user_id: 1,
            from_user_id: 2,
            muted: true,
            speaking: None,
        })
        .unwrap();
        assert!(value.get("speaking").is_none());
        assert_eq!(value["fromUserId"], 2);
    }

    #[test]
    fn room_error_carries_code_and_message() {
        let value = serde_json::to_value(ServerMessage::room_error(
            RoomErrorCode::InCall,
            "already in a call",
        ))
        .unwrap();
        assert_eq!(
            value,
            json!({ "type": "room-error", "code": "IN_CALL", "message": "already in a call" })
        );
    }
}
