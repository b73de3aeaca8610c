// Payload caps and strict decoding for client frames.

use thiserror::Error;

use super::ws::ClientMessage;
use crate::types::IceCandidate;

/// Maximum SDP length (characters) accepted in offers and answers.
pub const MAX_SDP_CHARS: usize = 100_000;

/// Maximum ICE candidate line length (characters).
pub const MAX_ICE_CANDIDATE_CHARS: usize = 4_096;

/// Maximum length of `sdpMid` and `usernameFragment`.
pub const MAX_ICE_FIELD_CHARS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("sdp must not be empty")]
    EmptySdp,
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
}

/// Decode a raw text frame into a [`ClientMessage`] and validate its payload.
pub fn decode_client_message(raw: &str) -> Result<ClientMessage, ValidationError> {
    let message = serde_json::from_str::<ClientMessage>(raw)
        .map_err(|error| ValidationError::Malformed(error.to_string()))?;
    validate_client_message(&message)?;
    Ok(message)
}

/// Enforce payload caps. Routing checks (room membership) happen in the relay.
pub fn validate_client_message(message: &ClientMessage) -> Result<(), ValidationError> {
    match message {
        ClientMessage::WebrtcOffer { sdp, .. } | ClientMessage::WebrtcAnswer { sdp, .. } => {
            validate_sdp(sdp)
        }
        ClientMessage::WebrtcIceCandidate { candidate, .. } => validate_ice_candidate(candidate),
        ClientMessage::JoinRoom { .. }
        | ClientMessage::LeaveRoom {}
        | ClientMessage::EndRoom {}
        | ClientMessage::WebrtcPeerState { .. } => Ok(()),
    }
}

pub fn validate_sdp(sdp: &str) -> Result<(), ValidationError> {
    if sdp.trim().is_empty() {
        return Err(ValidationError::EmptySdp);
    }
    check_len("sdp", sdp, MAX_SDP_CHARS)
}

pub fn validate_ice_candidate(candidate: &IceCandidate) -> Result<(), ValidationError> {
    check_len("candidate", &candidate.candidate, MAX_ICE_CANDIDATE_CHARS)?;
    if let Some(sdp_mid) = &candidate.sdp_mid {
        check_len("sdpMid", sdp_mid, MAX_ICE_FIELD_CHARS)?;
    }
    if let Some(fragment) = &candidate.username_fragment {
        check_len("usernameFragment", fragment, MAX_ICE_FIELD_CHARS)?;
    }
    Ok(())
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    // Byte length bounds char count from above, so most values skip the scan.
    if value.len() > max && value.chars().count() > max {
        Err(ValidationError::TooLong { field, max })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer(sdp: String) -> String {
        json!({ "type": "webrtc-offer", "roomUserId": 1, "targetUserId": 2, "sdp": sdp })
            .to_string()
    }

    fn candidate_frame(candidate: serde_json::Value) -> String {
        json!({
            "type": "webrtc-ice-candidate",
            "roomUserId": 1,
            "targetUserId": 2,
            "candidate": candidate
        })
        .to_string()
    }

    #[test]
    fn accepts_sdp_at_the_cap() {
        let raw = offer("v".repeat(MAX_SDP_CHARS));
        assert!(decode_client_message(&raw).is_ok());
    }

    #[test]
    fn rejects_sdp_over_the_cap() {
        let raw = offer("v".repeat(MAX_SDP_CHARS + 1));
        assert_eq!(
            decode_client_message(&raw),
            Err(ValidationError::TooLong { field: "sdp", max: MAX_SDP_CHARS })
        );
    }

    #[test]
    fn counts_characters_not_bytes() {
        // Two bytes per char: byte length exceeds the cap, char count does not.
        let raw = offer("é".repeat(MAX_SDP_CHARS));
        assert!(decode_client_message(&raw).is_ok());
    }

    #[test]
    fn rejects_blank_sdp() {
        assert_eq!(decode_client_message(&offer("  ".into())), Err(ValidationError::EmptySdp));
    }

    #[test]
    fn accepts_end_of_candidates_marker() {
        let raw = candidate_frame(json!({ "candidate": "" }));
        assert!(decode_client_message(&raw).is_ok());
    }

    #[test]
    fn rejects_oversized_candidate() {
        let raw = candidate_frame(json!({ "candidate": "a".repeat(MAX_ICE_CANDIDATE_CHARS + 1) }));
        assert_eq!(
            decode_client_message(&raw),
            Err(ValidationError::TooLong { field: "candidate", max: MAX_ICE_CANDIDATE_CHARS })
        );
    }

    #[test]
    fn rejects_oversized_sdp_mid() {
        let raw = candidate_frame(
            json!({ "candidate": "c", "sdpMid": "m".repeat(MAX_ICE_FIELD_CHARS + 1) }),
        );
        assert!(matches!(
            decode_client_message(&raw),
            Err(ValidationError::TooLong { field: "sdpMid", .. })
        ));
    }

    #[test]
    fn malformed_json_is_reported_as_malformed() {
        assert!(matches!(decode_client_message("{not json"), Err(ValidationError::Malformed(_))));
        assert!(matches!(
            decode_client_message(r#"{"type":"join-room"}"#),
            Err(ValidationError::Malformed(_))
        ));
    }
}
