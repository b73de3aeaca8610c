// WebRTC signaling routing between participants of one room.

use callboard_common::{
    protocol::ws::{ClientMessage, ServerMessage},
    types::{OrganisationId, UserId},
};

use super::rooms::{RoomBook, RoomError};

/// Who receives a relayed signal, and the stamped frame to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub recipients: Vec<UserId>,
    pub message: ServerMessage,
}

pub fn route(
    rooms: &RoomBook,
    organisation_id: OrganisationId,
    sender: UserId,
    message: ClientMessage,
) -> Result<Route, RoomError> {
    match message {
        ClientMessage::WebrtcOffer { room_user_id, target_user_id, sdp } => {
            check_pair(rooms, room_user_id, sender, target_user_id)?;
            Ok(Route {
                recipients: vec![target_user_id],
                message: ServerMessage::WebrtcOffer {
                    organisation_id,
                    room_user_id,
                    from_user_id: sender,
                    sdp,
                },
            })
        }
        ClientMessage::WebrtcAnswer { room_user_id, target_user_id, sdp } => {
            check_pair(rooms, room_user_id, sender, target_user_id)?;
            Ok(Route {
                recipients: vec![target_user_id],
                message: ServerMessage::WebrtcAnswer {
                    organisation_id,
                    room_user_id,
                    from_user_id: sender,
                    sdp,
                },
            })
        }
        ClientMessage::WebrtcIceCandidate { room_user_id, target_user_id, candidate } => {
            check_pair(rooms, room_user_id, sender, target_user_id)?;
            Ok(Route {
                recipients: vec![target_user_id],
                message: ServerMessage::WebrtcIceCandidate {
                    organisation_id,
                    room_user_id,
                    from_user_id: sender,
                    candidate,
                },
            })
        }
        ClientMessage::WebrtcPeerState { room_user_id, muted, speaking } => {
            check_sender(rooms, room_user_id, sender)?;
            let recipients = rooms
                .participants(room_user_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|user_id| *user_id != sender)
                .collect();
            Ok(Route {
                recipients,
                message: ServerMessage::WebrtcPeerState {
                    organisation_id,
                    room_user_id,
                    from_user_id: sender,
                    muted,
                    speaking,
                },
            })
        }
        other => Err(RoomError::InvalidSignal(format!("{} is not a signaling message", other.kind()))),
    }
}

fn check_sender(rooms: &RoomBook, room_user_id: UserId, sender: UserId) -> Result<(), RoomError> {
    if rooms.is_participant(room_user_id, sender) {
        Ok(())
    } else {
        Err(RoomError::InvalidSignal(format!("not a participant of call {room_user_id}")))
    }
}

fn check_pair(
    rooms: &RoomBook,
    room_user_id: UserId,
    sender: UserId,
    target: UserId,
) -> Result<(), RoomError> {
    check_sender(rooms, room_user_id, sender)?;
    if target == sender {
        return Err(RoomError::InvalidSignal("cannot signal yourself".into()));
    }
    if !rooms.is_participant(room_user_id, target) {
        return Err(RoomError::InvalidSignal(format!(
            "user {target} is not a participant of call {room_user_id}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use callboard_common::types::{IceCandidate, RoomErrorCode};
    use uuid::Uuid;

    fn book_with(room_user_id: UserId, participants: &[UserId]) -> RoomBook {
        let mut book = RoomBook::default();
        book.join(room_user_id, room_user_id, Uuid::new_v4(), true).expect("create");
        for user in participants.iter().filter(|user| **user != room_user_id) {
            book.join(*user, room_user_id, Uuid::new_v4(), true).expect("join");
        }
        book
    }

    fn offer(room_user_id: UserId, target_user_id: UserId) -> ClientMessage {
        ClientMessage::WebrtcOffer { room_user_id, target_user_id, sdp: "v=0".into() }
    }

    #[test]
    fn offer_is_unicast_and_stamped_with_sender() {
        let book = book_with(1, &[1, 2, 3]);
        let route = route(&book, 42, 2, offer(1, 3)).expect("routable");

        assert_eq!(route.recipients, vec![3]);
        assert_eq!(
            route.message,
            ServerMessage::WebrtcOffer {
                organisation_id: 42,
                room_user_id: 1,
                from_user_id: 2,
                sdp: "v=0".into()
            }
        );
    }

    #[test]
    fn candidate_keeps_payload() {
        let book = book_with(1, &[1, 2]);
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host");
        let message = ClientMessage::WebrtcIceCandidate {
            room_user_id: 1,
            target_user_id: 1,
            candidate: candidate.clone(),
        };
        let route = route(&book, 42, 2, message).expect("routable");
        match route.message {
            ServerMessage::WebrtcIceCandidate { from_user_id, candidate: relayed, .. } => {
                assert_eq!(from_user_id, 2);
                assert_eq!(relayed, candidate);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn target_outside_room_is_rejected() {
        let mut book = book_with(1, &[1, 2]);
        book.join(5, 5, Uuid::new_v4(), true).expect("other room");

        let error = route(&book, 42, 2, offer(1, 5)).expect_err("target in another room");
        assert_eq!(error.code(), RoomErrorCode::SignalInvalid);
        let error = route(&book, 42, 2, offer(1, 77)).expect_err("target offline");
        assert_eq!(error.code(), RoomErrorCode::SignalInvalid);
    }

    #[test]
    fn sender_outside_room_is_rejected() {
        let book = book_with(1, &[1, 2]);
        let error = route(&book, 42, 9, offer(1, 2)).expect_err("sender not seated");
        assert_eq!(error.code(), RoomErrorCode::SignalInvalid);

        let error = route(&book, 42, 2, offer(8, 1)).expect_err("room does not exist");
        assert_eq!(error.code(), RoomErrorCode::SignalInvalid);
    }

    #[test]
    fn signaling_yourself_is_rejected() {
        let book = book_with(1, &[1, 2]);
        let error = route(&book, 42, 2, offer(1, 2)).expect_err("self target");
        assert_eq!(error.code(), RoomErrorCode::SignalInvalid);
    }

    #[test]
    fn peer_state_fans_out_to_other_participants() {
        let book = book_with(1, &[1, 2, 3]);
        let message = ClientMessage::WebrtcPeerState { room_user_id: 1, muted: true, speaking: None };
        let route = route(&book, 42, 3, message).expect("routable");

        assert_eq!(route.recipients, vec![1, 2]);
        assert!(matches!(
            route.message,
            ServerMessage::WebrtcPeerState { from_user_id: 3, muted: true, speaking: None, .. }
        ));
    }

    #[test]
    fn room_commands_are_not_signals() {
        let book = book_with(1, &[1]);
        let error = route(&book, 42, 1, ClientMessage::LeaveRoom {}).expect_err("not a signal");
        assert_eq!(error.code(), RoomErrorCode::SignalInvalid);
    }
}
