// Call room state machine for one organisation.
//
// A room is keyed by its owner. Each participant holds a seat bound to the
// connection that joined, so closing that connection leaves the room while
// other tabs of the same user do not.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use callboard_common::{
    protocol::validation::ValidationError,
    types::{RoomErrorCode, UserId},
};
use thiserror::Error;

use super::registry::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("call {room_user_id} does not exist")]
    InvalidRoom { room_user_id: UserId },
    #[error("not an active member of this organisation")]
    NotMember,
    #[error("only the owner can end call {room_user_id}")]
    NotOwner { room_user_id: UserId },
    #[error("already in call {room_user_id}")]
    InCall { room_user_id: UserId },
    #[error("{0}")]
    InvalidSignal(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl RoomError {
    pub const fn code(&self) -> RoomErrorCode {
        match self {
            Self::InvalidRoom { .. } => RoomErrorCode::InvalidRoom,
            Self::NotMember | Self::NotOwner { .. } => RoomErrorCode::ForbiddenRoom,
            Self::InCall { .. } => RoomErrorCode::InCall,
            Self::InvalidSignal(_) | Self::Validation(_) => RoomErrorCode::SignalInvalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_user_id: UserId,
    pub created: bool,
    /// The caller was already seated in this room.
    pub rejoined: bool,
    /// Participants seated before the caller arrived. Empty on create and rejoin.
    pub existing_participants: Vec<UserId>,
    pub participants: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_user_id: UserId,
    pub remaining: Vec<UserId>,
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOutcome {
    pub room_user_id: UserId,
    pub former_participants: Vec<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seat {
    room_user_id: UserId,
    connection_id: ConnectionId,
}

#[derive(Debug, Default)]
pub struct RoomBook {
    rooms: BTreeMap<UserId, BTreeSet<UserId>>,
    seats: HashMap<UserId, Seat>,
}

impl RoomBook {
    pub fn join(
        &mut self,
        user_id: UserId,
        room_user_id: UserId,
        connection_id: ConnectionId,
        permitted: bool,
    ) -> Result<JoinOutcome, RoomError> {
        let exists = self.rooms.contains_key(&room_user_id);
        if !exists && user_id != room_user_id {
            return Err(RoomError::InvalidRoom { room_user_id });
        }
        if !permitted {
            return Err(RoomError::NotMember);
        }
        if let Some(seat) = self.seats.get(&user_id) {
            if seat.room_user_id != room_user_id {
                return Err(RoomError::InCall { room_user_id: seat.room_user_id });
            }
        }

        let participants = self.rooms.entry(room_user_id).or_default();
        let rejoined = participants.contains(&user_id);
        let existing_participants =
            if rejoined { Vec::new() } else { participants.iter().copied().collect() };
        participants.insert(user_id);
        let participants = participants.iter().copied().collect();

        // Rebinding lets a reconnecting tab take over the seat.
        self.seats.insert(user_id, Seat { room_user_id, connection_id });

        Ok(JoinOutcome {
            room_user_id,
            created: !exists,
            rejoined,
            existing_participants,
            participants,
        })
    }

    /// Leaves whichever room the user is seated in. `None` when not in a room.
    pub fn leave(&mut self, user_id: UserId) -> Option<LeaveOutcome> {
        let seat = self.seats.remove(&user_id)?;
        let participants = self.rooms.get_mut(&seat.room_user_id)?;
        participants.remove(&user_id);

        let remaining: Vec<UserId> = participants.iter().copied().collect();
        let closed = remaining.is_empty();
        if closed {
            self.rooms.remove(&seat.room_user_id);
        }

        Some(LeaveOutcome { room_user_id: seat.room_user_id, remaining, closed })
    }

    /// Leaves only if the seat is bound to `connection_id`.
    pub fn disconnect(
        &mut self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Option<LeaveOutcome> {
        match self.seats.get(&user_id) {
            Some(seat) if seat.connection_id == connection_id => self.leave(user_id),
            _ => None,
        }
    }

    pub fn end(&mut self, user_id: UserId) -> Result<EndOutcome, RoomError> {
        let Some(participants) = self.rooms.remove(&user_id) else {
            return Err(match self.seats.get(&user_id) {
                Some(seat) => RoomError::NotOwner { room_user_id: seat.room_user_id },
                None => RoomError::InvalidRoom { room_user_id: user_id },
            });
        };

        for participant in &participants {
            self.seats.remove(participant);
        }

        Ok(EndOutcome { room_user_id: user_id, former_participants: participants.into_iter().collect() })
    }

    pub fn participants(&self, room_user_id: UserId) -> Option<Vec<UserId>> {
        self.rooms.get(&room_user_id).map(|participants| participants.iter().copied().collect())
    }

    pub fn is_participant(&self, room_user_id: UserId, user_id: UserId) -> bool {
        self.seats.get(&user_id).is_some_and(|seat| seat.room_user_id == room_user_id)
    }

    pub fn room_of(&self, user_id: UserId) -> Option<UserId> {
        self.seats.get(&user_id).map(|seat| seat.room_user_id)
    }

    pub fn in_call_users(&self) -> BTreeSet<UserId> {
        self.seats.keys().copied().collect()
    }

    pub fn owners(&self) -> BTreeSet<UserId> {
        self.rooms.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn conn() -> ConnectionId {
        Uuid::new_v4()
    }

    fn assert_consistent(book: &RoomBook) {
        for (owner, participants) in &book.rooms {
            assert!(!participants.is_empty(), "room {owner} kept with no participants");
            for participant in participants {
                assert_eq!(book.room_of(*participant), Some(*owner));
            }
        }
        for (user, seat) in &book.seats {
            assert!(book.rooms.get(&seat.room_user_id).is_some_and(|p| p.contains(user)));
        }
    }

    #[test]
    fn owner_creates_room_as_sole_participant() {
        let mut book = RoomBook::default();
        let outcome = book.join(1, 1, conn(), true).expect("owner creates room");

        assert!(outcome.created);
        assert!(!outcome.rejoined);
        assert!(outcome.existing_participants.is_empty());
        assert_eq!(outcome.participants, vec![1]);
        assert_eq!(book.owners(), BTreeSet::from([1]));
        assert_consistent(&book);
    }

    #[test]
    fn joining_missing_room_as_non_owner_is_invalid() {
        let mut book = RoomBook::default();
        assert_eq!(
            book.join(2, 1, conn(), true),
            Err(RoomError::InvalidRoom { room_user_id: 1 })
        );
        assert!(book.is_empty());
    }

    #[test]
    fn missing_room_is_reported_before_permission() {
        let mut book = RoomBook::default();
        let error = book.join(2, 1, conn(), false).expect_err("no room");
        assert_eq!(error.code(), RoomErrorCode::InvalidRoom);

        book.join(1, 1, conn(), true).expect("create");
        let error = book.join(2, 1, conn(), false).expect_err("not a member");
        assert_eq!(error.code(), RoomErrorCode::ForbiddenRoom);
    }

    #[test]
    fn second_participant_sees_existing_ones() {
        let mut book = RoomBook::default();
        book.join(1, 1, conn(), true).expect("create");
        let outcome = book.join(2, 1, conn(), true).expect("join");

        assert!(!outcome.created);
        assert_eq!(outcome.existing_participants, vec![1]);
        assert_eq!(outcome.participants, vec![1, 2]);
        assert_consistent(&book);
    }

    #[test]
    fn joining_another_room_while_seated_is_in_call() {
        let mut book = RoomBook::default();
        book.join(1, 1, conn(), true).expect("create 1");
        book.join(3, 3, conn(), true).expect("create 3");
        book.join(2, 1, conn(), true).expect("join 1");

        let error = book.join(2, 3, conn(), true).expect_err("already seated");
        assert_eq!(error, RoomError::InCall { room_user_id: 1 });
        assert_eq!(error.code(), RoomErrorCode::InCall);

        let error = book.join(2, 2, conn(), true).expect_err("cannot open own room while seated");
        assert_eq!(error.code(), RoomErrorCode::InCall);
        assert_consistent(&book);
    }

    #[test]
    fn rejoining_same_room_is_idempotent_and_rebinds_seat() {
        let mut book = RoomBook::default();
        let first = conn();
        let second = conn();
        book.join(1, 1, conn(), true).expect("create");
        book.join(2, 1, first, true).expect("join");

        let outcome = book.join(2, 1, second, true).expect("rejoin");
        assert!(outcome.rejoined);
        assert_eq!(outcome.participants, vec![1, 2]);

        assert_eq!(book.disconnect(2, first), None, "stale connection no longer holds the seat");
        assert!(book.is_participant(1, 2));
        assert!(book.disconnect(2, second).is_some());
        assert!(!book.is_participant(1, 2));
    }

    #[test]
    fn owner_leaving_keeps_room_for_others() {
        let mut book = RoomBook::default();
        book.join(1, 1, conn(), true).expect("create");
        book.join(2, 1, conn(), true).expect("join");

        let outcome = book.leave(1).expect("owner was seated");
        assert_eq!(outcome, LeaveOutcome { room_user_id: 1, remaining: vec![2], closed: false });
        assert_eq!(book.owners(), BTreeSet::from([1]));
        assert_eq!(book.in_call_users(), BTreeSet::from([2]));

        let outcome = book.join(1, 1, conn(), true).expect("owner can come back");
        assert!(!outcome.created);
        assert_eq!(outcome.participants, vec![1, 2]);
        assert_consistent(&book);
    }

    #[test]
    fn last_participant_leaving_destroys_room() {
        let mut book = RoomBook::default();
        book.join(1, 1, conn(), true).expect("create");
        book.join(2, 1, conn(), true).expect("join");
        book.leave(1);

        let outcome = book.leave(2).expect("seated");
        assert!(outcome.closed);
        assert!(book.is_empty());
        assert!(book.in_call_users().is_empty());
    }

    #[test]
    fn leave_without_room_is_noop() {
        let mut book = RoomBook::default();
        assert_eq!(book.leave(5), None);
    }

    #[test]
    fn end_by_owner_clears_every_participant() {
        let mut book = RoomBook::default();
        book.join(1, 1, conn(), true).expect("create");
        book.join(2, 1, conn(), true).expect("join");
        book.join(3, 1, conn(), true).expect("join");

        let outcome = book.end(1).expect("owner ends");
        assert_eq!(outcome.former_participants, vec![1, 2, 3]);
        assert!(book.is_empty());
        assert!(book.in_call_users().is_empty());
        assert_eq!(book.room_of(2), None);
    }

    #[test]
    fn end_by_non_owner_is_forbidden_or_invalid() {
        let mut book = RoomBook::default();
        book.join(1, 1, conn(), true).expect("create");
        book.join(2, 1, conn(), true).expect("join");

        let error = book.end(2).expect_err("participant is not owner");
        assert_eq!(error.code(), RoomErrorCode::ForbiddenRoom);

        let error = book.end(9).expect_err("no room at all");
        assert_eq!(error.code(), RoomErrorCode::InvalidRoom);
        assert_eq!(book.participants(1), Some(vec![1, 2]));
    }

    #[test]
    fn owner_who_left_can_still_end_room() {
        let mut book = RoomBook::default();
        book.join(1, 1, conn(), true).expect("create");
        book.join(2, 1, conn(), true).expect("join");
        book.leave(1);

        let outcome = book.end(1).expect("owner still owns the room");
        assert_eq!(outcome.former_participants, vec![2]);
        assert!(book.is_empty());
    }
}
