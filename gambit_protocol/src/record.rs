// The authoritative session document.
//
// `SessionRecord` is both the persisted store layout and a wire payload: the
// relay sends the full record in `SessionReattached` / `SessionCreated` /
// `SessionSnapshot` messages so clients can resynchronize from authoritative
// state in one frame. Every mutation path loads a record, rewrites it, and
// persists it back — the record itself carries no behavior beyond seat and
// clock lookups.

use serde::{Deserialize, Serialize};

use crate::types::{Mode, Role, RoleScheme, SessionId, SessionStatus, Side, UserId, Winner};

/// Standard chess starting position in FEN.
pub const START_POSITION: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// One session: two seats, a position, two clocks, and an outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub scheme: RoleScheme,
    pub mode: Mode,
    /// Identity in the first-party seat (Mentor or White); plays white.
    pub first_party: UserId,
    /// Identity in the second-party seat (Trainee or Black); plays black.
    pub second_party: UserId,
    /// Current board position in FEN.
    pub position: String,
    pub side_to_move: Side,
    pub clock_white_ms: u64,
    pub clock_black_ms: u64,
    pub status: SessionStatus,
    /// Set exactly once, on the transition out of Active.
    pub winner: Option<Winner>,
    pub last_move: Option<String>,
    /// Append-only observer identities. Observers never occupy a seat.
    pub spectators: Vec<UserId>,
    pub created_at: String,
    pub last_move_at: String,
}

impl SessionRecord {
    pub fn new(
        id: SessionId,
        scheme: RoleScheme,
        mode: Mode,
        first_party: UserId,
        second_party: UserId,
        clock_ms: u64,
        now: &str,
    ) -> Self {
        Self {
            id,
            scheme,
            mode,
            first_party,
            second_party,
            position: START_POSITION.to_string(),
            side_to_move: Side::White,
            clock_white_ms: clock_ms,
            clock_black_ms: clock_ms,
            status: SessionStatus::Active,
            winner: None,
            last_move: None,
            spectators: Vec::new(),
            created_at: now.to_string(),
            last_move_at: now.to_string(),
        }
    }

    pub fn first_role(&self) -> Role {
        self.scheme.first_role()
    }

    pub fn second_role(&self) -> Role {
        self.scheme.second_role()
    }

    /// The seat an identity occupies, if any.
    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        if *user == self.first_party {
            Some(self.first_role())
        } else if *user == self.second_party {
            Some(self.second_role())
        } else {
            None
        }
    }

    /// The identity in a seat. Seat names from either scheme resolve: the
    /// first-party seat answers for both Mentor and White.
    pub fn occupant(&self, role: Role) -> &UserId {
        if role.is_first_party() { &self.first_party } else { &self.second_party }
    }

    pub fn is_over(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn clock_ms(&self, side: Side) -> u64 {
        match side {
            Side::White => self.clock_white_ms,
            Side::Black => self.clock_black_ms,
        }
    }

    pub fn set_clock_ms(&mut self, side: Side, value: u64) {
        match side {
            Side::White => self.clock_white_ms = value,
            Side::Black => self.clock_black_ms = value,
        }
    }

    /// Append an observer identity. Idempotent.
    pub fn add_spectator(&mut self, user: &UserId) -> bool {
        if self.spectators.contains(user) {
            return false;
        }
        self.spectators.push(user.clone());
        true
    }
}
