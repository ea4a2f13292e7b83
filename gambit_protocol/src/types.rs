// Core identity and state types for the session protocol.
//
// Lightweight newtypes and enums shared by `message.rs` (wire messages),
// `record.rs` (the persisted session document), and the relay's room and
// engine state. Session and user ids are opaque strings on the wire — the
// relay mints session ids as UUIDs but never inspects their structure.

use serde::{Deserialize, Serialize};

/// Opaque session identifier, assigned at creation, immutable.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

/// Authenticated user identity, presented at registration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

/// The side whose turn it is, in position-notation tokens ("w" / "b").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "w")]
    White,
    #[serde(rename = "b")]
    Black,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }
}

/// A named write-capable seat in a session.
///
/// `Mentor`/`Trainee` form the asymmetric scheme, `White`/`Black` the
/// symmetric one; exactly one scheme is active per session. The first-party
/// seat (`Mentor` or `White`) always plays the white pieces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Mentor,
    Trainee,
    White,
    Black,
}

impl Role {
    /// Seat precedence used when a join request names no (or an unknown)
    /// role: first open seat wins, alternate-scheme seats after the
    /// asymmetric pair. A compatibility shim for legacy join requests, not
    /// a security boundary.
    pub const FALLBACK_PRECEDENCE: [Role; 4] = [Role::Mentor, Role::Trainee, Role::White, Role::Black];

    /// True for the seat that plays the white pieces.
    pub fn is_first_party(self) -> bool {
        matches!(self, Role::Mentor | Role::White)
    }

    /// The color this seat plays.
    pub fn side(self) -> Side {
        if self.is_first_party() { Side::White } else { Side::Black }
    }

    /// The opposing seat within the same scheme.
    pub fn counterpart(self) -> Role {
        match self {
            Role::Mentor => Role::Trainee,
            Role::Trainee => Role::Mentor,
            Role::White => Role::Black,
            Role::Black => Role::White,
        }
    }
}

/// Which pair of seats a session uses. Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleScheme {
    /// Asymmetric pair: mentor vs. trainee.
    Lesson,
    /// Symmetric pair: white vs. black.
    Match,
}

impl RoleScheme {
    pub fn first_role(self) -> Role {
        match self {
            RoleScheme::Lesson => Role::Mentor,
            RoleScheme::Match => Role::White,
        }
    }

    pub fn second_role(self) -> Role {
        match self {
            RoleScheme::Lesson => Role::Trainee,
            RoleScheme::Match => Role::Black,
        }
    }
}

/// Session mode. Friendly permits the authoritative undo by the first-party
/// seat; serious forbids it. Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Friendly,
    Serious,
}

/// Session status. Active is initial; Completed and Timeout are terminal
/// (a finished session is retained as a read-only historical record).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Timeout,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Timeout)
    }
}

/// Outcome of a finished session: a winning seat, or a draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Role(Role),
    Draw,
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Checkmate,
    Resignation,
    Timeout,
    Draw,
    OpponentLeft,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkmate => "checkmate",
            Self::Resignation => "resignation",
            Self::Timeout => "timeout",
            Self::Draw => "draw",
            Self::OpponentLeft => "opponent-left",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_tokens_match_position_notation() {
        assert_eq!(serde_json::to_string(&Side::White).unwrap(), "\"w\"");
        assert_eq!(serde_json::to_string(&Side::Black).unwrap(), "\"b\"");
        let side: Side = serde_json::from_str("\"b\"").unwrap();
        assert_eq!(side, Side::Black);
    }

    #[test]
    fn first_party_seats_play_white() {
        assert_eq!(Role::Mentor.side(), Side::White);
        assert_eq!(Role::White.side(), Side::White);
        assert_eq!(Role::Trainee.side(), Side::Black);
        assert_eq!(Role::Black.side(), Side::Black);
    }

    #[test]
    fn counterpart_stays_within_scheme() {
        assert_eq!(Role::Mentor.counterpart(), Role::Trainee);
        assert_eq!(Role::Black.counterpart(), Role::White);
    }

    #[test]
    fn end_reason_tokens() {
        assert_eq!(EndReason::OpponentLeft.as_str(), "opponent-left");
        assert_eq!(
            serde_json::to_string(&EndReason::OpponentLeft).unwrap(),
            "\"opponent-left\""
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Timeout.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }
}
