// Protocol messages for client-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by game clients to the session relay.
// - `ServerMessage`: sent by the relay to game clients.
//
// `MoveDelta` is the proposed state change for one move. The relay applies
// deltas to the authoritative record without re-deriving legality — the
// server-side trust boundary on the move path is seat membership, not move
// correctness. Terminal claims are the exception and carry the claimed
// position so the relay can re-verify them against the rules engine.
//
// All types derive `Serialize`/`Deserialize` for JSON framing (see
// `framing.rs`).

use serde::{Deserialize, Serialize};

use crate::record::SessionRecord;
use crate::types::{EndReason, Mode, Role, RoleScheme, SessionId, Side, UserId, Winner};

/// A proposed state delta for one applied move.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoveDelta {
    /// Resulting position in FEN.
    pub position: String,
    pub side_to_move: Side,
    pub clock_white_ms: u64,
    pub clock_black_ms: u64,
    /// Optional annotation of the move just played (e.g. "e2e4").
    pub last_move: Option<String>,
}

/// Messages sent by a client to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Bind this connection to an identity (handshake; first frame).
    Register { protocol_version: u32, user: UserId },
    /// Invite another identity to a new session.
    Challenge {
        to: UserId,
        scheme: RoleScheme,
        mode: Mode,
        clock_ms: u64,
    },
    /// Accept or decline a pending challenge.
    ChallengeResponse { challenge_id: String, accept: bool },
    /// Enter a session's room, in a seat or as a spectator.
    JoinSession {
        session: SessionId,
        role: Option<Role>,
        spectator: bool,
    },
    /// Submit a move delta for the authoritative record.
    Move { session: SessionId, delta: MoveDelta },
    /// Friendly mode only: first-party seat rolls the position back one ply.
    Undo { session: SessionId, position: String },
    /// Offer a draw (relayed room-wide, no state change).
    DrawRequest { session: SessionId, role: Role },
    /// Accept or decline a draw offer.
    DrawResponse {
        session: SessionId,
        role: Role,
        accept: bool,
    },
    /// Resign. The role is a hint used only when the connection's own seat
    /// cannot be resolved.
    Resign {
        session: SessionId,
        role: Option<Role>,
    },
    /// Report that a seat's clock reached zero.
    Timeout { session: SessionId, role: Role },
    /// Assert a rule-defined ending (checkmate or draw) at a claimed
    /// position, to be re-verified by the relay.
    TerminalClaim {
        session: SessionId,
        reason: EndReason,
        winner: Role,
        position: String,
    },
    /// Pause / resume the session (seat holders only).
    Pause { session: SessionId },
    Resume { session: SessionId },
    /// Fetch one session record.
    FetchSession { session: SessionId },
    /// List the sessions where this identity holds a seat.
    ListSessions,
    /// Leaving gracefully.
    Goodbye,
}

/// Messages sent by the relay to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Registration accepted.
    Registered { user: UserId },
    /// Request rejected (unknown session, bad handshake, ...). Sent only to
    /// the requesting connection.
    Rejected { reason: String },
    /// Someone challenged this identity.
    ChallengeReceived {
        challenge_id: String,
        from: UserId,
        scheme: RoleScheme,
        mode: Mode,
        clock_ms: u64,
    },
    /// A challenge this identity issued was declined.
    ChallengeDeclined { challenge_id: String, by: UserId },
    /// A challenge was accepted and this session now exists.
    SessionCreated { record: SessionRecord },
    /// Room entry confirmed; carries the authoritative record. `role` is
    /// None for spectators.
    Joined {
        session: SessionId,
        role: Option<Role>,
        record: SessionRecord,
    },
    /// A seat holder entered the room.
    PlayerJoined {
        session: SessionId,
        user: UserId,
        role: Role,
    },
    /// Authoritative state after an applied delta.
    GameUpdate {
        session: SessionId,
        position: String,
        side_to_move: Side,
        clock_white_ms: u64,
        clock_black_ms: u64,
        last_move: Option<String>,
    },
    /// Terminal broadcast: fired exactly once per session.
    GameEnded {
        session: SessionId,
        reason: EndReason,
        winner: Winner,
        /// Resolved identity of the winning seat; None on a draw.
        winner_user: Option<UserId>,
        first_party: UserId,
        second_party: UserId,
    },
    /// A draw was offered / declined.
    DrawRequested { session: SessionId, role: Role },
    DrawDeclined { session: SessionId, role: Role },
    /// A terminal claim failed verification. Sent to the claimant only.
    ClaimRejected { session: SessionId, reason: String },
    /// One-time resynchronization notice after registering while holding a
    /// seat in an active session.
    SessionReattached { record: SessionRecord },
    /// A seat holder's connection dropped. The session continues.
    PlayerOffline {
        session: SessionId,
        user: UserId,
        role: Role,
    },
    Paused { session: SessionId, by: Role },
    Resumed { session: SessionId, by: Role },
    /// Reply to FetchSession.
    SessionSnapshot { record: SessionRecord },
    /// Reply to ListSessions.
    SessionList { records: Vec<SessionRecord> },
}
