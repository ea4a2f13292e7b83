// Session lifecycle: the mutation vocabulary and its application rules.
//
// Every state change — moves and lifecycle transitions alike — is expressed
// as a `Mutation` and applied here against a loaded record, under the
// sequencer's per-session gate. This module owns the pure parts: status
// transitions, winner resolution, and terminal-claim verification against
// the rules engine. Persistence and broadcasting stay in the engine, which
// interprets the returned `Applied` value.
//
// Status machine: Active is initial, Completed and Timeout are terminal
// (no outgoing transitions), Active ⇄ Paused. Winner is set exactly once,
// on the transition out of Active.
//
// Trust boundary: a move delta is applied without consulting the rules
// engine — seat membership was already checked upstream, and move legality
// is the clients' business. Terminal claims are the exception: a false
// checkmate or draw claim would end a game with the wrong outcome, so those
// are re-derived here before any transition happens.

use gambit_protocol::message::MoveDelta;
use gambit_protocol::record::SessionRecord;
use gambit_protocol::types::{EndReason, Mode, Role, SessionStatus, UserId, Winner};
use gambit_rules::RulesEngine;

/// A queued state mutation for one session.
#[derive(Clone, Debug)]
pub enum Mutation {
    /// Overwrite position/side/clocks from a trusted delta.
    Move(MoveDelta),
    /// Friendly mode: first-party seat overwrites the position one ply back.
    Undo { position: String },
    /// A draw offer was accepted.
    AcceptDraw,
    /// A seat resigned. The role is resolved by the engine before queueing;
    /// None means the resigner could not be identified at all.
    Resign { role: Option<Role> },
    /// A seat's clock was reported to have reached zero.
    DeclareTimeout { role: Role },
    /// A claimed rule-defined ending, to be verified.
    ClaimEnd {
        reason: EndReason,
        winner: Role,
        position: String,
    },
    /// A seat holder's connection dropped under the forfeit policy.
    Forfeit { role: Role },
    Pause,
    Resume,
    /// Record an observer identity on the session document.
    AddSpectator { user: UserId },
}

/// What applying a mutation produced. The engine persists the record and
/// broadcasts for every variant except `Ignored` and `Refused`.
#[derive(Debug, PartialEq)]
pub enum Applied {
    /// Position/clock state changed — broadcast a game update.
    Update,
    /// The session reached a terminal status — broadcast game-ended.
    Ended { reason: EndReason, winner: Winner },
    /// Paused or resumed — broadcast the presence-style notice.
    PauseChanged { paused: bool },
    /// The record changed without a room-wide notification.
    Silent,
    /// No state change; the reason goes back to the submitter privately.
    Refused { reason: String },
    /// No state change and nothing to report (logged at debug).
    Ignored { why: &'static str },
}

/// Apply one mutation to a loaded record.
///
/// `seat` is the submitter's seat at submission time (None for
/// relay-internal entries). `now` is the authoritative timestamp for
/// last-move bookkeeping.
pub fn apply(
    record: &mut SessionRecord,
    seat: Option<Role>,
    mutation: Mutation,
    rules: &dyn RulesEngine,
    now: &str,
) -> Applied {
    match mutation {
        Mutation::Move(delta) => apply_move(record, delta, now),
        Mutation::Undo { position } => apply_undo(record, seat, position),
        Mutation::AcceptDraw => {
            if record.status != SessionStatus::Active {
                return Applied::Ignored { why: "draw accepted on inactive session" };
            }
            end(record, SessionStatus::Completed, EndReason::Draw, Winner::Draw)
        }
        Mutation::Resign { role } => apply_resign(record, role),
        Mutation::DeclareTimeout { role } => apply_timeout(record, role),
        Mutation::ClaimEnd { reason, winner, position } => {
            apply_claim(record, rules, reason, winner, position)
        }
        Mutation::Forfeit { role } => {
            if record.status != SessionStatus::Active {
                return Applied::Ignored { why: "forfeit on inactive session" };
            }
            let winner = role.counterpart();
            end(
                record,
                SessionStatus::Completed,
                EndReason::OpponentLeft,
                Winner::Role(winner),
            )
        }
        Mutation::Pause => {
            if record.status != SessionStatus::Active {
                return Applied::Ignored { why: "pause on non-active session" };
            }
            record.status = SessionStatus::Paused;
            Applied::PauseChanged { paused: true }
        }
        Mutation::Resume => {
            if record.status != SessionStatus::Paused {
                return Applied::Ignored { why: "resume on non-paused session" };
            }
            record.status = SessionStatus::Active;
            Applied::PauseChanged { paused: false }
        }
        Mutation::AddSpectator { user } => {
            if record.add_spectator(&user) {
                Applied::Silent
            } else {
                Applied::Ignored { why: "spectator already recorded" }
            }
        }
    }
}

fn apply_move(record: &mut SessionRecord, delta: MoveDelta, now: &str) -> Applied {
    if record.status != SessionStatus::Active {
        return Applied::Ignored { why: "move on inactive session" };
    }
    record.position = delta.position;
    record.side_to_move = delta.side_to_move;
    record.clock_white_ms = delta.clock_white_ms;
    record.clock_black_ms = delta.clock_black_ms;
    record.last_move = delta.last_move;
    record.last_move_at = now.to_string();
    Applied::Update
}

fn apply_undo(record: &mut SessionRecord, seat: Option<Role>, position: String) -> Applied {
    if record.status != SessionStatus::Active {
        return Applied::Ignored { why: "undo on inactive session" };
    }
    if record.mode != Mode::Friendly {
        return Applied::Refused {
            reason: "undo is not available in a serious game".into(),
        };
    }
    if seat != Some(record.first_role()) {
        return Applied::Refused {
            reason: "only the first-party seat may undo".into(),
        };
    }
    record.position = position;
    record.side_to_move = record.side_to_move.opposite();
    record.last_move = None;
    Applied::Update
}

fn apply_resign(record: &mut SessionRecord, role: Option<Role>) -> Applied {
    if record.status != SessionStatus::Active {
        return Applied::Ignored { why: "resign on inactive session" };
    }
    let Some(resigner) = role else {
        return Applied::Ignored { why: "resigner could not be resolved" };
    };
    let winner = resigner.counterpart();
    end(
        record,
        SessionStatus::Completed,
        EndReason::Resignation,
        Winner::Role(winner),
    )
}

fn apply_timeout(record: &mut SessionRecord, role: Role) -> Applied {
    if record.status != SessionStatus::Active {
        return Applied::Ignored { why: "timeout on inactive session" };
    }
    // The stored clocks stay authoritative: the timed-out side's value is
    // clamped so the record can never show time remaining for a flagged seat.
    record.set_clock_ms(role.side(), 0);
    end(
        record,
        SessionStatus::Timeout,
        EndReason::Timeout,
        Winner::Role(role.counterpart()),
    )
}

fn apply_claim(
    record: &mut SessionRecord,
    rules: &dyn RulesEngine,
    reason: EndReason,
    winner: Role,
    position: String,
) -> Applied {
    if record.status != SessionStatus::Active {
        return Applied::Ignored { why: "terminal claim on inactive session" };
    }
    match reason {
        EndReason::Checkmate => {
            let loser_side = match rules.side_to_move(&position) {
                Ok(side) => side,
                Err(e) => return Applied::Refused { reason: e.to_string() },
            };
            if winner.side() == loser_side {
                return Applied::Refused {
                    reason: "claimed winner is the mated side".into(),
                };
            }
            if let Err(reason) = validate_checkmate(rules, &position) {
                return Applied::Refused { reason };
            }
            record.position = position;
            record.side_to_move = loser_side;
            end(
                record,
                SessionStatus::Completed,
                EndReason::Checkmate,
                Winner::Role(winner),
            )
        }
        EndReason::Draw => match rules.is_draw(&position) {
            Ok(true) => {
                record.position = position;
                end(record, SessionStatus::Completed, EndReason::Draw, Winner::Draw)
            }
            Ok(false) => Applied::Refused {
                reason: "position is not a draw".into(),
            },
            Err(e) => Applied::Refused { reason: e.to_string() },
        },
        _ => Applied::Refused {
            reason: format!("{} is not a claimable ending", reason.as_str()),
        },
    }
}

/// Independently verify a checkmate claim: the side to move must be in
/// check, and every one of its legal moves must leave it in check.
pub fn validate_checkmate(rules: &dyn RulesEngine, position: &str) -> Result<(), String> {
    let side = rules.side_to_move(position).map_err(|e| e.to_string())?;
    if !rules.is_check(position).map_err(|e| e.to_string())? {
        return Err("side to move is not in check".into());
    }
    let moves = rules.legal_moves(position).map_err(|e| e.to_string())?;
    for mv in &moves {
        let next = rules.apply(position, mv).map_err(|e| e.to_string())?;
        if !rules.is_check_for(&next, side).map_err(|e| e.to_string())? {
            return Err(format!("move {mv} escapes check"));
        }
    }
    Ok(())
}

/// Transition into a terminal status, setting the winner exactly once.
fn end(record: &mut SessionRecord, status: SessionStatus, reason: EndReason, winner: Winner) -> Applied {
    debug_assert!(status.is_terminal());
    if record.winner.is_some() {
        return Applied::Ignored { why: "winner already set" };
    }
    record.status = status;
    record.winner = Some(winner);
    Applied::Ended { reason, winner }
}

// Scripted rules engine for lifecycle and engine tests. `apply` suffixes the
// position so sequencing is observable without a real board.
#[cfg(test)]
pub(crate) struct StubRules {
    pub check: bool,
    pub moves: Vec<&'static str>,
    /// Whether a legal move escapes the check.
    pub escape: bool,
    pub draw: bool,
}

#[cfg(test)]
impl StubRules {
    pub fn mate() -> Self {
        Self { check: true, moves: vec![], escape: false, draw: false }
    }

    pub fn escapable_check() -> Self {
        Self { check: true, moves: vec!["g7g6"], escape: true, draw: false }
    }
}

#[cfg(test)]
impl RulesEngine for StubRules {
    fn side_to_move(&self, _position: &str) -> Result<gambit_protocol::types::Side, gambit_rules::RulesError> {
        Ok(gambit_protocol::types::Side::Black)
    }

    fn is_check(&self, _position: &str) -> Result<bool, gambit_rules::RulesError> {
        Ok(self.check)
    }

    fn is_check_for(
        &self,
        _position: &str,
        _side: gambit_protocol::types::Side,
    ) -> Result<bool, gambit_rules::RulesError> {
        Ok(!self.escape)
    }

    fn legal_moves(&self, _position: &str) -> Result<Vec<String>, gambit_rules::RulesError> {
        Ok(self.moves.iter().map(|m| (*m).to_string()).collect())
    }

    fn apply(&self, position: &str, mv: &str) -> Result<String, gambit_rules::RulesError> {
        Ok(format!("{position}+{mv}"))
    }

    fn is_draw(&self, _position: &str) -> Result<bool, gambit_rules::RulesError> {
        Ok(self.draw)
    }
}
