// gambit_rules — board-legality engine for the session relay.
//
// The relay treats chess rules as a black-box capability behind the
// `RulesEngine` trait: parse a position, answer "is the mover in check",
// enumerate legal moves, apply one, and answer "is this a draw". The relay
// consults it only when verifying terminal-state claims — routine move relay
// trusts seat membership, not move correctness, so this crate stays off the
// hot path.
//
// `BoardRules` adapts the `chess` crate's move generator. Positions cross
// the boundary as FEN strings and moves as coordinate notation ("e2e4",
// "e7e8q"), so the relay never links against board types.

use std::str::FromStr;

use chess::{Board, BoardStatus, ChessMove, Color, MoveGen};
use thiserror::Error;

use gambit_protocol::types::Side;

/// Failure while answering a legality query.
#[derive(Debug, Error)]
pub enum RulesError {
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("unparseable move: {0}")]
    InvalidMove(String),
    #[error("illegal move: {0}")]
    IllegalMove(String),
}

/// Board-legality queries the relay needs.
///
/// Implementations must be stateless with respect to sessions: every query
/// carries the full position.
pub trait RulesEngine: Send {
    /// Whose turn it is in this position.
    fn side_to_move(&self, position: &str) -> Result<Side, RulesError>;
    /// Is the side to move in check?
    fn is_check(&self, position: &str) -> Result<bool, RulesError>;
    /// Is `side` in check in this position?
    fn is_check_for(&self, position: &str, side: Side) -> Result<bool, RulesError>;
    /// Legal moves for the side to move, in coordinate notation.
    fn legal_moves(&self, position: &str) -> Result<Vec<String>, RulesError>;
    /// Apply one legal move, returning the resulting position.
    fn apply(&self, position: &str, mv: &str) -> Result<String, RulesError>;
    /// Is the position drawn with no winner (stalemate)?
    fn is_draw(&self, position: &str) -> Result<bool, RulesError>;
}

/// `RulesEngine` backed by the `chess` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoardRules;

fn parse(position: &str) -> Result<Board, RulesError> {
    Board::from_str(position).map_err(|e| RulesError::InvalidPosition(e.to_string()))
}

fn to_side(color: Color) -> Side {
    match color {
        Color::White => Side::White,
        Color::Black => Side::Black,
    }
}

impl RulesEngine for BoardRules {
    fn side_to_move(&self, position: &str) -> Result<Side, RulesError> {
        Ok(to_side(parse(position)?.side_to_move()))
    }

    fn is_check(&self, position: &str) -> Result<bool, RulesError> {
        Ok(parse(position)?.checkers().popcnt() > 0)
    }

    fn is_check_for(&self, position: &str, side: Side) -> Result<bool, RulesError> {
        let board = parse(position)?;
        // A position where the side that just moved is in check is not
        // reachable through legal play; the generator only ever reports
        // checks against the mover.
        Ok(to_side(board.side_to_move()) == side && board.checkers().popcnt() > 0)
    }

    fn legal_moves(&self, position: &str) -> Result<Vec<String>, RulesError> {
        Ok(MoveGen::new_legal(&parse(position)?).map(|m| m.to_string()).collect())
    }

    fn apply(&self, position: &str, mv: &str) -> Result<String, RulesError> {
        let board = parse(position)?;
        let parsed = ChessMove::from_str(mv).map_err(|_| RulesError::InvalidMove(mv.to_string()))?;
        if !board.legal(parsed) {
            return Err(RulesError::IllegalMove(mv.to_string()));
        }
        Ok(board.make_move_new(parsed).to_string())
    }

    fn is_draw(&self, position: &str) -> Result<bool, RulesError> {
        Ok(parse(position)?.status() == BoardStatus::Stalemate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    /// Fool's mate: 1.f3 e5 2.g4 Qh4#. White to move, mated.
    const FOOLS_MATE: &str = "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3";

    /// 1.e3 f5 2.Qh5+ — black is in check but g7g6 blocks.
    const CHECK_WITH_ESCAPE: &str = "rnbqkbnr/ppppp1pp/8/5p1Q/8/4P3/PPPP1PPP/RNB1KBNR b KQkq - 1 2";

    /// Queen stalemate: black king h8, white queen f7, white king g6.
    const STALEMATE: &str = "7k/5Q2/6K1/8/8/8/8/8 b - - 0 1";

    #[test]
    fn start_position_basics() {
        let rules = BoardRules;
        assert_eq!(rules.side_to_move(START).unwrap(), Side::White);
        assert!(!rules.is_check(START).unwrap());
        assert_eq!(rules.legal_moves(START).unwrap().len(), 20);
        assert!(!rules.is_draw(START).unwrap());
    }

    #[test]
    fn checkmate_position_has_no_legal_moves() {
        let rules = BoardRules;
        assert!(rules.is_check(FOOLS_MATE).unwrap());
        assert!(rules.legal_moves(FOOLS_MATE).unwrap().is_empty());
    }

    #[test]
    fn check_with_escape_keeps_legal_moves() {
        let rules = BoardRules;
        assert!(rules.is_check(CHECK_WITH_ESCAPE).unwrap());
        let moves = rules.legal_moves(CHECK_WITH_ESCAPE).unwrap();
        assert!(moves.contains(&"g7g6".to_string()), "moves: {moves:?}");
        // Blocking the check leaves black out of check.
        let after = rules.apply(CHECK_WITH_ESCAPE, "g7g6").unwrap();
        assert!(!rules.is_check_for(&after, Side::Black).unwrap());
    }

    #[test]
    fn is_check_for_tracks_the_checked_side() {
        let rules = BoardRules;
        assert!(rules.is_check_for(FOOLS_MATE, Side::White).unwrap());
        assert!(!rules.is_check_for(FOOLS_MATE, Side::Black).unwrap());
    }

    #[test]
    fn apply_advances_the_position() {
        let rules = BoardRules;
        let after = rules.apply(START, "e2e4").unwrap();
        assert!(
            after.starts_with("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b"),
            "after: {after}"
        );
        assert_eq!(rules.side_to_move(&after).unwrap(), Side::Black);
    }

    #[test]
    fn apply_rejects_illegal_and_garbage_moves() {
        let rules = BoardRules;
        assert!(matches!(
            rules.apply(START, "e2e5"),
            Err(RulesError::IllegalMove(_))
        ));
        assert!(matches!(
            rules.apply(START, "not-a-move"),
            Err(RulesError::InvalidMove(_))
        ));
    }

    #[test]
    fn stalemate_is_a_draw() {
        let rules = BoardRules;
        assert!(rules.is_draw(STALEMATE).unwrap());
        assert!(!rules.is_check(STALEMATE).unwrap());
        assert!(rules.legal_moves(STALEMATE).unwrap().is_empty());
    }

    #[test]
    fn garbage_position_is_rejected() {
        let rules = BoardRules;
        assert!(matches!(
            rules.is_check("not a position"),
            Err(RulesError::InvalidPosition(_))
        ));
    }
}
