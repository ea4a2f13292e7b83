// Test-only game client for end-to-end relay tests.
//
// Wraps the real `NetClient` (from `gambit_relay::client`) with synchronous
// polling helpers so tests can say "wait for the update carrying position X"
// instead of hand-rolling poll loops. The only test-specific code here is
// the blocking wrappers around `NetClient::poll()` — all networking uses the
// same code paths as a real embedding.
//
// See `tests/full_pipeline.rs` for the scenarios.

use std::thread;
use std::time::{Duration, Instant};

use gambit_protocol::message::{MoveDelta, ServerMessage};
use gambit_protocol::record::SessionRecord;
use gambit_protocol::types::{EndReason, Mode, Role, RoleScheme, SessionId, Side, UserId, Winner};
use gambit_relay::client::NetClient;

/// Default timeout for blocking poll operations.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A test client wrapping a real NetClient.
pub struct TestClient {
    client: NetClient,
}

impl TestClient {
    /// Connect to a relay and perform the Register handshake.
    pub fn connect(addr: std::net::SocketAddr, name: &str) -> Self {
        let client =
            NetClient::connect(&addr.to_string(), name).expect("TestClient::connect failed");
        Self { client }
    }

    pub fn user(&self) -> UserId {
        self.client.user().clone()
    }

    pub fn challenge(&mut self, to: &str, scheme: RoleScheme, mode: Mode, clock_ms: u64) {
        self.client
            .challenge(to, scheme, mode, clock_ms)
            .expect("challenge failed");
    }

    pub fn accept_challenge(&mut self, challenge_id: &str) {
        self.client
            .respond_challenge(challenge_id, true)
            .expect("accept failed");
    }

    pub fn join(&mut self, session: &SessionId, role: Role) {
        self.client
            .join_session(session, Some(role), false)
            .expect("join failed");
    }

    pub fn observe(&mut self, session: &SessionId) {
        self.client
            .join_session(session, None, true)
            .expect("observe failed");
    }

    /// Submit a move delta with plausible clock bookkeeping.
    pub fn play(&mut self, session: &SessionId, position: &str, side_to_move: Side, mv: &str) {
        self.client
            .send_move(
                session,
                MoveDelta {
                    position: position.into(),
                    side_to_move,
                    clock_white_ms: 590_000,
                    clock_black_ms: 590_000,
                    last_move: Some(mv.into()),
                },
            )
            .expect("send_move failed");
    }

    pub fn claim_checkmate(&mut self, session: &SessionId, winner: Role, position: &str) {
        self.client
            .claim_end(session, EndReason::Checkmate, winner, position)
            .expect("claim failed");
    }

    pub fn claim_draw(&mut self, session: &SessionId, position: &str) {
        // The winner seat is ignored for draw claims; any role token works.
        self.client
            .claim_end(session, EndReason::Draw, Role::White, position)
            .expect("claim failed");
    }

    pub fn resign(&mut self, session: &SessionId) {
        self.client.resign(session, None).expect("resign failed");
    }

    pub fn fetch(&mut self, session: &SessionId) {
        self.client.fetch_session(session).expect("fetch failed");
    }

    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }

    /// Blocking poll until `pick` matches a message; panics after 5s.
    pub fn wait_for<T>(&mut self, what: &str, pick: impl Fn(&ServerMessage) -> Option<T>) -> T {
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            for msg in self.client.poll() {
                if let Some(found) = pick(&msg) {
                    return found;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait for the room-entry confirmation; returns the seat (None for
    /// spectators).
    pub fn wait_for_join(&mut self) -> Option<Role> {
        self.wait_for("Joined", |msg| match msg {
            ServerMessage::Joined { role, .. } => Some(*role),
            _ => None,
        })
    }

    pub fn wait_for_challenge(&mut self) -> String {
        self.wait_for("ChallengeReceived", |msg| match msg {
            ServerMessage::ChallengeReceived { challenge_id, .. } => Some(challenge_id.clone()),
            _ => None,
        })
    }

    pub fn wait_for_session(&mut self) -> SessionRecord {
        self.wait_for("SessionCreated", |msg| match msg {
            ServerMessage::SessionCreated { record } => Some(record.clone()),
            _ => None,
        })
    }

    pub fn wait_for_update(&mut self, position: &str) -> Side {
        self.wait_for(&format!("GameUpdate {position}"), |msg| match msg {
            ServerMessage::GameUpdate { position: p, side_to_move, .. } if p == position => {
                Some(*side_to_move)
            }
            _ => None,
        })
    }

    pub fn wait_for_end(&mut self) -> (EndReason, Winner, Option<UserId>) {
        self.wait_for("GameEnded", |msg| match msg {
            ServerMessage::GameEnded { reason, winner, winner_user, .. } => {
                Some((*reason, *winner, winner_user.clone()))
            }
            _ => None,
        })
    }

    pub fn wait_for_claim_rejection(&mut self) -> String {
        self.wait_for("ClaimRejected", |msg| match msg {
            ServerMessage::ClaimRejected { reason, .. } => Some(reason.clone()),
            _ => None,
        })
    }

    pub fn wait_for_reattach(&mut self) -> SessionRecord {
        self.wait_for("SessionReattached", |msg| match msg {
            ServerMessage::SessionReattached { record } => Some(record.clone()),
            _ => None,
        })
    }

    pub fn wait_for_snapshot(&mut self) -> SessionRecord {
        self.wait_for("SessionSnapshot", |msg| match msg {
            ServerMessage::SessionSnapshot { record } => Some(record.clone()),
            _ => None,
        })
    }

    /// Let in-flight traffic settle, then return everything buffered.
    pub fn settle(&mut self) -> Vec<ServerMessage> {
        thread::sleep(Duration::from_millis(150));
        self.client.poll()
    }
}
