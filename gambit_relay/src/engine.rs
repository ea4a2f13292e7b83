// The coordinating service instance.
//
// `Engine` owns every piece of relay state — connection registry, session
// rooms, per-session sequencer, pending challenges, and the store and rules
// collaborators — and is driven exclusively from the server's single
// dispatch thread (`server.rs`). No ambient globals, no locks: the maps are
// plain owned state, and the sequencer provides the only ordering guarantee
// sessions need. A multi-threaded embedding would have to add per-session
// mutual exclusion around `submit`/`pump` covering moves and lifecycle
// transitions alike.
//
// The mutation path is uniform: dispatch resolves the submitter's seat,
// queues a `Mutation`, and the drain loop applies entries one at a time —
// load the record, rewrite it via `lifecycle::apply`, persist, broadcast —
// so every broadcast reflects a fully persisted prior state and no two
// mutations for one session ever interleave.

use std::collections::HashMap;

use gambit_protocol::message::{ClientMessage, ServerMessage};
use gambit_protocol::record::SessionRecord;
use gambit_protocol::types::{Mode, Role, RoleScheme, SessionId, UserId, Winner};
use gambit_rules::RulesEngine;

use crate::lifecycle::{self, Applied, Mutation};
use crate::reconnect::{self, DisconnectPolicy};
use crate::registry::{ConnectionId, Registry};
use crate::room::{RoomPlace, Rooms};
use crate::sequencer::{QueueEntry, Sequencer};
use crate::store::SessionStore;

/// A challenge awaiting its addressee's response. Process-lifetime only.
struct PendingChallenge {
    from: UserId,
    to: UserId,
    scheme: RoleScheme,
    mode: Mode,
    clock_ms: u64,
}

pub struct Engine {
    registry: Registry,
    rooms: Rooms,
    sequencer: Sequencer,
    store: Box<dyn SessionStore>,
    rules: Box<dyn RulesEngine>,
    policy: DisconnectPolicy,
    challenges: HashMap<String, PendingChallenge>,
}

impl Engine {
    pub fn new(
        store: Box<dyn SessionStore>,
        rules: Box<dyn RulesEngine>,
        policy: DisconnectPolicy,
    ) -> Self {
        Self {
            registry: Registry::new(),
            rooms: Rooms::new(),
            sequencer: Sequencer::new(),
            store,
            rules,
            policy,
            challenges: HashMap::new(),
        }
    }

    /// Track a freshly accepted connection before it registers.
    pub fn attach_connection(&mut self, conn: ConnectionId, stream: std::net::TcpStream) {
        self.registry.attach(conn, stream);
    }

    /// Bind a connection to an identity and re-sync it with any active
    /// session it participates in. Returns false when the binding was
    /// rejected (the connection keeps any identity it already had).
    pub fn handle_register(&mut self, conn: ConnectionId, user: UserId) -> bool {
        match self.registry.register(conn, user.clone()) {
            Ok(()) => {
                tracing::debug!("{conn} registered as {}", user.0);
                self.registry
                    .send_to(conn, &ServerMessage::Registered { user: user.clone() });
                reconnect::reattach(
                    self.store.as_ref(),
                    &mut self.rooms,
                    &mut self.registry,
                    conn,
                    &user,
                );
                true
            }
            Err(reason) => {
                self.registry.send_to(conn, &ServerMessage::Rejected { reason });
                false
            }
        }
    }

    /// Transport close: vacate the room, announce the drop, apply the
    /// disconnect policy, and forget the binding. Session status is never
    /// touched here under the default policy.
    pub fn handle_disconnect(&mut self, conn: ConnectionId) {
        if let Some((session, RoomPlace::Seat(role))) = self.rooms.leave(conn) {
            if let Some(user) = self.registry.resolve_user(conn).cloned() {
                tracing::debug!("{} went offline in session {}", user.0, session.0);
                let msg = ServerMessage::PlayerOffline {
                    session: session.clone(),
                    user,
                    role,
                };
                self.broadcast(&session, &msg);
            }
            if self.policy == DisconnectPolicy::Forfeit {
                self.enqueue(
                    session,
                    QueueEntry {
                        conn,
                        seat: None,
                        mutation: Mutation::Forfeit { role },
                    },
                );
            }
        }
        self.registry.forget(conn);
    }

    pub fn handle_message(&mut self, conn: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Register { user, .. } => {
                self.handle_register(conn, user);
            }
            ClientMessage::Challenge { to, scheme, mode, clock_ms } => {
                self.handle_challenge(conn, to, scheme, mode, clock_ms);
            }
            ClientMessage::ChallengeResponse { challenge_id, accept } => {
                self.handle_challenge_response(conn, challenge_id, accept);
            }
            ClientMessage::JoinSession { session, role, spectator } => {
                self.handle_join(conn, session, role, spectator);
            }
            ClientMessage::Move { session, delta } => {
                self.submit(conn, session, Mutation::Move(delta));
            }
            ClientMessage::Undo { session, position } => {
                self.submit(conn, session, Mutation::Undo { position });
            }
            ClientMessage::DrawRequest { session, role } => {
                // Offers are relayed, never stored: no state change involved.
                if self.holds_seat(conn, &session) {
                    let msg = ServerMessage::DrawRequested { session: session.clone(), role };
                    self.broadcast(&session, &msg);
                } else {
                    tracing::debug!("dropping draw offer from non-seat {conn}");
                }
            }
            ClientMessage::DrawResponse { session, role, accept } => {
                if accept {
                    self.submit(conn, session, Mutation::AcceptDraw);
                } else if self.holds_seat(conn, &session) {
                    let msg = ServerMessage::DrawDeclined { session: session.clone(), role };
                    self.broadcast(&session, &msg);
                }
            }
            ClientMessage::Resign { session, role } => {
                self.handle_resign(conn, session, role);
            }
            ClientMessage::Timeout { session, role } => {
                self.submit(conn, session, Mutation::DeclareTimeout { role });
            }
            ClientMessage::TerminalClaim { session, reason, winner, position } => {
                self.submit(conn, session, Mutation::ClaimEnd { reason, winner, position });
            }
            ClientMessage::Pause { session } => {
                self.submit(conn, session, Mutation::Pause);
            }
            ClientMessage::Resume { session } => {
                self.submit(conn, session, Mutation::Resume);
            }
            ClientMessage::FetchSession { session } => {
                self.handle_fetch(conn, session);
            }
            ClientMessage::ListSessions => {
                self.handle_list(conn);
            }
            ClientMessage::Goodbye => {
                // The reader loop surfaces Goodbye as a Disconnected event.
            }
        }
    }

    // --- pairing -----------------------------------------------------------

    fn handle_challenge(
        &mut self,
        conn: ConnectionId,
        to: UserId,
        scheme: RoleScheme,
        mode: Mode,
        clock_ms: u64,
    ) {
        let Some(from) = self.require_user(conn) else {
            return;
        };
        if from == to {
            self.reject(conn, "cannot challenge yourself");
            return;
        }
        let challenge_id = uuid::Uuid::new_v4().to_string();
        self.challenges.insert(
            challenge_id.clone(),
            PendingChallenge {
                from: from.clone(),
                to: to.clone(),
                scheme,
                mode,
                clock_ms,
            },
        );
        tracing::debug!("challenge {challenge_id} from {} to {}", from.0, to.0);
        let msg = ServerMessage::ChallengeReceived {
            challenge_id,
            from,
            scheme,
            mode,
            clock_ms,
        };
        self.registry.send_to_user(&to, &msg);
    }

    fn handle_challenge_response(&mut self, conn: ConnectionId, challenge_id: String, accept: bool) {
        let Some(responder) = self.require_user(conn) else {
            return;
        };
        let Some(challenge) = self.challenges.remove(&challenge_id) else {
            self.reject(conn, "unknown challenge");
            return;
        };
        if challenge.to != responder {
            self.challenges.insert(challenge_id, challenge);
            self.reject(conn, "challenge is not addressed to you");
            return;
        }
        if !accept {
            let msg = ServerMessage::ChallengeDeclined { challenge_id, by: responder };
            self.registry.send_to_user(&challenge.from, &msg);
            return;
        }
        let now = now_rfc3339();
        let record = SessionRecord::new(
            SessionId(uuid::Uuid::new_v4().to_string()),
            challenge.scheme,
            challenge.mode,
            challenge.from.clone(),
            challenge.to.clone(),
            challenge.clock_ms,
            &now,
        );
        if let Err(e) = self.store.create(record.clone()) {
            tracing::warn!("creating session failed: {e}");
            self.reject(conn, "session could not be created");
            return;
        }
        tracing::info!(
            "session {} created: {} vs {}",
            record.id.0,
            record.first_party.0,
            record.second_party.0
        );
        let msg = ServerMessage::SessionCreated { record };
        self.registry.send_to_user(&challenge.from, &msg);
        self.registry.send_to_user(&challenge.to, &msg);
    }

    // --- room entry --------------------------------------------------------

    fn handle_join(
        &mut self,
        conn: ConnectionId,
        session: SessionId,
        role: Option<Role>,
        spectator: bool,
    ) {
        let Some(user) = self.require_user(conn) else {
            return;
        };
        let record = match self.store.fetch(&session) {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.reject(conn, &format!("unknown session {}", session.0));
                return;
            }
            Err(e) => {
                tracing::warn!("join lookup of session {} failed: {e}", session.0);
                self.reject(conn, "session store unavailable");
                return;
            }
        };
        let place = self.rooms.join(conn, &session, role, spectator);
        self.registry.send_to(
            conn,
            &ServerMessage::Joined {
                session: session.clone(),
                role: place.seat(),
                record,
            },
        );
        match place {
            RoomPlace::Seat(seat) => {
                let msg = ServerMessage::PlayerJoined { session: session.clone(), user, role: seat };
                self.broadcast(&session, &msg);
            }
            RoomPlace::Spectator => {
                // Record the observer identity on the session document, under
                // the same per-session gate as every other store write.
                self.enqueue(
                    session,
                    QueueEntry {
                        conn,
                        seat: None,
                        mutation: Mutation::AddSpectator { user },
                    },
                );
            }
        }
    }

    // --- admin reads -------------------------------------------------------

    fn handle_fetch(&mut self, conn: ConnectionId, session: SessionId) {
        match self.store.fetch(&session) {
            Ok(Some(record)) => {
                self.registry
                    .send_to(conn, &ServerMessage::SessionSnapshot { record });
            }
            Ok(None) => self.reject(conn, &format!("unknown session {}", session.0)),
            Err(e) => {
                tracing::warn!("fetch of session {} failed: {e}", session.0);
                self.reject(conn, "session store unavailable");
            }
        }
    }

    fn handle_list(&mut self, conn: ConnectionId) {
        let Some(user) = self.require_user(conn) else {
            return;
        };
        match self.store.find_for_user(&user, None) {
            Ok(records) => {
                self.registry.send_to(conn, &ServerMessage::SessionList { records });
            }
            Err(e) => {
                tracing::warn!("session list for {} failed: {e}", user.0);
                self.reject(conn, "session store unavailable");
            }
        }
    }

    // --- mutation path -----------------------------------------------------

    /// Queue a mutation from a client connection. The write-authority check
    /// happens here: the submitter must hold a seat in this session's room.
    /// Spectator submissions are dropped silently — enforcement, not a
    /// reportable failure.
    fn submit(&mut self, conn: ConnectionId, session: SessionId, mutation: Mutation) {
        let seat = match self.rooms.place_of(conn) {
            Some((member_of, RoomPlace::Seat(role))) if *member_of == session => role,
            Some((member_of, RoomPlace::Spectator)) if *member_of == session => {
                tracing::debug!("dropping write from spectator {conn} in session {}", session.0);
                return;
            }
            _ => {
                tracing::debug!("dropping write from {conn}: not in session {}", session.0);
                return;
            }
        };
        self.enqueue(
            session,
            QueueEntry { conn, seat: Some(seat), mutation },
        );
    }

    /// Resignation resolves its seat before queueing: the connection's own
    /// seat wins; the role named in the message is the fallback; failing
    /// both, whoever still holds a seat is treated as the winner and the
    /// resigner is that seat's counterpart.
    fn handle_resign(&mut self, conn: ConnectionId, session: SessionId, role_hint: Option<Role>) {
        let resigner = match self.rooms.place_of(conn) {
            Some((member_of, RoomPlace::Seat(role))) if *member_of == session => Some(role),
            Some((member_of, RoomPlace::Spectator)) if *member_of == session => {
                tracing::debug!("dropping resignation from spectator {conn}");
                return;
            }
            _ => role_hint.or_else(|| {
                self.rooms
                    .occupied_seats(&session)
                    .first()
                    .map(|winner| winner.counterpart())
            }),
        };
        self.enqueue(
            session,
            QueueEntry {
                conn,
                seat: resigner,
                mutation: Mutation::Resign { role: resigner },
            },
        );
    }

    fn enqueue(&mut self, session: SessionId, entry: QueueEntry) {
        if self.sequencer.enqueue(&session, entry) {
            self.pump(&session);
        }
    }

    /// Drain the session's queue: one entry at a time, each fully applied,
    /// persisted, and broadcast before the next is picked up.
    fn pump(&mut self, session: &SessionId) {
        while let Some(entry) = self.sequencer.begin_next(session) {
            self.apply_entry(session, entry);
            self.sequencer.finish(session);
        }
    }

    fn apply_entry(&mut self, session: &SessionId, entry: QueueEntry) {
        let mut record = match self.store.fetch(session) {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.reject(entry.conn, &format!("unknown session {}", session.0));
                return;
            }
            Err(e) => {
                tracing::warn!("load of session {} failed: {e}; dropping entry", session.0);
                return;
            }
        };
        let was_claim = matches!(entry.mutation, Mutation::ClaimEnd { .. });
        let now = now_rfc3339();
        let applied = lifecycle::apply(
            &mut record,
            entry.seat,
            entry.mutation,
            self.rules.as_ref(),
            &now,
        );
        match applied {
            Applied::Ignored { why } => {
                tracing::debug!("session {}: {why}", session.0);
            }
            Applied::Refused { reason } => {
                tracing::debug!("session {}: refused: {reason}", session.0);
                let msg = if was_claim {
                    ServerMessage::ClaimRejected { session: session.clone(), reason }
                } else {
                    ServerMessage::Rejected { reason }
                };
                self.registry.send_to(entry.conn, &msg);
            }
            Applied::Update => {
                if self.persist_or_drop(&record, session) {
                    let msg = ServerMessage::GameUpdate {
                        session: session.clone(),
                        position: record.position.clone(),
                        side_to_move: record.side_to_move,
                        clock_white_ms: record.clock_white_ms,
                        clock_black_ms: record.clock_black_ms,
                        last_move: record.last_move.clone(),
                    };
                    self.broadcast(session, &msg);
                }
            }
            Applied::Ended { reason, winner } => {
                if self.persist_or_drop(&record, session) {
                    tracing::info!(
                        "session {} ended: {} ({:?})",
                        session.0,
                        reason.as_str(),
                        winner
                    );
                    let winner_user = match winner {
                        Winner::Role(role) => Some(record.occupant(role).clone()),
                        Winner::Draw => None,
                    };
                    let msg = ServerMessage::GameEnded {
                        session: session.clone(),
                        reason,
                        winner,
                        winner_user,
                        first_party: record.first_party.clone(),
                        second_party: record.second_party.clone(),
                    };
                    self.broadcast(session, &msg);
                }
            }
            Applied::PauseChanged { paused } => {
                if self.persist_or_drop(&record, session) {
                    if let Some(by) = entry.seat {
                        let msg = if paused {
                            ServerMessage::Paused { session: session.clone(), by }
                        } else {
                            ServerMessage::Resumed { session: session.clone(), by }
                        };
                        self.broadcast(session, &msg);
                    }
                }
            }
            Applied::Silent => {
                let _ = self.persist_or_drop(&record, session);
            }
        }
    }

    /// Persist, or log and abandon this entry. Returning false suppresses
    /// the broadcast: the authoritative record did not advance, so clients
    /// resynchronize naturally on the next successful update.
    fn persist_or_drop(&mut self, record: &SessionRecord, session: &SessionId) -> bool {
        match self.store.persist(record) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("persist of session {} failed: {e}; dropping update", session.0);
                false
            }
        }
    }

    // --- helpers -----------------------------------------------------------

    fn broadcast(&mut self, session: &SessionId, msg: &ServerMessage) {
        self.rooms.broadcast(&mut self.registry, session, msg);
    }

    fn holds_seat(&self, conn: ConnectionId, session: &SessionId) -> bool {
        matches!(
            self.rooms.place_of(conn),
            Some((member_of, RoomPlace::Seat(_))) if member_of == session
        )
    }

    fn require_user(&mut self, conn: ConnectionId) -> Option<UserId> {
        match self.registry.resolve_user(conn) {
            Some(user) => Some(user.clone()),
            None => {
                self.reject(conn, "register first");
                None
            }
        }
    }

    fn reject(&mut self, conn: ConnectionId, reason: &str) {
        self.registry.send_to(
            conn,
            &ServerMessage::Rejected { reason: reason.to_string() },
        );
    }

    #[cfg(test)]
    pub(crate) fn stored_record(&self, id: &SessionId) -> Option<SessionRecord> {
        self.store.fetch(id).ok().flatten()
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use gambit_protocol::framing::read_message;
    use gambit_protocol::message::MoveDelta;
    use gambit_protocol::record::START_POSITION;
    use gambit_protocol::types::{EndReason, SessionStatus, Side};

    use crate::lifecycle::StubRules;
    use crate::store::{FlakyStore, MemoryStore};

    use super::*;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// Client end of an engine connection.
    struct Peer {
        reader: BufReader<TcpStream>,
    }

    impl Peer {
        /// Blocking read with the 5s safety timeout set at connect time.
        fn recv(&mut self) -> ServerMessage {
            let bytes = read_message(&mut self.reader).unwrap();
            serde_json::from_slice(&bytes).unwrap()
        }

        /// Drain everything currently buffered, using a short timeout.
        fn drain(&mut self) -> Vec<ServerMessage> {
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_millis(100)))
                .unwrap();
            let mut messages = Vec::new();
            while let Ok(bytes) = read_message(&mut self.reader) {
                messages.push(serde_json::from_slice(&bytes).unwrap());
            }
            self.reader
                .get_ref()
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            messages
        }
    }

    struct Harness {
        engine: Engine,
        next_conn: u64,
    }

    impl Harness {
        fn new(store: Box<dyn SessionStore>, rules: Box<dyn RulesEngine>) -> Self {
            Self::with_policy(store, rules, DisconnectPolicy::Notify)
        }

        fn with_policy(
            store: Box<dyn SessionStore>,
            rules: Box<dyn RulesEngine>,
            policy: DisconnectPolicy,
        ) -> Self {
            Self {
                engine: Engine::new(store, rules, policy),
                next_conn: 0,
            }
        }

        /// Attach + register a connection; drains the handshake replies.
        fn connect(&mut self, user: &str) -> (ConnectionId, Peer) {
            let (client, server) = tcp_pair();
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let conn = ConnectionId(self.next_conn);
            self.next_conn += 1;
            self.engine.attach_connection(conn, server);
            assert!(self.engine.handle_register(conn, UserId(user.into())));
            let mut peer = Peer { reader: BufReader::new(client) };
            peer.drain();
            (conn, peer)
        }
    }

    fn sid(s: &str) -> SessionId {
        SessionId(s.into())
    }

    fn seeded_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .create(SessionRecord::new(
                sid("s-1"),
                RoleScheme::Match,
                Mode::Serious,
                UserId("alice".into()),
                UserId("bob".into()),
                600_000,
                "t0",
            ))
            .unwrap();
        store
    }

    fn delta(position: &str, side: Side) -> MoveDelta {
        MoveDelta {
            position: position.into(),
            side_to_move: side,
            clock_white_ms: 590_000,
            clock_black_ms: 600_000,
            last_move: Some("m".into()),
        }
    }

    fn updates(messages: &[ServerMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::GameUpdate { position, .. } => Some(position.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn register_reattaches_and_is_idempotent() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (client, server) = tcp_pair();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        harness.engine.attach_connection(ConnectionId(7), server);
        assert!(harness.engine.handle_register(ConnectionId(7), UserId("alice".into())));
        assert!(harness.engine.handle_register(ConnectionId(7), UserId("alice".into())));

        let mut peer = Peer { reader: BufReader::new(client) };
        let messages = peer.drain();
        let reattached: Vec<&ServerMessage> = messages
            .iter()
            .filter(|m| matches!(m, ServerMessage::SessionReattached { .. }))
            .collect();
        assert_eq!(reattached.len(), 2, "messages: {messages:?}");
        for msg in reattached {
            match msg {
                ServerMessage::SessionReattached { record } => {
                    assert_eq!(record.status, SessionStatus::Active);
                    assert_eq!(record.clock_white_ms, 600_000);
                }
                _ => unreachable!(),
            }
        }
        // Binding to a different identity on the same connection is refused.
        assert!(!harness.engine.handle_register(ConnectionId(7), UserId("mallory".into())));
        assert!(matches!(peer.recv(), ServerMessage::Rejected { .. }));
    }

    #[test]
    fn moves_broadcast_in_submission_order_to_the_whole_room() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (bob, mut peer_b) = harness.connect("bob");
        let (eve, mut peer_e) = harness.connect("eve");
        harness
            .engine
            .handle_message(eve, ClientMessage::JoinSession {
                session: sid("s-1"),
                role: None,
                spectator: true,
            });
        peer_a.drain();
        peer_b.drain();
        peer_e.drain();

        harness.engine.handle_message(alice, ClientMessage::Move {
            session: sid("s-1"),
            delta: delta("p1", Side::Black),
        });
        harness.engine.handle_message(bob, ClientMessage::Move {
            session: sid("s-1"),
            delta: delta("p2", Side::White),
        });
        harness.engine.handle_message(alice, ClientMessage::Move {
            session: sid("s-1"),
            delta: delta("p3", Side::Black),
        });

        for peer in [&mut peer_a, &mut peer_b, &mut peer_e] {
            assert_eq!(updates(&peer.drain()), vec!["p1", "p2", "p3"]);
        }
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.position, "p3");
        assert_eq!(record.side_to_move, Side::Black);
    }

    #[test]
    fn spectator_writes_change_nothing_and_broadcast_nothing() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (eve, mut peer_e) = harness.connect("eve");
        harness.engine.handle_message(eve, ClientMessage::JoinSession {
            session: sid("s-1"),
            role: None,
            spectator: true,
        });
        peer_a.drain();
        peer_e.drain();
        let _ = alice;

        harness.engine.handle_message(eve, ClientMessage::Move {
            session: sid("s-1"),
            delta: delta("hacked", Side::White),
        });
        harness.engine.handle_message(eve, ClientMessage::Resign {
            session: sid("s-1"),
            role: None,
        });

        assert!(updates(&peer_a.drain()).is_empty());
        assert!(updates(&peer_e.drain()).is_empty());
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.position, START_POSITION);
        assert_eq!(record.status, SessionStatus::Active);
    }

    #[test]
    fn broadcasts_never_cross_sessions() {
        let mut store = seeded_store();
        store
            .create(SessionRecord::new(
                sid("s-2"),
                RoleScheme::Match,
                Mode::Serious,
                UserId("carol".into()),
                UserId("dave".into()),
                600_000,
                "t1",
            ))
            .unwrap();
        let mut harness = Harness::new(Box::new(store), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (_carol, mut peer_c) = harness.connect("carol");
        let (_dave, mut peer_d) = harness.connect("dave");
        peer_a.drain();
        peer_c.drain();
        peer_d.drain();

        harness.engine.handle_message(alice, ClientMessage::Move {
            session: sid("s-1"),
            delta: delta("only-in-s1", Side::Black),
        });

        assert_eq!(updates(&peer_a.drain()), vec!["only-in-s1"]);
        assert!(updates(&peer_c.drain()).is_empty());
        assert!(updates(&peer_d.drain()).is_empty());
    }

    #[test]
    fn a_failed_persist_drops_one_update_and_the_queue_continues() {
        let store = FlakyStore { inner: seeded_store(), failing_persists: 1 };
        let mut harness = Harness::new(Box::new(store), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        peer_a.drain();

        harness.engine.handle_message(alice, ClientMessage::Move {
            session: sid("s-1"),
            delta: delta("lost", Side::Black),
        });
        harness.engine.handle_message(alice, ClientMessage::Move {
            session: sid("s-1"),
            delta: delta("kept", Side::White),
        });

        // The dropped entry produced no broadcast; the next one did.
        assert_eq!(updates(&peer_a.drain()), vec!["kept"]);
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.position, "kept");
    }

    #[test]
    fn draw_offer_accept_completes_exactly_once() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (bob, mut peer_b) = harness.connect("bob");
        peer_a.drain();
        peer_b.drain();

        harness.engine.handle_message(alice, ClientMessage::DrawRequest {
            session: sid("s-1"),
            role: Role::White,
        });
        assert!(matches!(peer_b.recv(), ServerMessage::DrawRequested { .. }));
        // A relayed offer does not touch the record.
        assert_eq!(
            harness.engine.stored_record(&sid("s-1")).unwrap().status,
            SessionStatus::Active
        );

        harness.engine.handle_message(bob, ClientMessage::DrawResponse {
            session: sid("s-1"),
            role: Role::Black,
            accept: true,
        });
        // Accepting twice must not produce a second terminal broadcast.
        harness.engine.handle_message(bob, ClientMessage::DrawResponse {
            session: sid("s-1"),
            role: Role::Black,
            accept: true,
        });

        let ended: Vec<ServerMessage> = peer_a
            .drain()
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::GameEnded { .. }))
            .collect();
        assert_eq!(ended.len(), 1);
        match &ended[0] {
            ServerMessage::GameEnded { reason, winner, winner_user, .. } => {
                assert_eq!(*reason, EndReason::Draw);
                assert_eq!(*winner, Winner::Draw);
                assert_eq!(*winner_user, None);
            }
            _ => unreachable!(),
        }
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.winner, Some(Winner::Draw));
    }

    #[test]
    fn draw_decline_relays_and_leaves_the_session_active() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (bob, mut peer_b) = harness.connect("bob");
        peer_a.drain();
        peer_b.drain();
        let _ = alice;

        harness.engine.handle_message(bob, ClientMessage::DrawResponse {
            session: sid("s-1"),
            role: Role::Black,
            accept: false,
        });

        assert!(matches!(peer_a.recv(), ServerMessage::DrawDeclined { .. }));
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.winner, None);
    }

    #[test]
    fn resignation_awards_the_opponent_identity() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (bob, mut peer_b) = harness.connect("bob");
        peer_a.drain();
        peer_b.drain();
        let _ = alice;

        harness.engine.handle_message(bob, ClientMessage::Resign {
            session: sid("s-1"),
            role: None,
        });

        match peer_a.recv() {
            ServerMessage::GameEnded { reason, winner, winner_user, first_party, second_party, .. } => {
                assert_eq!(reason, EndReason::Resignation);
                assert_eq!(winner, Winner::Role(Role::White));
                assert_eq!(winner_user, Some(UserId("alice".into())));
                assert_eq!(first_party, UserId("alice".into()));
                assert_eq!(second_party, UserId("bob".into()));
            }
            other => panic!("expected GameEnded, got {other:?}"),
        }
    }

    #[test]
    fn timeout_declaration_ends_with_the_opposite_seat_winning() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        peer_a.drain();

        harness.engine.handle_message(alice, ClientMessage::Timeout {
            session: sid("s-1"),
            role: Role::Black,
        });

        match peer_a.recv() {
            ServerMessage::GameEnded { reason, winner, .. } => {
                assert_eq!(reason, EndReason::Timeout);
                assert_eq!(winner, Winner::Role(Role::White));
            }
            other => panic!("expected GameEnded, got {other:?}"),
        }
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Timeout);
        assert_eq!(record.clock_black_ms, 0);
    }

    #[test]
    fn rejected_checkmate_claim_reaches_only_the_claimant() {
        let mut harness = Harness::new(
            Box::new(seeded_store()),
            Box::new(StubRules::escapable_check()),
        );
        let (alice, mut peer_a) = harness.connect("alice");
        let (bob, mut peer_b) = harness.connect("bob");
        peer_a.drain();
        peer_b.drain();
        let _ = bob;

        harness.engine.handle_message(alice, ClientMessage::TerminalClaim {
            session: sid("s-1"),
            reason: EndReason::Checkmate,
            winner: Role::White,
            position: "claimed".into(),
        });

        assert!(matches!(peer_a.recv(), ServerMessage::ClaimRejected { .. }));
        assert!(peer_b.drain().is_empty());
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.position, START_POSITION);
    }

    #[test]
    fn verified_checkmate_claim_ends_the_session() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (bob, mut peer_b) = harness.connect("bob");
        peer_a.drain();
        peer_b.drain();
        let _ = bob;

        // StubRules puts black on the move and mated, so white wins.
        harness.engine.handle_message(alice, ClientMessage::TerminalClaim {
            session: sid("s-1"),
            reason: EndReason::Checkmate,
            winner: Role::White,
            position: "mate-pos".into(),
        });

        match peer_b.recv() {
            ServerMessage::GameEnded { reason, winner_user, .. } => {
                assert_eq!(reason, EndReason::Checkmate);
                assert_eq!(winner_user, Some(UserId("alice".into())));
            }
            other => panic!("expected GameEnded, got {other:?}"),
        }
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.position, "mate-pos");
    }

    #[test]
    fn challenge_accept_creates_and_announces_a_session() {
        let mut harness = Harness::new(Box::new(MemoryStore::new()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (bob, mut peer_b) = harness.connect("bob");

        harness.engine.handle_message(alice, ClientMessage::Challenge {
            to: UserId("bob".into()),
            scheme: RoleScheme::Lesson,
            mode: Mode::Friendly,
            clock_ms: 300_000,
        });

        let challenge_id = match peer_b.recv() {
            ServerMessage::ChallengeReceived { challenge_id, from, scheme, .. } => {
                assert_eq!(from, UserId("alice".into()));
                assert_eq!(scheme, RoleScheme::Lesson);
                challenge_id
            }
            other => panic!("expected ChallengeReceived, got {other:?}"),
        };

        harness.engine.handle_message(bob, ClientMessage::ChallengeResponse {
            challenge_id,
            accept: true,
        });

        let record_a = match peer_a.recv() {
            ServerMessage::SessionCreated { record } => record,
            other => panic!("expected SessionCreated, got {other:?}"),
        };
        let record_b = match peer_b.recv() {
            ServerMessage::SessionCreated { record } => record,
            other => panic!("expected SessionCreated, got {other:?}"),
        };
        assert_eq!(record_a, record_b);
        assert_eq!(record_a.first_party, UserId("alice".into()));
        assert_eq!(record_a.second_party, UserId("bob".into()));
        assert_eq!(record_a.mode, Mode::Friendly);
        assert_eq!(record_a.clock_white_ms, 300_000);
        assert!(harness.engine.stored_record(&record_a.id).is_some());
    }

    #[test]
    fn challenge_decline_notifies_the_challenger_only() {
        let mut harness = Harness::new(Box::new(MemoryStore::new()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (bob, mut peer_b) = harness.connect("bob");

        harness.engine.handle_message(alice, ClientMessage::Challenge {
            to: UserId("bob".into()),
            scheme: RoleScheme::Match,
            mode: Mode::Serious,
            clock_ms: 300_000,
        });
        let challenge_id = match peer_b.recv() {
            ServerMessage::ChallengeReceived { challenge_id, .. } => challenge_id,
            other => panic!("expected ChallengeReceived, got {other:?}"),
        };
        harness.engine.handle_message(bob, ClientMessage::ChallengeResponse {
            challenge_id: challenge_id.clone(),
            accept: false,
        });

        match peer_a.recv() {
            ServerMessage::ChallengeDeclined { challenge_id: declined, by } => {
                assert_eq!(declined, challenge_id);
                assert_eq!(by, UserId("bob".into()));
            }
            other => panic!("expected ChallengeDeclined, got {other:?}"),
        }
        // The challenge is spent.
        harness.engine.handle_message(bob, ClientMessage::ChallengeResponse {
            challenge_id,
            accept: true,
        });
        assert!(matches!(peer_b.recv(), ServerMessage::Rejected { .. }));
    }

    #[test]
    fn disconnect_under_notify_policy_only_announces() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        let (_bob, mut peer_b) = harness.connect("bob");
        peer_a.drain();
        peer_b.drain();

        harness.engine.handle_disconnect(alice);

        match peer_b.recv() {
            ServerMessage::PlayerOffline { user, role, .. } => {
                assert_eq!(user, UserId("alice".into()));
                assert_eq!(role, Role::White);
            }
            other => panic!("expected PlayerOffline, got {other:?}"),
        }
        assert!(peer_b.drain().is_empty());
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Active);
    }

    #[test]
    fn disconnect_under_forfeit_policy_ends_the_session() {
        let mut harness = Harness::with_policy(
            Box::new(seeded_store()),
            Box::new(StubRules::mate()),
            DisconnectPolicy::Forfeit,
        );
        let (alice, mut peer_a) = harness.connect("alice");
        let (_bob, mut peer_b) = harness.connect("bob");
        peer_a.drain();
        peer_b.drain();

        harness.engine.handle_disconnect(alice);

        let messages = peer_b.drain();
        assert!(messages.iter().any(|m| matches!(m, ServerMessage::PlayerOffline { .. })));
        let ended = messages.iter().find_map(|m| match m {
            ServerMessage::GameEnded { reason, winner_user, .. } => Some((*reason, winner_user.clone())),
            _ => None,
        });
        assert_eq!(
            ended,
            Some((EndReason::OpponentLeft, Some(UserId("bob".into()))))
        );
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
    }

    #[test]
    fn unknown_session_operations_are_rejected_privately() {
        let mut harness = Harness::new(Box::new(MemoryStore::new()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");

        harness.engine.handle_message(alice, ClientMessage::JoinSession {
            session: sid("ghost"),
            role: None,
            spectator: false,
        });
        assert!(matches!(peer_a.recv(), ServerMessage::Rejected { .. }));

        harness.engine.handle_message(alice, ClientMessage::FetchSession { session: sid("ghost") });
        assert!(matches!(peer_a.recv(), ServerMessage::Rejected { .. }));
    }

    #[test]
    fn spectator_join_is_recorded_on_the_session_document() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (eve, mut peer_e) = harness.connect("eve");

        harness.engine.handle_message(eve, ClientMessage::JoinSession {
            session: sid("s-1"),
            role: None,
            spectator: true,
        });

        match peer_e.recv() {
            ServerMessage::Joined { role, .. } => assert_eq!(role, None),
            other => panic!("expected Joined, got {other:?}"),
        }
        let record = harness.engine.stored_record(&sid("s-1")).unwrap();
        assert_eq!(record.spectators, vec![UserId("eve".into())]);
    }

    #[test]
    fn fetch_and_list_serve_the_admin_read_surface() {
        let mut harness = Harness::new(Box::new(seeded_store()), Box::new(StubRules::mate()));
        let (alice, mut peer_a) = harness.connect("alice");
        peer_a.drain();

        harness.engine.handle_message(alice, ClientMessage::FetchSession { session: sid("s-1") });
        match peer_a.recv() {
            ServerMessage::SessionSnapshot { record } => assert_eq!(record.id, sid("s-1")),
            other => panic!("expected SessionSnapshot, got {other:?}"),
        }

        harness.engine.handle_message(alice, ClientMessage::ListSessions);
        match peer_a.recv() {
            ServerMessage::SessionList { records } => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].id, sid("s-1"));
            }
            other => panic!("expected SessionList, got {other:?}"),
        }
    }
}
