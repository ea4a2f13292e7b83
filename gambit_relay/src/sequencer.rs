// Per-session mutation sequencer.
//
// Every state mutation for a session — moves and lifecycle transitions
// alike — passes through one FIFO queue per session id, gated by an
// in-flight flag. The guarantees:
//
// - entries for one session apply in exactly the order submitted;
// - at most one entry per session is between load and persist at a time;
// - a submission that arrives while an entry is in flight (reentrancy
//   through the dispatch path) queues behind it instead of interleaving.
//
// Different sessions share nothing here: each has its own queue and flag,
// so one stuck or busy session never delays another. Queues are created
// lazily on first submission and discarded as soon as they drain.
//
// The sequencer only orders work; applying a mutation (load, rewrite,
// persist, broadcast) is the engine's job. The engine's drain loop is:
//
//   while let Some(entry) = sequencer.begin_next(&session) {
//       apply(entry);
//       sequencer.finish(&session);
//   }

use std::collections::{HashMap, HashSet, VecDeque};

use gambit_protocol::types::{Role, SessionId};

use crate::lifecycle::Mutation;
use crate::registry::ConnectionId;

/// One queued state mutation awaiting application.
#[derive(Debug)]
pub struct QueueEntry {
    /// Submitting connection; receives any private rejection.
    pub conn: ConnectionId,
    /// The seat the submitter held at submission time. None only for
    /// relay-internal entries (spectator-list appends).
    pub seat: Option<Role>,
    pub mutation: Mutation,
}

/// Per-session FIFO queues with an in-flight flag gating application.
#[derive(Default)]
pub struct Sequencer {
    queues: HashMap<SessionId, VecDeque<QueueEntry>>,
    in_flight: HashSet<SessionId>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an entry. Returns true when the caller should start draining
    /// (nothing is currently in flight for this session); false means an
    /// earlier drain loop is already running and will pick this entry up.
    pub fn enqueue(&mut self, session: &SessionId, entry: QueueEntry) -> bool {
        self.queues.entry(session.clone()).or_default().push_back(entry);
        !self.in_flight.contains(session)
    }

    /// Claim the next entry, marking the session in flight. Returns None —
    /// clearing the flag and discarding the empty queue — once drained.
    pub fn begin_next(&mut self, session: &SessionId) -> Option<QueueEntry> {
        match self.queues.get_mut(session).and_then(VecDeque::pop_front) {
            Some(entry) => {
                self.in_flight.insert(session.clone());
                Some(entry)
            }
            None => {
                self.in_flight.remove(session);
                self.queues.remove(session);
                None
            }
        }
    }

    /// Mark the in-flight entry finished (applied or abandoned).
    pub fn finish(&mut self, session: &SessionId) {
        self.in_flight.remove(session);
    }

    pub fn pending(&self, session: &SessionId) -> usize {
        self.queues.get(session).map_or(0, VecDeque::len)
    }

    /// True when no queue exists and nothing is in flight anywhere.
    pub fn is_idle(&self) -> bool {
        self.queues.is_empty() && self.in_flight.is_empty()
    }
}
