// Session room router.
//
// A `Room` is the dynamic set of connections currently associated with one
// session id: up to four named seats (two per role scheme) plus an
// open-ended spectator list. `Rooms` owns the session → room map, creating
// rooms lazily on first join and dropping them when the last member leaves.
//
// The critical invariant lives in `broadcast`: event delivery is scoped
// strictly by session-id membership, independent of how many sessions exist
// concurrently. Out-of-room delivery by identity goes through
// `Registry::send_to_user` instead.

use std::collections::{BTreeMap, HashMap};

use gambit_protocol::message::ServerMessage;
use gambit_protocol::types::{Role, SessionId};

use crate::registry::{ConnectionId, Registry};

/// Where a connection sits within a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomPlace {
    Seat(Role),
    Spectator,
}

impl RoomPlace {
    pub fn seat(self) -> Option<Role> {
        match self {
            RoomPlace::Seat(role) => Some(role),
            RoomPlace::Spectator => None,
        }
    }
}

/// Connections currently attached to one session.
#[derive(Default)]
struct Room {
    seats: BTreeMap<Role, ConnectionId>,
    spectators: Vec<ConnectionId>,
}

impl Room {
    fn members(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.seats.values().copied().chain(self.spectators.iter().copied())
    }

    fn place_of(&self, conn: ConnectionId) -> Option<RoomPlace> {
        for (role, occupant) in &self.seats {
            if *occupant == conn {
                return Some(RoomPlace::Seat(*role));
            }
        }
        if self.spectators.contains(&conn) {
            return Some(RoomPlace::Spectator);
        }
        None
    }

    fn remove(&mut self, conn: ConnectionId) -> Option<RoomPlace> {
        let place = self.place_of(conn)?;
        match place {
            RoomPlace::Seat(role) => {
                self.seats.remove(&role);
            }
            RoomPlace::Spectator => {
                self.spectators.retain(|c| *c != conn);
            }
        }
        Some(place)
    }

    fn is_empty(&self) -> bool {
        self.seats.is_empty() && self.spectators.is_empty()
    }
}

/// Routes connections and broadcasts per session.
#[derive(Default)]
pub struct Rooms {
    rooms: HashMap<SessionId, Room>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection to a session's room.
    ///
    /// Spectators are appended unconditionally (no slot limit). A named seat
    /// is occupied even if taken — the previous connection is displaced,
    /// which is how reconnection-by-replacement works. A missing role falls
    /// back to the first open seat in `Role::FALLBACK_PRECEDENCE`; if every
    /// seat is taken the connection observes instead. A connection holds at
    /// most one room membership, so any previous membership is dropped
    /// first.
    pub fn join(
        &mut self,
        conn: ConnectionId,
        session: &SessionId,
        role: Option<Role>,
        spectator: bool,
    ) -> RoomPlace {
        self.leave(conn);
        let room = self.rooms.entry(session.clone()).or_default();
        if spectator {
            room.spectators.push(conn);
            return RoomPlace::Spectator;
        }
        let seat = role.or_else(|| {
            Role::FALLBACK_PRECEDENCE
                .iter()
                .copied()
                .find(|r| !room.seats.contains_key(r))
        });
        match seat {
            Some(seat) => {
                room.seats.insert(seat, conn);
                RoomPlace::Seat(seat)
            }
            None => {
                room.spectators.push(conn);
                RoomPlace::Spectator
            }
        }
    }

    /// Remove a connection from whatever room it occupies. Returns what was
    /// vacated so the caller can emit a presence notification. Never mutates
    /// session status.
    pub fn leave(&mut self, conn: ConnectionId) -> Option<(SessionId, RoomPlace)> {
        let mut vacated = None;
        for (session, room) in &mut self.rooms {
            if let Some(place) = room.remove(conn) {
                vacated = Some((session.clone(), place));
                break;
            }
        }
        if let Some((session, _)) = &vacated {
            if self.rooms.get(session).is_some_and(Room::is_empty) {
                self.rooms.remove(session);
            }
        }
        vacated
    }

    /// The room and place a connection currently occupies.
    pub fn place_of(&self, conn: ConnectionId) -> Option<(&SessionId, RoomPlace)> {
        for (session, room) in &self.rooms {
            if let Some(place) = room.place_of(conn) {
                return Some((session, place));
            }
        }
        None
    }

    /// Seats currently occupied in a session's room, in seat order.
    pub fn occupied_seats(&self, session: &SessionId) -> Vec<Role> {
        self.rooms
            .get(session)
            .map(|room| room.seats.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Deliver to every connection currently in the session's room — all
    /// seats plus all spectators — and no one else.
    pub fn broadcast(&self, registry: &mut Registry, session: &SessionId, msg: &ServerMessage) {
        let Some(room) = self.rooms.get(session) else {
            return;
        };
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("serialize broadcast failed: {e}");
                return;
            }
        };
        for conn in room.members() {
            registry.send_payload(conn, &payload);
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
