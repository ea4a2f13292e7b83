// Reconnection supervisor: re-sync a returning participant.
//
// Registration is the hook: whenever a connection binds an identity, look
// for an Active session where that identity holds a seat, rejoin the room
// under the resolved seat (displacing any stale connection), and hand the
// full authoritative record back in a one-time `SessionReattached` notice.
// Registering twice produces the notice twice; session status and clocks
// are never touched.
//
// Disconnection is the other half. The default policy favors game
// continuity over liveness enforcement: a dropped seat holder is announced
// to the room (`PlayerOffline`) and nothing else happens — the session
// keeps running and the player reattaches on their next register. A
// competitive deployment can flip the policy to Forfeit instead, which ends
// an Active session in the remaining seat's favor (`OpponentLeft`). The
// policy decision is made by the engine; this module only defines it.

use gambit_protocol::message::ServerMessage;
use gambit_protocol::types::UserId;

use crate::registry::{ConnectionId, Registry};
use crate::room::Rooms;
use crate::store::SessionStore;

/// What to do with an Active session when a seat holder's connection drops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DisconnectPolicy {
    /// Announce the drop and keep playing.
    #[default]
    Notify,
    /// End the session in the remaining seat's favor.
    Forfeit,
}

impl DisconnectPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notify" => Some(Self::Notify),
            "forfeit" => Some(Self::Forfeit),
            _ => None,
        }
    }
}

/// Reattach a freshly registered connection to its active session, if any.
pub fn reattach(
    store: &dyn SessionStore,
    rooms: &mut Rooms,
    registry: &mut Registry,
    conn: ConnectionId,
    user: &UserId,
) {
    let record = match store.find_active_for_user(user) {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("reattach lookup for {:?} failed: {e}", user.0);
            return;
        }
    };
    let Some(role) = record.role_of(user) else {
        return;
    };
    tracing::debug!("reattaching {} to session {} as {role:?}", user.0, record.id.0);
    rooms.join(conn, &record.id, Some(role), false);
    registry.send_to(conn, &ServerMessage::SessionReattached { record });
}
