// Connection registry: transport connections ↔ authenticated identities.
//
// The registry owns the buffered write half of every live connection, so the
// main dispatch thread is the only writer to client sockets (reader threads
// only read). Write errors on a single client are logged and swallowed — the
// reader thread for that client will detect the broken pipe and surface a
// `Disconnected` event.
//
// Bindings are process-lifetime only and never persisted. A user may hold
// many simultaneous connections (multi-device); a connection is bound to at
// most one identity at a time.

use std::collections::HashMap;
use std::io::BufWriter;
use std::net::TcpStream;

use gambit_protocol::framing::write_message;
use gambit_protocol::message::ServerMessage;
use gambit_protocol::types::UserId;

/// Relay-assigned connection id (compact u64, process-lifetime only).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

struct Connection {
    writer: BufWriter<TcpStream>,
    user: Option<UserId>,
}

/// Maps transport connections to authenticated identities and owns the
/// write half of each connection.
#[derive(Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection before it registers.
    pub fn attach(&mut self, conn: ConnectionId, stream: TcpStream) {
        self.connections.insert(
            conn,
            Connection {
                writer: BufWriter::new(stream),
                user: None,
            },
        );
    }

    /// Bind a connection to an identity. Idempotent per connection; a
    /// connection may carry at most one identity at a time, so claiming a
    /// different identity on a bound connection is rejected.
    pub fn register(&mut self, conn: ConnectionId, user: UserId) -> Result<(), String> {
        let entry = self
            .connections
            .get_mut(&conn)
            .ok_or_else(|| "unknown connection".to_string())?;
        match &entry.user {
            None => {
                entry.user = Some(user);
                Ok(())
            }
            Some(existing) if *existing == user => Ok(()),
            Some(_) => Err("connection is already registered".into()),
        }
    }

    pub fn resolve_user(&self, conn: ConnectionId) -> Option<&UserId> {
        self.connections.get(&conn).and_then(|c| c.user.as_ref())
    }

    /// Remove all bindings for a connection (invoked on transport close).
    pub fn forget(&mut self, conn: ConnectionId) {
        self.connections.remove(&conn);
    }

    /// All live connections bound to an identity, in id order.
    pub fn connections_of(&self, user: &UserId) -> Vec<ConnectionId> {
        let mut conns: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.user.as_ref() == Some(user))
            .map(|(id, _)| *id)
            .collect();
        conns.sort();
        conns
    }

    /// Serialize and deliver one message to one connection.
    pub fn send_to(&mut self, conn: ConnectionId, msg: &ServerMessage) {
        match serde_json::to_vec(msg) {
            Ok(payload) => self.send_payload(conn, &payload),
            Err(e) => tracing::error!("serialize server message failed: {e}"),
        }
    }

    /// Deliver a pre-serialized frame to one connection. Used by broadcasts
    /// to serialize once per room instead of once per member.
    pub fn send_payload(&mut self, conn: ConnectionId, payload: &[u8]) {
        if let Some(entry) = self.connections.get_mut(&conn) {
            if let Err(e) = write_message(&mut entry.writer, payload) {
                tracing::debug!("write to {conn} failed: {e}");
            }
        }
    }

    /// Deliver to every connection bound to an identity, regardless of room
    /// membership (out-of-session notices, e.g. an incoming challenge).
    pub fn send_to_user(&mut self, user: &UserId, msg: &ServerMessage) {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("serialize server message failed: {e}");
                return;
            }
        };
        for conn in self.connections_of(user) {
            self.send_payload(conn, &payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::TcpListener;

    use gambit_protocol::framing::read_message;

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn recv(reader: &mut BufReader<TcpStream>) -> ServerMessage {
        let bytes = read_message(reader).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn register_is_idempotent_per_connection() {
        let (_client, server) = tcp_pair();
        let mut registry = Registry::new();
        registry.attach(ConnectionId(1), server);

        assert!(registry.register(ConnectionId(1), UserId("alice".into())).is_ok());
        assert!(registry.register(ConnectionId(1), UserId("alice".into())).is_ok());
        assert_eq!(registry.resolve_user(ConnectionId(1)), Some(&UserId("alice".into())));
    }

    #[test]
    fn rebinding_a_connection_to_another_identity_is_rejected() {
        let (_client, server) = tcp_pair();
        let mut registry = Registry::new();
        registry.attach(ConnectionId(1), server);

        registry.register(ConnectionId(1), UserId("alice".into())).unwrap();
        let err = registry.register(ConnectionId(1), UserId("bob".into())).unwrap_err();
        assert_eq!(err, "connection is already registered");
        assert_eq!(registry.resolve_user(ConnectionId(1)), Some(&UserId("alice".into())));
    }

    #[test]
    fn register_unknown_connection_fails() {
        let mut registry = Registry::new();
        assert!(registry.register(ConnectionId(9), UserId("alice".into())).is_err());
    }

    #[test]
    fn forget_removes_all_bindings() {
        let (_client, server) = tcp_pair();
        let mut registry = Registry::new();
        registry.attach(ConnectionId(1), server);
        registry.register(ConnectionId(1), UserId("alice".into())).unwrap();

        registry.forget(ConnectionId(1));
        assert_eq!(registry.resolve_user(ConnectionId(1)), None);
        assert!(registry.connections_of(&UserId("alice".into())).is_empty());
        // Sending to a forgotten connection is a silent no-op.
        registry.send_to(
            ConnectionId(1),
            &ServerMessage::Rejected { reason: "gone".into() },
        );
    }

    #[test]
    fn one_identity_many_connections() {
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        let mut registry = Registry::new();
        registry.attach(ConnectionId(1), s1);
        registry.attach(ConnectionId(2), s2);
        registry.register(ConnectionId(1), UserId("alice".into())).unwrap();
        registry.register(ConnectionId(2), UserId("alice".into())).unwrap();

        assert_eq!(
            registry.connections_of(&UserId("alice".into())),
            vec![ConnectionId(1), ConnectionId(2)]
        );
    }

    #[test]
    fn send_to_user_reaches_every_device() {
        let (c1, s1) = tcp_pair();
        let (c2, s2) = tcp_pair();
        let mut registry = Registry::new();
        registry.attach(ConnectionId(1), s1);
        registry.attach(ConnectionId(2), s2);
        registry.register(ConnectionId(1), UserId("alice".into())).unwrap();
        registry.register(ConnectionId(2), UserId("alice".into())).unwrap();

        let msg = ServerMessage::Registered { user: UserId("alice".into()) };
        registry.send_to_user(&UserId("alice".into()), &msg);

        for client in [c1, c2] {
            let mut reader = BufReader::new(client);
            assert_eq!(recv(&mut reader), msg);
        }
    }
}
