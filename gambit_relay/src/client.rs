// TCP client for connecting to the session relay.
//
// Provides a non-blocking interface for an embedding application (or an
// integration test) to talk to the relay. Architecture:
// - `connect()` performs TCP connect + Register handshake on the calling
//   thread, then spawns a background reader thread.
// - The reader thread calls `read_message()` in a loop, deserializes
//   `ServerMessage`, and pushes into an `mpsc` channel.
// - The calling thread holds a `BufWriter<TcpStream>` for sending.
// - `poll()` drains the inbox non-blocking, returning all queued messages.
//
// This separation ensures the caller never blocks on network I/O: the
// reader thread handles the blocking reads, and the writer flushes
// synchronously (acceptable for the small messages this protocol sends).
//
// Any notice the relay pushes immediately after registration — such as a
// `SessionReattached` for a returning participant — lands in the inbox and
// surfaces through `poll()`.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use gambit_protocol::framing::{read_message, write_message};
use gambit_protocol::message::{ClientMessage, MoveDelta, ServerMessage};
use gambit_protocol::types::{EndReason, Mode, Role, RoleScheme, SessionId, UserId};

/// TCP client for relay communication.
pub struct NetClient {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<ServerMessage>,
    _reader_thread: Option<JoinHandle<()>>,
    user: UserId,
}

impl NetClient {
    /// Connect to a relay, perform the Register handshake, and spawn a
    /// reader thread.
    pub fn connect(addr: &str, user: &str) -> Result<Self, String> {
        let stream = TcpStream::connect(addr).map_err(|e| format!("connect failed: {e}"))?;

        // Set a read timeout for the handshake.
        stream
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .ok();

        let reader_stream = stream
            .try_clone()
            .map_err(|e| format!("clone failed: {e}"))?;
        let mut writer = BufWriter::new(stream);

        let register = ClientMessage::Register {
            protocol_version: 1,
            user: UserId(user.into()),
        };
        send_msg(&mut writer, &register).map_err(|e| format!("send Register failed: {e}"))?;

        let mut reader = BufReader::new(reader_stream);
        let response_bytes =
            read_message(&mut reader).map_err(|e| format!("read Registered failed: {e}"))?;
        let response: ServerMessage = serde_json::from_slice(&response_bytes)
            .map_err(|e| format!("parse Registered failed: {e}"))?;

        let user = match response {
            ServerMessage::Registered { user } => user,
            ServerMessage::Rejected { reason } => {
                return Err(format!("rejected: {reason}"));
            }
            other => {
                return Err(format!("unexpected response: {other:?}"));
            }
        };

        // Clear read timeout for the long-lived reader loop.
        if let Ok(inner) = reader.get_ref().try_clone() {
            inner.set_read_timeout(None).ok();
        }

        // Spawn reader thread.
        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(reader, tx);
        });

        Ok(Self {
            writer,
            inbox: rx,
            _reader_thread: Some(reader_thread),
            user,
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Send any client message.
    pub fn send(&mut self, msg: &ClientMessage) -> Result<(), String> {
        send_msg(&mut self.writer, msg)
    }

    pub fn challenge(
        &mut self,
        to: &str,
        scheme: RoleScheme,
        mode: Mode,
        clock_ms: u64,
    ) -> Result<(), String> {
        self.send(&ClientMessage::Challenge {
            to: UserId(to.into()),
            scheme,
            mode,
            clock_ms,
        })
    }

    pub fn respond_challenge(&mut self, challenge_id: &str, accept: bool) -> Result<(), String> {
        self.send(&ClientMessage::ChallengeResponse {
            challenge_id: challenge_id.into(),
            accept,
        })
    }

    pub fn join_session(
        &mut self,
        session: &SessionId,
        role: Option<Role>,
        spectator: bool,
    ) -> Result<(), String> {
        self.send(&ClientMessage::JoinSession {
            session: session.clone(),
            role,
            spectator,
        })
    }

    pub fn send_move(&mut self, session: &SessionId, delta: MoveDelta) -> Result<(), String> {
        self.send(&ClientMessage::Move {
            session: session.clone(),
            delta,
        })
    }

    pub fn offer_draw(&mut self, session: &SessionId, role: Role) -> Result<(), String> {
        self.send(&ClientMessage::DrawRequest {
            session: session.clone(),
            role,
        })
    }

    pub fn respond_draw(&mut self, session: &SessionId, role: Role, accept: bool) -> Result<(), String> {
        self.send(&ClientMessage::DrawResponse {
            session: session.clone(),
            role,
            accept,
        })
    }

    pub fn resign(&mut self, session: &SessionId, role: Option<Role>) -> Result<(), String> {
        self.send(&ClientMessage::Resign {
            session: session.clone(),
            role,
        })
    }

    pub fn declare_timeout(&mut self, session: &SessionId, role: Role) -> Result<(), String> {
        self.send(&ClientMessage::Timeout {
            session: session.clone(),
            role,
        })
    }

    pub fn claim_end(
        &mut self,
        session: &SessionId,
        reason: EndReason,
        winner: Role,
        position: &str,
    ) -> Result<(), String> {
        self.send(&ClientMessage::TerminalClaim {
            session: session.clone(),
            reason,
            winner,
            position: position.into(),
        })
    }

    pub fn undo(&mut self, session: &SessionId, position: &str) -> Result<(), String> {
        self.send(&ClientMessage::Undo {
            session: session.clone(),
            position: position.into(),
        })
    }

    pub fn fetch_session(&mut self, session: &SessionId) -> Result<(), String> {
        self.send(&ClientMessage::FetchSession {
            session: session.clone(),
        })
    }

    /// Send Goodbye and close the connection.
    pub fn disconnect(&mut self) {
        let _ = send_msg(&mut self.writer, &ClientMessage::Goodbye);
    }

    /// Drain all queued server messages (non-blocking).
    pub fn poll(&self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = self.inbox.try_recv() {
            messages.push(msg);
        }
        messages
    }
}

/// Serialize a `ClientMessage` to JSON and write with length-delimited framing.
fn send_msg(writer: &mut BufWriter<TcpStream>, msg: &ClientMessage) -> Result<(), String> {
    let json = serde_json::to_vec(msg).map_err(|e| e.to_string())?;
    write_message(writer, &json).map_err(|e| e.to_string())
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: mpsc::Sender<ServerMessage>) {
    while let Ok(bytes) = read_message(&mut reader) {
        match serde_json::from_slice::<ServerMessage>(&bytes) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break; // Caller dropped the receiver
                }
            }
            Err(_) => break, // Malformed message
        }
    }
}
