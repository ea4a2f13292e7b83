// TCP server and main event loop for the session relay.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Reader threads** (one per client): call `framing::read_message()` in a
//   loop, deserialize `ClientMessage`, and send `InternalEvent::MessageFrom`
//   to the main thread. On error/EOF, send `InternalEvent::Disconnected`.
// - **Main thread**: owns the `Engine`, receives events from the channel,
//   and dispatches them. All sessions are serviced by this one thread; the
//   engine's per-session queues provide ordering, so no locks exist
//   anywhere.
//
// The main thread is the only writer to client TCP streams (via the
// engine's registry). Reader threads only read from streams. This avoids
// concurrent read/write on the same `TcpStream`, which is safe on most
// platforms but fragile.
//
// Handshake: the first frame on a connection must be `Register`. Anything
// else gets a `Rejected` reply and the connection is dropped, mirroring the
// usual "speak first or leave" handshake for framed protocols.
//
// Shutdown: the main thread checks a `keep_running` flag (set to false by
// `RelayHandle::stop`) and breaks out of the event loop.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use gambit_protocol::framing::{read_message, write_message};
use gambit_protocol::message::{ClientMessage, ServerMessage};
use gambit_rules::{BoardRules, RulesEngine};

use crate::engine::Engine;
use crate::reconnect::DisconnectPolicy;
use crate::registry::ConnectionId;
use crate::store::{MemoryStore, SessionStore};

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    NewConnection { stream: TcpStream },
    MessageFrom { conn: ConnectionId, message: ClientMessage },
    Disconnected { conn: ConnectionId },
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Configuration for starting a relay server.
pub struct RelayConfig {
    pub port: u16,
    pub disconnect_policy: DisconnectPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 7878,
            disconnect_policy: DisconnectPolicy::Notify,
        }
    }
}

/// Start a relay with the built-in collaborators: an in-memory session
/// store and the `chess`-backed rules engine.
pub fn start_relay(config: RelayConfig) -> std::io::Result<(RelayHandle, std::net::SocketAddr)> {
    start_relay_with(config, Box::new(MemoryStore::new()), Box::new(BoardRules))
}

/// Start the relay server on a background thread with injected store and
/// rules collaborators. Returns a handle for stopping it and the actual
/// bound address (useful when port 0 is used to let the OS pick).
pub fn start_relay_with(
    config: RelayConfig,
    store: Box<dyn SessionStore>,
    rules: Box<dyn RulesEngine>,
) -> std::io::Result<(RelayHandle, std::net::SocketAddr)> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    let thread = thread::spawn(move || {
        run_relay(listener, config, store, rules, keep_running_clone);
    });

    tracing::info!("relay listening on {addr}");
    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main relay loop. Runs until `keep_running` is set to false.
fn run_relay(
    listener: TcpListener,
    config: RelayConfig,
    store: Box<dyn SessionStore>,
    rules: Box<dyn RulesEngine>,
    keep_running: Arc<AtomicBool>,
) {
    let mut engine = Engine::new(store, rules, config.disconnect_policy);
    let mut next_conn: u64 = 0;

    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Set the listener to non-blocking so the accept thread can check
    // keep_running periodically.
    listener.set_nonblocking(true).ok();

    // Listener thread: accepts new connections.
    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).ok();
                    let _ = tx_listener.send(InternalEvent::NewConnection { stream });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => break,
            }
        }
    });

    // Main event loop. The timeout exists only to re-check keep_running.
    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                handle_event(&mut engine, &mut next_conn, event, &tx, &keep_running);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut engine, &mut next_conn, event, &tx, &keep_running);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Dispatch a single event to the engine.
fn handle_event(
    engine: &mut Engine,
    next_conn: &mut u64,
    event: InternalEvent,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    match event {
        InternalEvent::NewConnection { stream } => {
            let conn = ConnectionId(*next_conn);
            *next_conn += 1;
            handle_new_connection(engine, conn, stream, tx, keep_running);
        }
        InternalEvent::MessageFrom { conn, message } => {
            engine.handle_message(conn, message);
        }
        InternalEvent::Disconnected { conn } => {
            engine.handle_disconnect(conn);
        }
    }
}

/// Handle a new TCP connection: read the Register handshake, bind the
/// identity, and spawn a reader thread.
fn handle_new_connection(
    engine: &mut Engine,
    conn: ConnectionId,
    stream: TcpStream,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    // Set a read timeout so the handshake doesn't block forever.
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();

    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });

    let first_bytes = match read_message(&mut reader) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };

    let first: ClientMessage = match serde_json::from_slice(&first_bytes) {
        Ok(msg) => msg,
        Err(_) => return,
    };

    match first {
        ClientMessage::Register { protocol_version: _, user } => {
            let write_stream = match stream.try_clone() {
                Ok(s) => s,
                Err(_) => return,
            };
            engine.attach_connection(conn, write_stream);
            if engine.handle_register(conn, user) {
                // Clear read timeout for the long-lived reader loop.
                stream.set_read_timeout(None).ok();

                let tx_reader = tx.clone();
                let keep_running_reader = keep_running.clone();
                thread::spawn(move || {
                    reader_loop(reader, conn, tx_reader, keep_running_reader);
                });
            } else {
                engine.handle_disconnect(conn);
            }
        }
        _ => {
            // Expected Register as the first frame — reject and drop.
            let rejected = ServerMessage::Rejected {
                reason: "expected Register".into(),
            };
            if let Ok(json) = serde_json::to_vec(&rejected) {
                let mut writer = BufWriter::new(stream);
                let _ = write_message(&mut writer, &json);
            }
        }
    }
}

/// Reader loop for a single client. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    conn: ConnectionId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_message(&mut reader) {
            Ok(bytes) => match serde_json::from_slice::<ClientMessage>(&bytes) {
                Ok(ClientMessage::Goodbye) => {
                    let _ = tx.send(InternalEvent::Disconnected { conn });
                    break;
                }
                Ok(message) => {
                    let _ = tx.send(InternalEvent::MessageFrom { conn, message });
                }
                Err(_) => {
                    // Malformed message — disconnect.
                    let _ = tx.send(InternalEvent::Disconnected { conn });
                    break;
                }
            },
            Err(_) => {
                // Read error or EOF — disconnect.
                let _ = tx.send(InternalEvent::Disconnected { conn });
                break;
            }
        }
    }
}
