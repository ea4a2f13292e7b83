// gambit_relay — authoritative session relay and state engine for Gambit.
//
// The relay is the single source of truth for two-seat game sessions: it
// tracks which connection belongs to which session and seat, serializes
// concurrent move submissions per session, keeps authoritative position and
// clock state, verifies terminal-state claims (checkmate, draw), and
// broadcasts state deltas to exactly the connections of the matching
// session — never across sessions, and never accepting writes from
// spectators.
//
// Module overview:
// - `registry.rs`:  Connection ↔ identity bindings; owns every socket's
//                   write half so the dispatch thread is the only writer.
// - `room.rs`:      Per-session rooms (seats + spectators), join/leave and
//                   strictly session-scoped broadcast.
// - `sequencer.rs`: Per-session FIFO + in-flight flag — the ordering gate
//                   every mutation passes through.
// - `lifecycle.rs`: The mutation vocabulary, status machine, winner
//                   resolution, and terminal-claim verification.
// - `store.rs`:     `SessionStore` trait + in-memory implementation.
// - `engine.rs`:    The coordinating service instance tying it together.
// - `reconnect.rs`: Reattach-on-register and the disconnect policy.
// - `server.rs`:    TCP listener, reader threads, and the single-threaded
//                   main event loop (`std::net` + `mpsc`, no async runtime).
// - `client.rs`:    `NetClient`, the non-blocking library client.
//
// Collaborators: `gambit_protocol` (message types and framing) and
// `gambit_rules` (board legality, consulted only for terminal claims).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded via
// the library API (`start_relay` / `start_relay_with`).

pub mod client;
pub mod engine;
pub mod lifecycle;
pub mod reconnect;
pub mod registry;
pub mod room;
pub mod sequencer;
pub mod server;
pub mod store;

pub use reconnect::DisconnectPolicy;
pub use server::{RelayConfig, RelayHandle, start_relay, start_relay_with};
