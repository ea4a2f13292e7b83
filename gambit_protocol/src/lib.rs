// gambit_protocol — wire protocol for the Gambit session relay.
//
// This crate defines the message types, framing, and serialization used by
// the session relay (`gambit_relay`) and game clients to communicate over
// TCP. It is shared between both sides and has no dependency on the relay or
// the rules engine.
//
// Module overview:
// - `types.rs`:    Core ids and enums — `SessionId`, `UserId`, `Side`,
//                  `Role`, `RoleScheme`, `Mode`, `SessionStatus`, `Winner`,
//                  `EndReason`.
// - `record.rs`:   The authoritative session document (`SessionRecord`),
//                  which is both the persisted layout and a wire payload.
// - `message.rs`:  Client-to-relay and relay-to-client message enums, plus
//                  `MoveDelta`.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON serialization.** Human-readable frames make the relay easy to
//   drive from tests and scratch clients. Binary framing can be swapped in
//   later if bandwidth matters.
// - **Positions as opaque FEN strings.** The protocol crate never inspects
//   board positions; only the rules engine parses them.
// - **No async runtime.** Uses `std::io::Read`/`Write` for framing,
//   compatible with both blocking TCP streams and buffered wrappers.

pub mod framing;
pub mod message;
pub mod record;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, read_message, write_message};
pub use message::{ClientMessage, MoveDelta, ServerMessage};
pub use record::{START_POSITION, SessionRecord};
pub use types::{EndReason, Mode, Role, RoleScheme, SessionId, SessionStatus, Side, UserId, Winner};
