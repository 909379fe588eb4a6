// watchpost_protocol: wire protocol and per-connection state machines for the
// watchpost sensor/alert network.
//
// This crate holds everything both ends of a connection share: the message
// vocabulary, the envelope codec, framing, and the state machines that keep a
// single channel orderly (RTS/CTS arbitration, request/response pairing, the
// authentication/registration handshake). It never spawns threads or opens
// sockets; the server crate (`watchpost_server`) drives these types from its
// session and client loops.
//
// Module overview:
// - `types.rs`:      Id newtypes (server-wide vs client-local), `NodeType`,
//                    `SensorState`, `SensorData`.
// - `message.rs`:    `MessageKind`, data model records, typed `Request` and
//                    `Response` payloads.
// - `codec.rs`:      `Envelope` <-> JSON, including shape-based dispatch for
//                    messages that travel in both directions.
// - `framing.rs`:    4-byte big-endian length prefix + JSON over any
//                    `Read`/`Write`.
// - `error.rs`:      `ProtocolError`, `Error`, `TimeoutKind`.
// - `arbiter.rs`:    RTS/CTS state machine with collision backoff.
// - `correlator.rs`: Pairs responses with requests; blocking `call` for
//                    authentication.
// - `handshake.rs`:  Handshake states and the per-role admission table.
// - `link.rs`:       Arbiter + correlator + outbox over a writer.
// - `jitter.rs`:     Seedable PRNG for backoff delays and exchange ids.
// - `transition.rs`: Sensor-side alert/state-change classification.
// - `cache.rs`:      Manager-side replica of the server state.
//
// Design decisions:
// - **JSON envelopes.** The wire format is fixed by deployed nodes, so the
//   codec maps it onto strict types instead of exposing `serde_json::Value`.
// - **Pure state machines.** Every state machine takes `now: Instant`
//   explicitly, so tests drive them with a virtual clock and the same code runs
//   under the server's threads and the client's loop.
// - **No async runtime.** Uses `std::io::Read`/`Write`, compatible with
//   blocking TCP streams and in-memory buffers alike.

pub mod arbiter;
pub mod cache;
pub mod codec;
pub mod correlator;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod jitter;
pub mod link;
pub mod message;
pub mod transition;
pub mod types;

pub use arbiter::{Arbiter, ArbiterState, BackoffPolicy, RtsOutcome};
pub use cache::ManagerCache;
pub use codec::{Body, CodecError, Envelope, Origin};
pub use correlator::{Correlator, Reply};
pub use error::{Error, ProtocolError, TimeoutKind};
pub use framing::{MAX_FRAME_SIZE, read_envelope, write_envelope};
pub use handshake::{Handshake, HandshakeState, MIN_CLIENT_VERSION, PROTOCOL_VERSION, Role};
pub use jitter::Jitter;
pub use link::{Link, LinkEvent};
pub use message::{MessageKind, Request, Response, Snapshot};
pub use transition::{SensorProfile, Transition};
pub use types::{NodeId, NodeType, SensorData, SensorId, SensorState};
