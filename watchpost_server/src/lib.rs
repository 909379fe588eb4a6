// watchpost_server: alert system server and node client for watchpost.
//
// The server accepts TCP connections from sensor, alert and manager nodes,
// authenticates and registers them, and keeps every node's view of the alert
// system in step: sensor reports update the shared state and fan out to
// managers and to the alert nodes whose alert levels match. The protocol
// itself (envelopes, RTS/CTS, the handshake) lives in `watchpost_protocol`;
// this crate drives it over real sockets.
//
// Module overview:
// - `config.rs`:  `ServerConfig`, `Timeouts`, and the JSON `ConfigFile`.
// - `auth.rs`:    `CredentialStore` trait and the in-memory store.
// - `sync.rs`:    `AlertSystem`, the shared record of nodes, sensors, alerts
//                 and options, with the fan-out rules for every update.
// - `session.rs`: One server-side connection: authentication, then a `Link`
//                 driven by a `recv_timeout` loop.
// - `server.rs`:  TCP listener, one thread per connection, and the timer that
//                 releases delayed alerts and option changes.
// - `client.rs`:  `NodeClient`, the node-side counterpart used by node
//                 programs and the integration tests.
//
// The server can run as a standalone binary (`main.rs`) or be embedded via
// the library API (`start_server`).

pub mod auth;
pub mod client;
pub mod config;
pub mod server;
mod session;
pub mod sync;

pub use client::{ClientConfig, ClientEvent, NodeClient};
pub use server::{ServerHandle, start_server};
