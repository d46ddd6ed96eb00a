//! Namespace-scoped broadcast/request relay.
//!
//! A client connects to the root channel `/`, sends `sqw:client_preflight`
//! and is handed a private namespace id. It then reconnects to `/<ns>` and
//! exchanges `sqw:broadcast`, `sqw:request` and server-initiated `sqw:data`
//! events, each optionally acknowledged asynchronously. Modules, leaves first:
//!
//! - [`message`] holds the wire packets, binary-capable payloads and the
//!   line-delimited JSON framing.
//! - [`envelope`] turns named events into typed envelopes.
//! - [`ack`] correlates acknowledgements with the calls awaiting them.
//! - [`channel`] runs one logical channel over a byte stream: writer task,
//!   reader/demux task, cloneable handle.
//! - [`registry`] allocates namespaces and tracks their members.
//! - [`preflight`] serves the root channel handshake.
//! - [`session`] and [`service`] handle joined channels and the server-side
//!   namespace logic.
//! - [`server`] and [`client`] are the two ends over TCP; [`cli`] and
//!   [`config`] drive them from the command line.

pub mod ack;
pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod message;
pub mod preflight;
pub mod registry;
pub mod server;
pub mod service;
pub mod session;
