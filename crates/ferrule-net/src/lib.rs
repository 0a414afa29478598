//! Networking core for the ferrule system utilities.
//!
//! This crate provides IPv4 transport plumbing built around two cooperating
//! types, each of which owns a dedicated background worker thread:
//!
//! - [`Endpoint`] binds a local address in one of four [`Mode`]s and either
//!   accepts stream peers or exchanges datagrams (including multicast).
//!   Accepted peers surface as fresh [`Connection`]s through the
//!   new-connection callback; datagrams surface through the packet
//!   callback.
//! - [`Connection`] owns one established byte-stream session, either
//!   dialed with [`Connection::connect`] or handed out by an endpoint's
//!   accept path. Outbound data is buffered in a [`ByteQueue`] and flushed
//!   by the worker; inbound chunks and the one-shot broken notification
//!   arrive on callbacks.
//!
//! The stream is opaque bytes: there is no framing, no TLS, and no
//! reconnection policy. Both types publish their activity on a
//! [`DiagnosticsBus`](ferrule_core::DiagnosticsBus) reachable through
//! their `diagnostics()` accessors.
//!
//! # Example
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use ferrule_net::{Endpoint, EndpointConfig, Mode};
//!
//! let endpoint = Endpoint::new();
//! let opened = endpoint.open(
//!     EndpointConfig::new(Mode::Connection).local_address(Ipv4Addr::LOCALHOST),
//!     |connection| {
//!         connection.process(
//!             |bytes| println!("received {} bytes", bytes.len()),
//!             |graceful| println!("connection ended (graceful: {graceful})"),
//!         );
//!     },
//!     |_, _, _| {},
//! );
//! assert!(opened);
//! println!("listening on {}", endpoint.bound_port());
//! ```

pub mod connection;
pub mod endpoint;
pub mod queue;

mod interfaces;
mod resolver;

pub use connection::{BrokenCallback, Connection, ConnectionConfig, MessageReceivedCallback};
pub use endpoint::{Endpoint, EndpointConfig, Mode, NewConnectionCallback, PacketReceivedCallback};
pub use interfaces::interface_addresses;
pub use queue::ByteQueue;
pub use resolver::resolve_host;
