//! # Engine.IO server core
//!
//! Protocol core for an Engine.IO v3 server: the packet and payload
//! codecs, the transport abstraction, and the per-session socket state
//! machine.
//!
//! Concrete transports live in `eio_polling` and `eio_websocket`; the
//! HTTP router and session registry live in `eio_server`.

pub mod error;
pub mod handshake;
pub mod options;
pub mod packet;
pub mod payload;
pub mod socket;
pub mod transport;

/// Protocol version implemented by this server (`EIO` query parameter).
pub const PROTOCOL_VERSION: &str = "3";

/// Capacity of the per-session inbound packet queue.
pub const INBOX_CAPACITY: usize = 128;

/// Capacity of a transport's outbound packet queue.
pub const OUTBOX_CAPACITY: usize = 128;
