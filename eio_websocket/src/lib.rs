//! # Framed full-duplex transport
//!
//! A persistent frame stream established by HTTP upgrade. Each frame
//! carries exactly one encoded packet: text frames carry string-encoded
//! packets, binary frames carry base64-encoded byte-payload packets.
//! Per session, a reader loop decodes frames into the socket inbox and a
//! writer loop drains the outbox one frame per packet.

mod transport;

pub use transport::WebSocketTransport;

/// Write buffer size requested for accepted connections.
pub const BUFFER_SIZE: usize = 1024;
