//! Error taxonomy.
//!
//! Everything below the socket is recovered into one of these types; the
//! socket alone decides whether an error is fatal to the session and, if
//! so, drives the close transition exactly once.

use thiserror::Error;

use crate::packet::PacketType;

/// Malformed single packet.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The input had no type digit.
    #[error("empty packet")]
    Empty,

    /// The leading digit is not a known packet type.
    #[error("unknown packet type digit {0:#04x}")]
    UnknownType(u8),

    /// A binary-flagged packet was handed to the string encoder.
    #[error("binary payload in string encoder")]
    BinaryBody,

    /// Text packet body is not valid UTF-8.
    #[error("invalid UTF-8 in text packet: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Base64 body of a binary packet failed to decode.
    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    /// OPEN handshake body failed to encode or decode.
    #[error("invalid handshake body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Malformed packet batch.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Encoding an empty batch is not allowed.
    #[error("empty packet batch")]
    EmptyBatch,

    /// The length prefix is not a decimal number.
    #[error("invalid length prefix {0:?}")]
    BadLength(String),

    /// A length prefix ran off the end of the input without a `:`.
    #[error("length prefix missing ':' terminator")]
    UnterminatedLength,

    /// The input ended before the announced packet length.
    #[error("payload truncated inside a {expected} code point packet")]
    Truncated {
        /// Announced length of the incomplete packet.
        expected: usize,
    },

    /// A framed unit failed single-packet decoding.
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Failure of a transport-level operation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The outbound queue stayed full past the write deadline.
    #[error("outbox full")]
    OutboxFull,

    /// The transport has already been closed.
    #[error("transport closed")]
    Closed,

    /// Underlying connection failure, with the reason carried verbatim.
    #[error("{0}")]
    Connection(String),
}

/// Failure to queue an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InboxError {
    /// The inbox is at capacity.
    #[error("inbox full")]
    Full,

    /// The session is closed.
    #[error("session closed")]
    Closed,
}

/// Failure surfaced to registered error handlers.
#[derive(Debug, Error)]
pub enum SocketError {
    /// An application message handler panicked; dispatch continued.
    #[error("message handler panicked: {0}")]
    HandlerPanic(String),

    /// An inbound packet type the session does not accept.
    #[error("unsupported inbound packet type {0:?}")]
    UnsupportedPacket(PacketType),

    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure to send an application message.
#[derive(Debug, Error)]
pub enum SendError {
    /// The session is closed.
    #[error("socket#{0} is closed")]
    Closed(String),

    /// No transport is attached to the session.
    #[error("no transport attached")]
    Detached,

    /// The write failed at the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure to attach a transport to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttachError {
    /// Both transport slots are occupied.
    #[error("transports are full")]
    TransportsFull,

    /// The session is closed.
    #[error("socket is closed")]
    Closed,
}

/// Unrecognized transport name in a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown transport {0:?}")]
pub struct UnknownTransport(pub String);
