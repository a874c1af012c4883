//! Transport abstraction shared by the polling and framed transports.

use std::any::Any;
use std::fmt;
use std::str::FromStr;

use futures::future::BoxFuture;

use crate::error::{TransportError, UnknownTransport};
use crate::packet::Packet;

/// The concrete delivery mechanisms a session can ride on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Sequential HTTP request/response pairs.
    Polling,
    /// Persistent full-duplex frame stream.
    Websocket,
}

impl TransportKind {
    /// The name used in the `transport` query parameter and the
    /// handshake's `upgrades` list.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Websocket => "websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(Self::Polling),
            "websocket" => Ok(Self::Websocket),
            other => Err(UnknownTransport(other.to_owned())),
        }
    }
}

/// One concrete delivery mechanism bound to a session.
///
/// Implementations own their outbound queue and whatever HTTP exchange or
/// framed connection sits underneath. All methods may be called
/// concurrently from the dispatch task, the router, and application code.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Which mechanism this is, for routing decisions.
    fn kind(&self) -> TransportKind;

    /// Enqueue an outbound packet.
    ///
    /// Suspends while the outbox is full, up to the transport's write
    /// deadline, then fails with [`TransportError::OutboxFull`].
    fn write(&self, packet: Packet) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Complete a held polling response with the current outbox contents,
    /// leaving it parked when the outbox is empty. A no-op for transports
    /// that do not hold responses.
    fn flush(&self) -> BoxFuture<'_, ()>;

    /// Hook invoked on the older transport when the upgrade barrier packet
    /// arrives on its successor: deliver anything still queued, then
    /// release any held response.
    fn upgrade_to(&self, successor: TransportKind) -> BoxFuture<'_, ()>;

    /// Release underlying resources, waking any parked request with a
    /// terminal NOOP. The returned error, if any, feeds the session's
    /// close reason.
    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Downcast support for routing code that needs the concrete type.
    fn as_any(&self) -> &dyn Any;
}
