//! # HTTP long-polling transport
//!
//! Multiplexes one logical packet stream over sequential HTTP exchanges:
//! a GET carries server-to-client packets (parking until there is
//! something to say), a POST carries client-to-server packets. At most
//! one request per direction may be in flight per session.

mod transport;

pub use transport::{GetOutcome, PollingTransport, PostOutcome};

use eio_core::packet::Packet;

/// Content type for a response payload containing only text packets.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// Content type for a response payload containing any binary packet.
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Response body of a successful POST.
pub const POST_OK_BODY: &str = "ok";

/// Pick the response content type for a drained batch.
#[must_use]
pub fn content_type_for(packets: &[Packet]) -> &'static str {
    if packets.iter().any(Packet::is_binary) {
        BINARY_CONTENT_TYPE
    } else {
        TEXT_CONTENT_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_switches_on_binary_packets() {
        let text = [Packet::message("hi")];
        assert_eq!(content_type_for(&text), TEXT_CONTENT_TYPE);

        let mixed = [Packet::message("hi"), Packet::message_binary(vec![1u8])];
        assert_eq!(content_type_for(&mixed), BINARY_CONTENT_TYPE);
    }
}
