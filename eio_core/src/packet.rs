//! Single-packet codec.
//!
//! A packet encodes as one leading type digit followed by its body. Text
//! packets are written verbatim as UTF-8; binary packets are written as
//! `b<digit><base64>` using the standard padded alphabet, so any encoded
//! form starting with `b` is binary.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use crate::error::PacketError;
use crate::handshake::Handshake;

/// The closed set of packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
}

impl PacketType {
    /// The wire digit for this type.
    #[must_use]
    pub const fn digit(self) -> u8 {
        match self {
            Self::Open => b'0',
            Self::Close => b'1',
            Self::Ping => b'2',
            Self::Pong => b'3',
            Self::Message => b'4',
            Self::Upgrade => b'5',
            Self::Noop => b'6',
        }
    }

    /// Inverse of [`digit`](Self::digit).
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::UnknownType`] for anything outside `0`..=`6`.
    pub fn from_digit(digit: u8) -> Result<Self, PacketError> {
        match digit {
            b'0' => Ok(Self::Open),
            b'1' => Ok(Self::Close),
            b'2' => Ok(Self::Ping),
            b'3' => Ok(Self::Pong),
            b'4' => Ok(Self::Message),
            b'5' => Ok(Self::Upgrade),
            b'6' => Ok(Self::Noop),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// A single framed protocol packet.
///
/// Immutable after construction. The binary flag selects the encoder:
/// text packets must hold valid UTF-8, binary packets may hold arbitrary
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketType,
    data: Bytes,
    binary: bool,
}

impl Packet {
    /// Create a packet from raw parts.
    #[must_use]
    pub fn new(kind: PacketType, data: impl Into<Bytes>, binary: bool) -> Self {
        Self {
            kind,
            data: data.into(),
            binary,
        }
    }

    /// An application MESSAGE carrying text.
    #[must_use]
    pub fn message(text: impl Into<String>) -> Self {
        Self::new(PacketType::Message, text.into(), false)
    }

    /// An application MESSAGE carrying opaque bytes.
    #[must_use]
    pub fn message_binary(data: impl Into<Bytes>) -> Self {
        Self::new(PacketType::Message, data, true)
    }

    /// The OPEN packet carrying the session handshake.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Json`] if the handshake fails to serialize.
    pub fn open(handshake: &Handshake) -> Result<Self, PacketError> {
        let body = serde_json::to_vec(handshake)?;
        Ok(Self::new(PacketType::Open, body, false))
    }

    /// A NOOP packet, used to release parked polling requests.
    #[must_use]
    pub const fn noop() -> Self {
        Self {
            kind: PacketType::Noop,
            data: Bytes::new(),
            binary: false,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PacketType {
        self.kind
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.binary
    }

    /// Consume the packet, keeping its body.
    #[must_use]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Parse the OPEN handshake body.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Json`] if the body is not a handshake object.
    pub fn handshake(&self) -> Result<Handshake, PacketError> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Encode as `<digit><utf8 body>`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::BinaryBody`] when the binary flag is set;
    /// opaque bytes must go through [`encode_base64`](Self::encode_base64).
    pub fn encode_string(&self) -> Result<Vec<u8>, PacketError> {
        if self.binary {
            return Err(PacketError::BinaryBody);
        }
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.kind.digit());
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    /// Encode as `b<digit><base64 body>`.
    #[must_use]
    pub fn encode_base64(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.data.len().div_ceil(3) * 4);
        out.push(b'b');
        out.push(self.kind.digit());
        out.extend_from_slice(BASE64.encode(&self.data).as_bytes());
        out
    }

    /// Decode either encoded form, recognizing the `b` prefix.
    ///
    /// # Errors
    ///
    /// See [`decode_string`](Self::decode_string) and
    /// [`decode_base64`](Self::decode_base64).
    pub fn decode(input: &[u8]) -> Result<Self, PacketError> {
        match input.first() {
            None => Err(PacketError::Empty),
            Some(b'b') => Self::decode_base64(input),
            Some(_) => Self::decode_string(input),
        }
    }

    /// Decode the string form.
    ///
    /// # Errors
    ///
    /// Fails on empty input, an unknown type digit, or a non-UTF-8 body.
    pub fn decode_string(input: &[u8]) -> Result<Self, PacketError> {
        let (digit, body) = input.split_first().ok_or(PacketError::Empty)?;
        let kind = PacketType::from_digit(*digit)?;
        std::str::from_utf8(body)?;
        Ok(Self::new(kind, Bytes::copy_from_slice(body), false))
    }

    /// Decode the base64 form, including the leading `b`.
    ///
    /// # Errors
    ///
    /// Fails on empty input, an unknown type digit, or an invalid base64
    /// body.
    pub fn decode_base64(input: &[u8]) -> Result<Self, PacketError> {
        let rest = match input.split_first() {
            Some((b'b', rest)) => rest,
            _ => return Err(PacketError::Empty),
        };
        let (digit, body) = rest.split_first().ok_or(PacketError::Empty)?;
        let kind = PacketType::from_digit(*digit)?;
        let data = BASE64.decode(body)?;
        Ok(Self::new(kind, data, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testresult::TestResult;

    #[test]
    fn string_roundtrip_every_type() -> TestResult {
        for kind in [
            PacketType::Open,
            PacketType::Close,
            PacketType::Ping,
            PacketType::Pong,
            PacketType::Message,
            PacketType::Upgrade,
            PacketType::Noop,
        ] {
            let packet = Packet::new(kind, "payload", false);
            let encoded = packet.encode_string()?;
            assert_eq!(Packet::decode(&encoded)?, packet);
        }
        Ok(())
    }

    #[test]
    fn binary_roundtrip_every_type() -> TestResult {
        for kind in [
            PacketType::Open,
            PacketType::Close,
            PacketType::Ping,
            PacketType::Pong,
            PacketType::Message,
            PacketType::Upgrade,
            PacketType::Noop,
        ] {
            let packet = Packet::new(kind, vec![0u8, 159, 146, 150], true);
            let encoded = packet.encode_base64();
            assert_eq!(encoded[0], b'b');
            assert_eq!(Packet::decode(&encoded)?, packet);
        }
        Ok(())
    }

    #[test]
    fn empty_body_encodes_as_single_digit() -> TestResult {
        let packet = Packet::new(PacketType::Ping, "", false);
        assert_eq!(packet.encode_string()?, b"2");
        Ok(())
    }

    #[test]
    fn message_hello_encoding() -> TestResult {
        let packet = Packet::message("hello");
        assert_eq!(packet.encode_string()?, b"4hello");
        Ok(())
    }

    #[test]
    fn binary_hello_encoding() {
        let packet = Packet::message_binary(&b"hello"[..]);
        assert_eq!(packet.encode_base64(), b"b4aGVsbG8=");
    }

    #[test]
    fn string_encoder_rejects_binary_body() {
        let packet = Packet::message_binary(vec![1, 2, 3]);
        assert!(matches!(
            packet.encode_string(),
            Err(PacketError::BinaryBody)
        ));
    }

    #[test]
    fn decode_rejects_empty_input() {
        assert!(matches!(Packet::decode(b""), Err(PacketError::Empty)));
        assert!(matches!(Packet::decode(b"b"), Err(PacketError::Empty)));
    }

    #[test]
    fn decode_rejects_unknown_type_digit() {
        assert!(matches!(
            Packet::decode(b"9hello"),
            Err(PacketError::UnknownType(b'9'))
        ));
    }

    #[test]
    fn decode_rejects_invalid_base64() {
        assert!(matches!(
            Packet::decode(b"b4!!!"),
            Err(PacketError::Base64(_))
        ));
    }

    #[test]
    fn decode_rejects_invalid_utf8_text() {
        assert!(matches!(
            Packet::decode_string(&[b'4', 0xff, 0xfe]),
            Err(PacketError::Utf8(_))
        ));
    }

    #[test]
    fn open_packet_carries_handshake_json() -> TestResult {
        let handshake = Handshake {
            sid: "abc".into(),
            upgrades: vec!["websocket".into()],
            ping_interval: 25_000,
            ping_timeout: 60_000,
        };
        let packet = Packet::open(&handshake)?;
        assert_eq!(packet.kind(), PacketType::Open);
        assert_eq!(packet.handshake()?, handshake);
        let body = std::str::from_utf8(packet.data())?.to_owned();
        assert!(body.starts_with("{\"sid\":\"abc\""));
        Ok(())
    }
}
