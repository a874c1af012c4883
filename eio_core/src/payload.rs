//! Batch framing for the polling transport.
//!
//! A payload is the concatenation, per packet, of an ASCII decimal length,
//! a `:`, and the packet's encoded form. The length counts UTF-8 code
//! points for text packets and bytes for base64 packets; base64 bodies are
//! pure ASCII, so the decoder walks code points uniformly.

use crate::error::{PacketError, PayloadError};
use crate::packet::Packet;

/// Encode an ordered batch of packets.
///
/// # Errors
///
/// Fails on an empty batch, or when a text packet's body is not UTF-8.
pub fn encode(packets: &[Packet]) -> Result<Vec<u8>, PayloadError> {
    if packets.is_empty() {
        return Err(PayloadError::EmptyBatch);
    }
    let mut out = Vec::new();
    for packet in packets {
        let (body, length) = if packet.is_binary() {
            let body = packet.encode_base64();
            let length = body.len();
            (body, length)
        } else {
            let body = packet.encode_string()?;
            let length = std::str::from_utf8(&body)
                .map_err(PacketError::from)?
                .chars()
                .count();
            (body, length)
        };
        out.extend_from_slice(length.to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(&body);
    }
    Ok(out)
}

/// Decode a payload into its packets, in order.
///
/// # Errors
///
/// Fails on a non-UTF-8 stream, a malformed or unterminated length
/// prefix, input ending inside a packet, or a packet that does not decode.
pub fn decode(input: &[u8]) -> Result<Vec<Packet>, PayloadError> {
    let mut rest = std::str::from_utf8(input).map_err(PacketError::from)?;
    let mut packets = Vec::new();
    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or(PayloadError::UnterminatedLength)?;
        let (prefix, tail) = rest.split_at(colon);
        let length: usize = prefix
            .parse()
            .map_err(|_| PayloadError::BadLength(prefix.to_owned()))?;
        let tail = &tail[1..];

        let mut end = if length == 0 { Some(0) } else { None };
        let mut seen = 0usize;
        if end.is_none() {
            for (idx, ch) in tail.char_indices() {
                seen += 1;
                if seen == length {
                    end = Some(idx + ch.len_utf8());
                    break;
                }
            }
        }
        let end = end.ok_or(PayloadError::Truncated { expected: length })?;

        let (body, after) = tail.split_at(end);
        packets.push(Packet::decode(body.as_bytes())?);
        rest = after;
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use testresult::TestResult;

    #[test]
    fn empty_ping_encodes_as_length_one_unit() -> TestResult {
        let encoded = encode(&[Packet::new(PacketType::Ping, "", false)])?;
        assert_eq!(encoded, b"1:2");
        Ok(())
    }

    #[test]
    fn roundtrip_mixed_batch() -> TestResult {
        let batch = vec![
            Packet::message("hello"),
            Packet::message_binary(&b"hello"[..]),
            Packet::noop(),
            Packet::message("snowman \u{2603}"),
        ];
        let encoded = encode(&batch)?;
        assert_eq!(decode(&encoded)?, batch);
        Ok(())
    }

    #[test]
    fn text_length_counts_code_points_not_bytes() -> TestResult {
        // U+1F600 is one code point but four UTF-8 bytes.
        let packet = Packet::message("\u{1F600}");
        let encoded = encode(std::slice::from_ref(&packet))?;
        assert_eq!(&encoded[..2], b"2:");
        assert_eq!(decode(&encoded)?, vec![packet]);
        Ok(())
    }

    #[test]
    fn binary_length_counts_bytes() -> TestResult {
        let packet = Packet::message_binary("\u{1F600}".as_bytes().to_vec());
        let encoded = encode(std::slice::from_ref(&packet))?;
        // body is b, digit, then base64 of four bytes: ten bytes total
        assert_eq!(&encoded[..3], b"10:");
        assert_eq!(decode(&encoded)?, vec![packet]);
        Ok(())
    }

    #[test]
    fn binary_unit_decodes_with_flag_set() -> TestResult {
        let packets = decode(b"10:b4aGVsbG8=")?;
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind(), PacketType::Message);
        assert_eq!(packets[0].data(), b"hello");
        assert!(packets[0].is_binary());
        Ok(())
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(encode(&[]), Err(PayloadError::EmptyBatch)));
    }

    #[test]
    fn empty_input_decodes_to_no_packets() -> TestResult {
        assert!(decode(b"")?.is_empty());
        Ok(())
    }

    #[test]
    fn unterminated_length_is_rejected() {
        assert!(matches!(
            decode(b"12"),
            Err(PayloadError::UnterminatedLength)
        ));
    }

    #[test]
    fn non_decimal_length_is_rejected() {
        assert!(matches!(decode(b"x:4hi"), Err(PayloadError::BadLength(_))));
    }

    #[test]
    fn truncated_packet_is_rejected() {
        assert!(matches!(
            decode(b"6:4hi"),
            Err(PayloadError::Truncated { expected: 6 })
        ));
    }
}
