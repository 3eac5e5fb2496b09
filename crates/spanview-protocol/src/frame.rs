use bytes::{Buf, Bytes, BytesMut};

use crate::error::FramingError;
use crate::types::SequenceNumber;

/// Frame magic, "EXPS" big-endian.
pub const MAGIC: u32 = 0x4558_5053;

/// Current protocol version byte. Readers reject anything else.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 24;

/// Default payload cap: 10 MiB.
pub const DEFAULT_MAX_PAYLOAD: u32 = 10 * 1024 * 1024;

/// The fixed 24-byte message header, big-endian on the wire:
///
/// ```text
/// [magic: u32] [type: u8] [version: u8] [reserved: u16]
/// [timestamp_ms: u64] [payload_len: u32] [sequence: u32]
/// ```
///
/// `kind` is kept as the raw catalog byte so that frames with an unknown
/// type still decode; the dispatcher logs and drops those without killing
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub version: u8,
    /// Media presentation time for media messages, wall-clock send time
    /// for control messages. Milliseconds since the Unix epoch, UTC.
    pub timestamp_ms: u64,
    pub payload_len: u32,
    pub sequence: SequenceNumber,
}

/// A decoded frame: header plus payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Serialize one message frame: header, then the payload verbatim.
pub fn encode_frame(kind: u8, timestamp_ms: u64, sequence: SequenceNumber, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.push(kind);
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&timestamp_ms.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Incremental frame reader with per-connection sequence enforcement.
///
/// Feed it a `BytesMut` that accumulates socket reads; each
/// [`FrameDecoder::try_decode`] call extracts at most one complete frame
/// and advances the buffer past it.
#[derive(Debug)]
pub struct FrameDecoder {
    max_payload: u32,
    last_sequence: Option<SequenceNumber>,
}

impl FrameDecoder {
    pub fn new(max_payload: u32) -> Self {
        Self { max_payload, last_sequence: None }
    }

    /// Attempt to extract one complete frame.
    ///
    /// Returns `Ok(Some(frame))` when a full frame was consumed,
    /// `Ok(None)` when more bytes are needed. Header validation (magic,
    /// version, payload cap, sequence monotonicity) happens as soon as the
    /// 24 header bytes are available, so a poisoned stream fails before
    /// its payload arrives.
    pub fn try_decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FramingError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = parse_header(&buf[..HEADER_LEN])?;

        if header.payload_len > self.max_payload {
            return Err(FramingError::TooLarge { length: header.payload_len, cap: self.max_payload });
        }
        if let Some(last) = self.last_sequence {
            // Strictly increasing, no wrap: u32::MAX is an acknowledged
            // session-lifetime limit, not a wrap point.
            if header.sequence <= last {
                return Err(FramingError::OutOfOrder { sequence: header.sequence, last });
            }
        }

        let total = HEADER_LEN + header.payload_len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(header.payload_len as usize).freeze();
        self.last_sequence = Some(header.sequence);

        Ok(Some(Frame { header, payload }))
    }

    /// Called when the peer closed the stream. A non-empty buffer means
    /// the stream died mid-frame.
    pub fn finish(&self, buf: &BytesMut) -> Result<(), FramingError> {
        if buf.is_empty() {
            Ok(())
        } else {
            Err(FramingError::Eof)
        }
    }

    /// Highest sequence number observed so far.
    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.last_sequence
    }
}

fn parse_header(bytes: &[u8]) -> Result<FrameHeader, FramingError> {
    debug_assert!(bytes.len() >= HEADER_LEN);

    let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != MAGIC {
        return Err(FramingError::BadMagic(magic));
    }

    let kind = bytes[4];
    let version = bytes[5];
    if version != PROTOCOL_VERSION {
        return Err(FramingError::UnsupportedVersion(version));
    }
    // bytes[6..8] reserved, ignored on read

    let timestamp_ms = u64::from_be_bytes([
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    ]);
    let payload_len = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let sequence = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);

    Ok(FrameHeader { kind, version, timestamp_ms, payload_len, sequence })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(decoder: &mut FrameDecoder, encoded: &[u8]) -> Result<Option<Frame>, FramingError> {
        let mut buf = BytesMut::from(encoded);
        decoder.try_decode(&mut buf)
    }

    #[test]
    fn roundtrip() {
        let payload = b"{\"Timestamp\":1000}";
        let encoded = encode_frame(0x05, 1000, 1, payload);
        assert_eq!(encoded.len(), HEADER_LEN + payload.len());

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let frame = decode_one(&mut decoder, &encoded).unwrap().unwrap();
        assert_eq!(frame.header.kind, 0x05);
        assert_eq!(frame.header.version, PROTOCOL_VERSION);
        assert_eq!(frame.header.timestamp_ms, 1000);
        assert_eq!(frame.header.sequence, 1);
        assert_eq!(frame.header.payload_len as usize, payload.len());
        assert_eq!(&frame.payload[..], payload);
    }

    #[test]
    fn partial_header_needs_more() {
        let encoded = encode_frame(0x05, 0, 1, b"x");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let mut buf = BytesMut::from(&encoded[..HEADER_LEN - 1]);
        assert!(decoder.try_decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_payload_needs_more() {
        let encoded = encode_frame(0x03, 0, 1, &[0u8; 100]);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let mut buf = BytesMut::from(&encoded[..HEADER_LEN + 50]);
        assert!(decoder.try_decode(&mut buf).unwrap().is_none());

        // Completing the buffer yields the frame.
        buf.extend_from_slice(&encoded[HEADER_LEN + 50..]);
        let frame = decoder.try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.payload_len, 100);
        assert!(buf.is_empty());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut encoded = encode_frame(0x05, 0, 1, b"");
        encoded[0] = 0x00;
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        assert!(matches!(decode_one(&mut decoder, &encoded), Err(FramingError::BadMagic(_))));
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut encoded = encode_frame(0x05, 0, 1, b"");
        encoded[5] = 0x02;
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        assert!(matches!(
            decode_one(&mut decoder, &encoded),
            Err(FramingError::UnsupportedVersion(0x02))
        ));
    }

    #[test]
    fn empty_payload_accepted() {
        let encoded = encode_frame(0x0B, 0, 1, b"");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let frame = decode_one(&mut decoder, &encoded).unwrap().unwrap();
        assert_eq!(frame.header.payload_len, 0);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn payload_at_cap_accepted() {
        let cap = 64u32;
        let encoded = encode_frame(0x03, 0, 1, &vec![0u8; cap as usize]);
        let mut decoder = FrameDecoder::new(cap);
        assert!(decode_one(&mut decoder, &encoded).unwrap().is_some());
    }

    #[test]
    fn payload_over_cap_rejected() {
        let cap = 64u32;
        let encoded = encode_frame(0x03, 0, 1, &vec![0u8; cap as usize + 1]);
        let mut decoder = FrameDecoder::new(cap);
        assert!(matches!(
            decode_one(&mut decoder, &encoded),
            Err(FramingError::TooLarge { length: 65, cap: 64 })
        ));
    }

    #[test]
    fn over_cap_fails_before_payload_arrives() {
        let cap = 64u32;
        let encoded = encode_frame(0x03, 0, 1, &vec![0u8; 128]);
        let mut decoder = FrameDecoder::new(cap);
        // Header only; the oversized length is already fatal.
        let mut buf = BytesMut::from(&encoded[..HEADER_LEN]);
        assert!(matches!(decoder.try_decode(&mut buf), Err(FramingError::TooLarge { .. })));
    }

    #[test]
    fn sequence_must_strictly_increase() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(0x05, 0, 43, b""));
        buf.extend_from_slice(&encode_frame(0x05, 0, 42, b""));

        assert_eq!(decoder.try_decode(&mut buf).unwrap().unwrap().header.sequence, 43);
        assert!(matches!(
            decoder.try_decode(&mut buf),
            Err(FramingError::OutOfOrder { sequence: 42, last: 43 })
        ));
    }

    #[test]
    fn equal_sequence_rejected() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(0x05, 0, 7, b""));
        buf.extend_from_slice(&encode_frame(0x05, 0, 7, b""));

        assert!(decoder.try_decode(&mut buf).unwrap().is_some());
        assert!(matches!(decoder.try_decode(&mut buf), Err(FramingError::OutOfOrder { .. })));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(0x05, 10, 1, b"a"));
        buf.extend_from_slice(&encode_frame(0x06, 20, 2, b"bc"));

        let first = decoder.try_decode(&mut buf).unwrap().unwrap();
        let second = decoder.try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"a");
        assert_eq!(&second.payload[..], b"bc");
        assert!(buf.is_empty());
        assert!(decoder.try_decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_kind_still_decodes() {
        // Unknown catalog bytes are a dispatch concern, not a framing error.
        let encoded = encode_frame(0x7F, 0, 1, b"??");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let frame = decode_one(&mut decoder, &encoded).unwrap().unwrap();
        assert_eq!(frame.header.kind, 0x7F);
    }

    #[test]
    fn finish_mid_frame_is_eof() {
        let encoded = encode_frame(0x03, 0, 1, &[0u8; 100]);
        let decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let buf = BytesMut::from(&encoded[..HEADER_LEN + 10]);
        assert!(matches!(decoder.finish(&buf), Err(FramingError::Eof)));

        let empty = BytesMut::new();
        assert!(decoder.finish(&empty).is_ok());
    }
}
