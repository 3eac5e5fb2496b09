use thiserror::Error;

/// Errors raised by the frame codec. Every variant is fatal to the session
/// that observed it; callers must not attempt partial recovery.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("bad magic: expected 0x45585053, got 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported protocol version 0x{0:02x}")]
    UnsupportedVersion(u8),

    #[error("payload too large: {length} bytes (cap {cap})")]
    TooLarge { length: u32, cap: u32 },

    #[error("sequence regression: got {sequence} after {last}")]
    OutOfOrder { sequence: u32, last: u32 },

    #[error("stream ended mid-frame")]
    Eof,
}

/// Errors raised while encoding or decoding message payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_magic_display() {
        let e = FramingError::BadMagic(0xDEADBEEF);
        assert!(e.to_string().contains("0xdeadbeef"));
    }

    #[test]
    fn too_large_display() {
        let e = FramingError::TooLarge { length: 10_485_761, cap: 10_485_760 };
        let msg = e.to_string();
        assert!(msg.contains("10485761"));
        assert!(msg.contains("10485760"));
    }

    #[test]
    fn out_of_order_display() {
        let e = FramingError::OutOfOrder { sequence: 42, last: 43 };
        let msg = e.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("43"));
    }

    #[test]
    fn unknown_message_type_display() {
        let e = ProtocolError::UnknownMessageType(0xAB);
        assert!(e.to_string().contains("0xab"));
    }
}
