use serde::{Deserialize, Serialize};

/// Per-connection, per-direction message sequence number. Strictly
/// increasing across every message an endpoint emits; a regression is a
/// fatal framing error.
pub type SequenceNumber = u32;

/// Monotonic counter the frame producer stamps on every encoded video
/// frame. FEC group membership is defined over frame numbers (wire
/// sequence numbers interleave control traffic and cannot be contiguous).
pub type FrameNumber = u32;

/// Identifier of a FEC group.
pub type GroupId = u32;

/// Default TCP port for session listeners.
pub const DEFAULT_TCP_PORT: u16 = 15555;

/// Default UDP port for discovery.
pub const DEFAULT_UDP_PORT: u16 = 15556;

/// Application version, read from Cargo.toml at compile time.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An encoded video frame as produced by the (external) encoder, before
/// it is wrapped into a `VideoFrame` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub is_key_frame: bool,
    pub width: u32,
    pub height: u32,
    /// Media presentation time in milliseconds since the Unix epoch,
    /// carried in the frame header `Timestamp` field.
    pub timestamp_ms: u64,
}
