use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::FrameNumber;

/// Message catalog: the `Type` byte of the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    VideoFrame = 0x03,
    TouchEvent = 0x04,
    Heartbeat = 0x05,
    HeartbeatAck = 0x06,
    AudioConfig = 0x07,
    AudioFrame = 0x08,
    ProtocolFeedback = 0x09,
    BitrateControl = 0x0A,
    KeyFrameRequest = 0x0B,
    FecConfig = 0x0C,
    FecShard = 0x0D,
    FecGroupMetadata = 0x0E,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::HandshakeAck),
            0x03 => Ok(Self::VideoFrame),
            0x04 => Ok(Self::TouchEvent),
            0x05 => Ok(Self::Heartbeat),
            0x06 => Ok(Self::HeartbeatAck),
            0x07 => Ok(Self::AudioConfig),
            0x08 => Ok(Self::AudioFrame),
            0x09 => Ok(Self::ProtocolFeedback),
            0x0A => Ok(Self::BitrateControl),
            0x0B => Ok(Self::KeyFrameRequest),
            0x0C => Ok(Self::FecConfig),
            0x0D => Ok(Self::FecShard),
            0x0E => Ok(Self::FecGroupMetadata),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    /// Scheduler class: critical control traffic drains strictly before
    /// media traffic.
    pub fn is_critical(self) -> bool {
        !matches!(
            self,
            Self::VideoFrame | Self::AudioFrame | Self::FecShard | Self::FecGroupMetadata
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Handshake => "Handshake",
            Self::HandshakeAck => "HandshakeAck",
            Self::VideoFrame => "VideoFrame",
            Self::TouchEvent => "TouchEvent",
            Self::Heartbeat => "Heartbeat",
            Self::HeartbeatAck => "HeartbeatAck",
            Self::AudioConfig => "AudioConfig",
            Self::AudioFrame => "AudioFrame",
            Self::ProtocolFeedback => "ProtocolFeedback",
            Self::BitrateControl => "BitrateControl",
            Self::KeyFrameRequest => "KeyFrameRequest",
            Self::FecConfig => "FecConfig",
            Self::FecShard => "FecShard",
            Self::FecGroupMetadata => "FecGroupMetadata",
        }
    }
}

/// Serde adapter: binary payloads nested inside JSON as standard base64.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Sent by the client immediately after the transport (and optional TLS)
/// is established.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Handshake {
    pub device_id: String,
    pub device_name: String,
    pub client_version: String,
    pub screen_width: u32,
    pub screen_height: u32,
    /// Six decimal digits derived from the server certificate, required
    /// when the host enforces pairing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeAck {
    pub accepted: bool,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn default_video_codec() -> String {
    "H264".into()
}

/// One encoded video frame. Binary frame data rides as base64 inside
/// JSON; a known overhead, kept for wire compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VideoFrame {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub is_key_frame: bool,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_video_codec")]
    pub codec: String,
    /// Producer-stamped monotonic frame counter; FEC groups are keyed by
    /// this, not by the wire sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_number: Option<FrameNumber>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TouchAction {
    Down,
    Move,
    Up,
    Cancel,
}

/// Touch input from the device. Coordinates are normalized to the source
/// resolution advertised in the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TouchEvent {
    pub pointer_id: u32,
    pub action: TouchAction,
    pub x: f32,
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Heartbeat {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeartbeatAck {
    pub original_timestamp: u64,
    pub response_timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioCodec {
    Opus,
    Aac,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub codec: AudioCodec,
    pub bitrate_bps: u32,
    pub frame_duration_ms: u32,
}

/// Periodic receiver report driving the sender's ABR loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProtocolFeedback {
    pub rtt_ms: u32,
    pub received_bytes: u64,
    pub interval_ms: u32,
    pub missing_sequence_delta: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BitrateControl {
    pub target_bps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyFrameReason {
    GapDetected,
    FecAbandoned,
    UserRequested,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyFrameRequest {
    pub reason: KeyFrameReason,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FecConfig {
    pub enabled: bool,
    /// Frames per group, 1..=64.
    pub data_shards: u8,
    /// Parity shards per group, 0..=32. Zero disables parity.
    pub parity_shards: u8,
}

/// One parity shard of a FEC group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FecShard {
    pub group_id: u32,
    /// Index in `[0, data_shards + parity_shards)`.
    pub shard_index: u16,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Announces a completed FEC group; sent after the group's video frames
/// and before its parity shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FecGroupMetadata {
    pub group_id: u32,
    pub first_frame_seq: FrameNumber,
    pub data_shards: u8,
    pub parity_shards: u8,
    pub shard_length_bytes: u32,
    /// `[first_frame_seq, first_frame_seq + data_shards)`.
    pub protected_seq_range: [FrameNumber; 2],
}

/// Closed tagged variant over the whole catalog, one handler per variant.
/// `AudioFrame` is the only opaque-bytes payload; everything else is JSON.
#[derive(Debug, Clone)]
pub enum Message {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    VideoFrame(VideoFrame),
    TouchEvent(TouchEvent),
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    AudioConfig(AudioConfig),
    AudioFrame(Vec<u8>),
    ProtocolFeedback(ProtocolFeedback),
    BitrateControl(BitrateControl),
    KeyFrameRequest(KeyFrameRequest),
    FecConfig(FecConfig),
    FecShard(FecShard),
    FecGroupMetadata(FecGroupMetadata),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Handshake(_) => MessageKind::Handshake,
            Self::HandshakeAck(_) => MessageKind::HandshakeAck,
            Self::VideoFrame(_) => MessageKind::VideoFrame,
            Self::TouchEvent(_) => MessageKind::TouchEvent,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
            Self::HeartbeatAck(_) => MessageKind::HeartbeatAck,
            Self::AudioConfig(_) => MessageKind::AudioConfig,
            Self::AudioFrame(_) => MessageKind::AudioFrame,
            Self::ProtocolFeedback(_) => MessageKind::ProtocolFeedback,
            Self::BitrateControl(_) => MessageKind::BitrateControl,
            Self::KeyFrameRequest(_) => MessageKind::KeyFrameRequest,
            Self::FecConfig(_) => MessageKind::FecConfig,
            Self::FecShard(_) => MessageKind::FecShard,
            Self::FecGroupMetadata(_) => MessageKind::FecGroupMetadata,
        }
    }

    /// Serialize the payload bytes for this message (header not included).
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            Self::Handshake(m) => serde_json::to_vec(m)?,
            Self::HandshakeAck(m) => serde_json::to_vec(m)?,
            Self::VideoFrame(m) => serde_json::to_vec(m)?,
            Self::TouchEvent(m) => serde_json::to_vec(m)?,
            Self::Heartbeat(m) => serde_json::to_vec(m)?,
            Self::HeartbeatAck(m) => serde_json::to_vec(m)?,
            Self::AudioConfig(m) => serde_json::to_vec(m)?,
            Self::AudioFrame(bytes) => bytes.clone(),
            Self::ProtocolFeedback(m) => serde_json::to_vec(m)?,
            Self::BitrateControl(m) => serde_json::to_vec(m)?,
            Self::KeyFrameRequest(m) => serde_json::to_vec(m)?,
            Self::FecConfig(m) => serde_json::to_vec(m)?,
            Self::FecShard(m) => serde_json::to_vec(m)?,
            Self::FecGroupMetadata(m) => serde_json::to_vec(m)?,
        };
        Ok(bytes)
    }

    /// Decode a payload for a known catalog kind. Unknown JSON fields are
    /// ignored for forward compatibility.
    pub fn decode(kind: MessageKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match kind {
            MessageKind::Handshake => Self::Handshake(parse(kind, payload)?),
            MessageKind::HandshakeAck => Self::HandshakeAck(parse(kind, payload)?),
            MessageKind::VideoFrame => Self::VideoFrame(parse(kind, payload)?),
            MessageKind::TouchEvent => Self::TouchEvent(parse(kind, payload)?),
            MessageKind::Heartbeat => Self::Heartbeat(parse(kind, payload)?),
            MessageKind::HeartbeatAck => Self::HeartbeatAck(parse(kind, payload)?),
            MessageKind::AudioConfig => Self::AudioConfig(parse(kind, payload)?),
            MessageKind::AudioFrame => Self::AudioFrame(payload.to_vec()),
            MessageKind::ProtocolFeedback => Self::ProtocolFeedback(parse(kind, payload)?),
            MessageKind::BitrateControl => Self::BitrateControl(parse(kind, payload)?),
            MessageKind::KeyFrameRequest => Self::KeyFrameRequest(parse(kind, payload)?),
            MessageKind::FecConfig => Self::FecConfig(parse(kind, payload)?),
            MessageKind::FecShard => Self::FecShard(parse(kind, payload)?),
            MessageKind::FecGroupMetadata => Self::FecGroupMetadata(parse(kind, payload)?),
        })
    }
}

fn parse<T: DeserializeOwned>(kind: MessageKind, payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload)
        .map_err(|source| ProtocolError::MalformedPayload { kind: kind.name(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_roundtrip() {
        for b in 0x01..=0x0E {
            let kind = MessageKind::from_byte(b).unwrap();
            assert_eq!(kind as u8, b);
        }
        assert!(MessageKind::from_byte(0x00).is_err());
        assert!(MessageKind::from_byte(0x0F).is_err());
        assert!(MessageKind::from_byte(0xFF).is_err());
    }

    #[test]
    fn class_split() {
        assert!(MessageKind::Handshake.is_critical());
        assert!(MessageKind::HandshakeAck.is_critical());
        assert!(MessageKind::Heartbeat.is_critical());
        assert!(MessageKind::HeartbeatAck.is_critical());
        assert!(MessageKind::TouchEvent.is_critical());
        assert!(MessageKind::AudioConfig.is_critical());
        assert!(MessageKind::ProtocolFeedback.is_critical());
        assert!(MessageKind::BitrateControl.is_critical());
        assert!(MessageKind::KeyFrameRequest.is_critical());
        assert!(MessageKind::FecConfig.is_critical());

        assert!(!MessageKind::VideoFrame.is_critical());
        assert!(!MessageKind::AudioFrame.is_critical());
        assert!(!MessageKind::FecShard.is_critical());
        assert!(!MessageKind::FecGroupMetadata.is_critical());
    }

    #[test]
    fn handshake_roundtrip_pascal_case() {
        let msg = Handshake {
            device_id: "d1".into(),
            device_name: "Tablet".into(),
            client_version: "0.1.0".into(),
            screen_width: 1920,
            screen_height: 1080,
            pairing_code: Some("012345".into()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["DeviceId"], "d1");
        assert_eq!(json["ScreenWidth"], 1920);
        assert_eq!(json["PairingCode"], "012345");

        let decoded: Handshake = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.device_id, "d1");
        assert_eq!(decoded.pairing_code.as_deref(), Some("012345"));
    }

    #[test]
    fn handshake_pairing_code_optional() {
        let decoded: Handshake = serde_json::from_str(
            r#"{"DeviceId":"d","DeviceName":"n","ClientVersion":"1","ScreenWidth":1,"ScreenHeight":1}"#,
        )
        .unwrap();
        assert!(decoded.pairing_code.is_none());
    }

    #[test]
    fn unknown_fields_ignored() {
        let decoded: Heartbeat =
            serde_json::from_str(r#"{"Timestamp":5,"FutureField":"yes"}"#).unwrap();
        assert_eq!(decoded.timestamp, 5);
    }

    #[test]
    fn video_frame_base64_roundtrip() {
        let msg = VideoFrame {
            data: vec![0x00, 0x01, 0xFF, 0xFE],
            is_key_frame: true,
            width: 1280,
            height: 720,
            codec: default_video_codec(),
            frame_number: Some(7),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["Data"], "AAH//g==");
        assert_eq!(json["IsKeyFrame"], true);
        assert_eq!(json["FrameNumber"], 7);

        let decoded: VideoFrame = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.data, vec![0x00, 0x01, 0xFF, 0xFE]);
        assert_eq!(decoded.frame_number, Some(7));
    }

    #[test]
    fn video_frame_codec_defaults_to_h264() {
        let decoded: VideoFrame = serde_json::from_str(
            r#"{"Data":"","IsKeyFrame":false,"Width":1,"Height":1}"#,
        )
        .unwrap();
        assert_eq!(decoded.codec, "H264");
        assert!(decoded.frame_number.is_none());
    }

    #[test]
    fn touch_action_strings() {
        let msg = TouchEvent {
            pointer_id: 3,
            action: TouchAction::Move,
            x: 0.5,
            y: 0.25,
            pressure: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["Action"], "Move");
        assert!(json.get("Pressure").is_none());
    }

    #[test]
    fn heartbeat_ack_roundtrip() {
        let msg = HeartbeatAck { original_timestamp: 1000, response_timestamp: 1020 };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: HeartbeatAck = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.original_timestamp, 1000);
        assert_eq!(decoded.response_timestamp, 1020);
    }

    #[test]
    fn key_frame_reason_strings() {
        let json = serde_json::to_value(KeyFrameRequest { reason: KeyFrameReason::FecAbandoned })
            .unwrap();
        assert_eq!(json["Reason"], "FecAbandoned");
    }

    #[test]
    fn fec_metadata_roundtrip() {
        let msg = FecGroupMetadata {
            group_id: 9,
            first_frame_seq: 27,
            data_shards: 3,
            parity_shards: 2,
            shard_length_bytes: 104,
            protected_seq_range: [27, 30],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["GroupId"], 9);
        assert_eq!(json["ProtectedSeqRange"][1], 30);

        let decoded: FecGroupMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.protected_seq_range, [27, 30]);
    }

    #[test]
    fn message_dispatch_roundtrip() {
        let original = Message::BitrateControl(BitrateControl { target_bps: 3_500_000 });
        let payload = original.encode_payload().unwrap();
        let decoded = Message::decode(MessageKind::BitrateControl, &payload).unwrap();
        match decoded {
            Message::BitrateControl(m) => assert_eq!(m.target_bps, 3_500_000),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn audio_frame_is_opaque() {
        let original = Message::AudioFrame(vec![1, 2, 3]);
        let payload = original.encode_payload().unwrap();
        // Raw bytes, not JSON.
        assert_eq!(payload, vec![1, 2, 3]);
        match Message::decode(MessageKind::AudioFrame, &payload).unwrap() {
            Message::AudioFrame(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn malformed_payload_names_kind() {
        let err = Message::decode(MessageKind::Heartbeat, b"not json").unwrap_err();
        assert!(err.to_string().contains("Heartbeat"));
    }
}
