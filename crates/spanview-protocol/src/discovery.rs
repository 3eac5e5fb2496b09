use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Discovery protocol version; bumped independently of the session
/// protocol version byte.
pub const DISCOVERY_PROTOCOL_VERSION: u32 = 1;

/// One UDP discovery datagram: UTF-8 JSON, no framing, discriminated by
/// the `MessageType` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "MessageType", rename_all_fields = "PascalCase")]
pub enum DiscoveryMessage {
    DiscoveryRequest {
        /// Opaque correlation id, echoed in every response.
        request_id: String,
        discovery_protocol_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_device_name: Option<String>,
    },
    DiscoveryResponse {
        request_id: String,
        discovery_protocol_version: u32,
        server_id: String,
        server_name: String,
        tcp_port: u16,
        /// Always false; kept for wire compatibility.
        web_socket_supported: bool,
        server_version: String,
    },
}

impl DiscoveryMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a datagram. Returns `None` for anything that is not a valid
    /// discovery message; responders and browsers drop those silently.
    pub fn decode(datagram: &[u8]) -> Option<Self> {
        serde_json::from_slice(datagram).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let msg = DiscoveryMessage::DiscoveryRequest {
            request_id: "R".into(),
            discovery_protocol_version: DISCOVERY_PROTOCOL_VERSION,
            client_device_id: Some("d1".into()),
            client_device_name: None,
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["MessageType"], "DiscoveryRequest");
        assert_eq!(json["RequestId"], "R");
        assert_eq!(json["DiscoveryProtocolVersion"], 1);
        assert_eq!(json["ClientDeviceId"], "d1");
        assert!(json.get("ClientDeviceName").is_none());
    }

    #[test]
    fn response_wire_shape() {
        let msg = DiscoveryMessage::DiscoveryResponse {
            request_id: "R".into(),
            discovery_protocol_version: DISCOVERY_PROTOCOL_VERSION,
            server_id: "PC1".into(),
            server_name: "Office PC".into(),
            tcp_port: 15555,
            web_socket_supported: false,
            server_version: "0.1.0".into(),
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["MessageType"], "DiscoveryResponse");
        assert_eq!(json["ServerId"], "PC1");
        assert_eq!(json["TcpPort"], 15555);
        assert_eq!(json["WebSocketSupported"], false);
    }

    #[test]
    fn roundtrip() {
        let msg = DiscoveryMessage::DiscoveryRequest {
            request_id: "abc".into(),
            discovery_protocol_version: 1,
            client_device_id: None,
            client_device_name: Some("Tablet".into()),
        };
        let decoded = DiscoveryMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            DiscoveryMessage::DiscoveryRequest { request_id, client_device_name, .. } => {
                assert_eq!(request_id, "abc");
                assert_eq!(client_device_name.as_deref(), Some("Tablet"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn garbage_rejected() {
        assert!(DiscoveryMessage::decode(b"not json").is_none());
        assert!(DiscoveryMessage::decode(b"{\"MessageType\":\"Other\"}").is_none());
        assert!(DiscoveryMessage::decode(b"{}").is_none());
    }
}
