//! Host role: take an accepted (and possibly TLS-wrapped) connection
//! through the handshake and hand back a running server-side session.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use spanview_protocol::frame::FrameDecoder;
use spanview_protocol::messages::{Handshake, HandshakeAck, Message, MessageKind};

use crate::config::SessionConfig;
use crate::error::{HandshakeError, SessionError};
use crate::session::{
    read_one_frame, spawn_session, write_one_frame, Role, SessionEvent, SessionHandle,
    SessionParams, SessionState,
};
use crate::tls::pairing_code_matches;
use crate::transport::SessionStream;

/// A client session accepted by the host.
pub struct AcceptedSession {
    pub handle: SessionHandle,
    /// What the device said about itself (name, resolution, version).
    pub handshake: Handshake,
}

/// Run the server side of the handshake on a fresh connection and spawn
/// the session. `expected_pairing_code` is `Some` when the host enforces
/// pairing; comparison is constant-time.
pub async fn accept_session(
    mut stream: SessionStream,
    config: SessionConfig,
    expected_pairing_code: Option<String>,
    events: mpsc::Sender<SessionEvent>,
) -> Result<AcceptedSession, SessionError> {
    let (state_tx, _) = watch::channel(SessionState::Handshaking);
    let state_tx = Arc::new(state_tx);

    let mut decoder = FrameDecoder::new(config.max_payload_bytes);
    let mut buf = BytesMut::with_capacity(4096);

    let frame = tokio::time::timeout(
        Duration::from_millis(config.handshake_timeout_ms),
        read_one_frame(&mut stream, &mut decoder, &mut buf),
    )
    .await
    .map_err(|_| HandshakeError::Timeout)??;

    let handshake = match MessageKind::from_byte(frame.header.kind) {
        Ok(MessageKind::Handshake) => {
            match Message::decode(MessageKind::Handshake, &frame.payload) {
                Ok(Message::Handshake(handshake)) => handshake,
                Ok(_) | Err(_) => {
                    return reject(&mut stream, "malformed handshake payload").await;
                }
            }
        }
        _ => {
            warn!(kind = frame.header.kind, "first message was not a handshake");
            return reject(&mut stream, "expected a handshake").await;
        }
    };

    if let Some(expected) = &expected_pairing_code {
        let presented = handshake.pairing_code.as_deref().unwrap_or("");
        if !pairing_code_matches(expected, presented) {
            warn!(device_id = %handshake.device_id, "pairing code mismatch");
            return reject(&mut stream, "invalid pairing code").await;
        }
    }

    let session_id = format!("s-{}", uuid::Uuid::new_v4().simple());
    let ack = HandshakeAck {
        accepted: true,
        session_id: session_id.clone(),
        error_message: None,
    };
    write_one_frame(&mut stream, &Message::HandshakeAck(ack), 1).await?;

    info!(
        session_id = %session_id,
        device_id = %handshake.device_id,
        device_name = %handshake.device_name,
        client_version = %handshake.client_version,
        screen = %format!("{}x{}", handshake.screen_width, handshake.screen_height),
        "client session accepted"
    );

    let handle = spawn_session(SessionParams {
        stream,
        decoder,
        leftover: buf,
        next_sequence: 2,
        role: Role::Host,
        session_id,
        config,
        events,
        state_tx,
    });
    Ok(AcceptedSession { handle, handshake })
}

async fn reject(stream: &mut SessionStream, reason: &str) -> Result<AcceptedSession, SessionError> {
    let ack = HandshakeAck {
        accepted: false,
        session_id: String::new(),
        error_message: Some(reason.to_string()),
    };
    // Best effort; the connection is going away either way.
    let _ = write_one_frame(stream, &Message::HandshakeAck(ack), 1).await;
    Err(HandshakeError::Rejected(reason.to_string()).into())
}
