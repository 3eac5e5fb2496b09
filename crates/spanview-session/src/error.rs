use thiserror::Error;

use spanview_protocol::error::{FramingError, ProtocolError};

/// Transport-level failures. All fatal to the running session; WiFi
/// sessions may schedule a reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake failures. Fatal; `Rejected` additionally disables
/// auto-reconnect (the caller must act, e.g. re-enter a pairing code).
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("handshake timed out")]
    Timeout,

    #[error("malformed handshake ack: {0}")]
    MalformedAck(String),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate fingerprint changed for {host}: pinned {pinned}, got {presented}")]
    FingerprintMismatch {
        host: String,
        pinned: String,
        presented: String,
    },

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(#[source] std::io::Error),

    #[error("certificate error: {0}")]
    Certificate(String),
}

/// Raised by the send scheduler. Media drops are not errors (they are
/// counted in diagnostics); losing a handshake message is.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("handshake message dropped under queue pressure")]
    HandshakeDropped,

    #[error("scheduler closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] ProtocolError),
}

/// The single error type a session surfaces. The first error a worker
/// task observes wins and initiates teardown.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no peer traffic within the heartbeat timeout")]
    HeartbeatTimeout,
}

impl SessionError {
    /// Whether a WiFi client may schedule an automatic reconnect after
    /// this error. Handshake rejection requires explicit user action.
    pub fn allows_reconnect(&self) -> bool {
        match self {
            Self::Handshake(HandshakeError::Rejected(_)) => false,
            Self::Tls(TlsError::FingerprintMismatch { .. }) => false,
            _ => true,
        }
    }
}
