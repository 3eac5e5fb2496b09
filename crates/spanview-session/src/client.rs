//! Client role: connect over USB (forwarded loopback TCP) or WiFi
//! (optionally TLS with fingerprint pinning), perform the handshake, and
//! optionally keep the session alive with exponential-backoff reconnects.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use spanview_protocol::frame::FrameDecoder;
use spanview_protocol::messages::{Handshake, HandshakeAck, Message, MessageKind};
use spanview_protocol::types::APP_VERSION;

use crate::config::SessionConfig;
use crate::error::{HandshakeError, SessionError, TlsError};
use crate::session::{
    read_one_frame, spawn_session, write_one_frame, Role, SessionEvent, SessionHandle,
    SessionParams, SessionState,
};
use crate::transport::{connect_tcp, SessionStream};
use crate::trust::TrustStore;

/// Reconnect backoff schedule, capped at ten seconds.
const RECONNECT_DELAYS_MS: [u64; 5] = [500, 1_000, 2_000, 4_000, 8_000];
const RECONNECT_CAP_MS: u64 = 10_000;

/// What the client advertises about itself in the handshake.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub device_id: String,
    pub device_name: String,
    pub screen_width: u32,
    pub screen_height: u32,
}

/// Factory for client-role sessions. Owns the trust store and the state
/// observable, which persists across reconnects.
pub struct SessionClient {
    config: SessionConfig,
    identity: ClientIdentity,
    trust: Arc<TrustStore>,
    events: mpsc::Sender<SessionEvent>,
    state_tx: Arc<watch::Sender<SessionState>>,
}

impl SessionClient {
    pub fn new(
        config: SessionConfig,
        identity: ClientIdentity,
        trust: Arc<TrustStore>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self { config, identity, trust, events, state_tx: Arc::new(state_tx) }
    }

    /// Observe `Disconnected | Connecting | Handshaking | Connected |
    /// Reconnecting` across the client's whole lifetime.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    /// Connect over a USB-forwarded port: plain TCP to loopback. Once the
    /// port is forwarded, USB is an ordinary TCP socket.
    pub async fn connect_usb(&self, port: u16) -> Result<SessionHandle, SessionError> {
        self.connect_inner("127.0.0.1", port, false, None).await
    }

    /// Connect over WiFi, wrapping the stream in TLS when the session
    /// config enables it.
    pub async fn connect_wifi(
        &self,
        host: &str,
        port: u16,
        pairing_code: Option<String>,
    ) -> Result<SessionHandle, SessionError> {
        self.connect_inner(host, port, self.config.tls_enabled, pairing_code).await
    }

    async fn connect_inner(
        &self,
        host: &str,
        port: u16,
        tls: bool,
        pairing_code: Option<String>,
    ) -> Result<SessionHandle, SessionError> {
        let result = self.try_connect(host, port, tls, pairing_code).await;
        if let Err(e) = &result {
            warn!(host, port, "connect failed: {e}");
            self.state_tx.send_replace(SessionState::Disconnected);
        }
        result
    }

    async fn try_connect(
        &self,
        host: &str,
        port: u16,
        tls: bool,
        pairing_code: Option<String>,
    ) -> Result<SessionHandle, SessionError> {
        self.state_tx.send_replace(SessionState::Connecting);
        let tcp = connect_tcp(host, port, Duration::from_millis(self.config.connect_timeout_ms))
            .await?;

        let mut stream = if tls {
            let host_key = format!("{host}:{port}");
            let (tls_config, mismatch) =
                crate::tls::client_config(self.trust.clone(), host_key);
            let connector = TlsConnector::from(tls_config);
            let server_name = server_name_for(host)?;
            match connector.connect(server_name, tcp).await {
                Ok(tls_stream) => SessionStream::ClientTls(Box::new(tls_stream)),
                Err(e) => {
                    // A pin violation surfaces as a generic TLS error;
                    // recover the specific cause recorded by the verifier.
                    let recorded =
                        mismatch.lock().unwrap_or_else(|p| p.into_inner()).take();
                    return Err(match recorded {
                        Some(err) => err.into(),
                        None => TlsError::HandshakeFailed(e).into(),
                    });
                }
            }
        } else {
            SessionStream::Plain(tcp)
        };

        self.state_tx.send_replace(SessionState::Handshaking);
        let handshake = Handshake {
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.device_name.clone(),
            client_version: APP_VERSION.to_string(),
            screen_width: self.identity.screen_width,
            screen_height: self.identity.screen_height,
            pairing_code,
        };
        write_one_frame(&mut stream, &Message::Handshake(handshake), 1).await?;

        let mut decoder = FrameDecoder::new(self.config.max_payload_bytes);
        let mut buf = BytesMut::with_capacity(4096);
        let frame = tokio::time::timeout(
            Duration::from_millis(self.config.handshake_timeout_ms),
            read_one_frame(&mut stream, &mut decoder, &mut buf),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)??;

        if !matches!(MessageKind::from_byte(frame.header.kind), Ok(MessageKind::HandshakeAck)) {
            return Err(HandshakeError::MalformedAck(format!(
                "expected HandshakeAck, got type 0x{:02x}",
                frame.header.kind
            ))
            .into());
        }
        let ack: HandshakeAck = match Message::decode(MessageKind::HandshakeAck, &frame.payload) {
            Ok(Message::HandshakeAck(ack)) => ack,
            Ok(_) | Err(_) => {
                return Err(HandshakeError::MalformedAck("undecodable payload".into()).into());
            }
        };
        if !ack.accepted {
            let reason = ack.error_message.unwrap_or_else(|| "rejected by host".into());
            return Err(HandshakeError::Rejected(reason).into());
        }

        info!(session_id = %ack.session_id, host, port, "session established");
        Ok(spawn_session(SessionParams {
            stream,
            decoder,
            leftover: buf,
            next_sequence: 2,
            role: Role::Client,
            session_id: ack.session_id,
            config: self.config.clone(),
            events: self.events.clone(),
            state_tx: self.state_tx.clone(),
        }))
    }

    /// Keep a WiFi session alive: connect, run until it dies, and retry
    /// with exponential backoff (500 ms → 8 s, capped at 10 s). Stops on
    /// `cancel` (explicit user disconnect), on a handshake rejection, on a
    /// pin violation, or when auto-reconnect is disabled.
    pub async fn run_with_reconnect(
        &self,
        host: &str,
        port: u16,
        pairing_code: Option<String>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                self.state_tx.send_replace(SessionState::Disconnected);
                return Ok(());
            }

            match self.connect_wifi(host, port, pairing_code.clone()).await {
                Ok(handle) => {
                    attempt = 0;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            handle.disconnect().await;
                            return Ok(());
                        }
                        _ = handle.closed() => {}
                    }
                    let error = handle.take_error();
                    handle.join().await;
                    match error {
                        Some(e) if !e.allows_reconnect() || !self.config.auto_reconnect => {
                            self.state_tx.send_replace(SessionState::Disconnected);
                            return Err(e);
                        }
                        Some(e) => {
                            info!("session lost ({e}), scheduling reconnect");
                        }
                        None => {
                            // Closed without an error: disconnected elsewhere.
                            self.state_tx.send_replace(SessionState::Disconnected);
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    if !e.allows_reconnect() || !self.config.auto_reconnect {
                        self.state_tx.send_replace(SessionState::Disconnected);
                        return Err(e);
                    }
                }
            }

            let delay = RECONNECT_DELAYS_MS
                .get(attempt)
                .copied()
                .unwrap_or(RECONNECT_CAP_MS)
                .min(RECONNECT_CAP_MS);
            attempt = attempt.saturating_add(1);
            self.state_tx.send_replace(SessionState::Reconnecting { next_delay_ms: delay });
            info!(delay_ms = delay, "reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.state_tx.send_replace(SessionState::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
    }
}

fn server_name_for(host: &str) -> Result<rustls::pki_types::ServerName<'static>, SessionError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        Ok(rustls::pki_types::ServerName::IpAddress(ip.into()))
    } else {
        rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| TlsError::Certificate(format!("invalid server name '{host}': {e}")).into())
    }
}
