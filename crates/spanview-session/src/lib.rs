//! The spanview session layer: framed TCP (optionally TLS) sessions with
//! handshake, heartbeat/RTT, prioritized send scheduling, adaptive
//! bitrate, FEC over video frames, and UDP LAN discovery.

pub mod abr;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod limiter;
pub mod scheduler;
pub mod session;
pub mod tls;
pub mod transport;
pub mod trust;

pub use client::{ClientIdentity, SessionClient};
pub use config::{FecSettings, SchedulerConfig, SessionConfig};
pub use error::{
    DiscoveryError, HandshakeError, SchedulerError, SessionError, TlsError, TransportError,
};
pub use host::{accept_session, AcceptedSession};
pub use session::{
    DiagnosticsSnapshot, ReceivedFrame, Role, SessionEvent, SessionHandle, SessionState,
};
