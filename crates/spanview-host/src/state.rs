use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use spanview_protocol::types::EncodedFrame;
use spanview_session::{DiagnosticsSnapshot, SessionHandle};

/// Commands for the external encoder pipeline (capture and encoding live
/// outside this binary; they drain this channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderCommand {
    /// A receiver needs a key frame to resynchronize.
    KeyFrame,
    /// The ABR loop picked a new target bitrate.
    TargetBitrate(u32),
}

/// Shared host state: the live client sessions, keyed by session id.
pub struct HostState {
    pub server_id: String,
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl HostState {
    pub fn new() -> Self {
        Self { server_id: uuid::Uuid::new_v4().to_string(), sessions: DashMap::new() }
    }

    pub fn register(&self, handle: Arc<SessionHandle>) {
        self.sessions.insert(handle.session_id().to_string(), handle);
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Fan one encoded frame out to every connected client. Returns how
    /// many sessions it was queued on.
    pub fn broadcast_frame(&self, frame: EncodedFrame) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            entry.value().send_frame(frame.clone());
            delivered += 1;
        }
        delivered
    }

    /// Per-session diagnostics for display.
    pub fn diagnostics(&self) -> Vec<(String, DiagnosticsSnapshot)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().diagnostics()))
            .collect()
    }

    /// Gracefully disconnect every session (used at shutdown).
    pub async fn shutdown_all(&self) {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        self.sessions.clear();
        for handle in handles {
            info!(session_id = handle.session_id(), "closing session for shutdown");
            handle.disconnect().await;
        }
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}
