//! Two-class send scheduler.
//!
//! Critical control traffic (handshakes, heartbeats, feedback, requests)
//! drains strictly before media (frames, audio, parity). Each class has a
//! message-count cap and a byte budget; overflow drops the oldest media,
//! never a handshake. Enqueue is non-blocking and O(1)-ish under one
//! mutex; the single consumer suspends on a `Notify` when idle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, warn};

use spanview_protocol::error::ProtocolError;
use spanview_protocol::messages::{Message, MessageKind};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// One queued message: payload already serialized, sequence number still
/// unassigned (the send task stamps it immediately before the write so
/// on-wire order matches sequence order).
#[derive(Debug)]
pub struct Outbound {
    pub kind: MessageKind,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
    pub is_key_frame: bool,
}

impl Outbound {
    pub fn from_message(msg: &Message, timestamp_ms: u64) -> Result<Self, ProtocolError> {
        let is_key_frame = matches!(msg, Message::VideoFrame(f) if f.is_key_frame);
        Ok(Self { kind: msg.kind(), timestamp_ms, payload: msg.encode_payload()?, is_key_frame })
    }
}

fn is_handshake(kind: MessageKind) -> bool {
    matches!(kind, MessageKind::Handshake | MessageKind::HandshakeAck)
}

#[derive(Default)]
struct ClassQueue {
    items: VecDeque<Outbound>,
    bytes: usize,
}

impl ClassQueue {
    fn push(&mut self, out: Outbound) {
        self.bytes += out.payload.len();
        self.items.push_back(out);
    }

    fn pop(&mut self) -> Option<Outbound> {
        let out = self.items.pop_front()?;
        self.bytes -= out.payload.len();
        Some(out)
    }

    fn remove(&mut self, index: usize) -> Option<Outbound> {
        let out = self.items.remove(index)?;
        self.bytes -= out.payload.len();
        Some(out)
    }

    fn over(&self, capacity: usize, budget: usize) -> bool {
        self.items.len() > capacity || self.bytes > budget
    }
}

struct Inner {
    critical: ClassQueue,
    media: ClassQueue,
    closed: bool,
}

/// Snapshot of queue depths for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerDepth {
    pub critical_len: usize,
    pub critical_bytes: usize,
    pub media_len: usize,
    pub media_bytes: usize,
}

pub struct SendScheduler {
    config: SchedulerConfig,
    inner: Mutex<Inner>,
    notify: Notify,
    dropped_media: AtomicU64,
    dropped_critical: AtomicU64,
}

impl SendScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                critical: ClassQueue::default(),
                media: ClassQueue::default(),
                closed: false,
            }),
            notify: Notify::new(),
            dropped_media: AtomicU64::new(0),
            dropped_critical: AtomicU64::new(0),
        }
    }

    /// Queue a message. Never blocks and performs no I/O; drop policy runs
    /// under the lock. A `HandshakeDropped` error is fatal to the session.
    pub fn enqueue(&self, out: Outbound) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.closed {
            return Err(SchedulerError::Closed);
        }

        if out.kind.is_critical() {
            self.enqueue_critical(&mut inner, out)?;
        } else {
            self.enqueue_media(&mut inner, out);
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    fn enqueue_critical(&self, inner: &mut Inner, out: Outbound) -> Result<(), SchedulerError> {
        inner.critical.push(out);
        let (cap, budget) = (self.config.critical_capacity, self.config.critical_byte_budget);
        while inner.critical.over(cap, budget) {
            // Drop the oldest critical message that is not a handshake.
            let victim = inner
                .critical
                .items
                .iter()
                .position(|m| !is_handshake(m.kind));
            match victim.and_then(|i| inner.critical.remove(i)) {
                Some(dropped) => {
                    self.dropped_critical.fetch_add(1, Ordering::Relaxed);
                    warn!(kind = dropped.kind.name(), "critical queue over budget, dropping oldest");
                }
                None => {
                    // Only handshake messages remain; losing one is fatal.
                    return Err(SchedulerError::HandshakeDropped);
                }
            }
        }
        Ok(())
    }

    fn enqueue_media(&self, inner: &mut Inner, out: Outbound) {
        let (cap, budget) = (self.config.media_capacity, self.config.media_byte_budget);

        // Liveness preference: an incoming delta frame is worth less than
        // the newer deltas already queued, so drop it instead of the head.
        let would_overflow = inner.media.items.len() + 1 > cap
            || inner.media.bytes + out.payload.len() > budget;
        if would_overflow
            && out.kind == MessageKind::VideoFrame
            && !out.is_key_frame
            && inner
                .media
                .items
                .iter()
                .any(|m| m.kind == MessageKind::VideoFrame && !m.is_key_frame)
        {
            self.dropped_media.fetch_add(1, Ordering::Relaxed);
            debug!("media queue over budget, dropping incoming delta frame");
            return;
        }

        inner.media.push(out);
        while inner.media.over(cap, budget) {
            if inner.media.pop().is_some() {
                self.dropped_media.fetch_add(1, Ordering::Relaxed);
                debug!("media queue over budget, dropping oldest");
            }
        }
    }

    /// Take the next message: all pending critical first, then media.
    /// Suspends while both queues are empty. Returns `None` once the
    /// scheduler is closed and the critical queue has drained.
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(out) = inner.critical.pop() {
                    return Some(out);
                }
                if inner.closed {
                    return None;
                }
                if let Some(out) = inner.media.pop() {
                    return Some(out);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Begin draining: discard queued media and stop accepting messages;
    /// `pop` keeps yielding critical messages until the queue is empty.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if !inner.closed {
            inner.closed = true;
            let discarded = inner.media.items.len();
            inner.media.items.clear();
            inner.media.bytes = 0;
            if discarded > 0 {
                debug!(discarded, "discarded queued media on close");
            }
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn depth(&self) -> SchedulerDepth {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        SchedulerDepth {
            critical_len: inner.critical.items.len(),
            critical_bytes: inner.critical.bytes,
            media_len: inner.media.items.len(),
            media_bytes: inner.media.bytes,
        }
    }

    pub fn dropped_media(&self) -> u64 {
        self.dropped_media.load(Ordering::Relaxed)
    }

    pub fn dropped_critical(&self) -> u64 {
        self.dropped_critical.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use spanview_protocol::messages::{Heartbeat, VideoFrame};

    fn heartbeat(ts: u64) -> Outbound {
        Outbound::from_message(&Message::Heartbeat(Heartbeat { timestamp: ts }), ts).unwrap()
    }

    fn video(len: usize, is_key: bool) -> Outbound {
        let frame = VideoFrame {
            data: vec![0xAB; len],
            is_key_frame: is_key,
            width: 16,
            height: 16,
            codec: "H264".into(),
            frame_number: None,
        };
        Outbound::from_message(&Message::VideoFrame(frame), 0).unwrap()
    }

    fn audio(len: usize) -> Outbound {
        Outbound::from_message(&Message::AudioFrame(vec![0u8; len]), 0).unwrap()
    }

    fn handshake() -> Outbound {
        let msg = Message::Handshake(spanview_protocol::messages::Handshake {
            device_id: "d".into(),
            device_name: "n".into(),
            client_version: "1".into(),
            screen_width: 1,
            screen_height: 1,
            pairing_code: None,
        });
        Outbound::from_message(&msg, 0).unwrap()
    }

    fn small_config() -> SchedulerConfig {
        SchedulerConfig {
            critical_capacity: 4,
            media_capacity: 4,
            critical_byte_budget: 4096,
            media_byte_budget: 4096,
        }
    }

    #[tokio::test]
    async fn critical_drains_before_media() {
        let s = SendScheduler::new(small_config());
        s.enqueue(video(10, true)).unwrap();
        s.enqueue(heartbeat(1)).unwrap();
        s.enqueue(heartbeat(2)).unwrap();

        assert_eq!(s.pop().await.unwrap().kind, MessageKind::Heartbeat);
        assert_eq!(s.pop().await.unwrap().kind, MessageKind::Heartbeat);
        assert_eq!(s.pop().await.unwrap().kind, MessageKind::VideoFrame);
    }

    #[tokio::test]
    async fn fifo_within_class() {
        let s = SendScheduler::new(small_config());
        s.enqueue(heartbeat(1)).unwrap();
        s.enqueue(heartbeat(2)).unwrap();
        assert_eq!(s.pop().await.unwrap().timestamp_ms, 1);
        assert_eq!(s.pop().await.unwrap().timestamp_ms, 2);
    }

    #[tokio::test]
    async fn media_capacity_drops_oldest() {
        let mut config = small_config();
        config.media_capacity = 2;
        let s = SendScheduler::new(config);
        // Audio is media but never subject to the delta-frame preference.
        s.enqueue(audio(1)).unwrap();
        s.enqueue(audio(2)).unwrap();
        s.enqueue(audio(3)).unwrap();

        assert_eq!(s.dropped_media(), 1);
        assert_eq!(s.pop().await.unwrap().payload.len(), 2);
        assert_eq!(s.pop().await.unwrap().payload.len(), 3);
    }

    #[tokio::test]
    async fn byte_budget_never_exceeded() {
        let mut config = small_config();
        config.media_byte_budget = 3000;
        config.media_capacity = 64;
        let s = SendScheduler::new(config);
        for _ in 0..20 {
            s.enqueue(audio(400)).unwrap();
            assert!(s.depth().media_bytes <= 3000);
        }
        assert!(s.dropped_media() > 0);
    }

    #[tokio::test]
    async fn incoming_delta_dropped_when_queue_has_deltas() {
        let mut config = small_config();
        config.media_capacity = 2;
        let s = SendScheduler::new(config);
        s.enqueue(video(10, true)).unwrap();
        s.enqueue(video(10, false)).unwrap();
        // Queue full and holds a delta: the incoming delta loses.
        s.enqueue(video(10, false)).unwrap();

        assert_eq!(s.dropped_media(), 1);
        assert!(s.pop().await.unwrap().is_key_frame);
        let second = s.pop().await.unwrap();
        assert!(!second.is_key_frame);
        assert_eq!(s.depth().media_len, 0);
    }

    #[tokio::test]
    async fn key_frame_evicts_head_instead_of_being_dropped() {
        let mut config = small_config();
        config.media_capacity = 2;
        let s = SendScheduler::new(config);
        s.enqueue(video(10, false)).unwrap();
        s.enqueue(video(10, false)).unwrap();
        s.enqueue(video(10, true)).unwrap();

        assert_eq!(s.dropped_media(), 1);
        assert!(!s.pop().await.unwrap().is_key_frame);
        assert!(s.pop().await.unwrap().is_key_frame);
    }

    #[tokio::test]
    async fn critical_eviction_skips_handshakes() {
        let mut config = small_config();
        config.critical_capacity = 2;
        let s = SendScheduler::new(config);
        s.enqueue(handshake()).unwrap();
        s.enqueue(heartbeat(1)).unwrap();
        s.enqueue(heartbeat(2)).unwrap();

        assert_eq!(s.dropped_critical(), 1);
        // The handshake survived; heartbeat 1 was the victim.
        assert_eq!(s.pop().await.unwrap().kind, MessageKind::Handshake);
        assert_eq!(s.pop().await.unwrap().timestamp_ms, 2);
    }

    #[tokio::test]
    async fn dropping_a_handshake_is_fatal() {
        let mut config = small_config();
        config.critical_capacity = 1;
        let s = SendScheduler::new(config);
        s.enqueue(handshake()).unwrap();
        let err = s.enqueue(handshake()).unwrap_err();
        assert!(matches!(err, SchedulerError::HandshakeDropped));
    }

    #[tokio::test]
    async fn close_drains_critical_only() {
        let s = SendScheduler::new(small_config());
        s.enqueue(video(10, true)).unwrap();
        s.enqueue(heartbeat(1)).unwrap();
        s.close();

        assert_eq!(s.pop().await.unwrap().kind, MessageKind::Heartbeat);
        assert!(s.pop().await.is_none());
        assert!(matches!(s.enqueue(heartbeat(2)), Err(SchedulerError::Closed)));
    }

    #[tokio::test]
    async fn pop_wakes_on_enqueue() {
        use std::sync::Arc;

        let s = Arc::new(SendScheduler::new(small_config()));
        let popper = {
            let s = s.clone();
            tokio::spawn(async move { s.pop().await })
        };
        tokio::task::yield_now().await;
        s.enqueue(heartbeat(7)).unwrap();

        let out = popper.await.unwrap().unwrap();
        assert_eq!(out.timestamp_ms, 7);
    }
}
