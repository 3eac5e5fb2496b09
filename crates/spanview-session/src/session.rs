//! The live session: one socket, one send task, one receive task, one
//! heartbeat/ABR timer task. Any task that observes a fatal error records
//! it (first error wins) and cancels the others; teardown joins
//! everything before the handle is gone.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use spanview_fec::{AssemblyOutcome, GroupAssembler, GroupEncoder};
use spanview_protocol::error::FramingError;
use spanview_protocol::frame::{encode_frame, Frame, FrameDecoder};
use spanview_protocol::messages::{
    AudioConfig, BitrateControl, FecConfig, Heartbeat, HeartbeatAck, KeyFrameReason,
    KeyFrameRequest, Message, MessageKind, ProtocolFeedback, TouchEvent, VideoFrame,
};
use spanview_protocol::types::{EncodedFrame, FrameNumber, SequenceNumber};

use crate::abr::AbrController;
use crate::config::SessionConfig;
use crate::error::{SchedulerError, SessionError, TransportError};
use crate::limiter::RateLimiter;
use crate::scheduler::{Outbound, SendScheduler};
use crate::transport::SessionStream;

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The PC streaming frames out and receiving touch input.
    Host,
    /// The device receiving frames and sending touch input.
    Client,
}

/// The observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected { session_id: String },
    Reconnecting { next_delay_ms: u64 },
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Handshaking => "Handshaking",
            Self::Connected { .. } => "Connected",
            Self::Reconnecting { .. } => "Reconnecting",
        }
    }
}

/// A video frame delivered to the embedder (the decoder/renderer side).
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub frame: VideoFrame,
    /// Presentation time from the frame header; `None` for frames
    /// reconstructed from parity (the header is not FEC-protected).
    pub timestamp_ms: Option<u64>,
    pub reconstructed: bool,
}

/// Everything a session reports to its embedder.
#[derive(Debug)]
pub enum SessionEvent {
    VideoFrame(ReceivedFrame),
    AudioConfig(AudioConfig),
    AudioFrame { data: Vec<u8>, timestamp_ms: u64 },
    Touch(TouchEvent),
    /// The peer (or local FEC recovery) wants a key frame; the host feeds
    /// this to its encoder.
    KeyFrameRequested(KeyFrameReason),
    /// New target bitrate: from the local ABR loop on the host, from the
    /// peer's `BitrateControl` on the client (diagnostic display).
    BitrateTarget(u32),
    FecConfigChanged(FecConfig),
    /// The session reached `Disconnected`. `error` is `None` for a
    /// caller-initiated disconnect.
    Closed { error: Option<String> },
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_recovered: u64,
    pub dropped_media: u64,
    pub dropped_critical: u64,
    pub latest_rtt_ms: u32,
    pub target_bps: u32,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_recovered: AtomicU64,
    /// Receiver-side accumulators drained into each ProtocolFeedback.
    feedback_bytes: AtomicU64,
    feedback_missing: AtomicU32,
    target_bps: AtomicU32,
}

/// State shared by the worker tasks and the handle.
pub(crate) struct Shared {
    scheduler: SendScheduler,
    cancel: CancellationToken,
    error: Mutex<Option<SessionError>>,
    last_rx: Mutex<Instant>,
    latest_rtt_ms: AtomicU32,
    counters: Counters,
    key_frame_limiter: Mutex<RateLimiter>,
    state_tx: Arc<watch::Sender<SessionState>>,
    grouper: Mutex<GroupEncoder>,
    next_frame_number: AtomicU32,
    /// Worker tasks still running; the last one to exit publishes the
    /// terminal state and the closing event.
    live_tasks: AtomicUsize,
}

impl Shared {
    /// Record the first fatal error and begin teardown.
    fn fail(&self, err: SessionError) {
        {
            let mut slot = self.error.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                warn!(error = %err, "session failed");
                *slot = Some(err);
            }
        }
        self.cancel.cancel();
    }

    fn set_state(&self, state: SessionState, reason: &str) {
        let changed = {
            let current = self.state_tx.borrow();
            *current != state
        };
        if changed {
            info!(state = state.name(), reason, "session state changed");
            self.state_tx.send_replace(state);
        }
    }

    /// Serialize and queue a message; a dropped handshake is upgraded to a
    /// fatal error, media drops are counted silently by the scheduler.
    fn enqueue(&self, msg: &Message, timestamp_ms: u64) {
        let out = match Outbound::from_message(msg, timestamp_ms) {
            Ok(out) => out,
            Err(e) => {
                warn!(kind = msg.kind().name(), "failed to encode outbound message: {e}");
                return;
            }
        };
        match self.scheduler.enqueue(out) {
            Ok(()) => {}
            Err(SchedulerError::Closed) => {}
            Err(e @ SchedulerError::HandshakeDropped) => self.fail(e.into()),
        }
    }

    fn touch_rx(&self) {
        *self.last_rx.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn rx_idle(&self) -> Duration {
        self.last_rx.lock().unwrap_or_else(|p| p.into_inner()).elapsed()
    }

    /// Called by each worker task as it ends. The last task out performs
    /// the final transition: publish `Disconnected`, emit `Closed`.
    async fn task_exited(&self, events: &mpsc::Sender<SessionEvent>) {
        if self.live_tasks.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let error = self
            .error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|e| e.to_string());
        let reason = error.clone().unwrap_or_else(|| "disconnect requested".into());
        self.set_state(SessionState::Disconnected, &reason);
        let _ = events.send(SessionEvent::Closed { error }).await;
    }

    /// Rate-limited key-frame request (shared by local callers and FEC
    /// recovery): at most one per 500 ms.
    fn request_key_frame(&self, reason: KeyFrameReason) -> bool {
        let allowed = self
            .key_frame_limiter
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .try_consume();
        if allowed {
            self.enqueue(&Message::KeyFrameRequest(KeyFrameRequest { reason }), now_ms());
        } else {
            debug!(?reason, "key frame request suppressed by rate limit");
        }
        allowed
    }
}

/// Milliseconds since the Unix epoch, UTC.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Read one complete frame, growing `buf` from the stream as needed. Used
/// for the handshake exchange before the worker tasks exist.
pub(crate) async fn read_one_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    decoder: &mut FrameDecoder,
    buf: &mut BytesMut,
) -> Result<Frame, SessionError> {
    loop {
        if let Some(frame) = decoder.try_decode(buf)? {
            return Ok(frame);
        }
        let n = stream.read_buf(buf).await.map_err(TransportError::Io)?;
        if n == 0 {
            decoder.finish(buf)?;
            return Err(TransportError::Closed.into());
        }
    }
}

/// Write one frame directly to the stream (handshake path only; steady
/// state goes through the scheduler).
pub(crate) async fn write_one_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    msg: &Message,
    sequence: SequenceNumber,
) -> Result<(), SessionError> {
    let payload = msg.encode_payload()?;
    let frame = encode_frame(msg.kind() as u8, now_ms(), sequence, &payload);
    stream.write_all(&frame).await.map_err(TransportError::Io)?;
    stream.flush().await.map_err(TransportError::Io)?;
    Ok(())
}

pub(crate) struct SessionParams {
    pub stream: SessionStream,
    /// Decoder carried over from the handshake (it holds the peer's last
    /// sequence number).
    pub decoder: FrameDecoder,
    /// Bytes read past the handshake frame, if any.
    pub leftover: BytesMut,
    /// Our next outbound sequence number (the handshake used earlier ones).
    pub next_sequence: SequenceNumber,
    pub role: Role,
    pub session_id: String,
    pub config: SessionConfig,
    pub events: mpsc::Sender<SessionEvent>,
    pub state_tx: Arc<watch::Sender<SessionState>>,
}

/// Spawn the three worker tasks for an established (handshaken) session.
pub(crate) fn spawn_session(params: SessionParams) -> SessionHandle {
    let SessionParams {
        stream,
        decoder,
        leftover,
        next_sequence,
        role,
        session_id,
        config,
        events,
        state_tx,
    } = params;

    let grouper = GroupEncoder::new(config.fec.to_wire()).unwrap_or_else(|e| {
        warn!("invalid FEC settings ({e}), continuing without parity");
        let mut fallback = config.fec.to_wire();
        fallback.enabled = false;
        fallback.parity_shards = 0;
        fallback.data_shards = fallback.data_shards.clamp(1, 64);
        GroupEncoder::new(fallback).unwrap_or_else(|_| {
            GroupEncoder::new(FecConfig { enabled: false, data_shards: 1, parity_shards: 0 })
                .expect("minimal FEC config is always valid")
        })
    });

    let shared = Arc::new(Shared {
        scheduler: SendScheduler::new(config.scheduler),
        cancel: CancellationToken::new(),
        error: Mutex::new(None),
        last_rx: Mutex::new(Instant::now()),
        latest_rtt_ms: AtomicU32::new(0),
        counters: Counters::default(),
        key_frame_limiter: Mutex::new(RateLimiter::key_frame_requests()),
        state_tx,
        grouper: Mutex::new(grouper),
        next_frame_number: AtomicU32::new(0),
        live_tasks: AtomicUsize::new(3),
    });

    let (reader, writer) = tokio::io::split(stream);
    let (feedback_tx, feedback_rx) = mpsc::channel::<ProtocolFeedback>(8);

    let recv = tokio::spawn(recv_task(RecvContext {
        reader,
        decoder,
        buf: leftover,
        shared: shared.clone(),
        events: events.clone(),
        feedback_tx,
        assembler: GroupAssembler::new(config.fec.window_groups),
        role,
    }));
    let send = tokio::spawn(send_task(writer, shared.clone(), next_sequence, events.clone()));
    let timer = tokio::spawn(timer_task(shared.clone(), feedback_rx, events, config.clone(), role));

    shared.set_state(SessionState::Connected { session_id: session_id.clone() }, "handshake complete");

    // The sender announces its FEC parameters up front so the receiver can
    // size its gap tolerance before the first group arrives.
    if role == Role::Host {
        let wire = config.fec.to_wire();
        shared.enqueue(&Message::FecConfig(wire), now_ms());
    }

    SessionHandle {
        session_id,
        role,
        shared,
        tasks: tokio::sync::Mutex::new(Some(TaskSet { send, others: vec![recv, timer] })),
    }
}

struct TaskSet {
    send: JoinHandle<()>,
    others: Vec<JoinHandle<()>>,
}

/// Owner of a live session. Dropping the handle leaves the tasks running;
/// call [`SessionHandle::disconnect`] (or [`SessionHandle::join`] after
/// [`SessionHandle::closed`]) to tear down cleanly.
pub struct SessionHandle {
    session_id: String,
    role: Role,
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<Option<TaskSet>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// The first fatal error, if the session has failed.
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|e| e.to_string())
    }

    /// Take ownership of the fatal error, if any. Used by reconnect loops
    /// to decide whether another attempt is permitted.
    pub fn take_error(&self) -> Option<SessionError> {
        self.shared.error.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let c = &self.shared.counters;
        DiagnosticsSnapshot {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            frames_recovered: c.frames_recovered.load(Ordering::Relaxed),
            dropped_media: self.shared.scheduler.dropped_media(),
            dropped_critical: self.shared.scheduler.dropped_critical(),
            latest_rtt_ms: self.shared.latest_rtt_ms.load(Ordering::Relaxed),
            target_bps: c.target_bps.load(Ordering::Relaxed),
        }
    }

    /// Queue one encoded video frame (host side). The frame is stamped
    /// with the next frame number and, when FEC is active, contributes to
    /// the current parity group.
    pub fn send_frame(&self, frame: EncodedFrame) {
        let frame_number: FrameNumber =
            self.shared.next_frame_number.fetch_add(1, Ordering::Relaxed);
        let message = Message::VideoFrame(VideoFrame {
            data: frame.data,
            is_key_frame: frame.is_key_frame,
            width: frame.width,
            height: frame.height,
            codec: "H264".into(),
            frame_number: Some(frame_number),
        });

        let payload = match message.encode_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode video frame: {e}");
                return;
            }
        };
        let is_key_frame = frame.is_key_frame;
        match self.shared.scheduler.enqueue(Outbound {
            kind: MessageKind::VideoFrame,
            timestamp_ms: frame.timestamp_ms,
            payload: payload.clone(),
            is_key_frame,
        }) {
            Ok(()) => {
                self.shared.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(SchedulerError::Closed) => return,
            Err(e @ SchedulerError::HandshakeDropped) => {
                self.shared.fail(e.into());
                return;
            }
        }

        let fec_messages = {
            let mut grouper = self.shared.grouper.lock().unwrap_or_else(|p| p.into_inner());
            grouper.push_frame(frame_number, &payload)
        };
        match fec_messages {
            Ok(messages) => {
                for msg in &messages {
                    self.shared.enqueue(msg, frame.timestamp_ms);
                }
            }
            Err(e) => warn!("FEC encoding failed, group skipped: {e}"),
        }
    }

    /// Queue a touch event (client side).
    pub fn send_touch(&self, event: TouchEvent) {
        self.shared.enqueue(&Message::TouchEvent(event), now_ms());
    }

    pub fn send_audio_config(&self, config: AudioConfig) {
        self.shared.enqueue(&Message::AudioConfig(config), now_ms());
    }

    /// Queue an opaque encoded audio frame; `timestamp_ms` is its
    /// presentation time, carried in the header.
    pub fn send_audio_frame(&self, data: Vec<u8>, timestamp_ms: u64) {
        self.shared.enqueue(&Message::AudioFrame(data), timestamp_ms);
    }

    /// Announce a new FEC configuration to the peer and apply it locally.
    pub fn send_fec_config(&self, config: FecConfig) -> Result<(), spanview_fec::FecError> {
        self.shared
            .grouper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .reconfigure(config)?;
        self.shared.enqueue(&Message::FecConfig(config), now_ms());
        Ok(())
    }

    /// Ask the peer for a key frame. Subject to the session-wide rate
    /// limit of one request per 500 ms; returns whether it was sent.
    pub fn request_key_frame(&self, reason: KeyFrameReason) -> bool {
        self.shared.request_key_frame(reason)
    }

    /// Resolves when the session has begun teardown (fatal error or
    /// disconnect).
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Caller-initiated disconnect: drain critical traffic for up to
    /// 500 ms, then close the socket and join every task. Idempotent.
    pub async fn disconnect(&self) {
        info!(session_id = %self.session_id, "disconnecting session");
        self.shared.scheduler.close();
        let Some(mut tasks) = self.tasks.lock().await.take() else {
            self.shared.cancel.cancel();
            return;
        };
        // Draining: the send task exits once the critical queue is empty.
        let drained =
            tokio::time::timeout(Duration::from_millis(500), &mut tasks.send).await.is_ok();
        self.shared.cancel.cancel();
        if !drained {
            let _ = tasks.send.await;
        }
        for task in tasks.others {
            let _ = task.await;
        }
    }

    /// Join all worker tasks. Must only be called after teardown started
    /// ([`SessionHandle::closed`] resolved); used by reconnect loops.
    pub async fn join(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else { return };
        let _ = tasks.send.await;
        for task in tasks.others {
            let _ = task.await;
        }
    }
}

// ── Worker tasks ──────────────────────────────────────────────────────

async fn send_task(
    mut writer: WriteHalf<SessionStream>,
    shared: Arc<Shared>,
    mut sequence: SequenceNumber,
    events: mpsc::Sender<SessionEvent>,
) {
    loop {
        let popped = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            out = shared.scheduler.pop() => out,
        };
        let Some(out) = popped else { break };

        let frame = encode_frame(out.kind as u8, out.timestamp_ms, sequence, &out.payload);
        match sequence.checked_add(1) {
            Some(next) => sequence = next,
            None => {
                // Sequence space exhausted; the protocol terminates rather
                // than wrapping.
                shared.fail(SessionError::Framing(FramingError::OutOfOrder {
                    sequence: u32::MAX,
                    last: u32::MAX,
                }));
                break;
            }
        }

        // Cancel-aware write so teardown can always reclaim this task,
        // even against a peer that stopped reading.
        let written = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => result,
        };
        if let Err(e) = written {
            shared.fail(TransportError::Io(e).into());
            break;
        }
        shared.counters.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
    }

    let _ = writer.shutdown().await;
    debug!("send task ended");
    shared.task_exited(&events).await;
}

struct RecvContext {
    reader: ReadHalf<SessionStream>,
    decoder: FrameDecoder,
    buf: BytesMut,
    shared: Arc<Shared>,
    events: mpsc::Sender<SessionEvent>,
    feedback_tx: mpsc::Sender<ProtocolFeedback>,
    assembler: GroupAssembler,
    role: Role,
}

async fn recv_task(mut ctx: RecvContext) {
    let mut last_frame_number: Option<FrameNumber> = None;
    // The receive task owns the FEC buffers, so group expiry ticks here.
    let mut fec_tick = tokio::time::interval(Duration::from_millis(100));
    fec_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    'outer: loop {
        tokio::select! {
            _ = ctx.shared.cancel.cancelled() => break,
            _ = fec_tick.tick() => {
                let rtt = Duration::from_millis(
                    ctx.shared.latest_rtt_ms.load(Ordering::Relaxed) as u64,
                );
                let outcome = ctx.assembler.expire(Instant::now(), rtt);
                deliver_outcome(&ctx.shared, &ctx.events, outcome).await;
            }
            result = ctx.reader.read_buf(&mut ctx.buf) => {
                match result {
                    Ok(0) => {
                        match ctx.decoder.finish(&ctx.buf) {
                            Ok(()) => ctx.shared.fail(TransportError::Closed.into()),
                            Err(e) => ctx.shared.fail(e.into()),
                        }
                        break;
                    }
                    Ok(n) => {
                        ctx.shared.counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                        ctx.shared.counters.feedback_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        ctx.shared.fail(TransportError::Io(e).into());
                        break;
                    }
                }

                loop {
                    match ctx.decoder.try_decode(&mut ctx.buf) {
                        Ok(Some(frame)) => {
                            ctx.shared.touch_rx();
                            dispatch_frame(&mut ctx, frame, &mut last_frame_number).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            ctx.shared.fail(e.into());
                            break 'outer;
                        }
                    }
                }
            }
        }
    }
    debug!("receive task ended");
    ctx.shared.task_exited(&ctx.events).await;
}

async fn dispatch_frame(
    ctx: &mut RecvContext,
    frame: Frame,
    last_frame_number: &mut Option<FrameNumber>,
) {
    let kind = match MessageKind::from_byte(frame.header.kind) {
        Ok(kind) => kind,
        Err(_) => {
            // Unknown tags are logged and dropped; only unknown *framing*
            // kills the session.
            warn!(kind = frame.header.kind, "unknown message type, dropping");
            return;
        }
    };
    let message = match Message::decode(kind, &frame.payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(kind = kind.name(), "failed to decode payload, dropping: {e}");
            return;
        }
    };

    match message {
        Message::Heartbeat(hb) => {
            let ack = HeartbeatAck {
                original_timestamp: hb.timestamp,
                response_timestamp: now_ms(),
            };
            ctx.shared.enqueue(&Message::HeartbeatAck(ack), now_ms());
        }
        Message::HeartbeatAck(ack) => {
            let rtt = now_ms().saturating_sub(ack.original_timestamp);
            ctx.shared
                .latest_rtt_ms
                .store(rtt.min(u32::MAX as u64) as u32, Ordering::Relaxed);
        }
        Message::VideoFrame(video) => {
            ctx.shared.counters.frames_received.fetch_add(1, Ordering::Relaxed);

            let outcome = match video.frame_number {
                Some(n) => {
                    if let Some(last) = *last_frame_number {
                        let gap = n.saturating_sub(last.saturating_add(1));
                        if gap > 0 {
                            ctx.shared
                                .counters
                                .feedback_missing
                                .fetch_add(gap, Ordering::Relaxed);
                        }
                    }
                    if last_frame_number.map_or(true, |last| n > last) {
                        *last_frame_number = Some(n);
                    }
                    Some(ctx.assembler.on_video_frame(n, &frame.payload))
                }
                None => None,
            };

            // Arrived frames are delivered immediately; recovery only ever
            // adds frames behind them.
            let _ = ctx
                .events
                .send(SessionEvent::VideoFrame(ReceivedFrame {
                    frame: video,
                    timestamp_ms: Some(frame.header.timestamp_ms),
                    reconstructed: false,
                }))
                .await;
            if let Some(outcome) = outcome {
                deliver_outcome(&ctx.shared, &ctx.events, outcome).await;
            }
        }
        Message::FecGroupMetadata(meta) => {
            let outcome = ctx.assembler.on_metadata(&meta, Instant::now());
            deliver_outcome(&ctx.shared, &ctx.events, outcome).await;
        }
        Message::FecShard(shard) => {
            let outcome = ctx.assembler.on_shard(&shard);
            deliver_outcome(&ctx.shared, &ctx.events, outcome).await;
        }
        Message::FecConfig(config) => {
            ctx.assembler.set_config(config);
            let reconfigure_result = ctx
                .shared
                .grouper
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .reconfigure(config);
            if let Err(e) = reconfigure_result {
                warn!("peer sent invalid FEC config, keeping previous: {e}");
            } else {
                let _ = ctx.events.send(SessionEvent::FecConfigChanged(config)).await;
            }
        }
        Message::ProtocolFeedback(feedback) => {
            if ctx.role == Role::Host {
                // The timer task owns the ABR state; hand the report over.
                if ctx.feedback_tx.try_send(feedback).is_err() {
                    debug!("feedback channel full, dropping report");
                }
            }
        }
        Message::BitrateControl(control) => {
            let _ = ctx.events.send(SessionEvent::BitrateTarget(control.target_bps)).await;
        }
        Message::KeyFrameRequest(request) => {
            let _ = ctx.events.send(SessionEvent::KeyFrameRequested(request.reason)).await;
        }
        Message::TouchEvent(touch) => {
            let _ = ctx.events.send(SessionEvent::Touch(touch)).await;
        }
        Message::AudioConfig(config) => {
            let _ = ctx.events.send(SessionEvent::AudioConfig(config)).await;
        }
        Message::AudioFrame(data) => {
            let _ = ctx
                .events
                .send(SessionEvent::AudioFrame { data, timestamp_ms: frame.header.timestamp_ms })
                .await;
        }
        Message::Handshake(_) | Message::HandshakeAck(_) => {
            warn!("unexpected handshake message on an established session, dropping");
        }
    }
}

async fn deliver_outcome(
    shared: &Arc<Shared>,
    events: &mpsc::Sender<SessionEvent>,
    outcome: AssemblyOutcome,
) {
    for recovered in outcome.recovered {
        match Message::decode(MessageKind::VideoFrame, &recovered.payload) {
            Ok(Message::VideoFrame(video)) => {
                shared.counters.frames_recovered.fetch_add(1, Ordering::Relaxed);
                // The frame made it after all; take it back out of the
                // loss figure reported to the sender.
                let _ = shared.counters.feedback_missing.fetch_update(
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                    |v| Some(v.saturating_sub(1)),
                );
                let _ = events
                    .send(SessionEvent::VideoFrame(ReceivedFrame {
                        frame: video,
                        timestamp_ms: None,
                        reconstructed: true,
                    }))
                    .await;
            }
            Ok(_) | Err(_) => {
                warn!(
                    frame_number = recovered.frame_number,
                    "recovered shard did not parse as a video frame"
                );
            }
        }
    }
    if let Some(reason) = outcome.request_key_frame {
        shared.request_key_frame(reason);
    }
}

async fn timer_task(
    shared: Arc<Shared>,
    mut feedback_rx: mpsc::Receiver<ProtocolFeedback>,
    events: mpsc::Sender<SessionEvent>,
    config: SessionConfig,
    role: Role,
) {
    let heartbeat_interval = Duration::from_millis(config.heartbeat_interval_ms.max(1));
    let heartbeat_timeout = Duration::from_millis(config.heartbeat_timeout_ms);
    let mut heartbeat = tokio::time::interval(heartbeat_interval);

    // Receiver reports feed the sender's ABR loop once a second.
    let feedback_interval = Duration::from_millis(1_000);
    let mut feedback_tick = tokio::time::interval(feedback_interval);

    let mut abr = match role {
        Role::Host => Some(AbrController::new(5_000_000, config.abr_min_bps, config.abr_max_bps)),
        Role::Client => None,
    };
    if let Some(abr) = &abr {
        shared.counters.target_bps.store(abr.target_bps(), Ordering::Relaxed);
    }

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = heartbeat.tick() => {
                let now = now_ms();
                shared.enqueue(&Message::Heartbeat(Heartbeat { timestamp: now }), now);
                if shared.rx_idle() > heartbeat_timeout {
                    shared.fail(SessionError::HeartbeatTimeout);
                    break;
                }
            }
            Some(feedback) = feedback_rx.recv() => {
                let Some(abr) = &mut abr else { continue };
                if let Some(target) = abr.on_feedback(&feedback, Instant::now()) {
                    shared.counters.target_bps.store(target, Ordering::Relaxed);
                    shared.enqueue(
                        &Message::BitrateControl(BitrateControl { target_bps: target }),
                        now_ms(),
                    );
                    // The external encoder tracks the target through this
                    // event.
                    let _ = events.send(SessionEvent::BitrateTarget(target)).await;
                }
            }
            _ = feedback_tick.tick(), if role == Role::Client => {
                let bytes = shared.counters.feedback_bytes.swap(0, Ordering::Relaxed);
                let missing = shared.counters.feedback_missing.swap(0, Ordering::Relaxed);
                let report = ProtocolFeedback {
                    rtt_ms: shared.latest_rtt_ms.load(Ordering::Relaxed),
                    received_bytes: bytes,
                    interval_ms: feedback_interval.as_millis() as u32,
                    missing_sequence_delta: missing,
                };
                shared.enqueue(&Message::ProtocolFeedback(report), now_ms());
            }
        }
    }
    debug!("timer task ended");
    shared.task_exited(&events).await;
}
