//! FEC grouping over encoded video frames.
//!
//! The sender emits each `VideoFrame` immediately, collects `k` consecutive
//! frames into a group (one frame per data shard), then emits a
//! `FecGroupMetadata` followed by `m` parity `FecShard`s. The receiver
//! mirrors that: frames are delivered upstream the moment they arrive, while
//! the assembler tracks group membership and reconstructs lost frames once
//! enough shards are present.
//!
//! Shard layout: a 4-byte big-endian length prefix, the serialized
//! `VideoFrame` payload, zero padding up to the group shard length. The
//! prefix lets reconstruction recover the exact payload, metadata included.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use spanview_protocol::messages::{
    FecConfig, FecGroupMetadata, FecShard, KeyFrameReason, Message,
};
use spanview_protocol::types::{FrameNumber, GroupId};

use crate::error::FecError;
use crate::rs::ReedSolomon;

/// Upper bound on `FecConfig.data_shards`.
pub const MAX_DATA_SHARDS: u8 = 64;

/// Upper bound on `FecConfig.parity_shards`.
pub const MAX_PARITY_SHARDS: u8 = 32;

/// Default sliding window, in groups, after which an incomplete group is
/// abandoned.
pub const DEFAULT_WINDOW_GROUPS: u32 = 4;

/// Floor for the group abandonment timeout.
pub const MIN_GROUP_TIMEOUT: Duration = Duration::from_millis(250);

const LEN_PREFIX: usize = 4;

/// Recent frame payloads kept for back-filling groups whose metadata has
/// not arrived yet.
const FRAME_CACHE_LIMIT: usize = 512;

fn validate(config: &FecConfig) -> Result<(), FecError> {
    if config.data_shards == 0
        || config.data_shards > MAX_DATA_SHARDS
        || config.parity_shards > MAX_PARITY_SHARDS
    {
        return Err(FecError::InvalidShardCount {
            data: config.data_shards as usize,
            parity: config.parity_shards as usize,
        });
    }
    Ok(())
}

/// Sender side: accumulates outbound frame payloads and produces the FEC
/// messages that follow each completed group.
pub struct GroupEncoder {
    config: FecConfig,
    rs: Option<ReedSolomon>,
    next_group_id: GroupId,
    pending: Vec<(FrameNumber, Vec<u8>)>,
}

impl GroupEncoder {
    pub fn new(config: FecConfig) -> Result<Self, FecError> {
        validate(&config)?;
        let rs = if config.enabled && config.parity_shards > 0 {
            Some(ReedSolomon::new(config.data_shards as usize, config.parity_shards as usize)?)
        } else {
            None
        };
        Ok(Self { config, rs, next_group_id: 0, pending: Vec::new() })
    }

    pub fn config(&self) -> FecConfig {
        self.config
    }

    /// Apply a new `FecConfig`. Any partially accumulated group is
    /// discarded; group ids keep counting.
    pub fn reconfigure(&mut self, config: FecConfig) -> Result<(), FecError> {
        let next_group_id = self.next_group_id;
        *self = Self::new(config)?;
        self.next_group_id = next_group_id;
        Ok(())
    }

    /// Record one outbound frame payload (the serialized `VideoFrame`
    /// JSON). Returns the FEC messages to emit after it: empty until a
    /// group completes, then one metadata message plus the parity shards.
    pub fn push_frame(
        &mut self,
        frame_number: FrameNumber,
        payload: &[u8],
    ) -> Result<Vec<Message>, FecError> {
        let Some(rs) = &self.rs else {
            return Ok(Vec::new());
        };

        // Groups span consecutive frame numbers; a discontinuity (producer
        // restart) starts a fresh group.
        if let Some(&(last, _)) = self.pending.last() {
            if frame_number != last.wrapping_add(1) {
                debug!(last, frame_number, "frame number discontinuity, restarting group");
                self.pending.clear();
            }
        }
        self.pending.push((frame_number, payload.to_vec()));

        if self.pending.len() < self.config.data_shards as usize {
            return Ok(Vec::new());
        }

        let k = self.config.data_shards as usize;
        let m = self.config.parity_shards as usize;
        let shard_len = self
            .pending
            .iter()
            .map(|(_, p)| LEN_PREFIX + p.len())
            .max()
            .unwrap_or(LEN_PREFIX);

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(k + m);
        for (_, payload) in &self.pending {
            shards.push(pack_shard(payload, shard_len));
        }
        shards.resize_with(k + m, || vec![0u8; shard_len]);
        rs.encode(&mut shards)?;

        let first_frame_seq = self.pending[0].0;
        let group_id = self.next_group_id;
        self.next_group_id = self.next_group_id.wrapping_add(1);
        self.pending.clear();

        let mut out = Vec::with_capacity(1 + m);
        out.push(Message::FecGroupMetadata(FecGroupMetadata {
            group_id,
            first_frame_seq,
            data_shards: self.config.data_shards,
            parity_shards: self.config.parity_shards,
            shard_length_bytes: shard_len as u32,
            protected_seq_range: [first_frame_seq, first_frame_seq.wrapping_add(k as u32)],
        }));
        for (i, shard) in shards.into_iter().enumerate().skip(k) {
            out.push(Message::FecShard(FecShard {
                group_id,
                shard_index: i as u16,
                data: shard,
            }));
        }
        Ok(out)
    }
}

fn pack_shard(payload: &[u8], shard_len: usize) -> Vec<u8> {
    let mut shard = vec![0u8; shard_len];
    shard[..LEN_PREFIX].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    shard[LEN_PREFIX..LEN_PREFIX + payload.len()].copy_from_slice(payload);
    shard
}

fn unpack_shard(shard: &[u8]) -> Option<Vec<u8>> {
    if shard.len() < LEN_PREFIX {
        return None;
    }
    let len = u32::from_be_bytes([shard[0], shard[1], shard[2], shard[3]]) as usize;
    shard.get(LEN_PREFIX..LEN_PREFIX + len).map(|s| s.to_vec())
}

/// A frame payload reconstructed from parity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredFrame {
    pub frame_number: FrameNumber,
    /// Serialized `VideoFrame` JSON, identical to what was lost.
    pub payload: Vec<u8>,
}

/// What one assembler step produced.
#[derive(Debug, Default)]
pub struct AssemblyOutcome {
    /// Recovered frames, in frame-number order.
    pub recovered: Vec<RecoveredFrame>,
    /// Set when the step detected unrecoverable loss; the session sends a
    /// (rate-limited) `KeyFrameRequest` with this reason.
    pub request_key_frame: Option<KeyFrameReason>,
}

impl AssemblyOutcome {
    fn merge(&mut self, other: AssemblyOutcome) {
        self.recovered.extend(other.recovered);
        if self.request_key_frame.is_none() {
            self.request_key_frame = other.request_key_frame;
        }
    }
}

struct GroupBuffer {
    first_frame: FrameNumber,
    data_shards: usize,
    parity_shards: usize,
    shard_len: usize,
    shards: Vec<Option<Vec<u8>>>,
    created_at: Instant,
}

impl GroupBuffer {
    fn total(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    fn present(&self) -> usize {
        self.shards.iter().filter(|s| s.is_some()).count()
    }

    fn data_complete(&self) -> bool {
        self.shards[..self.data_shards].iter().all(|s| s.is_some())
    }

    fn covers(&self, frame_number: FrameNumber) -> bool {
        frame_number >= self.first_frame
            && (frame_number - self.first_frame) < self.data_shards as u32
    }
}

/// Receiver side: tracks live FEC groups, reconstructs lost frames, and
/// flags unrecoverable loss.
pub struct GroupAssembler {
    window: u32,
    config: Option<FecConfig>,
    groups: BTreeMap<GroupId, GroupBuffer>,
    frame_cache: BTreeMap<FrameNumber, Vec<u8>>,
    last_seen_frame: Option<FrameNumber>,
}

impl GroupAssembler {
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            config: None,
            groups: BTreeMap::new(),
            frame_cache: BTreeMap::new(),
            last_seen_frame: None,
        }
    }

    /// Record the peer's announced FEC configuration (affects gap
    /// detection only; group geometry always comes from metadata).
    pub fn set_config(&mut self, config: FecConfig) {
        self.config = Some(config);
    }

    /// Feed an arrived video frame payload. The caller has already
    /// delivered the frame upstream; this only updates group state.
    pub fn on_video_frame(&mut self, frame_number: FrameNumber, payload: &[u8]) -> AssemblyOutcome {
        let mut outcome = AssemblyOutcome::default();

        // A gap wider than the recoverable window can never be repaired by
        // parity, so ask for a fresh key frame immediately.
        if let Some(last) = self.last_seen_frame {
            let window_frames = match &self.config {
                Some(c) if c.enabled && c.parity_shards > 0 => {
                    self.window.saturating_mul(c.data_shards as u32)
                }
                _ => 0,
            };
            if frame_number > last.saturating_add(1).saturating_add(window_frames) {
                outcome.request_key_frame = Some(KeyFrameReason::GapDetected);
            }
        }
        if self.last_seen_frame.map_or(true, |last| frame_number > last) {
            self.last_seen_frame = Some(frame_number);
        }

        self.frame_cache.insert(frame_number, payload.to_vec());
        while self.frame_cache.len() > FRAME_CACHE_LIMIT {
            self.frame_cache.pop_first();
        }

        let target = self
            .groups
            .iter()
            .find(|(_, g)| g.covers(frame_number))
            .map(|(&id, _)| id);
        if let Some(id) = target {
            outcome.merge(self.place_frame(id, frame_number));
        }
        outcome
    }

    /// Feed a `FecGroupMetadata` announcement.
    pub fn on_metadata(&mut self, meta: &FecGroupMetadata, now: Instant) -> AssemblyOutcome {
        let mut outcome = AssemblyOutcome::default();

        if meta.data_shards == 0
            || meta.data_shards > MAX_DATA_SHARDS
            || meta.parity_shards > MAX_PARITY_SHARDS
        {
            warn!(
                group_id = meta.group_id,
                data = meta.data_shards,
                parity = meta.parity_shards,
                "ignoring FEC metadata with invalid shard counts"
            );
            return outcome;
        }
        if self.groups.contains_key(&meta.group_id) {
            return outcome;
        }

        // Slide the window: anything older than group_id - W is abandoned.
        let horizon = meta.group_id.saturating_sub(self.window);
        let stale: Vec<GroupId> =
            self.groups.range(..horizon).map(|(&id, _)| id).collect();
        for id in stale {
            outcome.merge(self.abandon(id));
        }

        let buffer = GroupBuffer {
            first_frame: meta.first_frame_seq,
            data_shards: meta.data_shards as usize,
            parity_shards: meta.parity_shards as usize,
            shard_len: meta.shard_length_bytes as usize,
            shards: vec![None; (meta.data_shards + meta.parity_shards) as usize],
            created_at: now,
        };
        self.groups.insert(meta.group_id, buffer);

        // Back-fill from frames that arrived before their metadata.
        let end = meta.first_frame_seq.saturating_add(meta.data_shards as u32);
        let frames: Vec<FrameNumber> = self
            .frame_cache
            .range(meta.first_frame_seq..end)
            .map(|(&n, _)| n)
            .collect();
        for frame_number in frames {
            outcome.merge(self.place_frame(meta.group_id, frame_number));
        }

        // Covered cache entries are owned by the group buffer now.
        let prune: Vec<FrameNumber> = self.frame_cache.range(..end).map(|(&n, _)| n).collect();
        for n in prune {
            self.frame_cache.remove(&n);
        }

        outcome
    }

    /// Feed a parity `FecShard`.
    pub fn on_shard(&mut self, shard: &FecShard) -> AssemblyOutcome {
        let mut outcome = AssemblyOutcome::default();
        let Some(group) = self.groups.get_mut(&shard.group_id) else {
            debug!(group_id = shard.group_id, "parity shard for unknown group, dropping");
            return outcome;
        };

        let idx = shard.shard_index as usize;
        if idx >= group.total() {
            warn!(group_id = shard.group_id, idx, "shard index out of range, dropping");
            return outcome;
        }
        if shard.data.len() != group.shard_len {
            warn!(
                group_id = shard.group_id,
                got = shard.data.len(),
                expected = group.shard_len,
                "shard size mismatch, abandoning group"
            );
            return self.abandon(shard.group_id);
        }

        if group.shards[idx].is_none() {
            group.shards[idx] = Some(shard.data.clone());
        }
        outcome.merge(self.try_recover(shard.group_id));
        outcome
    }

    /// Abandon groups whose timeout elapsed: `max(250 ms, 5·RTT)` since the
    /// metadata arrived. Fires even when no further traffic arrives.
    pub fn expire(&mut self, now: Instant, rtt: Duration) -> AssemblyOutcome {
        let timeout = MIN_GROUP_TIMEOUT.max(rtt.saturating_mul(5));
        let expired: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, g)| now.duration_since(g.created_at) >= timeout)
            .map(|(&id, _)| id)
            .collect();

        let mut outcome = AssemblyOutcome::default();
        for id in expired {
            debug!(group_id = id, "FEC group timed out");
            outcome.merge(self.abandon(id));
        }
        outcome
    }

    /// Number of live (incomplete) groups, for diagnostics.
    pub fn live_groups(&self) -> usize {
        self.groups.len()
    }

    fn place_frame(&mut self, group_id: GroupId, frame_number: FrameNumber) -> AssemblyOutcome {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return AssemblyOutcome::default();
        };
        let Some(payload) = self.frame_cache.get(&frame_number) else {
            return AssemblyOutcome::default();
        };

        if LEN_PREFIX + payload.len() > group.shard_len {
            warn!(group_id, frame_number, "frame exceeds announced shard length, abandoning group");
            return self.abandon(group_id);
        }
        let idx = (frame_number - group.first_frame) as usize;
        if group.shards[idx].is_none() {
            group.shards[idx] = Some(pack_shard(payload, group.shard_len));
        }
        self.try_recover(group_id)
    }

    fn try_recover(&mut self, group_id: GroupId) -> AssemblyOutcome {
        let mut outcome = AssemblyOutcome::default();
        let (complete, recoverable) = match self.groups.get(&group_id) {
            Some(g) => (g.data_complete(), g.present() >= g.data_shards),
            None => return outcome,
        };

        if complete {
            self.groups.remove(&group_id);
            return outcome;
        }
        if !recoverable {
            return outcome;
        }

        let Some(group) = self.groups.remove(&group_id) else {
            return outcome;
        };
        let present: Vec<bool> = group.shards.iter().map(|s| s.is_some()).collect();
        let mut shards: Vec<Vec<u8>> =
            group.shards.into_iter().map(|s| s.unwrap_or_default()).collect();

        let rs = match ReedSolomon::new(group.data_shards, group.parity_shards) {
            Ok(rs) => rs,
            Err(e) => {
                warn!(group_id, error = %e, "FEC codec rejected group geometry");
                outcome.request_key_frame = Some(KeyFrameReason::FecAbandoned);
                return outcome;
            }
        };
        if let Err(e) = rs.reconstruct(&mut shards, &present) {
            warn!(group_id, error = %e, "FEC reconstruction failed, requesting key frame");
            outcome.request_key_frame = Some(KeyFrameReason::FecAbandoned);
            return outcome;
        }

        for (i, was_present) in present[..group.data_shards].iter().enumerate() {
            if *was_present {
                continue;
            }
            match unpack_shard(&shards[i]) {
                Some(payload) => {
                    outcome.recovered.push(RecoveredFrame {
                        frame_number: group.first_frame.wrapping_add(i as u32),
                        payload,
                    });
                }
                None => {
                    warn!(group_id, shard = i, "recovered shard has a corrupt length prefix");
                    outcome.request_key_frame = Some(KeyFrameReason::FecAbandoned);
                }
            }
        }
        debug!(group_id, recovered = outcome.recovered.len(), "FEC group recovered");
        outcome
    }

    /// Drop a group. Missing data shards at this point are unrecoverable,
    /// so the caller is asked to request a key frame.
    fn abandon(&mut self, group_id: GroupId) -> AssemblyOutcome {
        let mut outcome = AssemblyOutcome::default();
        if let Some(group) = self.groups.remove(&group_id) {
            if !group.data_complete() {
                debug!(group_id, "abandoning FEC group with unrecovered loss");
                outcome.request_key_frame = Some(KeyFrameReason::FecAbandoned);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use spanview_protocol::messages::VideoFrame;

    fn fec_config(enabled: bool, k: u8, m: u8) -> FecConfig {
        FecConfig { enabled, data_shards: k, parity_shards: m }
    }

    fn frame_payload(frame_number: FrameNumber, len: usize, is_key: bool) -> Vec<u8> {
        let frame = VideoFrame {
            data: (0..len).map(|i| (i as u8).wrapping_mul(frame_number as u8 | 1)).collect(),
            is_key_frame: is_key,
            width: 1920,
            height: 1080,
            codec: "H264".into(),
            frame_number: Some(frame_number),
        };
        serde_json::to_vec(&frame).unwrap()
    }

    fn unwrap_meta(msg: &Message) -> &FecGroupMetadata {
        match msg {
            Message::FecGroupMetadata(m) => m,
            other => panic!("expected metadata, got {:?}", other.kind()),
        }
    }

    fn unwrap_shard(msg: &Message) -> &FecShard {
        match msg {
            Message::FecShard(s) => s,
            other => panic!("expected shard, got {:?}", other.kind()),
        }
    }

    #[test]
    fn encoder_emits_group_after_k_frames() {
        let mut enc = GroupEncoder::new(fec_config(true, 3, 2)).unwrap();
        assert!(enc.push_frame(0, &frame_payload(0, 50, true)).unwrap().is_empty());
        assert!(enc.push_frame(1, &frame_payload(1, 40, false)).unwrap().is_empty());

        let out = enc.push_frame(2, &frame_payload(2, 60, false)).unwrap();
        assert_eq!(out.len(), 3); // metadata + 2 parity shards

        let meta = unwrap_meta(&out[0]);
        assert_eq!(meta.group_id, 0);
        assert_eq!(meta.first_frame_seq, 0);
        assert_eq!(meta.data_shards, 3);
        assert_eq!(meta.parity_shards, 2);
        assert_eq!(meta.protected_seq_range, [0, 3]);

        let longest = frame_payload(2, 60, false).len();
        assert_eq!(meta.shard_length_bytes as usize, longest + LEN_PREFIX);

        assert_eq!(unwrap_shard(&out[1]).shard_index, 3);
        assert_eq!(unwrap_shard(&out[2]).shard_index, 4);
        assert_eq!(unwrap_shard(&out[1]).data.len(), meta.shard_length_bytes as usize);
    }

    #[test]
    fn encoder_group_ids_increment() {
        let mut enc = GroupEncoder::new(fec_config(true, 2, 1)).unwrap();
        enc.push_frame(0, b"a").unwrap();
        let g0 = enc.push_frame(1, b"b").unwrap();
        enc.push_frame(2, b"c").unwrap();
        let g1 = enc.push_frame(3, b"d").unwrap();

        assert_eq!(unwrap_meta(&g0[0]).group_id, 0);
        assert_eq!(unwrap_meta(&g1[0]).group_id, 1);
        assert_eq!(unwrap_meta(&g1[0]).first_frame_seq, 2);
    }

    #[test]
    fn encoder_disabled_or_parity_free_is_silent() {
        let mut disabled = GroupEncoder::new(fec_config(false, 3, 2)).unwrap();
        let mut no_parity = GroupEncoder::new(fec_config(true, 3, 0)).unwrap();
        for n in 0..10 {
            assert!(disabled.push_frame(n, b"x").unwrap().is_empty());
            assert!(no_parity.push_frame(n, b"x").unwrap().is_empty());
        }
    }

    #[test]
    fn encoder_restarts_group_on_discontinuity() {
        let mut enc = GroupEncoder::new(fec_config(true, 2, 1)).unwrap();
        enc.push_frame(0, b"a").unwrap();
        // Jump: frame 5 starts a new group rather than completing the old.
        assert!(enc.push_frame(5, b"b").unwrap().is_empty());
        let out = enc.push_frame(6, b"c").unwrap();
        assert_eq!(unwrap_meta(&out[0]).first_frame_seq, 5);
    }

    #[test]
    fn encoder_rejects_bad_config() {
        assert!(GroupEncoder::new(fec_config(true, 0, 2)).is_err());
        assert!(GroupEncoder::new(fec_config(true, 65, 2)).is_err());
        assert!(GroupEncoder::new(fec_config(true, 8, 33)).is_err());
    }

    #[test]
    fn lost_frame_is_recovered_bit_exact() {
        // k=3, m=2: lose F1 and one parity shard; F1 must come back
        // exactly and no key frame may be requested.
        let payloads: Vec<Vec<u8>> = vec![
            frame_payload(0, 90, true),
            frame_payload(1, 70, false),
            frame_payload(2, 96, false),
        ];

        let mut enc = GroupEncoder::new(fec_config(true, 3, 2)).unwrap();
        enc.push_frame(0, &payloads[0]).unwrap();
        enc.push_frame(1, &payloads[1]).unwrap();
        let fec_messages = enc.push_frame(2, &payloads[2]).unwrap();

        let now = Instant::now();
        let mut asm = GroupAssembler::new(DEFAULT_WINDOW_GROUPS);
        asm.set_config(fec_config(true, 3, 2));

        // F1 never arrives; the second parity shard is lost too.
        assert!(asm.on_video_frame(0, &payloads[0]).recovered.is_empty());
        let o = asm.on_video_frame(2, &payloads[2]);
        assert!(o.recovered.is_empty());
        assert!(o.request_key_frame.is_none());

        let o = asm.on_metadata(unwrap_meta(&fec_messages[0]), now);
        assert!(o.recovered.is_empty());

        let o = asm.on_shard(unwrap_shard(&fec_messages[1]));
        assert_eq!(o.recovered.len(), 1);
        assert_eq!(o.recovered[0].frame_number, 1);
        assert_eq!(o.recovered[0].payload, payloads[1]);
        assert!(o.request_key_frame.is_none());
        assert_eq!(asm.live_groups(), 0);
    }

    #[test]
    fn two_losses_recovered_in_order() {
        let payloads: Vec<Vec<u8>> =
            (0..4).map(|n| frame_payload(n, 30 + n as usize, n == 0)).collect();

        let mut enc = GroupEncoder::new(fec_config(true, 4, 2)).unwrap();
        let mut fec_messages = Vec::new();
        for (n, p) in payloads.iter().enumerate() {
            fec_messages = enc.push_frame(n as u32, p).unwrap();
        }

        let now = Instant::now();
        let mut asm = GroupAssembler::new(DEFAULT_WINDOW_GROUPS);
        asm.on_video_frame(1, &payloads[1]);
        asm.on_video_frame(3, &payloads[3]);
        asm.on_metadata(unwrap_meta(&fec_messages[0]), now);
        asm.on_shard(unwrap_shard(&fec_messages[1]));
        let o = asm.on_shard(unwrap_shard(&fec_messages[2]));

        assert_eq!(o.recovered.len(), 2);
        assert_eq!(o.recovered[0].frame_number, 0);
        assert_eq!(o.recovered[0].payload, payloads[0]);
        assert_eq!(o.recovered[1].frame_number, 2);
        assert_eq!(o.recovered[1].payload, payloads[2]);
    }

    #[test]
    fn complete_group_needs_no_recovery() {
        let payloads: Vec<Vec<u8>> = (0..2).map(|n| frame_payload(n, 20, false)).collect();
        let mut enc = GroupEncoder::new(fec_config(true, 2, 1)).unwrap();
        enc.push_frame(0, &payloads[0]).unwrap();
        let fec_messages = enc.push_frame(1, &payloads[1]).unwrap();

        let now = Instant::now();
        let mut asm = GroupAssembler::new(DEFAULT_WINDOW_GROUPS);
        asm.on_video_frame(0, &payloads[0]);
        asm.on_video_frame(1, &payloads[1]);
        let o = asm.on_metadata(unwrap_meta(&fec_messages[0]), now);
        assert!(o.recovered.is_empty());
        assert!(o.request_key_frame.is_none());
        // All data present: the group is dropped immediately.
        assert_eq!(asm.live_groups(), 0);
    }

    #[test]
    fn window_slide_abandons_lossy_group() {
        let now = Instant::now();
        let mut asm = GroupAssembler::new(2);

        let meta0 = FecGroupMetadata {
            group_id: 0,
            first_frame_seq: 0,
            data_shards: 2,
            parity_shards: 1,
            shard_length_bytes: 16,
            protected_seq_range: [0, 2],
        };
        asm.on_metadata(&meta0, now);
        assert_eq!(asm.live_groups(), 1);

        // Group 3 > 0 + W(2): group 0 is abandoned with loss.
        let meta3 = FecGroupMetadata { group_id: 3, first_frame_seq: 6, ..meta0 };
        let o = asm.on_metadata(&meta3, now);
        assert_eq!(o.request_key_frame, Some(KeyFrameReason::FecAbandoned));
        assert_eq!(asm.live_groups(), 1);
    }

    #[test]
    fn timeout_fires_without_further_traffic() {
        let start = Instant::now();
        let mut asm = GroupAssembler::new(DEFAULT_WINDOW_GROUPS);
        let meta = FecGroupMetadata {
            group_id: 0,
            first_frame_seq: 0,
            data_shards: 3,
            parity_shards: 1,
            shard_length_bytes: 8,
            protected_seq_range: [0, 3],
        };
        asm.on_metadata(&meta, start);

        // Below both floors: nothing expires.
        let o = asm.expire(start + Duration::from_millis(100), Duration::from_millis(20));
        assert!(o.request_key_frame.is_none());
        assert_eq!(asm.live_groups(), 1);

        // 250 ms floor dominates a 20 ms RTT.
        let o = asm.expire(start + Duration::from_millis(260), Duration::from_millis(20));
        assert_eq!(o.request_key_frame, Some(KeyFrameReason::FecAbandoned));
        assert_eq!(asm.live_groups(), 0);
    }

    #[test]
    fn timeout_scales_with_rtt() {
        let start = Instant::now();
        let mut asm = GroupAssembler::new(DEFAULT_WINDOW_GROUPS);
        let meta = FecGroupMetadata {
            group_id: 0,
            first_frame_seq: 0,
            data_shards: 2,
            parity_shards: 1,
            shard_length_bytes: 8,
            protected_seq_range: [0, 2],
        };
        asm.on_metadata(&meta, start);

        // 5 × 200 ms RTT = 1 s; 400 ms is not enough.
        let o = asm.expire(start + Duration::from_millis(400), Duration::from_millis(200));
        assert!(o.request_key_frame.is_none());
        let o = asm.expire(start + Duration::from_millis(1001), Duration::from_millis(200));
        assert_eq!(o.request_key_frame, Some(KeyFrameReason::FecAbandoned));
    }

    #[test]
    fn shard_size_mismatch_abandons_group() {
        let now = Instant::now();
        let mut asm = GroupAssembler::new(DEFAULT_WINDOW_GROUPS);
        let meta = FecGroupMetadata {
            group_id: 0,
            first_frame_seq: 0,
            data_shards: 2,
            parity_shards: 1,
            shard_length_bytes: 32,
            protected_seq_range: [0, 2],
        };
        asm.on_metadata(&meta, now);

        let bad = FecShard { group_id: 0, shard_index: 2, data: vec![0u8; 16] };
        let o = asm.on_shard(&bad);
        assert_eq!(o.request_key_frame, Some(KeyFrameReason::FecAbandoned));
        assert_eq!(asm.live_groups(), 0);
    }

    #[test]
    fn gap_detection_without_fec() {
        let mut asm = GroupAssembler::new(DEFAULT_WINDOW_GROUPS);
        assert!(asm.on_video_frame(5, b"x").request_key_frame.is_none());
        // Frame 6 lost entirely; with no FEC running, the gap is
        // immediately unrecoverable.
        let o = asm.on_video_frame(7, b"x");
        assert_eq!(o.request_key_frame, Some(KeyFrameReason::GapDetected));
    }

    #[test]
    fn gap_within_fec_window_is_tolerated() {
        let mut asm = GroupAssembler::new(4);
        asm.set_config(fec_config(true, 3, 2));
        asm.on_video_frame(0, b"x");
        // Gap of 5 frames is inside the 4·3 recoverable window.
        assert!(asm.on_video_frame(6, b"x").request_key_frame.is_none());
        // A gap beyond 12 frames is not.
        let o = asm.on_video_frame(25, b"x");
        assert_eq!(o.request_key_frame, Some(KeyFrameReason::GapDetected));
    }

    #[test]
    fn orphan_parity_shard_is_dropped() {
        let mut asm = GroupAssembler::new(DEFAULT_WINDOW_GROUPS);
        let shard = FecShard { group_id: 42, shard_index: 3, data: vec![0u8; 8] };
        let o = asm.on_shard(&shard);
        assert!(o.recovered.is_empty());
        assert!(o.request_key_frame.is_none());
    }
}
