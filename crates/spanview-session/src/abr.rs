//! Adaptive bitrate control: AIMD over receiver feedback.
//!
//! Loss (missing sequences) or an RTT blow-up past twice the baseline
//! triggers a multiplicative decrease; three consecutive clean intervals
//! earn an additive increase. Adjustments are spaced at least 200 ms
//! apart and clamped to the configured band.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use spanview_protocol::messages::ProtocolFeedback;

/// Minimum spacing between target adjustments.
pub const MIN_ADJUST_INTERVAL: Duration = Duration::from_millis(200);

/// Additive increase step.
const INCREASE_STEP_BPS: u32 = 250_000;

/// Multiplicative decrease factor.
const DECREASE_FACTOR: f64 = 0.7;

/// Clean intervals required before an increase.
const GOOD_INTERVALS_FOR_INCREASE: u32 = 3;

/// RTT samples kept for the baseline percentile.
const RTT_HISTORY: usize = 30;

pub struct AbrController {
    target_bps: u32,
    min_bps: u32,
    max_bps: u32,
    smoothed_rtt_ms: Option<f64>,
    rtt_history: VecDeque<u32>,
    consecutive_good: u32,
    last_adjust: Option<Instant>,
}

impl AbrController {
    pub fn new(initial_bps: u32, min_bps: u32, max_bps: u32) -> Self {
        Self {
            target_bps: initial_bps.clamp(min_bps, max_bps),
            min_bps,
            max_bps,
            smoothed_rtt_ms: None,
            rtt_history: VecDeque::with_capacity(RTT_HISTORY),
            consecutive_good: 0,
            last_adjust: None,
        }
    }

    pub fn target_bps(&self) -> u32 {
        self.target_bps
    }

    pub fn smoothed_rtt_ms(&self) -> Option<f64> {
        self.smoothed_rtt_ms
    }

    /// Process one feedback report. Returns the new target when it
    /// changed; the caller broadcasts it and notifies the encoder.
    pub fn on_feedback(&mut self, feedback: &ProtocolFeedback, now: Instant) -> Option<u32> {
        if self.rtt_history.len() == RTT_HISTORY {
            self.rtt_history.pop_front();
        }
        self.rtt_history.push_back(feedback.rtt_ms);

        let rtt = feedback.rtt_ms as f64;
        let smoothed = match self.smoothed_rtt_ms {
            Some(prev) => 0.8 * prev + 0.2 * rtt,
            None => rtt,
        };
        self.smoothed_rtt_ms = Some(smoothed);

        // Smoothing always runs; the decision itself is rate-limited.
        if let Some(last) = self.last_adjust {
            if now.duration_since(last) < MIN_ADJUST_INTERVAL {
                return None;
            }
        }

        let baseline = self.baseline_rtt_ms();
        let congested = feedback.missing_sequence_delta > 0 || smoothed > 2.0 * baseline;

        if congested {
            let decreased = ((self.target_bps as f64) * DECREASE_FACTOR) as u32;
            let new_target = decreased.max(self.min_bps);
            self.consecutive_good = 0;
            if new_target != self.target_bps {
                debug!(
                    from = self.target_bps,
                    to = new_target,
                    missing = feedback.missing_sequence_delta,
                    smoothed_rtt_ms = smoothed,
                    "ABR decrease"
                );
                self.target_bps = new_target;
                self.last_adjust = Some(now);
                return Some(new_target);
            }
            self.last_adjust = Some(now);
            return None;
        }

        self.consecutive_good += 1;
        if self.consecutive_good >= GOOD_INTERVALS_FOR_INCREASE {
            self.consecutive_good = 0;
            let new_target = self.target_bps.saturating_add(INCREASE_STEP_BPS).min(self.max_bps);
            if new_target != self.target_bps {
                debug!(from = self.target_bps, to = new_target, "ABR increase");
                self.target_bps = new_target;
                self.last_adjust = Some(now);
                return Some(new_target);
            }
        }
        None
    }

    /// 30th-percentile RTT over the last 30 intervals; the minimum seen
    /// while history is still short.
    fn baseline_rtt_ms(&self) -> f64 {
        if self.rtt_history.is_empty() {
            return 0.0;
        }
        if self.rtt_history.len() < RTT_HISTORY {
            return *self.rtt_history.iter().min().unwrap_or(&0) as f64;
        }
        let mut sorted: Vec<u32> = self.rtt_history.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() as f64 * 0.3) as usize;
        sorted[idx.min(sorted.len() - 1)] as f64
    }
}
