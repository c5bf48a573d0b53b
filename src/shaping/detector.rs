//! Heavy-Hitter Detector
//!
//! Wraps a [`CountMinSketch`] with the time bookkeeping needed to compare raw
//! byte totals against a threshold expressed in bytes per second.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::clock::Timestamp;
use super::flow::FlowKey;
use super::sketch::{CountMinSketch, DecayMode};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Detects flows whose byte rate exceeds a threshold
#[derive(Debug)]
pub struct HeavyHitterDetector {
    sketch: CountMinSketch,

    /// Threshold in bytes per second
    threshold: u64,

    /// Nominal time between decays
    decay_interval: Duration,

    decay_mode: DecayMode,

    /// Nanosecond timestamp of the last decay (or of creation)
    last_decay: AtomicU64,

    /// Number of decays applied
    decays: AtomicU64,
}

impl HeavyHitterDetector {
    /// Create a detector whose measurement window starts at `now`
    pub fn new(
        sketch: CountMinSketch,
        threshold: u64,
        decay_interval: Duration,
        decay_mode: DecayMode,
        now: Timestamp,
    ) -> Self {
        Self {
            sketch,
            threshold,
            decay_interval,
            decay_mode,
            last_decay: AtomicU64::new(now.as_nanos()),
            decays: AtomicU64::new(0),
        }
    }

    /// Record `bytes` for `flow`
    pub fn update(&self, flow: &FlowKey, bytes: u64) {
        self.sketch.update(flow, bytes);
    }

    /// Estimated bytes for `flow` since the sketch was last cleared,
    /// including decayed history
    pub fn estimate(&self, flow: &FlowKey) -> u64 {
        self.sketch.estimate(flow)
    }

    /// Time span the counters currently represent
    ///
    /// Elapsed time since the last decay, plus one interval of carried history
    /// once a halving decay has happened (a flow at a steady rate `r` holds
    /// `r * interval` right after halving). Never shorter than one interval so
    /// that a burst at the start of a window is judged against a full window
    /// of budget.
    pub fn window(&self, now: Timestamp) -> Duration {
        let last = Timestamp::from_nanos(self.last_decay.load(Ordering::Acquire));
        let mut window = now.saturating_duration_since(last);
        if self.decay_mode == DecayMode::Halve && self.decays.load(Ordering::Acquire) > 0 {
            window = window.saturating_add(self.decay_interval);
        }
        window.max(self.decay_interval)
    }

    /// Byte budget a flow running exactly at the threshold would have used
    /// over the current window
    pub fn budget(&self, now: Timestamp) -> u64 {
        let window = self.window(now).as_nanos();
        u64::try_from(u128::from(self.threshold).saturating_mul(window) / NANOS_PER_SEC)
            .unwrap_or(u64::MAX)
    }

    /// Whether `flow` is currently sending faster than the threshold
    pub fn is_heavy(&self, flow: &FlowKey, now: Timestamp) -> bool {
        self.estimate(flow) > self.budget(now)
    }

    /// Whether a decay interval has elapsed since the last decay
    pub fn decay_due(&self, now: Timestamp) -> bool {
        let last = Timestamp::from_nanos(self.last_decay.load(Ordering::Acquire));
        now.saturating_duration_since(last) >= self.decay_interval
    }

    /// Decay the sketch and restart the measurement window at `now`
    pub fn decay(&self, now: Timestamp) {
        self.sketch.decay(self.decay_mode);
        self.last_decay.fetch_max(now.as_nanos(), Ordering::AcqRel);
        self.decays.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(mode = ?self.decay_mode, total = self.sketch.total(), "sketch decayed");
    }

    /// Number of decays applied so far
    pub fn decay_count(&self) -> u64 {
        self.decays.load(Ordering::Acquire)
    }

    /// Threshold in bytes per second
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Nominal decay interval
    pub fn decay_interval(&self) -> Duration {
        self.decay_interval
    }
}
