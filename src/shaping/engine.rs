//! Admission Policy Engine
//!
//! Combines the heavy-hitter detector with the pod-wide aggregate bucket and
//! the per-flow buckets into one decision per traffic event, driving each
//! flow through `Normal -> Flagged -> Throttled -> Normal`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use super::bucket::{Consume, TokenBucket};
use super::clock::Timestamp;
use super::config::{EngineSettings, EnforcementMode};
use super::detector::HeavyHitterDetector;
use super::flow::{FlowKey, FlowPhase, FlowSnapshot, FlowState};
use super::sketch::CountMinSketch;
use crate::metrics;
use crate::policy::{PolicyConfig, ValidationError};

/// Verdict for one traffic event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Let the traffic through
    Admit,

    /// Transient congestion: retry after the wait
    Delay(Duration),

    /// Heavy hitter over the pod limit: hold back for at least the wait
    Throttle(Duration),

    /// Not admitted and the caller cannot queue
    Drop,
}

impl Decision {
    /// Short lowercase name, used for logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Admit => "admit",
            Decision::Delay(_) => "delay",
            Decision::Throttle(_) => "throttle",
            Decision::Drop => "drop",
        }
    }

    /// Whether the traffic was admitted
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    /// Suggested wait, if any
    pub fn wait(&self) -> Option<Duration> {
        match self {
            Decision::Delay(wait) | Decision::Throttle(wait) => Some(*wait),
            Decision::Admit | Decision::Drop => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.wait() {
            Some(wait) => write!(f, "{} {:?}", self.kind(), wait),
            None => f.write_str(self.kind()),
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Whether the sketch was decayed
    pub decayed: bool,

    /// Idle flows removed
    pub evicted: usize,

    /// Flows returned to `Normal` after their deadline
    pub demoted: usize,

    /// Flows still tracked
    pub tracked: usize,
}

/// Shaping engine for one pod
#[derive(Debug)]
pub struct ShapingEngine {
    policy: PolicyConfig,
    settings: EngineSettings,
    detector: HeavyHitterDetector,
    aggregate: TokenBucket,
    flows: DashMap<FlowKey, FlowState>,
    cool_down: Duration,

    /// Set while a reconciliation pass runs
    sweeping: AtomicBool,
}

impl ShapingEngine {
    /// Build an engine with all clocks starting at `now`
    ///
    /// # Errors
    ///
    /// Returns the first constraint violated by the policy or the settings.
    pub fn new(
        policy: PolicyConfig,
        settings: EngineSettings,
        now: Timestamp,
    ) -> Result<Self, ValidationError> {
        policy.validate()?;
        settings.validate()?;

        let sketch = match settings.hash_seed {
            Some(seed) => CountMinSketch::with_seed(policy.sketch_width, policy.sketch_depth, seed),
            None => CountMinSketch::new(policy.sketch_width, policy.sketch_depth),
        };
        let detector = HeavyHitterDetector::new(
            sketch,
            non_negative(policy.heavy_hitter_threshold),
            settings.decay_interval(),
            settings.decay_mode,
            now,
        );
        let aggregate = TokenBucket::new_at(non_negative(policy.burst), non_negative(policy.rate), now);

        debug!(
            rate = policy.rate,
            burst = policy.burst,
            width = policy.sketch_width,
            depth = policy.sketch_depth,
            threshold = policy.heavy_hitter_threshold,
            enforcement = ?settings.enforcement,
            "shaping engine created"
        );

        Ok(Self {
            cool_down: settings.cool_down(),
            policy,
            settings,
            detector,
            aggregate,
            flows: DashMap::new(),
            sweeping: AtomicBool::new(false),
        })
    }

    /// Decide one traffic event of `bytes` on `flow` observed at `now`
    pub fn on_event(&self, flow: FlowKey, bytes: u64, now: Timestamp) -> Decision {
        if self.policy.is_unlimited() {
            return self.finish(Decision::Admit, bytes);
        }

        self.detector.update(&flow, bytes);
        let heavy = self.detector.is_heavy(&flow, now);

        let mut state = match self.flows.entry(flow) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                metrics::TRACKED_FLOWS.inc();
                trace!(flow = %flow, "tracking new flow");
                entry.insert(FlowState::new(self.flow_bucket(now), now))
            }
        };
        state.last_seen = state.last_seen.max(now);
        state.bytes_seen = state.bytes_seen.saturating_add(bytes);

        let before = state.phase;
        let deadline = now + self.cool_down;
        let mut phase = before;

        if let Some(streak) = state.observe_heavy(heavy, self.detector.decay_count(), now) {
            phase = match phase {
                FlowPhase::Normal if streak >= self.detector.decay_interval() => {
                    FlowPhase::Flagged { until: deadline }
                }
                FlowPhase::Normal => FlowPhase::Normal,
                escalated => escalated.extend(deadline),
            };
        }

        let decision = match self.aggregate.try_consume(bytes, now) {
            Consume::Rejected { available_in } => match phase {
                FlowPhase::Normal => Decision::Delay(available_in),
                FlowPhase::Flagged { .. } => {
                    phase = FlowPhase::Throttled {
                        cool_down_until: deadline,
                    };
                    Decision::Throttle(available_in)
                }
                FlowPhase::Throttled { .. } => Decision::Throttle(available_in),
            },
            Consume::Admitted => match phase {
                FlowPhase::Throttled { .. } => match state.bucket.try_consume(bytes, now) {
                    Consume::Rejected { available_in } => {
                        self.aggregate.refund(bytes);
                        Decision::Throttle(available_in)
                    }
                    Consume::Admitted => {
                        if !heavy && phase.expired(now) {
                            phase = FlowPhase::Normal;
                        }
                        Decision::Admit
                    }
                },
                FlowPhase::Flagged { .. } => {
                    if !heavy && phase.expired(now) {
                        phase = FlowPhase::Normal;
                    }
                    Decision::Admit
                }
                FlowPhase::Normal => Decision::Admit,
            },
        };

        state.phase = phase;
        drop(state);

        record_transition(&flow, before, phase);
        self.finish(decision, bytes)
    }

    /// Apply the enforcement mode and count the decision
    fn finish(&self, decision: Decision, bytes: u64) -> Decision {
        let decision = match (self.settings.enforcement, decision) {
            (EnforcementMode::Police, Decision::Delay(_) | Decision::Throttle(_)) => Decision::Drop,
            (_, decision) => decision,
        };
        metrics::DECISIONS_TOTAL
            .with_label_values(&[decision.kind()])
            .inc();
        if !decision.is_admit() {
            metrics::REJECTED_BYTES_TOTAL.inc_by(bytes);
        }
        decision
    }

    fn flow_bucket(&self, now: Timestamp) -> TokenBucket {
        TokenBucket::new_at(
            non_negative(self.policy.flow_burst),
            non_negative(self.policy.flow_rate),
            now,
        )
    }

    /// Decay the sketch if due, evict idle flows and demote flows whose
    /// deadline passed while light
    ///
    /// Returns `None` without doing anything if another pass is running.
    pub fn reconcile(&self, now: Timestamp) -> Option<SweepReport> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("reconciliation already running, skipping");
            return None;
        }
        let _guard = SweepGuard(&self.sweeping);

        let decayed = self.detector.decay_due(now);
        if decayed {
            self.detector.decay(now);
            metrics::SKETCH_DECAYS_TOTAL.inc();
        }

        let idle_timeout = self.settings.idle_timeout();
        let mut evicted = 0;
        let mut demoted = 0;
        self.flows.retain(|flow, state| {
            if state.is_idle(now, idle_timeout) {
                trace!(flow = %flow, phase = %state.phase, "evicting idle flow");
                evicted += 1;
                return false;
            }
            if state.phase.expired(now) && !self.detector.is_heavy(flow, now) {
                record_transition(flow, state.phase, FlowPhase::Normal);
                state.phase = FlowPhase::Normal;
                state.heavy_since = None;
                demoted += 1;
            }
            true
        });

        if evicted > 0 {
            metrics::FLOWS_EVICTED_TOTAL.inc_by(evicted as u64);
            metrics::TRACKED_FLOWS.sub(evicted as i64);
        }

        let report = SweepReport {
            decayed,
            evicted,
            demoted,
            tracked: self.flows.len(),
        };
        trace!(?report, "reconciliation pass finished");
        Some(report)
    }

    /// Forget every tracked flow, returning how many were dropped
    pub fn release_flows(&self) -> usize {
        let mut released = 0;
        self.flows.retain(|_, _| {
            released += 1;
            false
        });
        metrics::TRACKED_FLOWS.sub(released as i64);
        released
    }

    /// Phase of `flow`, if tracked
    pub fn flow_phase(&self, flow: &FlowKey) -> Option<FlowPhase> {
        self.flows.get(flow).map(|state| state.phase)
    }

    /// Number of tracked flows
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Snapshot of every tracked flow, ordered by key
    pub fn flow_snapshot(&self) -> Vec<FlowSnapshot> {
        let mut flows: Vec<(FlowKey, FlowSnapshot)> = self
            .flows
            .iter()
            .map(|entry| {
                let state = entry.value();
                let snapshot = FlowSnapshot {
                    flow: entry.key().to_string(),
                    phase: state.phase,
                    tokens: state.bucket.available(),
                    bytes_seen: state.bytes_seen,
                    last_seen: state.last_seen,
                };
                (*entry.key(), snapshot)
            })
            .collect();
        flows.sort_by(|a, b| a.0.cmp(&b.0));
        flows.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    /// Policy in force
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Engine settings
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Heavy-hitter detector
    pub fn detector(&self) -> &HeavyHitterDetector {
        &self.detector
    }

    /// Pod-wide bucket
    pub fn aggregate(&self) -> &TokenBucket {
        &self.aggregate
    }

    /// Cool-down window applied on escalation
    pub fn cool_down(&self) -> Duration {
        self.cool_down
    }
}

impl Drop for ShapingEngine {
    fn drop(&mut self) {
        metrics::TRACKED_FLOWS.sub(self.flows.len() as i64);
    }
}

struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn record_transition(flow: &FlowKey, from: FlowPhase, to: FlowPhase) {
    if from.name() == to.name() {
        return;
    }
    debug!(flow = %flow, from = from.name(), to = to.name(), "flow phase changed");
    metrics::PHASE_TRANSITIONS_TOTAL
        .with_label_values(&[from.name(), to.name()])
        .inc();
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaping::sketch::DecayMode;

    fn ms(n: u64) -> Timestamp {
        Timestamp::from_millis(n)
    }

    fn engine(policy: PolicyConfig) -> ShapingEngine {
        ShapingEngine::new(policy, EngineSettings::seeded(7), Timestamp::ZERO).unwrap()
    }

    fn limited(rate: i64, burst: i64) -> PolicyConfig {
        PolicyConfig {
            burst,
            flow_burst: burst,
            ..PolicyConfig::from_rate(rate)
        }
    }

    #[test]
    fn test_unlimited_admits_everything() {
        let engine = engine(PolicyConfig::unlimited());
        let flow = FlowKey::from_id(1);
        for i in 0..100 {
            assert_eq!(engine.on_event(flow, u64::MAX / 2, ms(i)), Decision::Admit);
        }
        assert_eq!(engine.flow_count(), 0);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let policy = PolicyConfig {
            sketch_width: 0,
            ..PolicyConfig::from_rate(1000)
        };
        assert!(ShapingEngine::new(policy, EngineSettings::default(), Timestamp::ZERO).is_err());
    }

    #[test]
    fn test_out_of_range_settings_rejected() {
        let settings = EngineSettings {
            decay_interval_ms: u64::MAX,
            cool_down_multiple: u32::MAX,
            ..EngineSettings::seeded(7)
        };
        let err = ShapingEngine::new(limited(1000, 2000), settings, Timestamp::ZERO).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::SettingOutOfRange {
                field: "engine.decay_interval_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_single_oversized_event_is_delayed() {
        let engine = engine(limited(1000, 2000));
        let flow = FlowKey::from_id(1);

        match engine.on_event(flow, 2500, ms(0)) {
            Decision::Delay(wait) => assert!(wait > Duration::ZERO),
            other => panic!("expected delay, got {other:?}"),
        }
        assert_eq!(engine.flow_phase(&flow), Some(FlowPhase::Normal));
        // nothing was taken from the aggregate bucket
        assert_eq!(engine.aggregate().available(), 2000);
    }

    #[test]
    fn test_sustained_heavy_flow_is_flagged_then_throttled() {
        let engine = engine(limited(1000, 20_000));
        let flow = FlowKey::from_id(1);

        let mut flagged_at = None;
        let mut throttled_at = None;
        for tick in 1..=100u64 {
            let now = ms(tick * 100);
            let decision = engine.on_event(flow, 500, now);
            match engine.flow_phase(&flow) {
                Some(FlowPhase::Flagged { .. }) if flagged_at.is_none() => flagged_at = Some(tick),
                Some(FlowPhase::Throttled { .. }) if throttled_at.is_none() => {
                    assert!(matches!(decision, Decision::Throttle(_)));
                    throttled_at = Some(tick);
                }
                _ => {}
            }
            engine.reconcile(now);
        }

        let flagged_at = flagged_at.expect("flow was never flagged");
        let throttled_at = throttled_at.expect("flow was never throttled");
        // heavy from the third tick, flagged one decay interval later
        assert!(flagged_at >= 13);
        assert!(throttled_at > flagged_at);
    }

    #[test]
    fn test_sustained_heavy_flow_is_throttled_with_reset_decay() {
        let settings = EngineSettings {
            decay_mode: DecayMode::Reset,
            ..EngineSettings::seeded(7)
        };
        let engine = ShapingEngine::new(limited(1000, 20_000), settings, Timestamp::ZERO).unwrap();
        let flow = FlowKey::from_id(1);

        let mut flagged_at = None;
        let mut throttled_at = None;
        for tick in 1..=100u64 {
            let now = ms(tick * 100);
            let decision = engine.on_event(flow, 500, now);
            match engine.flow_phase(&flow) {
                Some(FlowPhase::Flagged { .. }) if flagged_at.is_none() => flagged_at = Some(tick),
                Some(FlowPhase::Throttled { .. }) if throttled_at.is_none() => {
                    assert!(matches!(decision, Decision::Throttle(_)));
                    throttled_at = Some(tick);
                }
                _ => {}
            }
            engine.reconcile(now);
        }

        // heavy from 300ms; counters restart every second, yet the run carries over
        assert_eq!(flagged_at, Some(13));
        let throttled_at = throttled_at.expect("flow was never throttled");
        assert!(throttled_at > 13);
    }

    #[test]
    fn test_light_flow_stays_normal() {
        let engine = engine(limited(100_000, 200_000));
        let flow = FlowKey::from_id(2);
        for tick in 1..=50u64 {
            let now = ms(tick * 100);
            assert_eq!(engine.on_event(flow, 50, now), Decision::Admit);
            engine.reconcile(now);
        }
        assert_eq!(engine.flow_phase(&flow), Some(FlowPhase::Normal));
    }

    #[test]
    fn test_police_mode_drops() {
        let settings = EngineSettings {
            enforcement: EnforcementMode::Police,
            ..EngineSettings::seeded(7)
        };
        let engine = ShapingEngine::new(limited(1000, 2000), settings, Timestamp::ZERO).unwrap();
        assert_eq!(engine.on_event(FlowKey::from_id(1), 2500, ms(0)), Decision::Drop);
        assert_eq!(engine.on_event(FlowKey::from_id(1), 100, ms(0)), Decision::Admit);
    }

    #[test]
    fn test_throttled_flow_needs_its_own_bucket() {
        let policy = PolicyConfig {
            flow_rate: 100,
            flow_burst: 100,
            ..limited(1_000_000, 1_000_000)
        };
        let engine = engine(policy);
        let flow = FlowKey::from_id(3);
        engine.on_event(flow, 1, ms(0));
        engine.flows.get_mut(&flow).unwrap().phase = FlowPhase::Throttled {
            cool_down_until: ms(3000),
        };

        let before = engine.aggregate().available_at(ms(1));
        assert!(matches!(engine.on_event(flow, 500, ms(1)), Decision::Throttle(_)));
        // the aggregate tokens taken for the rejected event were given back
        assert_eq!(engine.aggregate().available(), before);
        assert!(matches!(engine.flow_phase(&flow), Some(FlowPhase::Throttled { .. })));
    }

    #[test]
    fn test_throttled_flow_recovers_after_cool_down() {
        let policy = PolicyConfig {
            heavy_hitter_threshold: 1_000_000,
            ..limited(1_000_000, 1_000_000)
        };
        let engine = engine(policy);
        let flow = FlowKey::from_id(4);
        engine.on_event(flow, 1, ms(0));
        engine.flows.get_mut(&flow).unwrap().phase = FlowPhase::Throttled {
            cool_down_until: ms(3000),
        };

        assert_eq!(engine.on_event(flow, 10, ms(2000)), Decision::Admit);
        assert!(matches!(engine.flow_phase(&flow), Some(FlowPhase::Throttled { .. })));
        assert_eq!(engine.on_event(flow, 10, ms(3000)), Decision::Admit);
        assert_eq!(engine.flow_phase(&flow), Some(FlowPhase::Normal));
    }

    #[test]
    fn test_reconcile_evicts_idle_flows() {
        let engine = engine(limited(1000, 2000));
        engine.on_event(FlowKey::from_id(1), 10, ms(0));
        engine.on_event(FlowKey::from_id(2), 10, Timestamp::from_secs(50));
        assert_eq!(engine.flow_count(), 2);

        let report = engine.reconcile(Timestamp::from_secs(61)).unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.tracked, 1);
        assert!(report.decayed);
        assert!(engine.flow_phase(&FlowKey::from_id(1)).is_none());
        assert!(engine.flow_phase(&FlowKey::from_id(2)).is_some());
    }

    #[test]
    fn test_reconcile_demotes_expired_flags() {
        let engine = engine(limited(1000, 2000));
        let flow = FlowKey::from_id(5);
        engine.on_event(flow, 10, ms(0));
        engine.flows.get_mut(&flow).unwrap().phase = FlowPhase::Flagged { until: ms(500) };

        let report = engine.reconcile(ms(600)).unwrap();
        assert_eq!(report.demoted, 1);
        assert_eq!(engine.flow_phase(&flow), Some(FlowPhase::Normal));
    }

    #[test]
    fn test_reconcile_skips_when_already_running() {
        let engine = engine(limited(1000, 2000));
        engine.sweeping.store(true, Ordering::Release);
        assert!(engine.reconcile(ms(5000)).is_none());
        engine.sweeping.store(false, Ordering::Release);
        assert!(engine.reconcile(ms(5000)).is_some());
    }

    #[test]
    fn test_flow_snapshot_is_ordered() {
        let engine = engine(limited(1000, 2000));
        engine.on_event(FlowKey::from_label("b").unwrap(), 10, ms(0));
        engine.on_event(FlowKey::from_label("a").unwrap(), 20, ms(0));

        let snapshot = engine.flow_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].flow, "a");
        assert_eq!(snapshot[0].bytes_seen, 20);
        assert_eq!(snapshot[1].flow, "b");
    }

    #[test]
    fn test_decision_display() {
        assert_eq!(Decision::Admit.to_string(), "admit");
        assert_eq!(Decision::Delay(Duration::from_millis(5)).to_string(), "delay 5ms");
        assert_eq!(Decision::Drop.wait(), None);
    }
}
