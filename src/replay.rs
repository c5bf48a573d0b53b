//! Trace Replay
//!
//! Feeds a recorded traffic trace through a [`CoreHandle`] on trace time,
//! running reconciliation whenever a sweep interval has elapsed between
//! events. Traces are JSON lines:
//!
//! ```text
//! {"flow": "pod-a", "bytes": 1500, "at_ms": 0}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::time::Duration;

use crate::shaping::{
    CoreHandle, Decision, FlowKey, FlowSnapshot, ReconciliationDriver, Timestamp,
};

/// One recorded traffic event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Flow label, at most 40 bytes
    pub flow: String,

    /// Bytes observed
    pub bytes: u64,

    /// Observation time in milliseconds since the start of the trace
    pub at_ms: u64,
}

/// Outcome of one replayed event
#[derive(Debug, Clone, Serialize)]
pub struct ReplayRecord {
    /// Trace time of the event in milliseconds
    pub at_ms: u64,

    /// Flow label from the trace
    pub flow: String,

    /// Bytes in the event
    pub bytes: u64,

    /// Decision kind (`admit`, `delay`, `throttle` or `drop`)
    pub decision: &'static str,

    /// Suggested wait for `delay` and `throttle`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<f64>,

    /// Flow phase after the event; absent for unlimited policies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<&'static str>,
}

/// Totals for a replay
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaySummary {
    /// Events replayed
    pub events: u64,

    /// Events admitted
    pub admitted: u64,

    /// Events delayed
    pub delayed: u64,

    /// Events throttled
    pub throttled: u64,

    /// Events dropped
    pub dropped: u64,

    /// Bytes in admitted events
    pub admitted_bytes: u64,

    /// Bytes in events that were not admitted
    pub rejected_bytes: u64,

    /// Reconciliation passes run
    pub sweeps: u64,

    /// Flows evicted as idle during the replay
    pub evicted: u64,

    /// Flows still tracked at the end, ordered by key
    pub flows: Vec<FlowSnapshot>,
}

impl ReplaySummary {
    fn record(&mut self, decision: Decision, bytes: u64) {
        self.events += 1;
        match decision {
            Decision::Admit => {
                self.admitted += 1;
                self.admitted_bytes = self.admitted_bytes.saturating_add(bytes);
            }
            Decision::Delay(_) => self.delayed += 1,
            Decision::Throttle(_) => self.throttled += 1,
            Decision::Drop => self.dropped += 1,
        }
        if !decision.is_admit() {
            self.rejected_bytes = self.rejected_bytes.saturating_add(bytes);
        }
    }
}

/// Read a JSON-lines trace
///
/// # Errors
///
/// Fails on I/O errors and on the first malformed line, naming its number.
pub fn read_trace<R: BufRead>(reader: R) -> Result<Vec<TraceEvent>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read trace")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event: TraceEvent = serde_json::from_str(line)
            .with_context(|| format!("Invalid trace event on line {}", index + 1))?;
        events.push(event);
    }
    Ok(events)
}

/// Replay `events` through `handle`, calling `on_record` after each event
///
/// The handle should have been created at trace time zero
/// (see [`CoreHandle::init_at`]).
///
/// # Errors
///
/// Fails if a flow label does not fit in a [`FlowKey`].
pub fn replay<F>(handle: &CoreHandle, events: &[TraceEvent], mut on_record: F) -> Result<ReplaySummary>
where
    F: FnMut(&ReplayRecord),
{
    let driver = ReconciliationDriver::new(handle.clone());
    let tick = driver.tick();
    let mut next_sweep = Timestamp::ZERO + tick;
    let mut summary = ReplaySummary::default();

    for event in events {
        let flow = FlowKey::from_label(&event.flow)
            .with_context(|| format!("Flow label too long: {:?}", event.flow))?;
        let now = Timestamp::from_millis(event.at_ms);

        if now >= next_sweep {
            if let Some(report) = driver.run_once(now) {
                summary.sweeps += 1;
                summary.evicted += report.evicted as u64;
            }
            next_sweep = now + tick;
        }

        let decision = handle.on_event(flow, event.bytes, now);
        summary.record(decision, event.bytes);

        let phase = handle
            .engine()
            .and_then(|engine| engine.flow_phase(&flow))
            .map(|phase| phase.name());
        on_record(&ReplayRecord {
            at_ms: event.at_ms,
            flow: event.flow.clone(),
            bytes: event.bytes,
            decision: decision.kind(),
            wait_ms: decision.wait().map(as_millis_f64),
            phase,
        });
    }

    if let Some(engine) = handle.engine() {
        summary.flows = engine.flow_snapshot();
    }
    Ok(summary)
}

fn as_millis_f64(wait: Duration) -> f64 {
    wait.as_secs_f64() * 1000.0
}
