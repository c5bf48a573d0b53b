//! Traffic Shaping Core
//!
//! Per-pod admission decisions for observed traffic. Each event is fed to a
//! count-min sketch based heavy-hitter detector and charged against a pod-wide
//! token bucket; flows that keep exceeding the heavy-hitter threshold are
//! flagged and, once the pod bucket runs dry, throttled against their own
//! per-flow bucket until they cool down.
//!
//! # Architecture
//!
//! ```text
//! CoreHandle ── ShapingEngine ──┬── HeavyHitterDetector ── CountMinSketch
//!                               ├── TokenBucket (aggregate)
//!                               └── DashMap<FlowKey, FlowState>
//!                                                  └── TokenBucket (per flow)
//! ReconciliationDriver ── decay + idle sweep on a timer
//! ```
//!
//! The event path never blocks and never fails: sketch cells and bucket tokens
//! are atomics, flow state lives behind sharded locks, and a torn-down handle
//! admits everything.

pub mod bucket;
pub mod clock;
pub mod config;
pub mod detector;
pub mod driver;
pub mod engine;
pub mod flow;
pub mod handle;
pub mod sketch;

#[cfg(test)]
mod proptests;

pub use bucket::{Consume, TokenBucket};
pub use clock::Timestamp;
pub use config::{EngineSettings, EnforcementMode};
pub use detector::HeavyHitterDetector;
pub use driver::{DriverTask, ReconciliationDriver};
pub use engine::{Decision, ShapingEngine, SweepReport};
pub use flow::{FlowKey, FlowPhase, FlowSnapshot, FlowState, FLOW_KEY_LEN};
pub use handle::{CoreError, CoreHandle};
pub use sketch::{CountMinSketch, DecayMode};
