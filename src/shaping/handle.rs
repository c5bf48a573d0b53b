//! Core Handle
//!
//! The value an attachment layer keeps per pod interface. It drives one
//! [`ShapingEngine`] until torn down and fails open: a torn-down handle
//! admits everything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::clock::Timestamp;
use super::config::EngineSettings;
use super::engine::{Decision, ShapingEngine};
use super::flow::FlowKey;
use crate::policy::{parse_policy, ParseError, PolicyConfig, ValidationError};

/// Errors building a handle from a policy string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The policy string could not be parsed
    #[error("invalid bandwidth policy: {0}")]
    Parse(#[from] ParseError),

    /// The parsed policy is out of range
    #[error("rejected bandwidth policy: {0}")]
    Validation(#[from] ValidationError),
}

/// Shared handle to a shaping engine
///
/// Clones share the same engine; tearing down through any clone affects all
/// of them. The engine's flow table is released on teardown and the rest of
/// it when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct CoreHandle {
    engine: Arc<ShapingEngine>,
    active: Arc<AtomicBool>,
}

impl CoreHandle {
    /// Build a handle for an already-parsed policy
    pub fn init(policy: PolicyConfig, settings: EngineSettings) -> Result<Self, ValidationError> {
        Self::init_at(policy, settings, Timestamp::now())
    }

    /// Build a handle whose clocks start at `now`, for callers that stamp
    /// events with their own time source
    pub fn init_at(
        policy: PolicyConfig,
        settings: EngineSettings,
        now: Timestamp,
    ) -> Result<Self, ValidationError> {
        let engine = ShapingEngine::new(policy, settings, now)?;
        info!(
            rate = engine.policy().rate,
            burst = engine.policy().burst,
            unlimited = engine.policy().is_unlimited(),
            "bandwidth shaping attached"
        );
        Ok(Self {
            engine: Arc::new(engine),
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Parse a policy string and build a handle for it
    pub fn from_policy(input: &str, settings: EngineSettings) -> Result<Self, CoreError> {
        let policy = parse_policy(input)?;
        Ok(Self::init(policy, settings)?)
    }

    /// Decide one traffic event; admits when the handle has been torn down
    pub fn on_event(&self, flow: FlowKey, bytes: u64, now: Timestamp) -> Decision {
        if !self.is_active() {
            return Decision::Admit;
        }
        self.engine.on_event(flow, bytes, now)
    }

    /// Detach the engine and release its flow table
    ///
    /// Returns `false` if the handle was already torn down.
    pub fn teardown(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            debug!("teardown on inactive handle");
            return false;
        }
        let released = self.engine.release_flows();
        info!(flows = released, "bandwidth shaping detached");
        true
    }

    /// Whether the handle has not been torn down
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The engine, unless torn down
    pub fn engine(&self) -> Option<Arc<ShapingEngine>> {
        self.is_active().then(|| Arc::clone(&self.engine))
    }
}
