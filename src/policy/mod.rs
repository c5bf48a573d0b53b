//! Bandwidth Policy
//!
//! Turns the bandwidth declaration attached to a pod into a fully-resolved
//! [`PolicyConfig`]. Two input forms are accepted:
//!
//! - a bare suffixed quantity such as `10M` or `512Ki`, taken as the pod-wide rate
//! - a JSON document (see [`document`]) carrying rate, burst, sketch dimensions,
//!   the heavy-hitter threshold and per-flow bucket overrides
//!
//! An empty declaration yields a pass-through policy (`rate == 0`, unlimited).

mod document;
pub mod error;
pub mod quantity;

pub use error::{ParseError, ValidationError};
pub use quantity::{format_bandwidth, humanize_bandwidth, parse_bandwidth, BandwidthSuffix};

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default counters per sketch row
pub const DEFAULT_SKETCH_WIDTH: usize = 1024;

/// Default number of sketch rows
pub const DEFAULT_SKETCH_DEPTH: usize = 4;

/// Default heavy-hitter threshold in bytes per second
pub const DEFAULT_HEAVY_HITTER_THRESHOLD: i64 = 1000;

/// Upper bound on `width * depth` accepted by validation (128 MiB of counters)
pub const MAX_SKETCH_CELLS: usize = 1 << 24;

/// Resolved bandwidth policy
///
/// Immutable once built; changing the policy means building a new engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Pod-wide ceiling in bytes per second (0 = unlimited)
    pub rate: i64,

    /// Pod-wide bucket capacity in bytes
    pub burst: i64,

    /// Counters per sketch row
    pub sketch_width: usize,

    /// Independent sketch rows
    pub sketch_depth: usize,

    /// Per-flow rate (bytes/sec) above which a flow is a heavy hitter
    pub heavy_hitter_threshold: i64,

    /// Per-flow bucket refill rate in bytes per second
    pub flow_rate: i64,

    /// Per-flow bucket capacity in bytes
    pub flow_burst: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rate: 0,
            burst: 0,
            sketch_width: DEFAULT_SKETCH_WIDTH,
            sketch_depth: DEFAULT_SKETCH_DEPTH,
            heavy_hitter_threshold: DEFAULT_HEAVY_HITTER_THRESHOLD,
            flow_rate: 0,
            flow_burst: 0,
        }
    }
}

impl PolicyConfig {
    /// Pass-through policy that never limits
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Policy for a bare rate: burst is twice the rate and the per-flow
    /// bucket mirrors the aggregate one
    pub fn from_rate(rate: i64) -> Self {
        let burst = rate.saturating_mul(2);
        Self {
            rate,
            burst,
            flow_rate: rate,
            flow_burst: burst,
            ..Self::default()
        }
    }

    /// Whether this policy disables limiting entirely
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Check the policy is usable by the shaping engine
    ///
    /// `burst >= rate` is recommended but not enforced.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sketch_width == 0 {
            return Err(ValidationError::NonPositiveDimension { field: "cms.width" });
        }
        if self.sketch_depth == 0 {
            return Err(ValidationError::NonPositiveDimension { field: "cms.depth" });
        }
        if self
            .sketch_width
            .checked_mul(self.sketch_depth)
            .map_or(true, |cells| cells > MAX_SKETCH_CELLS)
        {
            return Err(ValidationError::SketchTooLarge {
                width: self.sketch_width,
                depth: self.sketch_depth,
            });
        }
        if self.rate < 0 {
            return Err(ValidationError::NegativeRate { field: "rate" });
        }
        if self.burst < 0 {
            return Err(ValidationError::NegativeBurst { field: "burst" });
        }
        if self.flow_rate < 0 {
            return Err(ValidationError::NegativeRate {
                field: "tokenBucket.rate",
            });
        }
        if self.flow_burst < 0 {
            return Err(ValidationError::NegativeBurst {
                field: "tokenBucket.burst",
            });
        }
        if self.heavy_hitter_threshold < 0 {
            return Err(ValidationError::NegativeRate {
                field: "cms.heavyHitterThreshold",
            });
        }
        Ok(())
    }
}

/// Parse a bandwidth declaration
///
/// # Errors
///
/// Returns a [`ParseError`] when the quantity or the document is malformed.
/// The result is not validated; call [`PolicyConfig::validate`].
pub fn parse_policy(input: &str) -> Result<PolicyConfig, ParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(PolicyConfig::unlimited());
    }

    if trimmed.starts_with('{') {
        return document::parse_document(trimmed);
    }

    parse_bandwidth(trimmed).map(PolicyConfig::from_rate)
}

impl FromStr for PolicyConfig {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_policy(s)
    }
}
