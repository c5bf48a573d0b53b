//! Structured Policy Documents
//!
//! The extended policy form is a JSON object:
//!
//! ```json
//! {
//!   "rate": "10M",
//!   "burst": "15M",
//!   "cms": { "width": 2048, "depth": 5, "heavyHitterThreshold": 50000 },
//!   "tokenBucket": { "rate": 1000000, "burst": 2000000 }
//! }
//! ```
//!
//! Every field is optional. Quantities may be suffixed strings or bare integers.

use serde::Deserialize;

use super::error::ParseError;
use super::quantity::parse_bandwidth;
use super::PolicyConfig;

/// A quantity as written in a document
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Quantity {
    Bytes(i64),
    Text(String),
}

impl Quantity {
    /// Resolve to bytes; an empty string counts as absent
    fn resolve(&self) -> Result<Option<i64>, ParseError> {
        match self {
            Quantity::Bytes(n) => Ok(Some(*n)),
            Quantity::Text(s) if s.trim().is_empty() => Ok(None),
            Quantity::Text(s) => parse_bandwidth(s).map(Some),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SketchSection {
    width: Option<i64>,
    depth: Option<i64>,
    heavy_hitter_threshold: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BucketSection {
    rate: Option<Quantity>,
    burst: Option<Quantity>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PolicyDocument {
    rate: Option<Quantity>,
    burst: Option<Quantity>,
    cms: SketchSection,
    token_bucket: BucketSection,
}

fn resolve(quantity: &Option<Quantity>) -> Result<Option<i64>, ParseError> {
    match quantity {
        Some(q) => q.resolve(),
        None => Ok(None),
    }
}

fn positive_dimension(value: Option<i64>) -> Result<Option<usize>, ParseError> {
    match value {
        Some(v) if v > 0 => usize::try_from(v)
            .map(Some)
            .map_err(|_| ParseError::MalformedDocument(format!("sketch dimension {v} too large"))),
        _ => Ok(None),
    }
}

/// Parse the JSON policy form
///
/// Resolution order: `rate`/`burst` first (each also seeding the per-flow
/// bucket), then the `cms` section, then `tokenBucket` which overrides the
/// per-flow values when set to a positive quantity.
pub(super) fn parse_document(input: &str) -> Result<PolicyConfig, ParseError> {
    let doc: PolicyDocument = serde_json::from_str(input)
        .map_err(|e| ParseError::MalformedDocument(e.to_string()))?;

    let mut config = PolicyConfig::default();

    if let Some(rate) = resolve(&doc.rate)? {
        config.rate = rate;
        config.flow_rate = rate;
    }

    match resolve(&doc.burst)? {
        Some(burst) => {
            config.burst = burst;
            config.flow_burst = burst;
        }
        None if config.rate > 0 => {
            config.burst = config.rate.saturating_mul(2);
            config.flow_burst = config.burst;
        }
        None => {}
    }

    if let Some(width) = positive_dimension(doc.cms.width)? {
        config.sketch_width = width;
    }
    if let Some(depth) = positive_dimension(doc.cms.depth)? {
        config.sketch_depth = depth;
    }
    if let Some(threshold) = doc.cms.heavy_hitter_threshold.filter(|t| *t > 0) {
        config.heavy_hitter_threshold = threshold;
    }

    if let Some(rate) = resolve(&doc.token_bucket.rate)?.filter(|r| *r > 0) {
        config.flow_rate = rate;
    }
    if let Some(burst) = resolve(&doc.token_bucket.burst)?.filter(|b| *b > 0) {
        config.flow_burst = burst;
    }

    Ok(config)
}
