// Prometheus metrics for the shaping core
//
// Counters are updated on the data path regardless of registration; `init`
// only makes them visible through `gather_metrics`:
// - Admission decisions by kind (counter)
// - Phase transitions (counter)
// - Rejected bytes (counter)
// - Sketch decays and flow evictions (counter)
// - Tracked flows (gauge)

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::{Arc, OnceLock};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Admission metrics
    pub static ref DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("natra_decisions_total", "Admission decisions by kind"),
        &["decision"]
    ).expect("Failed to create decisions metric");

    pub static ref REJECTED_BYTES_TOTAL: IntCounter = IntCounter::new(
        "natra_rejected_bytes_total",
        "Bytes reported in events that were not admitted"
    ).expect("Failed to create rejected bytes metric");

    // Flow state metrics
    pub static ref PHASE_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("natra_phase_transitions_total", "Flow phase transitions"),
        &["from", "to"]
    ).expect("Failed to create phase transitions metric");

    pub static ref TRACKED_FLOWS: IntGauge = IntGauge::new(
        "natra_tracked_flows",
        "Flows currently held in the flow table"
    ).expect("Failed to create tracked flows metric");

    pub static ref FLOWS_EVICTED_TOTAL: IntCounter = IntCounter::new(
        "natra_flows_evicted_total",
        "Idle flows removed by reconciliation"
    ).expect("Failed to create evicted flows metric");

    // Sketch metrics
    pub static ref SKETCH_DECAYS_TOTAL: IntCounter = IntCounter::new(
        "natra_sketch_decays_total",
        "Count-min sketch decays applied"
    ).expect("Failed to create sketch decays metric");
}

static REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();

/// Register all collectors with [`REGISTRY`]
///
/// Safe to call more than once; only the first call registers.
pub fn init() -> anyhow::Result<()> {
    let outcome = REGISTERED.get_or_init(|| register().map_err(|e| e.to_string()));
    outcome
        .clone()
        .map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))
}

fn register() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REJECTED_BYTES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PHASE_TRANSITIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TRACKED_FLOWS.clone()))?;
    REGISTRY.register(Box::new(FLOWS_EVICTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SKETCH_DECAYS_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_gather_metrics() {
        init().unwrap();
        DECISIONS_TOTAL.with_label_values(&["admit"]).inc();
        SKETCH_DECAYS_TOTAL.inc();

        let output = gather_metrics().unwrap();
        assert!(output.contains("natra_decisions_total"));
        assert!(output.contains("natra_sketch_decays_total"));
    }

    #[test]
    fn test_transition_labels() {
        let before = PHASE_TRANSITIONS_TOTAL
            .with_label_values(&["normal", "flagged"])
            .get();
        PHASE_TRANSITIONS_TOTAL
            .with_label_values(&["normal", "flagged"])
            .inc();
        assert!(
            PHASE_TRANSITIONS_TOTAL
                .with_label_values(&["normal", "flagged"])
                .get()
                > before
        );
    }
}
