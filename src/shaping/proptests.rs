//! Property-Based Tests for the Shaping Core
//!
//! # Test Strategies
//!
//! - **Sketch**: estimates never undercount, and overcount beyond `(e/w) * N`
//!   for no more than roughly `e^-d` of the keys
//! - **Token Bucket**: tokens stay within `[0, capacity]` across arbitrary
//!   operation sequences, and a rejected request fits after the reported wait
//! - **Policy Parser**: every suffix scales its number exactly
//! - **Engine**: an unlimited policy admits every event
//!
//! # Running the Tests
//!
//! ```bash
//! cargo test --lib shaping::proptests
//! ```

use proptest::prelude::*;
use std::collections::HashMap;

use crate::policy::{parse_bandwidth, parse_policy, BandwidthSuffix, PolicyConfig};
use crate::shaping::bucket::{Consume, TokenBucket};
use crate::shaping::clock::Timestamp;
use crate::shaping::config::EngineSettings;
use crate::shaping::engine::{Decision, ShapingEngine};
use crate::shaping::flow::FlowKey;
use crate::shaping::sketch::CountMinSketch;

#[derive(Debug, Clone)]
enum BucketOp {
    Consume(u64),
    Refund(u64),
    Advance(u64),
    Rewind(u64),
}

fn arb_bucket_op() -> impl Strategy<Value = BucketOp> {
    prop_oneof![
        4 => (0u64..5_000).prop_map(BucketOp::Consume),
        1 => (0u64..5_000).prop_map(BucketOp::Refund),
        3 => (0u64..2_000_000_000).prop_map(BucketOp::Advance),
        1 => (0u64..500_000_000).prop_map(BucketOp::Rewind),
    ]
}

fn arb_suffix() -> impl Strategy<Value = BandwidthSuffix> {
    prop::sample::select(BandwidthSuffix::ALL.to_vec())
}

// ============================================================================
// Sketch Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_sketch_never_undercounts(
        seed in any::<u64>(),
        width in 1usize..64,
        depth in 1usize..6,
        updates in prop::collection::vec((0u16..200, 1u64..10_000), 1..300),
    ) {
        let sketch = CountMinSketch::with_seed(width, depth, seed);
        let mut truth: HashMap<u16, u64> = HashMap::new();
        for (key, bytes) in &updates {
            sketch.update(key, *bytes);
            *truth.entry(*key).or_default() += bytes;
        }
        for (key, count) in &truth {
            prop_assert!(sketch.estimate(key) >= *count);
        }
        prop_assert_eq!(sketch.total(), truth.values().sum::<u64>());
    }
}

#[test]
fn test_sketch_error_bound_holds_statistically() {
    // e / 272 ~= 1% of total traffic; e^-5 ~= 0.67% of keys may exceed it
    let width = 272;
    let depth = 5;

    for seed in [1u64, 2, 3, 4] {
        let sketch = CountMinSketch::with_seed(width, depth, seed);
        let mut truth: HashMap<u32, u64> = HashMap::new();

        // skewed volumes: a few large flows and a long tail
        for key in 0..5_000u32 {
            let bytes = 100_000 / u64::from(key + 1) + 100;
            sketch.update(&key, bytes);
            truth.insert(key, bytes);
        }

        let bound = sketch.error_bound();
        let violations = truth
            .iter()
            .filter(|(key, count)| (sketch.estimate(*key) - **count) as f64 > bound)
            .count();
        let fraction = violations as f64 / truth.len() as f64;
        assert!(
            fraction <= 0.02,
            "seed {seed}: {violations} of {} keys beyond the error bound",
            truth.len()
        );
    }
}

// ============================================================================
// Token Bucket Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_bucket_tokens_stay_in_range(
        capacity in 0u64..10_000,
        rate in 1u64..100_000,
        ops in prop::collection::vec(arb_bucket_op(), 1..200),
    ) {
        let bucket = TokenBucket::new(capacity, rate);
        let mut now = 0u64;
        for op in ops {
            match op {
                BucketOp::Consume(n) => {
                    let before = bucket.available_at(Timestamp::from_nanos(now));
                    match bucket.try_consume(n, Timestamp::from_nanos(now)) {
                        Consume::Admitted => prop_assert!(n <= capacity),
                        Consume::Rejected { .. } => prop_assert!(before < n),
                    }
                }
                BucketOp::Refund(n) => bucket.refund(n),
                BucketOp::Advance(d) => now = now.saturating_add(d),
                BucketOp::Rewind(d) => now = now.saturating_sub(d),
            }
            prop_assert!(bucket.available() <= capacity);
        }
    }

    #[test]
    fn prop_retry_after_wait_is_admitted(
        capacity in 1u64..100_000,
        rate in 1u64..1_000_000,
        drain in 0.0f64..=1.0,
        request in 0.0f64..=1.0,
        start in 0u64..10_000_000_000,
    ) {
        let bucket = TokenBucket::new_at(capacity, rate, Timestamp::from_nanos(start));
        let now = Timestamp::from_nanos(start);
        let drained = (capacity as f64 * drain) as u64;
        prop_assert!(bucket.try_consume(drained, now).is_admitted());

        let n = ((capacity as f64 * request) as u64).max(1);
        match bucket.try_consume(n, now) {
            Consume::Admitted => prop_assert!(capacity - drained >= n),
            Consume::Rejected { available_in } => {
                prop_assert!(bucket.available() < n);
                prop_assert!(bucket.try_consume(n, now + available_in).is_admitted());
            }
        }
    }

    #[test]
    fn prop_unlimited_bucket_never_rejects(n in any::<u64>(), at in any::<u64>()) {
        let bucket = TokenBucket::new(0, 0);
        prop_assert!(bucket.try_consume(n, Timestamp::from_nanos(at)).is_admitted());
    }
}

// ============================================================================
// Policy Parser Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_suffix_scales_exactly(value in 0i64..1_000_000, suffix in arb_suffix()) {
        let parsed = parse_bandwidth(&format!("{value}{suffix}")).unwrap();
        prop_assert_eq!(parsed, value * suffix.multiplier());
    }

    #[test]
    fn prop_bare_rate_defaults_burst(rate in 1i64..1_000_000_000) {
        let policy = parse_policy(&rate.to_string()).unwrap();
        prop_assert_eq!(policy.rate, rate);
        prop_assert_eq!(policy.burst, rate * 2);
    }

    #[test]
    fn prop_parser_never_panics(input in ".{0,40}") {
        let _ = parse_policy(&input);
    }
}

// ============================================================================
// Engine Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_unlimited_policy_always_admits(
        events in prop::collection::vec((0u64..16, any::<u64>(), 0u64..10_000_000_000), 1..100),
    ) {
        let engine = ShapingEngine::new(
            PolicyConfig::unlimited(),
            EngineSettings::seeded(5),
            Timestamp::ZERO,
        ).unwrap();
        for (flow, bytes, at) in events {
            let decision = engine.on_event(FlowKey::from_id(flow), bytes, Timestamp::from_nanos(at));
            prop_assert_eq!(decision, Decision::Admit);
        }
    }

    #[test]
    fn prop_admitted_bytes_bounded_by_bucket(
        rate in 100i64..10_000,
        sizes in prop::collection::vec(1u64..5_000, 1..200),
    ) {
        let policy = PolicyConfig::from_rate(rate);
        let burst = policy.burst as u64;
        let engine = ShapingEngine::new(policy, EngineSettings::seeded(5), Timestamp::ZERO).unwrap();

        // every event at the same instant: nothing refills
        let mut admitted = 0u64;
        for (i, bytes) in sizes.iter().enumerate() {
            let flow = FlowKey::from_id(i as u64 % 4);
            if engine.on_event(flow, *bytes, Timestamp::ZERO).is_admit() {
                admitted += bytes;
            }
        }
        prop_assert!(admitted <= burst);
    }
}
