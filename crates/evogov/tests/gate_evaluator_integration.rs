//! Integration tests for the `gate_evaluator` module.
//!
//! Covers non-compensatory rejection, schema enforcement, harmonic
//! aggregation bounds, and verdict determinism.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use evogov::gate_evaluator::{
    GateError, GateResult, GateThresholds, SCORE_ONE_MILLIONTHS, evaluate,
};

fn metrics(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

// ---------------------------------------------------------------------------
// Non-compensation
// ---------------------------------------------------------------------------

#[test]
fn one_violation_rejects_regardless_of_aggregate() {
    // Nine perfect criteria and one failing criterion must reject.
    let mut thresholds = GateThresholds::new();
    let mut values = BTreeMap::new();
    for i in 0..9 {
        let name = format!("criterion_{i}");
        thresholds.set(name.clone(), 600_000);
        values.insert(name, SCORE_ONE_MILLIONTHS);
    }
    thresholds.set("weak", 600_000);
    values.insert("weak".to_string(), 599_999);

    let result = evaluate(&values, &thresholds).expect("evaluate");
    assert!(!result.passed);
    assert_eq!(result.violations.len(), 1);
    assert!(result.violations.contains("weak"));
    assert!(result.aggregate_score_millionths > 900_000);
}

#[test]
fn every_criterion_passing_is_required_and_sufficient() {
    let thresholds = GateThresholds::new()
        .with("accuracy", 800_000)
        .with("fairness", 700_000)
        .with("latency_score", 500_000);

    let passing = metrics(&[
        ("accuracy", 800_000),
        ("fairness", 700_000),
        ("latency_score", 500_000),
    ]);
    assert!(evaluate(&passing, &thresholds).expect("evaluate").passed);

    for (name, _) in [
        ("accuracy", 0),
        ("fairness", 0),
        ("latency_score", 0),
    ] {
        let mut failing = passing.clone();
        failing.insert(name.to_string(), 0);
        let result = evaluate(&failing, &thresholds).expect("evaluate");
        assert!(!result.passed);
        assert!(result.violations.contains(name));
    }
}

// ---------------------------------------------------------------------------
// Schema enforcement
// ---------------------------------------------------------------------------

#[test]
fn missing_metric_never_silently_skips() {
    let thresholds = GateThresholds::new()
        .with("present", 100_000)
        .with("absent", 100_000);
    let err = evaluate(&metrics(&[("present", 900_000)]), &thresholds).unwrap_err();
    assert!(matches!(err, GateError::MissingMetric { .. }));
}

#[test]
fn unknown_metric_is_schema_violation() {
    let thresholds = GateThresholds::new().with("known", 100_000);
    let err = evaluate(
        &metrics(&[("known", 900_000), ("unknown", 900_000)]),
        &thresholds,
    )
    .unwrap_err();
    assert_eq!(
        err,
        GateError::UnknownMetric {
            name: "unknown".to_string()
        }
    );
}

#[test]
fn gate_with_no_criteria_cannot_pass() {
    let err = evaluate(&BTreeMap::new(), &GateThresholds::new()).unwrap_err();
    assert_eq!(err, GateError::EmptyThresholds);
}

// ---------------------------------------------------------------------------
// Aggregate bounds
// ---------------------------------------------------------------------------

#[test]
fn aggregate_stays_in_unit_range() {
    let thresholds = GateThresholds::new().with("a", 1).with("b", 1).with("c", 1);
    for values in [
        metrics(&[("a", 0), ("b", 0), ("c", 0)]),
        metrics(&[("a", 1), ("b", 1_000_000), ("c", 500_000)]),
        metrics(&[("a", 1_000_000), ("b", 1_000_000), ("c", 1_000_000)]),
    ] {
        let result = evaluate(&values, &thresholds).expect("evaluate");
        assert!(result.aggregate_score_millionths >= 0);
        assert!(result.aggregate_score_millionths <= SCORE_ONE_MILLIONTHS);
    }
}

#[test]
fn aggregate_is_at_most_the_minimum_criterion_scaled() {
    // The harmonic mean never exceeds the arithmetic mean and is dominated
    // by small values.
    let thresholds = GateThresholds::new().with("a", 1).with("b", 1);
    let result = evaluate(&metrics(&[("a", 1_000_000), ("b", 2_000)]), &thresholds)
        .expect("evaluate");
    assert!(result.aggregate_score_millionths < 501_000);
}

// ---------------------------------------------------------------------------
// Determinism and reporting
// ---------------------------------------------------------------------------

#[test]
fn identical_inputs_produce_identical_verdicts() {
    let thresholds = GateThresholds::new()
        .with("a", 500_000)
        .with("b", 500_000)
        .with("c", 500_000);
    let values = metrics(&[("a", 499_999), ("b", 500_000), ("c", 123_456)]);

    let runs: Vec<GateResult> = (0..5)
        .map(|_| evaluate(&values, &thresholds).expect("evaluate"))
        .collect();
    for result in &runs[1..] {
        assert_eq!(*result, runs[0]);
    }
    assert_eq!(runs[0].violations.len(), 2);
}

#[test]
fn reason_names_every_violation_with_shortfall() {
    let thresholds = GateThresholds::new()
        .with("accuracy", 900_000)
        .with("fairness", 800_000);
    let result = evaluate(
        &metrics(&[("accuracy", 850_000), ("fairness", 750_000)]),
        &thresholds,
    )
    .expect("evaluate");

    assert!(result.reason.contains("accuracy"));
    assert!(result.reason.contains("shortfall 50000"));
    assert!(result.reason.contains("fairness"));
}

#[test]
fn serialized_result_preserves_verdict() {
    let thresholds = GateThresholds::new().with("a", 500_000);
    let result = evaluate(&metrics(&[("a", 400_000)]), &thresholds).expect("evaluate");

    let json = serde_json::to_string(&result).expect("serialize");
    let restored: GateResult = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(result, restored);
    assert!(!restored.passed);
}
