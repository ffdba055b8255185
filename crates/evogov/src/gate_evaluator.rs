//! Non-compensatory multi-criteria gate with fail-closed semantics.
//!
//! The gate aggregates named metric values against per-criterion minimum
//! thresholds. Aggregation is non-compensatory: a single criterion below
//! its threshold forces rejection no matter how high every other criterion
//! scores. The harmonic-mean aggregate exists for reporting and ranking
//! only and never overrides a violation.
//!
//! The criterion list is fully data-driven: whatever names appear in the
//! thresholds map are the schema, and the metrics map must match it
//! exactly. A missing metric is fatal for the evaluation, and an unknown
//! metric is rejected rather than silently ignored.
//!
//! Metric values are fixed-point millionths in `[0, 1_000_000]`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// A perfect score: 1.0 in millionths.
pub const SCORE_ONE_MILLIONTHS: i64 = 1_000_000;

/// Floor applied to values before harmonic aggregation, in millionths.
const EPSILON_MILLIONTHS: i64 = 1;

// ---------------------------------------------------------------------------
// GateThresholds
// ---------------------------------------------------------------------------

/// Per-criterion minimum scores, in millionths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateThresholds {
    criteria: BTreeMap<String, i64>,
}

impl GateThresholds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum score for a criterion.
    pub fn set(&mut self, name: impl Into<String>, min_millionths: i64) -> &mut Self {
        self.criteria.insert(name.into(), min_millionths);
        self
    }

    /// Builder-style variant of [`set`](Self::set).
    pub fn with(mut self, name: impl Into<String>, min_millionths: i64) -> Self {
        self.criteria.insert(name.into(), min_millionths);
        self
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Criterion names in deterministic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.criteria.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// GateError
// ---------------------------------------------------------------------------

/// Errors from a gate evaluation. All are fatal for the evaluation at hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateError {
    /// A gate with no criteria must not silently pass.
    EmptyThresholds,
    /// A criterion named by the thresholds has no metric value.
    MissingMetric { criterion: String },
    /// A metric was supplied that no threshold names.
    UnknownMetric { name: String },
    /// A metric value fell outside `[0, 1_000_000]` millionths.
    OutOfRange { name: String, value_millionths: i64 },
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyThresholds => f.write_str("gate has no criteria"),
            Self::MissingMetric { criterion } => {
                write!(f, "missing metric for criterion `{criterion}`")
            }
            Self::UnknownMetric { name } => write!(f, "unknown metric `{name}`"),
            Self::OutOfRange {
                name,
                value_millionths,
            } => write!(
                f,
                "metric `{name}` value {value_millionths} outside [0, 1000000]"
            ),
        }
    }
}

impl std::error::Error for GateError {}

// ---------------------------------------------------------------------------
// GateResult
// ---------------------------------------------------------------------------

/// Verdict of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    /// True only when every criterion meets its threshold.
    pub passed: bool,
    /// Harmonic mean of all criterion values, in millionths. Reporting
    /// only; never overrides a violation.
    pub aggregate_score_millionths: i64,
    /// Evaluated value per criterion, deterministically ordered.
    pub per_criterion_millionths: BTreeMap<String, i64>,
    /// Criteria whose value fell below the threshold.
    pub violations: BTreeSet<String>,
    /// Human-readable summary of the verdict.
    pub reason: String,
}

impl GateResult {
    /// A rejecting result used when an evaluation could not run at all.
    ///
    /// Fail-closed: no criterion scores, aggregate zero, `passed` false.
    pub fn fail_closed(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            aggregate_score_millionths: 0,
            per_criterion_millionths: BTreeMap::new(),
            violations: BTreeSet::new(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

/// Evaluate metrics against thresholds.
///
/// The metrics map must contain exactly the criteria the thresholds name:
/// a missing criterion is [`GateError::MissingMetric`], an extra key is
/// [`GateError::UnknownMetric`].
pub fn evaluate(
    metrics: &BTreeMap<String, i64>,
    thresholds: &GateThresholds,
) -> Result<GateResult, GateError> {
    if thresholds.is_empty() {
        return Err(GateError::EmptyThresholds);
    }

    for name in metrics.keys() {
        if !thresholds.criteria.contains_key(name) {
            return Err(GateError::UnknownMetric { name: name.clone() });
        }
    }

    let mut per_criterion = BTreeMap::new();
    let mut violations = BTreeSet::new();
    let mut shortfalls = Vec::new();

    for (criterion, &min_millionths) in &thresholds.criteria {
        let value = *metrics
            .get(criterion)
            .ok_or_else(|| GateError::MissingMetric {
                criterion: criterion.clone(),
            })?;
        if !(0..=SCORE_ONE_MILLIONTHS).contains(&value) {
            return Err(GateError::OutOfRange {
                name: criterion.clone(),
                value_millionths: value,
            });
        }
        per_criterion.insert(criterion.clone(), value);
        if value < min_millionths {
            violations.insert(criterion.clone());
            shortfalls.push(format!(
                "{criterion} (value {value}, threshold {min_millionths}, shortfall {})",
                min_millionths - value
            ));
        }
    }

    let aggregate = harmonic_mean_millionths(per_criterion.values().copied());
    let passed = violations.is_empty();
    let reason = if passed {
        format!("all {} criteria satisfied", per_criterion.len())
    } else {
        format!("violations: {}", shortfalls.join("; "))
    };

    Ok(GateResult {
        passed,
        aggregate_score_millionths: aggregate,
        per_criterion_millionths: per_criterion,
        violations,
        reason,
    })
}

/// Harmonic mean of millionth-scaled values with an epsilon floor.
fn harmonic_mean_millionths(values: impl Iterator<Item = i64>) -> i64 {
    let mut count: u128 = 0;
    let mut reciprocal_sum: u128 = 0;
    for value in values {
        let floored = value.max(EPSILON_MILLIONTHS) as u128;
        // Each term is 1e12 / v, keeping six fractional digits of 1/v.
        reciprocal_sum += 1_000_000_000_000u128 / floored;
        count += 1;
    }
    if count == 0 || reciprocal_sum == 0 {
        return 0;
    }
    let mean = count * 1_000_000_000_000u128 / reciprocal_sum;
    mean.min(SCORE_ONE_MILLIONTHS as u128) as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
