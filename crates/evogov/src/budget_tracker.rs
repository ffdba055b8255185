//! Rolling-period spend governor with soft and hard admission thresholds.
//!
//! The tracker admits or refuses estimated work against a per-period limit.
//! There is no reserve-then-release protocol: `check_and_reserve` only
//! inspects state, and `commit` is the sole mutator of spend, called after a
//! dispatch has actually resolved. Spend is therefore monotonically
//! non-decreasing within a period and resets exactly once when a check
//! observes that the period has expired.
//!
//! All amounts are fixed-point millionths of the accounting unit.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Fraction denominator: 1.0 expressed in millionths.
pub const FRACTION_ONE_MILLIONTHS: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// BudgetConfig
// ---------------------------------------------------------------------------

/// Configuration for the budget tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Spend limit per period, in millionths of the accounting unit.
    pub period_limit_millionths: u64,
    /// Period duration in milliseconds.
    pub period_duration_ms: u64,
    /// Soft-refusal threshold as a fraction of the limit, in millionths.
    pub soft_threshold_millionths: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            period_limit_millionths: 100_000_000,
            period_duration_ms: 86_400_000,
            soft_threshold_millionths: 950_000,
        }
    }
}

impl BudgetConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), BudgetError> {
        if self.period_limit_millionths == 0 {
            return Err(BudgetError::InvalidConfig {
                reason: "period_limit_millionths must be > 0".to_string(),
            });
        }
        if self.period_duration_ms == 0 {
            return Err(BudgetError::InvalidConfig {
                reason: "period_duration_ms must be > 0".to_string(),
            });
        }
        if self.soft_threshold_millionths == 0
            || self.soft_threshold_millionths > FRACTION_ONE_MILLIONTHS
        {
            return Err(BudgetError::InvalidConfig {
                reason: "soft_threshold_millionths must be in (0, 1_000_000]".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BudgetReason / BudgetDecision
// ---------------------------------------------------------------------------

/// Why an admission check resolved the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BudgetReason {
    /// Projected spend stays below the soft threshold.
    Ok,
    /// Projected spend crosses the soft threshold but not the limit.
    SoftLimit,
    /// Projected spend reaches or exceeds the period limit.
    HardLimit,
}

impl fmt::Display for BudgetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::SoftLimit => f.write_str("soft_limit"),
            Self::HardLimit => f.write_str("hard_limit"),
        }
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetDecision {
    /// Whether the estimated work is admitted.
    pub allowed: bool,
    /// Fraction of the budget remaining after the projected spend, in
    /// millionths. Zero when the projection meets or exceeds the limit.
    pub remaining_fraction_millionths: u64,
    /// Reason code for the decision.
    pub reason: BudgetReason,
}

// ---------------------------------------------------------------------------
// BudgetSnapshot / BudgetEvent
// ---------------------------------------------------------------------------

/// Point-in-time view of budget state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub period_limit_millionths: u64,
    pub spent_millionths: u64,
    pub period_start_ms: u64,
    pub request_count: u64,
    pub per_backend_spend_millionths: BTreeMap<String, u64>,
}

/// Structured event emitted by budget operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetEvent {
    /// Event type: `reserve_allowed`, `reserve_denied`, `commit`, `rollover`.
    pub event: String,
    /// Backend the event concerns (empty for period-level events).
    pub backend_id: String,
    /// Amount involved, in millionths.
    pub amount_millionths: u64,
    /// Spend after the event, in millionths.
    pub spent_millionths: u64,
    /// Reason code for admission events.
    pub reason: String,
}

// ---------------------------------------------------------------------------
// BudgetError
// ---------------------------------------------------------------------------

/// Errors from budget construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetError {
    /// Rejected configuration.
    InvalidConfig { reason: String },
}

impl fmt::Display for BudgetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid budget config: {reason}"),
        }
    }
}

impl std::error::Error for BudgetError {}

// ---------------------------------------------------------------------------
// BudgetTracker
// ---------------------------------------------------------------------------

/// Tracks cumulative spend against a rolling period limit.
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    spent_millionths: u64,
    period_start_ms: u64,
    request_count: u64,
    per_backend_spend_millionths: BTreeMap<String, u64>,
    events: Vec<BudgetEvent>,
}

impl BudgetTracker {
    /// Create a tracker whose first period starts at `now_ms`.
    pub fn new(config: BudgetConfig, now_ms: u64) -> Result<Self, BudgetError> {
        config.validate()?;
        Ok(Self {
            config,
            spent_millionths: 0,
            period_start_ms: now_ms,
            request_count: 0,
            per_backend_spend_millionths: BTreeMap::new(),
            events: Vec::new(),
        })
    }

    /// Admission check for estimated work.
    ///
    /// Rolls the period over first if it has expired (at most once per
    /// check), then projects `spent + estimated` against the limit. Does not
    /// deduct anything; only [`commit`](Self::commit) mutates spend.
    pub fn check_and_reserve(
        &mut self,
        now_ms: u64,
        estimated_cost_millionths: u64,
    ) -> BudgetDecision {
        self.roll_over_if_expired(now_ms);

        if estimated_cost_millionths == 0 {
            let decision = BudgetDecision {
                allowed: true,
                remaining_fraction_millionths: self.remaining_fraction(self.spent_millionths),
                reason: BudgetReason::Ok,
            };
            self.record_admission(&decision, 0);
            return decision;
        }

        let projected = self
            .spent_millionths
            .saturating_add(estimated_cost_millionths);
        let projected_fraction = fraction_millionths(projected, self.config.period_limit_millionths);

        let reason = if projected_fraction >= FRACTION_ONE_MILLIONTHS {
            BudgetReason::HardLimit
        } else if projected_fraction >= self.config.soft_threshold_millionths {
            BudgetReason::SoftLimit
        } else {
            BudgetReason::Ok
        };

        let decision = BudgetDecision {
            allowed: reason == BudgetReason::Ok,
            remaining_fraction_millionths: self.remaining_fraction(projected),
            reason,
        };
        self.record_admission(&decision, estimated_cost_millionths);
        decision
    }

    /// Commit the actual cost of a resolved dispatch. Never decreases spend.
    pub fn commit(&mut self, backend_id: &str, actual_cost_millionths: u64) {
        self.spent_millionths = self.spent_millionths.saturating_add(actual_cost_millionths);
        *self
            .per_backend_spend_millionths
            .entry(backend_id.to_string())
            .or_insert(0) += actual_cost_millionths;
        self.request_count += 1;
        self.events.push(BudgetEvent {
            event: "commit".to_string(),
            backend_id: backend_id.to_string(),
            amount_millionths: actual_cost_millionths,
            spent_millionths: self.spent_millionths,
            reason: String::new(),
        });
    }

    /// Current state snapshot.
    pub fn usage(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            period_limit_millionths: self.config.period_limit_millionths,
            spent_millionths: self.spent_millionths,
            period_start_ms: self.period_start_ms,
            request_count: self.request_count,
            per_backend_spend_millionths: self.per_backend_spend_millionths.clone(),
        }
    }

    /// Restore spend recovered from an external checkpoint or ledger replay.
    ///
    /// Used at startup when budget state is reconstructed from the audit
    /// trail; replaces the current period's counters wholesale.
    pub fn restore(&mut self, period_start_ms: u64, spent_millionths: u64) {
        self.period_start_ms = period_start_ms;
        self.spent_millionths = spent_millionths;
    }

    /// Drain accumulated events.
    pub fn drain_events(&mut self) -> Vec<BudgetEvent> {
        std::mem::take(&mut self.events)
    }

    // -- Internal --

    fn roll_over_if_expired(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.period_start_ms) >= self.config.period_duration_ms {
            self.spent_millionths = 0;
            self.period_start_ms = now_ms;
            self.request_count = 0;
            self.per_backend_spend_millionths.clear();
            self.events.push(BudgetEvent {
                event: "rollover".to_string(),
                backend_id: String::new(),
                amount_millionths: 0,
                spent_millionths: 0,
                reason: String::new(),
            });
        }
    }

    fn remaining_fraction(&self, projected_millionths: u64) -> u64 {
        let used = fraction_millionths(projected_millionths, self.config.period_limit_millionths);
        FRACTION_ONE_MILLIONTHS.saturating_sub(used)
    }

    fn record_admission(&mut self, decision: &BudgetDecision, estimated_millionths: u64) {
        self.events.push(BudgetEvent {
            event: if decision.allowed {
                "reserve_allowed".to_string()
            } else {
                "reserve_denied".to_string()
            },
            backend_id: String::new(),
            amount_millionths: estimated_millionths,
            spent_millionths: self.spent_millionths,
            reason: decision.reason.to_string(),
        });
    }
}

/// `numerator / denominator` as a fraction in millionths, saturating.
fn fraction_millionths(numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return FRACTION_ONE_MILLIONTHS;
    }
    let scaled = u128::from(numerator) * u128::from(FRACTION_ONE_MILLIONTHS)
        / u128::from(denominator);
    scaled.min(u128::from(u64::MAX)) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(limit_millionths: u64) -> BudgetTracker {
        BudgetTracker::new(
            BudgetConfig {
                period_limit_millionths: limit_millionths,
                period_duration_ms: 1_000,
                soft_threshold_millionths: 950_000,
            },
            0,
        )
        .expect("valid config")
    }

    // -- Config validation --

    #[test]
    fn zero_limit_rejected() {
        let err = BudgetTracker::new(
            BudgetConfig {
                period_limit_millionths: 0,
                period_duration_ms: 1_000,
                soft_threshold_millionths: 950_000,
            },
            0,
        )
        .unwrap_err();
        assert!(matches!(err, BudgetError::InvalidConfig { .. }));
    }

    #[test]
    fn zero_duration_rejected() {
        let err = BudgetConfig {
            period_limit_millionths: 1,
            period_duration_ms: 0,
            soft_threshold_millionths: 950_000,
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, BudgetError::InvalidConfig { .. }));
    }

    #[test]
    fn out_of_range_soft_threshold_rejected() {
        for soft in [0, 1_000_001] {
            let err = BudgetConfig {
                period_limit_millionths: 1,
                period_duration_ms: 1,
                soft_threshold_millionths: soft,
            }
            .validate()
            .unwrap_err();
            assert!(matches!(err, BudgetError::InvalidConfig { .. }));
        }
    }

    #[test]
    fn default_config_is_valid() {
        BudgetConfig::default().validate().expect("default valid");
    }

    // -- Admission thresholds --

    #[test]
    fn soft_limit_refuses_at_projected_99_percent() {
        let mut tracker = tracker(100_000_000);
        tracker.commit("fast", 94_000_000);

        let decision = tracker.check_and_reserve(0, 5_000_000);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, BudgetReason::SoftLimit);
    }

    #[test]
    fn admits_at_projected_65_percent() {
        let mut tracker = tracker(100_000_000);
        tracker.commit("fast", 60_000_000);

        let decision = tracker.check_and_reserve(0, 5_000_000);
        assert!(decision.allowed);
        assert_eq!(decision.reason, BudgetReason::Ok);
        assert_eq!(decision.remaining_fraction_millionths, 350_000);
    }

    #[test]
    fn hard_limit_at_projected_100_percent() {
        let mut tracker = tracker(100_000_000);
        tracker.commit("fast", 96_000_000);

        let decision = tracker.check_and_reserve(0, 4_000_000);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, BudgetReason::HardLimit);
        assert_eq!(decision.remaining_fraction_millionths, 0);
    }

    #[test]
    fn zero_estimate_always_allowed() {
        let mut tracker = tracker(100);
        tracker.commit("fast", 100_000);

        let decision = tracker.check_and_reserve(0, 0);
        assert!(decision.allowed);
        assert_eq!(decision.reason, BudgetReason::Ok);
    }

    // -- Monotonicity and rollover --

    #[test]
    fn spend_is_monotonic_within_period() {
        let mut tracker = tracker(1_000_000);
        let mut last = 0;
        for cost in [10, 0, 250, 5, 0, 999] {
            tracker.commit("fast", cost);
            let spent = tracker.usage().spent_millionths;
            assert!(spent >= last);
            last = spent;
        }
    }

    #[test]
    fn rollover_resets_to_exactly_zero() {
        let mut tracker = tracker(1_000_000);
        tracker.commit("fast", 900_000);
        tracker.commit("slow", 50_000);

        // Period duration is 1_000ms; a check at 1_000 rolls over.
        let decision = tracker.check_and_reserve(1_000, 10);
        assert!(decision.allowed);

        let snapshot = tracker.usage();
        assert_eq!(snapshot.spent_millionths, 0);
        assert_eq!(snapshot.period_start_ms, 1_000);
        assert_eq!(snapshot.request_count, 0);
        assert!(snapshot.per_backend_spend_millionths.is_empty());
    }

    #[test]
    fn no_rollover_before_period_elapses() {
        let mut tracker = tracker(1_000_000);
        tracker.commit("fast", 500_000);
        tracker.check_and_reserve(999, 10);
        assert_eq!(tracker.usage().spent_millionths, 500_000);
        assert_eq!(tracker.usage().period_start_ms, 0);
    }

    #[test]
    fn one_rollover_per_check_even_after_many_periods() {
        let mut tracker = tracker(1_000_000);
        tracker.commit("fast", 500_000);

        // Ten periods elapse; a single check performs a single rollover.
        tracker.check_and_reserve(10_500, 10);
        let events = tracker.drain_events();
        let rollovers = events.iter().filter(|e| e.event == "rollover").count();
        assert_eq!(rollovers, 1);
        assert_eq!(tracker.usage().period_start_ms, 10_500);
    }

    // -- Per-backend accounting --

    #[test]
    fn per_backend_spend_accumulates() {
        let mut tracker = tracker(1_000_000);
        tracker.commit("fast", 100);
        tracker.commit("fast", 50);
        tracker.commit("slow", 7);

        let snapshot = tracker.usage();
        assert_eq!(snapshot.per_backend_spend_millionths["fast"], 150);
        assert_eq!(snapshot.per_backend_spend_millionths["slow"], 7);
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.spent_millionths, 157);
    }

    // -- Restore --

    #[test]
    fn restore_replaces_period_counters() {
        let mut tracker = tracker(1_000_000);
        tracker.restore(500, 123_456);
        let snapshot = tracker.usage();
        assert_eq!(snapshot.period_start_ms, 500);
        assert_eq!(snapshot.spent_millionths, 123_456);
    }

    // -- Events --

    #[test]
    fn admission_events_carry_reason() {
        let mut tracker = tracker(100);
        tracker.commit("fast", 100);
        tracker.check_and_reserve(0, 100);

        let events = tracker.drain_events();
        let denied: Vec<_> = events
            .iter()
            .filter(|e| e.event == "reserve_denied")
            .collect();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].reason, "hard_limit");
    }

    // -- Serialization --

    #[test]
    fn snapshot_serialization_round_trip() {
        let mut tracker = tracker(1_000_000);
        tracker.commit("fast", 42);
        let snapshot = tracker.usage();
        let json = serde_json::to_string(&snapshot).expect("serialize");
        let restored: BudgetSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(snapshot, restored);
    }

    #[test]
    fn decision_serialization_round_trip() {
        let decision = BudgetDecision {
            allowed: false,
            remaining_fraction_millionths: 10_000,
            reason: BudgetReason::SoftLimit,
        };
        let json = serde_json::to_string(&decision).expect("serialize");
        let restored: BudgetDecision = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decision, restored);
    }

    #[test]
    fn reason_display() {
        assert_eq!(BudgetReason::Ok.to_string(), "ok");
        assert_eq!(BudgetReason::SoftLimit.to_string(), "soft_limit");
        assert_eq!(BudgetReason::HardLimit.to_string(), "hard_limit");
    }
}
