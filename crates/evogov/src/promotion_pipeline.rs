//! Staged champion/challenger promotion: shadow → canary → decided.
//!
//! A run mirrors live traffic at the challenger without user-facing effect
//! (shadow), then routes a small deterministic fraction of offered samples
//! (canary), then evaluates the merged metrics through the gate and writes
//! the outcome to the audit ledger. Every run terminates in exactly one
//! ledgered decision: gate rejection, cancellation, incomplete metrics, and
//! even sample starvation all produce a terminal artifact. The only error a
//! run can surface to its caller is a ledger failure, which is fail-stop.
//!
//! Metric collection is fail-closed. Samples whose routing exhausts every
//! backend count against the reserved `reliability` criterion instead of
//! aborting the run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit_ledger::{
    AuditLedger, COST_METADATA_KEY, DecisionKind, DecisionRecord, LedgerError, ProofArtifact,
};
use crate::backend::BackendAdapter;
use crate::budget_tracker::FRACTION_ONE_MILLIONTHS;
use crate::clock::Clock;
use crate::gate_evaluator::{GateResult, GateThresholds, evaluate};
use crate::observability::{ObservabilityEvent, ObservabilitySink};
use crate::router::Router;

/// Reserved metric name fed by the pipeline itself: the fraction of samples
/// whose routing succeeded, in millionths.
pub const RELIABILITY_METRIC: &str = "reliability";

// ---------------------------------------------------------------------------
// ScoreFn — external metric computation
// ---------------------------------------------------------------------------

/// Context handed to the score function for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleContext {
    pub run_id: String,
    pub phase: PromotionPhase,
    pub sample_index: u64,
    pub payload: String,
}

/// External collaborator that scores one challenger output against the
/// champion's. Values are millionths in `[0, 1_000_000]`; the key set must
/// match the gate thresholds.
pub trait ScoreFn: Send + Sync {
    fn compute_metrics(
        &self,
        challenger_output: &str,
        champion_output: &str,
        context: &SampleContext,
    ) -> BTreeMap<String, i64>;
}

// ---------------------------------------------------------------------------
// Samples and phases
// ---------------------------------------------------------------------------

/// One mirrored traffic sample: the live input and what the champion
/// produced for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleInput {
    pub payload: String,
    pub champion_output: String,
}

/// Phase of a promotion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PromotionPhase {
    Shadow,
    Canary,
    Decided,
}

impl fmt::Display for PromotionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shadow => f.write_str("shadow"),
            Self::Canary => f.write_str("canary"),
            Self::Decided => f.write_str("decided"),
        }
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PromotionOutcome {
    Promoted,
    RolledBack,
}

impl fmt::Display for PromotionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promoted => f.write_str("promoted"),
            Self::RolledBack => f.write_str("rolled_back"),
        }
    }
}

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Operator abort signal, honored between samples during shadow and canary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// PromotionConfig
// ---------------------------------------------------------------------------

/// Configuration for a promotion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// Samples the shadow phase must route before moving on.
    pub shadow_min_samples: u64,
    /// Canary-selected samples required before deciding.
    pub canary_min_samples: u64,
    /// Fraction of offered samples the canary phase selects, in millionths.
    pub canary_fraction_millionths: u64,
    /// Gate thresholds applied at decision time.
    pub thresholds: GateThresholds,
}

impl PromotionConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.shadow_min_samples == 0 {
            return Err(PipelineError::InvalidConfig {
                reason: "shadow_min_samples must be > 0".to_string(),
            });
        }
        if self.canary_min_samples == 0 {
            return Err(PipelineError::InvalidConfig {
                reason: "canary_min_samples must be > 0".to_string(),
            });
        }
        if self.canary_fraction_millionths == 0
            || self.canary_fraction_millionths > FRACTION_ONE_MILLIONTHS
        {
            return Err(PipelineError::InvalidConfig {
                reason: "canary_fraction_millionths must be in (0, 1_000_000]".to_string(),
            });
        }
        if self.thresholds.is_empty() {
            return Err(PipelineError::InvalidConfig {
                reason: "thresholds must name at least one criterion".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PipelineError / PromotionDecision
// ---------------------------------------------------------------------------

/// Errors a promotion run can surface. Everything else terminates in a
/// ledgered decision instead of an error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid promotion config: {reason}")]
    InvalidConfig { reason: String },
    #[error("ledger failure: {0}")]
    Ledger(#[from] LedgerError),
}

/// Result of one completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub run_id: String,
    pub outcome: PromotionOutcome,
    /// Gate verdict embedded in the artifact (fail-closed when the gate
    /// could not run).
    pub gate_result: GateResult,
    pub artifact: ProofArtifact,
}

// ---------------------------------------------------------------------------
// MetricAccumulator — merged shadow + canary evidence
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MetricAccumulator {
    sums: BTreeMap<String, i128>,
    scored_samples: u64,
    total_samples: u64,
    failed_samples: u64,
    cost_millionths: u64,
}

impl MetricAccumulator {
    fn record_success(&mut self, metrics: &BTreeMap<String, i64>, cost_millionths: u64) {
        for (name, value) in metrics {
            *self.sums.entry(name.clone()).or_insert(0) += i128::from(*value);
        }
        self.scored_samples += 1;
        self.total_samples += 1;
        self.cost_millionths = self.cost_millionths.saturating_add(cost_millionths);
    }

    fn record_failure(&mut self) {
        self.total_samples += 1;
        self.failed_samples += 1;
    }

    /// Mean per metric plus the reserved reliability fraction.
    fn means(&self) -> BTreeMap<String, i64> {
        let mut means = BTreeMap::new();
        if self.scored_samples > 0 {
            for (name, sum) in &self.sums {
                means.insert(
                    name.clone(),
                    (*sum / i128::from(self.scored_samples)) as i64,
                );
            }
        }
        let reliability = if self.total_samples == 0 {
            0
        } else {
            let succeeded = self.total_samples - self.failed_samples;
            (u128::from(succeeded) * u128::from(FRACTION_ONE_MILLIONTHS)
                / u128::from(self.total_samples)) as i64
        };
        means.insert(RELIABILITY_METRIC.to_string(), reliability);
        means
    }
}

// ---------------------------------------------------------------------------
// PromotionRun — transient state for one cycle
// ---------------------------------------------------------------------------

/// Orchestration state for one champion→challenger cycle. Owned by the
/// pipeline for the duration of a run and discarded once the corresponding
/// artifact is durably appended.
#[derive(Debug)]
struct PromotionRun {
    run_id: String,
    champion_id: String,
    challenger_id: String,
    phase: PromotionPhase,
    accumulator: MetricAccumulator,
    gate_result: Option<GateResult>,
    outcome: Option<PromotionOutcome>,
}

impl PromotionRun {
    fn new(run_id: &str, champion_id: &str, challenger_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            champion_id: champion_id.to_string(),
            challenger_id: challenger_id.to_string(),
            phase: PromotionPhase::Shadow,
            accumulator: MetricAccumulator::default(),
            gate_result: None,
            outcome: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PromotionPipeline
// ---------------------------------------------------------------------------

/// Orchestrates one or more promotion runs over shared router and ledger
/// handles.
pub struct PromotionPipeline {
    config: PromotionConfig,
    router: Arc<Router>,
    ledger: Arc<Mutex<AuditLedger>>,
    score_fn: Arc<dyn ScoreFn>,
    sink: Arc<dyn ObservabilitySink>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PromotionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromotionPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PromotionPipeline {
    pub fn new(
        config: PromotionConfig,
        router: Arc<Router>,
        ledger: Arc<Mutex<AuditLedger>>,
        score_fn: Arc<dyn ScoreFn>,
        sink: Arc<dyn ObservabilitySink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            router,
            ledger,
            score_fn,
            sink,
            clock,
        })
    }

    /// Execute one champion→challenger evaluation cycle.
    ///
    /// `samples` mirrors live traffic in arrival order. The shadow phase
    /// routes the first `shadow_min_samples` of them; the canary phase
    /// offers the remainder and selects its configured fraction until
    /// `canary_min_samples` have been selected. The run then decides,
    /// appends its artifact, and returns.
    pub fn run(
        &self,
        run_id: &str,
        champion_id: &str,
        challenger_id: &str,
        challenger_backends: &[Arc<dyn BackendAdapter>],
        samples: &[SampleInput],
        cancel: &CancelToken,
    ) -> Result<PromotionDecision, PipelineError> {
        let mut run = PromotionRun::new(run_id, champion_id, challenger_id);
        let mut shadow_routed: u64 = 0;
        let mut canary_selected: u64 = 0;
        let mut canary_credit: u64 = 0;
        let mut sample_index: u64 = 0;

        self.emit_phase(&run, run.phase);

        for sample in samples {
            if run.phase == PromotionPhase::Decided {
                break;
            }
            if cancel.is_cancelled() {
                run.gate_result = Some(GateResult::fail_closed("CANCELLED"));
                return self.seal(run, DecisionKind::Rollback);
            }

            match run.phase {
                PromotionPhase::Shadow => {
                    self.collect_sample(&mut run, sample_index, sample, challenger_backends);
                    sample_index += 1;
                    shadow_routed += 1;
                    if shadow_routed >= self.config.shadow_min_samples {
                        run.phase = PromotionPhase::Canary;
                        self.emit_phase(&run, run.phase);
                    }
                }
                PromotionPhase::Canary => {
                    // Deterministic fractional selection: accumulate credit
                    // per offered sample, dispatch when a whole unit is due.
                    canary_credit += self.config.canary_fraction_millionths;
                    if canary_credit >= FRACTION_ONE_MILLIONTHS {
                        canary_credit -= FRACTION_ONE_MILLIONTHS;
                        self.collect_sample(&mut run, sample_index, sample, challenger_backends);
                        sample_index += 1;
                        canary_selected += 1;
                        if canary_selected >= self.config.canary_min_samples {
                            run.phase = PromotionPhase::Decided;
                        }
                    }
                }
                PromotionPhase::Decided => unreachable!("loop exits on decided"),
            }
        }

        if run.phase != PromotionPhase::Decided {
            // The sample feed dried up before both phase minima were met.
            // Deciding on partial evidence would be a silent approval path,
            // so the run blocks instead.
            run.gate_result = Some(GateResult::fail_closed(format!(
                "INSUFFICIENT_SAMPLES: phase {} after {} of {} samples",
                run.phase,
                shadow_routed + canary_selected,
                self.config.shadow_min_samples + self.config.canary_min_samples
            )));
            return self.seal(run, DecisionKind::Block);
        }

        self.emit_phase(&run, PromotionPhase::Decided);
        let means = run.accumulator.means();
        match evaluate(&means, &self.config.thresholds) {
            Ok(gate_result) => {
                let kind = if gate_result.passed {
                    DecisionKind::Promote
                } else {
                    DecisionKind::Rollback
                };
                run.gate_result = Some(gate_result);
                self.seal(run, kind)
            }
            Err(gate_error) => {
                run.gate_result = Some(GateResult::fail_closed(format!(
                    "INCOMPLETE_METRICS: {gate_error}"
                )));
                self.seal(run, DecisionKind::Block)
            }
        }
    }

    // -- Internal --

    /// Route one sample at the challenger and fold its metrics in. Routing
    /// exhaustion is evidence, not an abort.
    fn collect_sample(
        &self,
        run: &mut PromotionRun,
        sample_index: u64,
        sample: &SampleInput,
        challenger_backends: &[Arc<dyn BackendAdapter>],
    ) {
        match self.router.route(&sample.payload, challenger_backends) {
            Ok(outcome) => {
                let cost: u64 = outcome
                    .attempts
                    .iter()
                    .map(|a| a.cost_millionths)
                    .sum();
                let context = SampleContext {
                    run_id: run.run_id.clone(),
                    phase: run.phase,
                    sample_index,
                    payload: sample.payload.clone(),
                };
                let metrics = self.score_fn.compute_metrics(
                    &outcome.payload,
                    &sample.champion_output,
                    &context,
                );
                run.accumulator.record_success(&metrics, cost);
            }
            Err(_) => {
                run.accumulator.record_failure();
                self.sink.record(
                    ObservabilityEvent::new(self.clock.now_ms(), "promotion_sample_failed")
                        .field("run_id", &run.run_id)
                        .field("phase", run.phase.to_string())
                        .field("sample_index", sample_index.to_string()),
                );
            }
        }
    }

    /// Append the terminal artifact and assemble the caller-facing decision.
    /// Consumes the run; its state survives only inside the artifact.
    fn seal(
        &self,
        mut run: PromotionRun,
        kind: DecisionKind,
    ) -> Result<PromotionDecision, PipelineError> {
        run.phase = PromotionPhase::Decided;
        run.outcome = Some(if kind == DecisionKind::Promote {
            PromotionOutcome::Promoted
        } else {
            PromotionOutcome::RolledBack
        });
        let outcome = run.outcome.unwrap_or(PromotionOutcome::RolledBack);
        let gate_result = run
            .gate_result
            .take()
            .unwrap_or_else(|| GateResult::fail_closed("no gate verdict recorded"));

        let mut metadata = BTreeMap::new();
        metadata.insert("champion_id".to_string(), run.champion_id.clone());
        metadata.insert("challenger_id".to_string(), run.challenger_id.clone());
        metadata.insert("outcome".to_string(), outcome.to_string());
        metadata.insert(
            "total_samples".to_string(),
            run.accumulator.total_samples.to_string(),
        );
        metadata.insert(
            "failed_samples".to_string(),
            run.accumulator.failed_samples.to_string(),
        );
        metadata.insert(
            COST_METADATA_KEY.to_string(),
            run.accumulator.cost_millionths.to_string(),
        );

        let timestamp_ms = self.clock.now_ms();
        let artifact = {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger.append(DecisionRecord {
                decision_id: run.run_id.clone(),
                decision_type: kind,
                metrics: gate_result.clone(),
                timestamp_ms,
                metadata,
            })?
        };

        self.sink.record(
            ObservabilityEvent::new(timestamp_ms, "promotion_decided")
                .field("run_id", &run.run_id)
                .field("outcome", outcome.to_string())
                .field("decision_type", kind.to_string())
                .field("reason", &gate_result.reason),
        );

        Ok(PromotionDecision {
            run_id: run.run_id,
            outcome,
            gate_result,
            artifact,
        })
    }

    fn emit_phase(&self, run: &PromotionRun, phase: PromotionPhase) {
        self.sink.record(
            ObservabilityEvent::new(self.clock.now_ms(), "promotion_phase")
                .field("run_id", &run.run_id)
                .field("phase", phase.to_string()),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
