//! Fault-tolerant, budget-constrained request router across backends.
//!
//! The router walks an ordered candidate list (callers order by ascending
//! estimated cost or whatever policy they prefer) and for each candidate
//! consults the circuit breaker, then the budget, then dispatches. Side
//! effects are strictly ordered per attempt: breaker and budget state move
//! only after the dispatch resolves, never before, and the budget mutex is
//! never held across the dispatch itself.
//!
//! A cache hit short-circuits everything — no network call happens, so
//! neither the breaker nor the budget is consulted.
//!
//! Per-attempt analytics records go to the observability sink,
//! fire-and-forget.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendAdapter, BackendFault};
use crate::budget_tracker::BudgetTracker;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::observability::{ObservabilityEvent, ObservabilitySink};
use crate::response_cache::{ResponseCache, fingerprint};

// ---------------------------------------------------------------------------
// RouterConfig
// ---------------------------------------------------------------------------

/// Configuration for the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-dispatch timeout handed to the backend adapter, in milliseconds.
    pub dispatch_timeout_ms: u64,
    /// TTL for cached responses, in milliseconds.
    pub cache_ttl_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 30_000,
            cache_ttl_ms: 300_000,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.dispatch_timeout_ms == 0 {
            return Err(RouterError::InvalidConfig {
                reason: "dispatch_timeout_ms must be > 0".to_string(),
            });
        }
        if self.cache_ttl_ms == 0 {
            return Err(RouterError::InvalidConfig {
                reason: "cache_ttl_ms must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AttemptRecord — per-candidate outcome
// ---------------------------------------------------------------------------

/// How one candidate backend fared during a route call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Dispatch succeeded.
    Success,
    /// Candidate skipped: breaker open.
    SkippedBreakerOpen,
    /// Candidate skipped: budget refused the estimated cost.
    SkippedBudget,
    /// Dispatch failed with a transient fault.
    FailedTransient,
    /// Dispatch failed with a permanent fault.
    FailedPermanent,
    /// Dispatch timed out.
    FailedTimeout,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::SkippedBreakerOpen => f.write_str("skipped_breaker_open"),
            Self::SkippedBudget => f.write_str("skipped_budget"),
            Self::FailedTransient => f.write_str("failed_transient"),
            Self::FailedPermanent => f.write_str("failed_permanent"),
            Self::FailedTimeout => f.write_str("failed_timeout"),
        }
    }
}

/// Record of one candidate attempt within a route call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub backend_id: String,
    pub outcome: AttemptOutcome,
    /// Wall time of the dispatch itself; zero for skips.
    pub latency_ms: u64,
    /// Cost committed against the budget for this attempt.
    pub cost_millionths: u64,
    /// Human-readable detail (fault message, refusal reason).
    pub detail: String,
}

// ---------------------------------------------------------------------------
// RouteOutcome / RouterError
// ---------------------------------------------------------------------------

/// Successful result of a route call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOutcome {
    /// Response payload.
    pub payload: String,
    /// Backend that produced the response; `None` on a cache hit.
    pub backend_id: Option<String>,
    /// Whether the response came from the cache.
    pub from_cache: bool,
    /// Every candidate attempt made, in order. Empty on a cache hit.
    pub attempts: Vec<AttemptRecord>,
}

/// Errors from the router.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RouterError {
    #[error("invalid router config: {reason}")]
    InvalidConfig { reason: String },
    /// Every candidate was skipped or failed.
    #[error("all {} candidate backends exhausted", attempts.len())]
    AllBackendsExhausted { attempts: Vec<AttemptRecord> },
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Multi-backend router over shared budget, breaker, and cache state.
pub struct Router {
    config: RouterConfig,
    budget: Arc<Mutex<BudgetTracker>>,
    breakers: Arc<CircuitBreaker>,
    cache: Arc<ResponseCache>,
    sink: Arc<dyn ObservabilitySink>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(
        config: RouterConfig,
        budget: Arc<Mutex<BudgetTracker>>,
        breakers: Arc<CircuitBreaker>,
        cache: Arc<ResponseCache>,
        sink: Arc<dyn ObservabilitySink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RouterError> {
        config.validate()?;
        Ok(Self {
            config,
            budget,
            breakers,
            cache,
            sink,
            clock,
        })
    }

    /// Route a payload through the first viable candidate.
    ///
    /// Candidates are tried in the order given. Breaker-open and
    /// budget-refused candidates are skipped; failed dispatches move to the
    /// next candidate after updating breaker and budget state. If no
    /// candidate yields a response, every attempt is returned inside
    /// [`RouterError::AllBackendsExhausted`].
    pub fn route(
        &self,
        payload: &str,
        candidates: &[Arc<dyn BackendAdapter>],
    ) -> Result<RouteOutcome, RouterError> {
        let request_fingerprint = fingerprint(payload);

        let now_ms = self.clock.now_ms();
        if let Some(cached) = self.cache.get(&request_fingerprint, now_ms) {
            self.sink.record(
                ObservabilityEvent::new(now_ms, "route_cache_hit")
                    .field("fingerprint", &request_fingerprint),
            );
            return Ok(RouteOutcome {
                payload: cached,
                backend_id: None,
                from_cache: true,
                attempts: Vec::new(),
            });
        }

        let mut attempts = Vec::new();
        for adapter in candidates {
            let backend_id = adapter.backend_id().to_string();

            if !self.breakers.is_allowed(&backend_id, self.clock.now_ms()) {
                attempts.push(self.skip(
                    &backend_id,
                    AttemptOutcome::SkippedBreakerOpen,
                    "circuit open",
                ));
                continue;
            }

            let estimated = adapter.estimated_cost_millionths(payload);
            let decision = {
                let mut budget = self.budget.lock().unwrap_or_else(PoisonError::into_inner);
                budget.check_and_reserve(self.clock.now_ms(), estimated)
            };
            if !decision.allowed {
                attempts.push(self.skip(
                    &backend_id,
                    AttemptOutcome::SkippedBudget,
                    &decision.reason.to_string(),
                ));
                continue;
            }

            // External I/O: no lock held across this call.
            let started_ms = self.clock.now_ms();
            let result = adapter.dispatch(payload, self.config.dispatch_timeout_ms);
            let latency_ms = self.clock.now_ms().saturating_sub(started_ms);

            match result {
                Ok(response) => {
                    self.breakers.on_success(&backend_id);
                    {
                        let mut budget =
                            self.budget.lock().unwrap_or_else(PoisonError::into_inner);
                        budget.commit(&backend_id, response.cost_millionths);
                    }
                    let now_ms = self.clock.now_ms();
                    self.cache.put(
                        &request_fingerprint,
                        &response.payload,
                        self.config.cache_ttl_ms,
                        now_ms,
                    );

                    let attempt = AttemptRecord {
                        backend_id: backend_id.clone(),
                        outcome: AttemptOutcome::Success,
                        latency_ms,
                        cost_millionths: response.cost_millionths,
                        detail: String::new(),
                    };
                    self.emit_attempt(&attempt);
                    attempts.push(attempt);

                    return Ok(RouteOutcome {
                        payload: response.payload,
                        backend_id: Some(backend_id),
                        from_cache: false,
                        attempts,
                    });
                }
                Err(fault) => {
                    self.breakers.on_failure(&backend_id, self.clock.now_ms());
                    let billed = fault.billed_cost_millionths();
                    if billed > 0 {
                        let mut budget =
                            self.budget.lock().unwrap_or_else(PoisonError::into_inner);
                        budget.commit(&backend_id, billed);
                    }

                    let attempt = AttemptRecord {
                        backend_id: backend_id.clone(),
                        outcome: match &fault {
                            BackendFault::Transient { .. } => AttemptOutcome::FailedTransient,
                            BackendFault::Permanent { .. } => AttemptOutcome::FailedPermanent,
                            BackendFault::Timeout { .. } => AttemptOutcome::FailedTimeout,
                        },
                        latency_ms,
                        cost_millionths: billed,
                        detail: fault.to_string(),
                    };
                    self.emit_attempt(&attempt);
                    attempts.push(attempt);
                }
            }
        }

        self.sink.record(
            ObservabilityEvent::new(self.clock.now_ms(), "route_exhausted")
                .field("attempts", attempts.len().to_string()),
        );
        Err(RouterError::AllBackendsExhausted { attempts })
    }

    /// Cache TTL the router applies to responses.
    pub fn cache_ttl_ms(&self) -> u64 {
        self.config.cache_ttl_ms
    }

    // -- Internal --

    fn skip(&self, backend_id: &str, outcome: AttemptOutcome, detail: &str) -> AttemptRecord {
        let attempt = AttemptRecord {
            backend_id: backend_id.to_string(),
            outcome,
            latency_ms: 0,
            cost_millionths: 0,
            detail: detail.to_string(),
        };
        self.emit_attempt(&attempt);
        attempt
    }

    fn emit_attempt(&self, attempt: &AttemptRecord) {
        self.sink.record(
            ObservabilityEvent::new(self.clock.now_ms(), "route_attempt")
                .field("backend_id", &attempt.backend_id)
                .field("outcome", attempt.outcome.to_string())
                .field("latency_ms", attempt.latency_ms.to_string())
                .field("cost_millionths", attempt.cost_millionths.to_string()),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
