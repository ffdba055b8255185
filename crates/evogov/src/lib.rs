//! Auto-evolution governance pipeline.
//!
//! Decides whether a challenger configuration may replace the active
//! champion, and dispatches evaluation traffic safely while doing so:
//!
//! - [`budget_tracker`]: rolling-period spend governor with soft and hard
//!   admission thresholds.
//! - [`circuit_breaker`]: per-backend failure isolation
//!   (closed/open/half-open).
//! - [`response_cache`]: integrity-checked, time-bound response cache.
//! - [`router`]: composes the three into fault-tolerant, budget-constrained
//!   dispatch across interchangeable backends.
//! - [`gate_evaluator`]: non-compensatory, fail-closed multi-criteria gate.
//! - [`audit_ledger`]: append-only, hash-chained store of decision records.
//! - [`promotion_pipeline`]: shadow → canary → decided orchestration, every
//!   run ending in exactly one ledgered decision.
//!
//! Shared state (budget, breaker set, cache, ledger writer) is passed as
//! explicit handles into the router and pipeline at construction; there are
//! no ambient singletons, and no lock is ever held across backend I/O.

#![forbid(unsafe_code)]

pub mod audit_ledger;
pub mod backend;
pub mod budget_tracker;
pub mod circuit_breaker;
pub mod clock;
pub mod gate_evaluator;
pub mod observability;
pub mod promotion_pipeline;
pub mod response_cache;
pub mod router;
