//! Integration tests for the `router` module.
//!
//! Covers candidate fallthrough across breaker, budget, and cache state,
//! breaker recovery through routed traffic, analytics emission, and
//! concurrent routing against shared state.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::thread;

use evogov::backend::{BackendAdapter, BackendFault, ScriptedBackend};
use evogov::budget_tracker::{BudgetConfig, BudgetTracker};
use evogov::circuit_breaker::{BreakerConfig, BreakerStateKind, CircuitBreaker};
use evogov::clock::{Clock, ManualClock};
use evogov::observability::{MemorySink, ObservabilitySink};
use evogov::response_cache::{CacheConfig, ResponseCache};
use evogov::router::{AttemptOutcome, Router, RouterConfig, RouterError};

struct Harness {
    router: Arc<Router>,
    budget: Arc<Mutex<BudgetTracker>>,
    breakers: Arc<CircuitBreaker>,
    sink: Arc<MemorySink>,
    clock: Arc<ManualClock>,
}

fn harness(period_limit_millionths: u64) -> Harness {
    let clock = Arc::new(ManualClock::new(10_000));
    let budget = Arc::new(Mutex::new(
        BudgetTracker::new(
            BudgetConfig {
                period_limit_millionths,
                period_duration_ms: 3_600_000,
                soft_threshold_millionths: 950_000,
            },
            clock.now_ms(),
        )
        .expect("budget"),
    ));
    let breakers = Arc::new(
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            reset_timeout_ms: 5_000,
            success_threshold: 1,
        })
        .expect("breakers"),
    );
    let cache = Arc::new(ResponseCache::new(CacheConfig::default(), b"router-it").expect("cache"));
    let sink = Arc::new(MemorySink::new());
    let router = Arc::new(
        Router::new(
            RouterConfig::default(),
            Arc::clone(&budget),
            Arc::clone(&breakers),
            cache,
            sink.clone() as Arc<dyn ObservabilitySink>,
            clock.clone() as Arc<dyn Clock>,
        )
        .expect("router"),
    );
    Harness {
        router,
        budget,
        breakers,
        sink,
        clock,
    }
}

fn adapters(backends: Vec<ScriptedBackend>) -> Vec<Arc<dyn BackendAdapter>> {
    backends
        .into_iter()
        .map(|b| Arc::new(b) as Arc<dyn BackendAdapter>)
        .collect()
}

// ---------------------------------------------------------------------------
// Fallthrough ordering
// ---------------------------------------------------------------------------

#[test]
fn candidates_are_tried_in_caller_order() {
    let h = harness(1_000_000_000);
    let first = ScriptedBackend::new("first", 100);
    first.push_fault(BackendFault::Transient {
        message: "unavailable".to_string(),
        billed_cost_millionths: 0,
    });
    let second = ScriptedBackend::new("second", 200);
    second.push_fault(BackendFault::Timeout {
        elapsed_ms: 30_000,
        billed_cost_millionths: 50,
    });
    let third = ScriptedBackend::new("third", 300);
    third.push_response("late answer", 280);

    let outcome = h
        .router
        .route("question", &adapters(vec![first, second, third]))
        .expect("route");
    assert_eq!(outcome.backend_id.as_deref(), Some("third"));

    let recorded: Vec<(String, AttemptOutcome)> = outcome
        .attempts
        .iter()
        .map(|a| (a.backend_id.clone(), a.outcome))
        .collect();
    assert_eq!(
        recorded,
        vec![
            ("first".to_string(), AttemptOutcome::FailedTransient),
            ("second".to_string(), AttemptOutcome::FailedTimeout),
            ("third".to_string(), AttemptOutcome::Success),
        ]
    );

    // Timeout partial billing plus the final success.
    assert_eq!(h.budget.lock().unwrap().usage().spent_millionths, 330);
}

// ---------------------------------------------------------------------------
// Breaker lifecycle through routed traffic
// ---------------------------------------------------------------------------

#[test]
fn breaker_opens_then_recovers_through_probe() {
    let h = harness(1_000_000_000);

    // Two failures open the breaker (threshold 2).
    for _ in 0..2 {
        let flaky = ScriptedBackend::new("flaky", 100);
        flaky.push_fault(BackendFault::Transient {
            message: "down".to_string(),
            billed_cost_millionths: 0,
        });
        let _ = h.router.route("q", &adapters(vec![flaky]));
    }
    assert_eq!(h.breakers.snapshot("flaky").state, BreakerStateKind::Open);

    // While open, the candidate is skipped without dispatch.
    let idle = ScriptedBackend::new("flaky", 100);
    idle.push_response("unused", 1);
    let list = adapters(vec![idle]);
    let err = h.router.route("q2", &list).unwrap_err();
    let RouterError::AllBackendsExhausted { attempts } = err else {
        panic!("expected exhaustion");
    };
    assert_eq!(attempts[0].outcome, AttemptOutcome::SkippedBreakerOpen);

    // After the reset timeout, the probe goes through and closes it
    // (success threshold 1).
    h.clock.advance(5_000);
    let recovered = ScriptedBackend::new("flaky", 100);
    recovered.push_response("alive", 90);
    let outcome = h
        .router
        .route("q3", &adapters(vec![recovered]))
        .expect("route");
    assert_eq!(outcome.backend_id.as_deref(), Some("flaky"));
    assert_eq!(h.breakers.snapshot("flaky").state, BreakerStateKind::Closed);
}

// ---------------------------------------------------------------------------
// Budget refusal and recovery
// ---------------------------------------------------------------------------

#[test]
fn budget_exhaustion_skips_until_rollover() {
    let h = harness(1_000);
    // Spend the whole period budget.
    {
        let mut budget = h.budget.lock().unwrap();
        budget.commit("elsewhere", 1_000);
    }

    let refused = ScriptedBackend::new("refused", 500);
    let err = h.router.route("q", &adapters(vec![refused])).unwrap_err();
    let RouterError::AllBackendsExhausted { attempts } = err else {
        panic!("expected exhaustion");
    };
    assert_eq!(attempts[0].outcome, AttemptOutcome::SkippedBudget);

    // The next period admits traffic again.
    h.clock.advance(3_600_000);
    let admitted = ScriptedBackend::new("admitted", 500);
    admitted.push_response("ok", 400);
    let outcome = h
        .router
        .route("q2", &adapters(vec![admitted]))
        .expect("route");
    assert_eq!(outcome.backend_id.as_deref(), Some("admitted"));
}

// ---------------------------------------------------------------------------
// Cache behavior through the router
// ---------------------------------------------------------------------------

#[test]
fn identical_payload_is_served_from_cache() {
    let h = harness(1_000_000_000);
    let backend = ScriptedBackend::new("origin", 100);
    backend.push_response("answer", 90);
    let list = adapters(vec![backend]);

    let first = h.router.route("repeated question", &list).expect("route");
    assert!(!first.from_cache);

    // The script is exhausted, so only the cache can answer now.
    let second = h.router.route("repeated question", &list).expect("route");
    assert!(second.from_cache);
    assert_eq!(second.payload, "answer");
    assert_eq!(h.budget.lock().unwrap().usage().request_count, 1);
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

#[test]
fn every_attempt_is_visible_to_the_sink() {
    let h = harness(1_000_000_000);
    let failing = ScriptedBackend::new("failing", 100);
    failing.push_fault(BackendFault::Permanent {
        message: "rejected".to_string(),
        billed_cost_millionths: 0,
    });
    let ok = ScriptedBackend::new("ok", 100);
    ok.push_response("fine", 90);

    h.router
        .route("q", &adapters(vec![failing, ok]))
        .expect("route");

    let events = h.sink.take();
    let outcomes: Vec<String> = events
        .iter()
        .filter(|e| e.event == "route_attempt")
        .map(|e| e.fields["outcome"].clone())
        .collect();
    assert_eq!(outcomes, vec!["failed_permanent", "success"]);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_routes_share_budget_safely() {
    let h = harness(1_000_000_000);
    let mut handles = Vec::new();
    for worker in 0..8 {
        let router = Arc::clone(&h.router);
        handles.push(thread::spawn(move || {
            for i in 0..25 {
                let backend = ScriptedBackend::new(format!("backend-{worker}"), 100);
                backend.push_response("ok", 100);
                let list = vec![Arc::new(backend) as Arc<dyn BackendAdapter>];
                router
                    .route(&format!("w{worker}-q{i}"), &list)
                    .expect("route");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker");
    }

    // 8 workers x 25 distinct payloads, 100 millionths each.
    let snapshot = h.budget.lock().unwrap().usage();
    assert_eq!(snapshot.spent_millionths, 20_000);
    assert_eq!(snapshot.request_count, 200);
}
