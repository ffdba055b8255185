//! Backend adapter boundary for interchangeable dispatch providers.
//!
//! A backend is anything that can take a request payload and produce a
//! response for a metered cost: a model provider, an evaluation service, a
//! remote worker pool. The router composes adapters without knowing what
//! sits behind them; adapters report their own estimated and actual costs
//! in millionths of the accounting unit.
//!
//! Faults distinguish transient conditions (worth trying the next
//! candidate) from permanent ones (malformed request, rejected contract).
//! A timeout is a fault like any other, and every fault carries the cost
//! the backend metered before failing, since partially billed work must
//! still be committed against the budget.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BackendResponse — successful dispatch result
// ---------------------------------------------------------------------------

/// Response from a successful backend dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Response payload.
    pub payload: String,
    /// Actual metered cost in millionths of the accounting unit.
    pub cost_millionths: u64,
}

// ---------------------------------------------------------------------------
// BackendFault — typed dispatch failures
// ---------------------------------------------------------------------------

/// Failure of a single backend dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendFault {
    /// Transient condition (overload, connection reset); the next candidate
    /// may succeed.
    Transient {
        message: String,
        billed_cost_millionths: u64,
    },
    /// Permanent condition (malformed request, contract rejection); retrying
    /// the same payload elsewhere may still be attempted, but the condition
    /// is surfaced as non-retryable once all candidates are exhausted.
    Permanent {
        message: String,
        billed_cost_millionths: u64,
    },
    /// The per-call timeout elapsed before the backend responded.
    Timeout {
        elapsed_ms: u64,
        billed_cost_millionths: u64,
    },
}

impl BackendFault {
    /// Cost the backend metered before failing, to be committed against the
    /// budget even though the dispatch failed.
    pub fn billed_cost_millionths(&self) -> u64 {
        match self {
            Self::Transient {
                billed_cost_millionths,
                ..
            }
            | Self::Permanent {
                billed_cost_millionths,
                ..
            }
            | Self::Timeout {
                billed_cost_millionths,
                ..
            } => *billed_cost_millionths,
        }
    }

    /// Whether the fault is permanent (non-retryable once exhausted).
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

impl fmt::Display for BackendFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { message, .. } => write!(f, "transient backend fault: {message}"),
            Self::Permanent { message, .. } => write!(f, "permanent backend fault: {message}"),
            Self::Timeout { elapsed_ms, .. } => {
                write!(f, "backend timed out after {elapsed_ms}ms")
            }
        }
    }
}

impl std::error::Error for BackendFault {}

// ---------------------------------------------------------------------------
// BackendAdapter — the provider contract
// ---------------------------------------------------------------------------

/// One interchangeable dispatch provider.
pub trait BackendAdapter: Send + Sync {
    /// Stable backend identifier, used for breaker state and spend tracking.
    fn backend_id(&self) -> &str;

    /// Estimated cost of dispatching this payload, in millionths.
    fn estimated_cost_millionths(&self, payload: &str) -> u64;

    /// Dispatch the payload with a per-call timeout.
    fn dispatch(&self, payload: &str, timeout_ms: u64) -> Result<BackendResponse, BackendFault>;
}

// ---------------------------------------------------------------------------
// ScriptedBackend — deterministic adapter for tests and lab runs
// ---------------------------------------------------------------------------

/// Adapter that replays a scripted sequence of outcomes.
///
/// Each `dispatch` pops the front of the script; an exhausted script
/// produces a transient fault so that misconfigured tests fail loudly
/// rather than succeed silently.
#[derive(Debug)]
pub struct ScriptedBackend {
    backend_id: String,
    estimated_cost_millionths: u64,
    script: Mutex<VecDeque<Result<BackendResponse, BackendFault>>>,
}

impl ScriptedBackend {
    pub fn new(backend_id: impl Into<String>, estimated_cost_millionths: u64) -> Self {
        Self {
            backend_id: backend_id.into(),
            estimated_cost_millionths,
            script: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a successful response.
    pub fn push_response(&self, payload: impl Into<String>, cost_millionths: u64) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(BackendResponse {
                payload: payload.into(),
                cost_millionths,
            }));
        }
    }

    /// Queue a fault.
    pub fn push_fault(&self, fault: BackendFault) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(fault));
        }
    }

    /// Queue `count` copies of the same successful response.
    pub fn push_responses(&self, payload: &str, cost_millionths: u64, count: usize) {
        for _ in 0..count {
            self.push_response(payload, cost_millionths);
        }
    }

    /// Remaining scripted outcomes.
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl BackendAdapter for ScriptedBackend {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn estimated_cost_millionths(&self, _payload: &str) -> u64 {
        self.estimated_cost_millionths
    }

    fn dispatch(&self, _payload: &str, _timeout_ms: u64) -> Result<BackendResponse, BackendFault> {
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(outcome) => outcome,
            None => Err(BackendFault::Transient {
                message: format!("script exhausted for backend {}", self.backend_id),
                billed_cost_millionths: 0,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
