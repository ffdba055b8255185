//! Per-backend failure isolation with closed/open/half-open states.
//!
//! Each backend carries an independent breaker record. Evaluation is lazy:
//! there is no background sweeper, and the open→half-open transition happens
//! inside the `is_allowed` call that first observes the reset timeout as
//! elapsed. Callers must report every terminal outcome of a backend call;
//! an unreported outcome leaves the breaker state stale.
//!
//! The registry gives every backend its own lock so that mutations on one
//! backend never contend with another.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BreakerConfig
// ---------------------------------------------------------------------------

/// Configuration shared by all backend breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing a probe, in milliseconds.
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            success_threshold: 2,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), BreakerError> {
        if self.failure_threshold == 0 {
            return Err(BreakerError::InvalidConfig {
                reason: "failure_threshold must be > 0".to_string(),
            });
        }
        if self.reset_timeout_ms == 0 {
            return Err(BreakerError::InvalidConfig {
                reason: "reset_timeout_ms must be > 0".to_string(),
            });
        }
        if self.success_threshold == 0 {
            return Err(BreakerError::InvalidConfig {
                reason: "success_threshold must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BreakerStateKind / BreakerState
// ---------------------------------------------------------------------------

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BreakerStateKind {
    /// Normal operation; calls pass through.
    Closed,
    /// Backend assumed down; calls fail fast.
    Open,
    /// Probing whether the backend has recovered.
    HalfOpen,
}

impl fmt::Display for BreakerStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Snapshot of one backend's breaker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub state: BreakerStateKind,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_ms: u64,
}

// ---------------------------------------------------------------------------
// BreakerEvent / BreakerError
// ---------------------------------------------------------------------------

/// Structured event for breaker transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub backend_id: String,
    /// `opened`, `probe_allowed`, `closed`, `reopened`.
    pub event: String,
    pub consecutive_failures: u32,
}

/// Errors from breaker construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerError {
    InvalidConfig { reason: String },
}

impl fmt::Display for BreakerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig { reason } => write!(f, "invalid breaker config: {reason}"),
        }
    }
}

impl std::error::Error for BreakerError {}

// ---------------------------------------------------------------------------
// BreakerCore — pure per-backend state machine
// ---------------------------------------------------------------------------

/// The state machine for a single backend, free of locking concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerCore {
    state: BreakerStateKind,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_ms: u64,
}

impl Default for BreakerCore {
    fn default() -> Self {
        Self {
            state: BreakerStateKind::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_ms: 0,
        }
    }
}

impl BreakerCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a call may proceed. Performs the lazy open→half-open
    /// transition when the reset timeout has elapsed; that single call
    /// becomes the probe.
    pub fn is_allowed(&mut self, config: &BreakerConfig, now_ms: u64) -> bool {
        match self.state {
            BreakerStateKind::Closed | BreakerStateKind::HalfOpen => true,
            BreakerStateKind::Open => {
                if now_ms.saturating_sub(self.last_failure_ms) >= config.reset_timeout_ms {
                    self.state = BreakerStateKind::HalfOpen;
                    self.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Report a successful terminal outcome.
    pub fn on_success(&mut self, config: &BreakerConfig) {
        match self.state {
            BreakerStateKind::Closed => {
                self.consecutive_failures = 0;
            }
            BreakerStateKind::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= config.success_threshold {
                    self.state = BreakerStateKind::Closed;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                }
            }
            // A success reported while open belongs to a call that started
            // before the breaker tripped; the reset timeout still governs.
            BreakerStateKind::Open => {}
        }
    }

    /// Report a failed terminal outcome.
    pub fn on_failure(&mut self, config: &BreakerConfig, now_ms: u64) {
        match self.state {
            BreakerStateKind::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= config.failure_threshold {
                    self.state = BreakerStateKind::Open;
                    self.last_failure_ms = now_ms;
                }
            }
            BreakerStateKind::HalfOpen => {
                // Failed probe: straight back to open, fresh timeout.
                self.state = BreakerStateKind::Open;
                self.consecutive_failures = self.consecutive_failures.max(config.failure_threshold);
                self.consecutive_successes = 0;
                self.last_failure_ms = now_ms;
            }
            BreakerStateKind::Open => {
                self.consecutive_failures += 1;
                self.last_failure_ms = now_ms;
            }
        }
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> BreakerState {
        BreakerState {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_failure_ms: self.last_failure_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker — concurrent per-backend registry
// ---------------------------------------------------------------------------

struct BreakerSlot {
    core: BreakerCore,
    events: Vec<BreakerEvent>,
}

/// Registry of breaker records keyed by backend id.
///
/// The outer map is read-locked on the hot path; each backend's record has
/// its own mutex, so distinct backends never contend.
pub struct CircuitBreaker {
    config: BreakerConfig,
    backends: RwLock<BTreeMap<String, Arc<Mutex<BreakerSlot>>>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Result<Self, BreakerError> {
        config.validate()?;
        Ok(Self {
            config,
            backends: RwLock::new(BTreeMap::new()),
        })
    }

    /// Whether a call to `backend_id` may proceed right now.
    pub fn is_allowed(&self, backend_id: &str, now_ms: u64) -> bool {
        let slot = self.slot(backend_id);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slot.core.snapshot().state;
        let allowed = slot.core.is_allowed(&self.config, now_ms);
        if before == BreakerStateKind::Open && slot.core.snapshot().state == BreakerStateKind::HalfOpen
        {
            let failures = slot.core.snapshot().consecutive_failures;
            slot.events.push(BreakerEvent {
                backend_id: backend_id.to_string(),
                event: "probe_allowed".to_string(),
                consecutive_failures: failures,
            });
        }
        allowed
    }

    /// Report a successful terminal outcome for `backend_id`.
    pub fn on_success(&self, backend_id: &str) {
        let slot = self.slot(backend_id);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slot.core.snapshot().state;
        slot.core.on_success(&self.config);
        if before == BreakerStateKind::HalfOpen
            && slot.core.snapshot().state == BreakerStateKind::Closed
        {
            slot.events.push(BreakerEvent {
                backend_id: backend_id.to_string(),
                event: "closed".to_string(),
                consecutive_failures: 0,
            });
        }
    }

    /// Report a failed terminal outcome for `backend_id`.
    pub fn on_failure(&self, backend_id: &str, now_ms: u64) {
        let slot = self.slot(backend_id);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slot.core.snapshot().state;
        slot.core.on_failure(&self.config, now_ms);
        let after = slot.core.snapshot();
        if before != BreakerStateKind::Open && after.state == BreakerStateKind::Open {
            slot.events.push(BreakerEvent {
                backend_id: backend_id.to_string(),
                event: if before == BreakerStateKind::HalfOpen {
                    "reopened".to_string()
                } else {
                    "opened".to_string()
                },
                consecutive_failures: after.consecutive_failures,
            });
        }
    }

    /// Snapshot of one backend's record. Unknown backends read as closed.
    pub fn snapshot(&self, backend_id: &str) -> BreakerState {
        let known = {
            let backends = self
                .backends
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            backends.get(backend_id).cloned()
        };
        match known {
            Some(slot) => slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .core
                .snapshot(),
            None => BreakerCore::new().snapshot(),
        }
    }

    /// Drain transition events across all backends, ordered by backend id.
    pub fn drain_events(&self) -> Vec<BreakerEvent> {
        let backends = self
            .backends
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut events = Vec::new();
        for slot in backends.values() {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            events.append(&mut slot.events);
        }
        events
    }

    // -- Internal --

    fn slot(&self, backend_id: &str) -> Arc<Mutex<BreakerSlot>> {
        {
            let backends = self
                .backends
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = backends.get(backend_id) {
                return Arc::clone(slot);
            }
        }
        let mut backends = self
            .backends
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(backends.entry(backend_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(BreakerSlot {
                core: BreakerCore::new(),
                events: Vec::new(),
            }))
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
