//! Best-effort observability sink for routing and promotion analytics.
//!
//! The router and the promotion pipeline emit structured event records for
//! every dispatch attempt and every phase transition. Delivery is
//! fire-and-forget: a sink must never block, fail, or otherwise sit on the
//! decision path. Sinks receive an owned event and do with it what they
//! will (forward, buffer, drop).

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ObservabilityEvent — one structured record
// ---------------------------------------------------------------------------

/// A single structured observability record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityEvent {
    /// Event time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// RFC3339 rendering of `timestamp_ms` for human consumers.
    pub timestamp_rfc3339: String,
    /// Event name (e.g. `route_attempt`, `promotion_decided`).
    pub event: String,
    /// Structured fields, deterministically ordered.
    pub fields: BTreeMap<String, String>,
}

impl ObservabilityEvent {
    /// Create an event with no fields.
    pub fn new(timestamp_ms: u64, event: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            timestamp_rfc3339: rfc3339_millis(timestamp_ms),
            event: event.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Attach a field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Render a millisecond timestamp as RFC3339 UTC with millisecond precision.
fn rfc3339_millis(timestamp_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// ObservabilitySink — delivery boundary
// ---------------------------------------------------------------------------

/// Receiver of observability events. Implementations must not block.
pub trait ObservabilitySink: Send + Sync {
    /// Accept one event. Best-effort; errors are swallowed by the sink.
    fn record(&self, event: ObservabilityEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ObservabilitySink for NullSink {
    fn record(&self, _event: ObservabilityEvent) {}
}

/// Sink that buffers events in memory, for tests and lab runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ObservabilityEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take all buffered events, leaving the sink empty.
    pub fn take(&self) -> Vec<ObservabilityEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl ObservabilitySink for MemorySink {
    fn record(&self, event: ObservabilityEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
