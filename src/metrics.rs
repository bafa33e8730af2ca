//! Metrics hooks.
//!
//! A [`MetricsSink`] observes every decision. Sinks must be non-blocking;
//! the driver wraps each call so a panicking sink never corrupts the
//! decision path.

use crate::decision::Decision;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Observer of rate-limit decisions. All methods default to no-ops so a
/// sink only implements the outcomes it cares about.
pub trait MetricsSink: Send + Sync {
    /// The request was allowed.
    fn on_allowed(&self, decision: &Decision) {
        let _ = decision;
    }

    /// The request ran out of tokens (soft limit).
    fn on_limited(&self, decision: &Decision) {
        let _ = decision;
    }

    /// The request hit an escalation penalty (hard block).
    fn on_blocked(&self, decision: &Decision) {
        let _ = decision;
    }
}

/// Discards every decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {}

/// Logs decisions through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn on_allowed(&self, decision: &Decision) {
        tracing::debug!(
            policy = %decision.policy,
            scope = %decision.scope,
            remaining = decision.remaining,
            "request allowed"
        );
    }

    fn on_limited(&self, decision: &Decision) {
        tracing::info!(
            policy = %decision.policy,
            scope = %decision.scope,
            key = %decision.key_hash,
            retry_after_secs = decision.retry_after_secs(),
            "request rate limited"
        );
    }

    fn on_blocked(&self, decision: &Decision) {
        tracing::warn!(
            policy = %decision.policy,
            scope = %decision.scope,
            key = %decision.key_hash,
            violations = decision.violations,
            retry_after_secs = decision.retry_after_secs(),
            "request blocked by penalty"
        );
    }
}

/// Which hook fired for a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// `on_allowed`
    Allowed,
    /// `on_limited`
    Limited,
    /// `on_blocked`
    Blocked,
}

/// One recorded event.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    /// Which hook fired.
    pub kind: MetricKind,
    /// The decision as observed.
    pub decision: Decision,
}

/// Bounded in-memory sink for tests and diagnostics. The oldest event is
/// evicted once capacity is reached.
#[derive(Debug, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<MetricEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Sink holding at most 10 000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Sink holding at most `capacity` events (minimum one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn record(&self, kind: MetricKind, decision: &Decision) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push(MetricEvent { kind, decision: decision.clone() });
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    /// How many events were dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MemorySink {
    fn on_allowed(&self, decision: &Decision) {
        self.record(MetricKind::Allowed, decision);
    }

    fn on_limited(&self, decision: &Decision) {
        self.record(MetricKind::Limited, decision);
    }

    fn on_blocked(&self, decision: &Decision) {
        self.record(MetricKind::Blocked, decision);
    }
}
