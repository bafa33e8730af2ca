//! The store seam: one atomic token-bucket evaluation per request.
//!
//! [`RateStore`] is the wire contract between the decision driver and the
//! shared state. Each call evaluates block gate, refill, consume, violation
//! accounting, and penalty escalation as a single atomic action; partial
//! updates are never observable, and concurrent calls for the same key are
//! serialized by the store.
//!
//! Two backends ship: [`memory::InMemoryStore`] for tests and
//! single-instance deployments, and [`redis::RedisStore`] (feature `redis`)
//! for a horizontally scaled fleet sharing one source of truth.

use crate::error::StoreError;
use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

/// Penalty parameters handed to the store alongside each evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PenaltyParams {
    /// Sliding violation-accumulation window in seconds; zero means the
    /// counter never expires.
    pub violation_window_secs: u64,
    /// Escalation ladder in seconds; the k-th violation selects entry
    /// `min(k, len)`, 1-indexed.
    pub penalties_secs: Vec<u64>,
}

/// One evaluation request.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequest {
    /// Key holding `{ tokens, ts }`.
    pub bucket_key: String,
    /// Presence-only penalty sentinel key.
    pub block_key: String,
    /// Violation counter key.
    pub violation_key: String,
    /// Bucket capacity.
    pub capacity: u64,
    /// Refill window in seconds.
    pub window_secs: f64,
    /// Tokens to consume.
    pub cost: u64,
    /// Escalation parameters, if the policy carries penalties.
    pub penalty: Option<PenaltyParams>,
}

/// One evaluation result. Exactly six semantic fields cross the wire; a
/// shorter or non-numeric reply is a protocol violation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResult {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Whether a penalty block is in force (pre-existing or just set).
    pub blocked: bool,
    /// Tokens left after this evaluation. `-1.0` on the block-gate early
    /// exit, where the bucket is deliberately not read.
    pub remaining_tokens: f64,
    /// Seconds to wait before retrying; zero when allowed.
    pub retry_after_secs: u64,
    /// Seconds until the bucket refills completely.
    pub reset_after_secs: u64,
    /// Violation count inside the current window; zero on allowed and
    /// block-gate paths.
    pub violations: u64,
}

/// Atomic evaluation against shared state.
///
/// Implementations must guarantee that for any single key triple all
/// concurrent evaluations serialize: no two calls observe the same bucket
/// snapshot. Decisions are never cached in-process; the store is the sole
/// authority.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Run one atomic evaluation.
    async fn evaluate(&self, request: &StoreRequest) -> Result<StoreResult, StoreError>;
}

impl StoreRequest {
    pub(crate) fn violation_window_secs(&self) -> u64 {
        self.penalty.as_ref().map(|p| p.violation_window_secs).unwrap_or(0)
    }

    pub(crate) fn penalties_secs(&self) -> &[u64] {
        self.penalty.as_ref().map(|p| p.penalties_secs.as_slice()).unwrap_or(&[])
    }
}
