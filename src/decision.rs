//! The per-request verdict.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Outcome of one rate-limit evaluation. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Name of the policy that produced this decision.
    pub policy: String,
    /// Bucket partition the request landed in.
    pub scope: String,
    /// Hex SHA-256 fingerprint of the caller key.
    pub key_hash: String,
    /// Effective capacity applied to this caller.
    pub limit: u64,
    /// Whole tokens left in the bucket, floored and never negative.
    pub remaining: u64,
    /// Tokens this request cost (or would have cost).
    pub cost: u64,
    /// How long the caller should wait before retrying. Zero when allowed.
    pub retry_after: Duration,
    /// Time until the bucket is full again.
    pub reset_after: Duration,
    /// Wall-clock instant the bucket is full again. A display hint, not a
    /// guarantee; the store's clock is authoritative.
    pub reset: SystemTime,
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Whether an escalation penalty is in force.
    pub blocked: bool,
    /// Violations accumulated inside the current violation window.
    pub violations: u64,
}

impl Decision {
    /// `reset` as integer seconds since the UNIX epoch, for the
    /// `X-RateLimit-Reset` header.
    pub fn reset_unix_secs(&self) -> u64 {
        self.reset.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
    }

    /// `retry_after` as integer seconds, rounded up, for the `Retry-After`
    /// header.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}
