//! In-memory store backend.
//!
//! Runs the same evaluation as the distributed backend, serialized by a
//! process-local mutex, with expiry emulated through stored deadlines. Only
//! correct for a single instance: a fleet must share one distributed store,
//! or each node enforces its own private budget.

use super::{RateStore, StoreRequest, StoreResult};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    ts: f64,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct Shard {
    buckets: HashMap<String, Bucket>,
    // block key -> deadline (seconds)
    blocks: HashMap<String, f64>,
    // violation key -> (count, deadline)
    violations: HashMap<String, (u64, f64)>,
}

/// Process-local [`RateStore`].
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    shard: Arc<Mutex<Shard>>,
}

impl InMemoryStore {
    /// Store on the system wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store on an injected clock. Tests drive a
    /// [`ManualClock`](crate::clock::ManualClock) through this.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock, shard: Arc::new(Mutex::new(Shard::default())) }
    }

    /// Number of live bucket entries (expired entries may linger until
    /// touched).
    pub fn bucket_count(&self) -> usize {
        self.shard.lock().unwrap().buckets.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateStore for InMemoryStore {
    async fn evaluate(&self, request: &StoreRequest) -> Result<StoreResult, StoreError> {
        let now = self.clock.now_secs();
        let mut shard = self.shard.lock().unwrap();

        // Block gate: while a penalty is in force nothing else is touched,
        // so a blocked caller earns no refill.
        if let Some(&deadline) = shard.blocks.get(&request.block_key) {
            if deadline > now {
                return Ok(StoreResult {
                    allowed: false,
                    blocked: true,
                    remaining_tokens: -1.0,
                    retry_after_secs: (deadline - now).ceil() as u64,
                    reset_after_secs: 0,
                    violations: 0,
                });
            }
            shard.blocks.remove(&request.block_key);
        }

        let capacity = request.capacity as f64;
        let (tokens, ts) = match shard.buckets.get(&request.bucket_key) {
            Some(bucket) if bucket.expires_at > now => (bucket.tokens, bucket.ts),
            _ => (capacity, now),
        };

        // Clock regressions never consume tokens.
        let delta = (now - ts).max(0.0);
        let rate = capacity / request.window_secs;
        let filled = (tokens + delta * rate).min(capacity);

        let cost = request.cost as f64;
        let allowed = filled >= cost;
        let remaining = if allowed { filled - cost } else { filled };

        // A denied request consumes nothing but still advances the refill
        // reference: the elapsed time was earned.
        let bucket_ttl = (2.0 * request.window_secs).ceil().max(1.0);
        shard.buckets.insert(
            request.bucket_key.clone(),
            Bucket { tokens: remaining, ts: now, expires_at: now + bucket_ttl },
        );

        let reset_after_secs =
            if rate > 0.0 { ((capacity - remaining) / rate).ceil() as u64 } else { 0 };

        if allowed {
            return Ok(StoreResult {
                allowed: true,
                blocked: false,
                remaining_tokens: remaining,
                retry_after_secs: 0,
                reset_after_secs,
                violations: 0,
            });
        }

        let violation_window = request.violation_window_secs();
        let penalties = request.penalties_secs();

        let mut violations = 0;
        if !penalties.is_empty() || violation_window > 0 {
            let entry = shard.violations.entry(request.violation_key.clone()).or_insert((0, f64::INFINITY));
            if entry.1 <= now {
                *entry = (0, f64::INFINITY);
            }
            entry.0 += 1;
            if violation_window > 0 {
                entry.1 = now + violation_window as f64;
            }
            violations = entry.0;
        }

        let penalty_secs = if penalties.is_empty() {
            0
        } else {
            let index = (violations as usize).min(penalties.len());
            penalties[index - 1]
        };

        if penalty_secs > 0 {
            // Overwrites any prior block.
            shard.blocks.insert(request.block_key.clone(), now + penalty_secs as f64);
        }

        let retry_after_secs = if penalty_secs > 0 {
            penalty_secs
        } else if rate > 0.0 {
            ((cost - remaining) / rate).ceil() as u64
        } else {
            request.window_secs.ceil() as u64
        };

        Ok(StoreResult {
            allowed: false,
            blocked: penalty_secs > 0,
            remaining_tokens: remaining,
            retry_after_secs,
            reset_after_secs,
            violations,
        })
    }
}
