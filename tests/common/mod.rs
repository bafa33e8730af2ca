#![allow(dead_code)]

use accessrl::clock::ManualClock;
use accessrl::error::StoreError;
use accessrl::prelude::*;
use accessrl::store::memory::InMemoryStore;
use accessrl::store::{StoreRequest, StoreResult};
use async_trait::async_trait;
use http::HeaderMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store wrapper that counts evaluations, for bypass-semantics assertions.
#[derive(Debug)]
pub struct CountingStore {
    inner: InMemoryStore,
    calls: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self { inner, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateStore for CountingStore {
    async fn evaluate(&self, request: &StoreRequest) -> Result<StoreResult, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.evaluate(request).await
    }
}

/// Store that always fails, for fail-open / fail-closed assertions.
#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
    Transport,
    Protocol,
}

#[derive(Debug)]
pub struct FailingStore(pub FailureMode);

#[async_trait]
impl RateStore for FailingStore {
    async fn evaluate(&self, _request: &StoreRequest) -> Result<StoreResult, StoreError> {
        match self.0 {
            FailureMode::Transport => Err(StoreError::Transport("connection refused".into())),
            FailureMode::Protocol => Err(StoreError::Protocol("reply too short".into())),
        }
    }
}

/// A limiter over a counting in-memory store on a manual clock.
pub struct Fixture {
    pub limiter: Arc<RateLimiter>,
    pub store: Arc<CountingStore>,
    pub clock: ManualClock,
}

impl Fixture {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::build(config, |builder| builder)
    }

    pub fn build(
        config: RateLimiterConfig,
        customize: impl FnOnce(RateLimiterBuilder) -> RateLimiterBuilder,
    ) -> Self {
        let clock = ManualClock::new();
        let store = Arc::new(CountingStore::new(InMemoryStore::with_clock(Arc::new(
            clock.clone(),
        ))));
        let builder = RateLimiter::builder().config(config).store(store.clone());
        let limiter = Arc::new(customize(builder).build().expect("valid configuration"));
        Self { limiter, store, clock }
    }

    /// Check a request that only carries a client IP.
    pub async fn check_ip(&self, ip: &str, meta: &[EndpointMeta]) -> Outcome {
        let headers = ip_headers(ip);
        let ctx = RequestContext::new(&headers);
        self.limiter.check(&ctx, meta, None).await.expect("store reachable")
    }

    /// Like [`check_ip`] with route information attached.
    pub async fn check_ip_on_route(
        &self,
        ip: &str,
        meta: &[EndpointMeta],
        route: &RouteInfo,
    ) -> Outcome {
        let headers = ip_headers(ip);
        let ctx = RequestContext::new(&headers);
        self.limiter.check(&ctx, meta, Some(route)).await.expect("store reachable")
    }
}

pub fn ip_headers(ip: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", ip.parse().unwrap());
    headers
}

pub fn decision(outcome: &Outcome) -> &Decision {
    outcome.decision().expect("expected a decision, got bypass")
}

pub fn penalty(violation_window_secs: u64, penalties_secs: &[u64]) -> PenaltySpec {
    PenaltySpec {
        enabled: true,
        violation_window_secs,
        penalties_secs: penalties_secs.to_vec(),
    }
}

pub fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}
