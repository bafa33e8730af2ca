//! Convenient re-exports for common accessrl types.
pub use crate::{
    config::RateLimiterConfig,
    decision::Decision,
    driver::{Outcome, RateLimiter, RateLimiterBuilder},
    error::{ConfigError, StoreError},
    metrics::{LogSink, MemorySink, MetricsSink, NullSink},
    middleware::{RateLimitLayer, RateLimitService},
    policy::{PenaltySpec, PolicyConfig},
    provider::PolicyProvider,
    request::{Claim, EndpointMeta, MetaChain, Principal, RemoteAddr, RequestContext, RouteInfo},
    resolver::{BuiltinResolver, CompositeResolver, KeyResolver},
    store::RateStore,
};
