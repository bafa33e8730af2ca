#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # accessrl
//!
//! Distributed access rate limiting for HTTP services: policy-driven token
//! buckets with escalating penalties, evaluated atomically against a shared
//! store so every instance of a fleet reaches the same verdict.
//!
//! ## Features
//!
//! - **Atomic token buckets** with refill, per-request cost, and
//!   escalating time-bounded blocks, executed server-side in one step
//! - **Named policies** with live reconfiguration (lock-free snapshot swap)
//! - **Caller identity pipeline**: IP, claims, API-key headers, or
//!   compound keys, hashed before they touch the store
//! - **Tower middleware** that attaches `X-RateLimit-*` headers and shapes
//!   `429` rejections
//! - **Fail-open by default**: a store outage never takes the service down
//! - Backends: Redis (feature `redis`, default) and in-memory
//!
//! ## Quick Start
//!
//! ```rust
//! use accessrl::prelude::*;
//! use accessrl::store::memory::InMemoryStore;
//! use http::Request;
//! use std::sync::Arc;
//! use tower::{service_fn, Layer, Service, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RateLimiterConfig::default()
//!         .policy("downloads", PolicyConfig::new(3, 10))
//!         .default_policy("downloads");
//!     let limiter = Arc::new(
//!         RateLimiter::builder()
//!             .config(config)
//!             .store(Arc::new(InMemoryStore::new()))
//!             .build()?,
//!     );
//!
//!     let service = service_fn(|_req: Request<String>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(String::from("report")))
//!     });
//!     let mut service = RateLimitLayer::new(limiter).layer(service);
//!
//!     let request = Request::builder()
//!         .header("x-forwarded-for", "203.0.113.7")
//!         .body(String::new())?;
//!     let response = service.ready().await?.call(request).await?;
//!     assert_eq!(response.status(), 200);
//!     assert_eq!(response.headers()["x-ratelimit-remaining"], "2");
//!     Ok(())
//! }
//! ```
//!
//! In production, back the limiter with
//! [`RedisStore`](store::redis::RedisStore) so all instances share one
//! source of truth.

pub mod clock;
pub mod config;
pub mod decision;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod prelude;
pub mod provider;
pub mod request;
pub mod resolver;
pub mod store;

// Re-exports
pub use config::RateLimiterConfig;
pub use decision::Decision;
pub use driver::{Outcome, RateLimiter, RateLimiterBuilder};
pub use error::{ConfigError, StoreError};
pub use metrics::{LogSink, MemorySink, MetricsSink, NullSink};
pub use middleware::{RateLimitLayer, RateLimitService, RejectionHandler};
pub use policy::{PenaltyConfig, PenaltySpec, Policy, PolicyConfig};
pub use provider::{PolicyProvider, PolicySnapshot};
pub use request::{Claim, EndpointMeta, MetaChain, Principal, RemoteAddr, RequestContext, RouteInfo};
pub use resolver::{BuiltinResolver, CompositeResolver, KeyResolver};
pub use store::{PenaltyParams, RateStore, StoreRequest, StoreResult};
