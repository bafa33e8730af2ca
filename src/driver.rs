//! The decision driver.
//!
//! [`RateLimiter::check`] takes one request from policy resolution through
//! key derivation to the atomic store evaluation and shapes the result into
//! a [`Decision`]. It is the single error boundary: nothing below it
//! recovers failures, and the only error that escapes is a store failure
//! under fail-closed configuration.

use crate::config::RateLimiterConfig;
use crate::decision::Decision;
use crate::error::{ConfigError, StoreError};
use crate::metrics::MetricsSink;
use crate::policy::{Policy, Predicate};
use crate::provider::PolicyProvider;
use crate::request::{EndpointMeta, RequestContext, RouteInfo};
use crate::resolver::{BuiltinResolver, KeyResolver};
use crate::store::{PenaltyParams, RateStore, StoreRequest};
use sha2::{Digest, Sha256};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// What the driver concluded for one request.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// No limiting applies: no policy, disabled, exempt, no identity, or
    /// the store failed and the policy is fail-open.
    Bypass,
    /// The store evaluated the request.
    Decision(Decision),
}

impl Outcome {
    /// The decision, if one was made.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Outcome::Decision(decision) => Some(decision),
            Outcome::Bypass => None,
        }
    }
}

/// Policy-driven rate limiter over a shared store.
pub struct RateLimiter {
    provider: Arc<PolicyProvider>,
    store: Arc<dyn RateStore>,
    sinks: Vec<Arc<dyn MetricsSink>>,
    prefix: String,
    fail_open: bool,
    fallback_resolver: Option<Arc<dyn KeyResolver>>,
    exempt_when: Option<Predicate>,
    authenticated_when: Option<Predicate>,
    store_timeout: Option<Duration>,
    pub(crate) headers_enabled: bool,
    pub(crate) rejection_body: String,
    pub(crate) rejection_content_type: String,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("prefix", &self.prefix)
            .field("fail_open", &self.fail_open)
            .field("store_timeout", &self.store_timeout)
            .field("headers_enabled", &self.headers_enabled)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Start building a limiter.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// The policy provider, for live reconfiguration.
    pub fn provider(&self) -> &Arc<PolicyProvider> {
        &self.provider
    }

    /// The store key prefix in use.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Evaluate one request.
    ///
    /// `meta` is the ordered endpoint metadata chain (later entries win
    /// field by field); `route` scopes the bucket when neither metadata nor
    /// the policy names a partition.
    pub async fn check(
        &self,
        ctx: &RequestContext<'_>,
        meta: &[EndpointMeta],
        route: Option<&RouteInfo>,
    ) -> Result<Outcome, StoreError> {
        let merged = EndpointMeta::merged(meta);

        // One snapshot for the whole request; a concurrent reload never
        // mixes generations mid-decision.
        let snapshot = self.provider.snapshot();
        let Some(policy_name) = merged
            .policy
            .clone()
            .or_else(|| snapshot.default_policy_name().map(str::to_owned))
        else {
            return Ok(Outcome::Bypass);
        };
        let Some(policy) = snapshot.policy(&policy_name) else {
            tracing::warn!(policy = %policy_name, "unknown rate limit policy, bypassing");
            return Ok(Outcome::Bypass);
        };

        if !policy.enabled {
            return Ok(Outcome::Bypass);
        }
        if self.exempt_when.as_ref().is_some_and(|exempt| exempt(ctx))
            || policy.exempt_when.as_ref().is_some_and(|exempt| exempt(ctx))
        {
            return Ok(Outcome::Bypass);
        }

        let Some(key) = self.resolve_key(&policy, ctx).await else {
            tracing::debug!(policy = %policy.name, "no caller identity, bypassing");
            return Ok(Outcome::Bypass);
        };

        let scope = merged
            .scope
            .clone()
            .or_else(|| policy.shared_bucket.clone())
            .or_else(|| route.and_then(|r| r.pattern.clone()))
            .or_else(|| route.and_then(|r| r.display_name.clone()))
            .unwrap_or_else(|| "unknown".to_string());

        let effective_limit = if self.is_authenticated(&policy, ctx) {
            policy.authenticated_limit.unwrap_or(policy.limit)
        } else {
            policy.anonymous_limit.unwrap_or(policy.limit)
        };

        let cost = merged
            .cost
            .filter(|c| *c > 0)
            .or_else(|| policy.cost_fn.as_ref().map(|f| f(ctx)))
            .unwrap_or(policy.cost)
            .clamp(1, effective_limit);

        let key_hash = hex::encode(Sha256::digest(key.as_bytes()));
        let scope_key = sanitize_scope(&scope);
        let policy_key = policy.name.to_ascii_lowercase();

        let store_request = StoreRequest {
            bucket_key: format!("{}:bucket:{policy_key}:{scope_key}:{key_hash}", self.prefix),
            block_key: format!("{}:block:{policy_key}:{scope_key}:{key_hash}", self.prefix),
            violation_key: format!("{}:viol:{policy_key}:{scope_key}:{key_hash}", self.prefix),
            capacity: effective_limit,
            window_secs: policy.window.as_secs_f64(),
            cost,
            penalty: policy.penalty.as_ref().map(|p| PenaltyParams {
                violation_window_secs: p.violation_window.as_secs(),
                penalties_secs: p.penalties.iter().map(|d| d.as_secs()).collect(),
            }),
        };

        let evaluation = self.store.evaluate(&store_request);
        let result = match self.store_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, evaluation).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(deadline)),
            },
            None => evaluation.await,
        };
        let result = match result {
            Ok(result) => result,
            Err(err) if err.is_transport() && self.fail_open => {
                tracing::error!(
                    policy = %policy.name,
                    error = %err,
                    "rate limit store unavailable, failing open"
                );
                return Ok(Outcome::Bypass);
            }
            Err(err) => return Err(err),
        };

        // The block-gate early exit reports -1 remaining tokens; the floor
        // deliberately lands that at zero.
        let remaining = result.remaining_tokens.max(0.0).floor() as u64;
        let reset_after_secs = if result.reset_after_secs > 0 {
            result.reset_after_secs
        } else {
            result.retry_after_secs
        };
        let reset_after = Duration::from_secs(reset_after_secs);

        let decision = Decision {
            policy: policy.name.clone(),
            scope,
            key_hash,
            limit: effective_limit,
            remaining,
            cost,
            retry_after: Duration::from_secs(result.retry_after_secs),
            reset_after,
            reset: SystemTime::now() + reset_after,
            allowed: result.allowed,
            blocked: result.blocked,
            violations: result.violations,
        };
        self.emit(&decision);
        Ok(Outcome::Decision(decision))
    }

    /// Fail-soft identity resolution: the policy resolver, then the
    /// configured fallback exactly once.
    async fn resolve_key(&self, policy: &Policy, ctx: &RequestContext<'_>) -> Option<String> {
        if let Some(key) = policy.resolver.resolve(ctx).await.filter(|k| !k.is_empty()) {
            return Some(key);
        }
        let fallback = self.fallback_resolver.as_ref()?;
        fallback.resolve(ctx).await.filter(|k| !k.is_empty())
    }

    fn is_authenticated(&self, policy: &Policy, ctx: &RequestContext<'_>) -> bool {
        if let Some(predicate) = &policy.authenticated_when {
            return predicate(ctx);
        }
        if let Some(predicate) = &self.authenticated_when {
            return predicate(ctx);
        }
        if ctx.principal.is_some_and(|p| p.authenticated) {
            return true;
        }
        policy
            .authenticated_headers
            .iter()
            .any(|name| ctx.headers.get(name).is_some_and(|v| !v.is_empty()))
    }

    fn emit(&self, decision: &Decision) {
        for sink in &self.sinks {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if decision.allowed {
                    sink.on_allowed(decision);
                } else if decision.blocked {
                    sink.on_blocked(decision);
                } else {
                    sink.on_limited(decision);
                }
            }));
            if outcome.is_err() {
                tracing::warn!(policy = %decision.policy, "metrics sink panicked");
            }
        }
    }
}

/// Replace every byte that would be unsafe inside a store key: whitespace,
/// control characters, `:`, `|`, `/`, `\`, and anything non-ASCII.
fn sanitize_scope(scope: &str) -> String {
    if scope.is_empty() {
        return "default".to_string();
    }
    scope
        .bytes()
        .map(|b| match b {
            b':' | b'|' | b'/' | b'\\' => '_',
            b if b.is_ascii_whitespace() || b.is_ascii_control() || !b.is_ascii() => '_',
            b => b as char,
        })
        .collect()
}

/// Builder for [`RateLimiter`].
#[derive(Default)]
pub struct RateLimiterBuilder {
    config: RateLimiterConfig,
    store: Option<Arc<dyn RateStore>>,
    provider: Option<Arc<PolicyProvider>>,
    sinks: Vec<Arc<dyn MetricsSink>>,
    fallback_resolver: Option<Arc<dyn KeyResolver>>,
    disable_fallback: bool,
    exempt_when: Option<Predicate>,
    authenticated_when: Option<Predicate>,
    store_timeout: Option<Duration>,
    disable_store_timeout: bool,
}

impl RateLimiterBuilder {
    /// Use this configuration (policies, prefix, fail-open, shaping).
    pub fn config(mut self, config: RateLimiterConfig) -> Self {
        self.config = config;
        self
    }

    /// Back the limiter with this store.
    pub fn store(mut self, store: Arc<dyn RateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing provider instead of building one from the
    /// configuration (useful when several limiters reload together).
    pub fn provider(mut self, provider: Arc<PolicyProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Attach a metrics sink. May be called repeatedly.
    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Replace the IP fallback used when a policy resolver yields nothing.
    pub fn fallback_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.fallback_resolver = Some(resolver);
        self
    }

    /// Disable the fallback entirely: a policy resolver returning nothing
    /// bypasses limiting.
    pub fn no_fallback_resolver(mut self) -> Self {
        self.disable_fallback = true;
        self
    }

    /// Exempt requests matching the predicate from every policy.
    pub fn exempt_when(
        mut self,
        predicate: impl Fn(&RequestContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.exempt_when = Some(Arc::new(predicate));
        self
    }

    /// Global authentication detection, overridden per policy.
    pub fn authenticated_when(
        mut self,
        predicate: impl Fn(&RequestContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.authenticated_when = Some(Arc::new(predicate));
        self
    }

    /// Deadline for the store round-trip; expiry counts as a transport
    /// failure. Defaults to one second.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    /// Let store calls run unbounded.
    pub fn no_store_timeout(mut self) -> Self {
        self.disable_store_timeout = true;
        self
    }

    /// Normalize all policies and assemble the limiter.
    pub fn build(self) -> Result<RateLimiter, ConfigError> {
        let store = self.store.ok_or(ConfigError::MissingStore)?;
        let provider = match self.provider {
            Some(provider) => provider,
            None => Arc::new(PolicyProvider::from_config(&self.config)?),
        };
        let fallback_resolver = if self.disable_fallback {
            None
        } else {
            Some(
                self.fallback_resolver
                    .unwrap_or_else(|| Arc::new(BuiltinResolver::Ip) as Arc<dyn KeyResolver>),
            )
        };
        let store_timeout = if self.disable_store_timeout {
            None
        } else {
            Some(self.store_timeout.unwrap_or(Duration::from_secs(1)))
        };
        Ok(RateLimiter {
            provider,
            store,
            sinks: self.sinks,
            prefix: self.config.prefix,
            fail_open: self.config.fail_open,
            fallback_resolver,
            exempt_when: self.exempt_when,
            authenticated_when: self.authenticated_when,
            store_timeout,
            headers_enabled: self.config.headers_enabled,
            rejection_body: self.config.rejection_body,
            rejection_content_type: self.config.rejection_content_type,
        })
    }
}
