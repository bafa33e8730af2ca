//! Policy model: the serde-facing configuration and the normalized,
//! immutable form the driver consumes.
//!
//! Normalization runs once per policy per snapshot. It promotes per-period
//! convenience limits, fills defaults, validates every invariant (failing
//! fast with an error naming the offending policy), and compiles the
//! key-resolver specs so no string parsing happens per request.

use crate::error::ConfigError;
use crate::request::RequestContext;
use crate::resolver::{self, KeyResolver};
use http::HeaderName;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Boolean request predicate (exemption and authentication hooks).
pub type Predicate = Arc<dyn Fn(&RequestContext<'_>) -> bool + Send + Sync>;

/// Dynamic per-request cost hook. Values are clamped to
/// `[1, effective_limit]` at decision time.
pub type CostFn = Arc<dyn Fn(&RequestContext<'_>) -> u64 + Send + Sync>;

/// Escalating-penalty configuration as it appears in the schema.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PenaltySpec {
    /// Kill-switch; a disabled penalty block is dropped at normalization.
    pub enabled: bool,
    /// Sliding window during which denials accumulate. Zero keeps the
    /// violation counter forever.
    pub violation_window_secs: u64,
    /// Block durations for the 1st, 2nd, ... violation; the last entry
    /// saturates.
    pub penalties_secs: Vec<u64>,
}

impl Default for PenaltySpec {
    fn default() -> Self {
        Self { enabled: true, violation_window_secs: 0, penalties_secs: Vec::new() }
    }
}

/// Normalized penalty configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PenaltyConfig {
    /// Sliding violation-accumulation window; zero means no expiry.
    pub violation_window: Duration,
    /// Escalation ladder, all strictly positive.
    pub penalties: Vec<Duration>,
}

/// One named policy as bound from configuration.
///
/// The serde surface carries everything expressible in a config file; the
/// builder methods attach the programmatic hooks (custom resolver,
/// predicates, dynamic cost) that cannot be deserialized.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Bucket capacity.
    pub limit: Option<u64>,
    /// Refill window in seconds.
    pub window_secs: Option<u64>,
    /// Convenience: capacity per one-second window.
    pub limit_per_second: Option<u64>,
    /// Convenience: capacity per one-minute window.
    pub limit_per_minute: Option<u64>,
    /// Convenience: capacity per one-hour window.
    pub limit_per_hour: Option<u64>,
    /// Tokens consumed per request; defaults to 1.
    pub cost: Option<u64>,
    /// Capacity override for authenticated callers.
    pub authenticated_limit: Option<u64>,
    /// Capacity override for anonymous callers.
    pub anonymous_limit: Option<u64>,
    /// Headers whose non-empty presence marks a caller authenticated.
    pub authenticated_headers: Vec<String>,
    /// Cross-endpoint bucket name.
    pub shared_bucket: Option<String>,
    /// Ordered key-resolver specs.
    pub key_resolvers: Vec<String>,
    /// Comma-separated alternative to `key_resolvers`.
    pub key_strategy: Option<String>,
    /// Escalating-penalty block.
    pub penalty: Option<PenaltySpec>,
    /// Policy kill-switch; defaults to enabled.
    pub enabled: Option<bool>,

    /// Explicit resolver; wins over `key_resolvers` / `key_strategy`.
    #[serde(skip)]
    pub resolver: Option<Arc<dyn KeyResolver>>,
    /// Per-policy exemption predicate.
    #[serde(skip)]
    pub exempt_when: Option<Predicate>,
    /// Per-policy authentication detection override.
    #[serde(skip)]
    pub authenticated_when: Option<Predicate>,
    /// Dynamic per-request cost hook.
    #[serde(skip)]
    pub cost_fn: Option<CostFn>,
}

impl fmt::Debug for PolicyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyConfig")
            .field("limit", &self.limit)
            .field("window_secs", &self.window_secs)
            .field("limit_per_second", &self.limit_per_second)
            .field("limit_per_minute", &self.limit_per_minute)
            .field("limit_per_hour", &self.limit_per_hour)
            .field("cost", &self.cost)
            .field("authenticated_limit", &self.authenticated_limit)
            .field("anonymous_limit", &self.anonymous_limit)
            .field("authenticated_headers", &self.authenticated_headers)
            .field("shared_bucket", &self.shared_bucket)
            .field("key_resolvers", &self.key_resolvers)
            .field("key_strategy", &self.key_strategy)
            .field("penalty", &self.penalty)
            .field("enabled", &self.enabled)
            .field("resolver", &self.resolver.as_ref().map(|_| "<resolver>"))
            .field("exempt_when", &self.exempt_when.as_ref().map(|_| "<predicate>"))
            .field("authenticated_when", &self.authenticated_when.as_ref().map(|_| "<predicate>"))
            .field("cost_fn", &self.cost_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl PolicyConfig {
    /// A policy of `limit` tokens refilled over `window_secs` seconds.
    pub fn new(limit: u64, window_secs: u64) -> Self {
        Self { limit: Some(limit), window_secs: Some(window_secs), ..Self::default() }
    }

    /// Replace the compiled resolver with an explicit one. Takes precedence
    /// over `key_resolvers` / `key_strategy`.
    pub fn resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Exempt requests matching the predicate from this policy.
    pub fn exempt_when(
        mut self,
        predicate: impl Fn(&RequestContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.exempt_when = Some(Arc::new(predicate));
        self
    }

    /// Override how authentication is detected for this policy.
    pub fn authenticated_when(
        mut self,
        predicate: impl Fn(&RequestContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.authenticated_when = Some(Arc::new(predicate));
        self
    }

    /// Compute the per-request cost dynamically.
    pub fn cost_with(
        mut self,
        cost: impl Fn(&RequestContext<'_>) -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.cost_fn = Some(Arc::new(cost));
        self
    }
}

/// A normalized policy. Immutable once published in a snapshot;
/// reconfiguration replaces the whole snapshot instead of mutating.
#[derive(Clone)]
pub struct Policy {
    /// Policy name as configured (lookup is case-insensitive).
    pub name: String,
    /// Bucket capacity.
    pub limit: u64,
    /// Refill window.
    pub window: Duration,
    /// Tokens consumed per request.
    pub cost: u64,
    /// Capacity override for authenticated callers.
    pub authenticated_limit: Option<u64>,
    /// Capacity override for anonymous callers.
    pub anonymous_limit: Option<u64>,
    /// Headers whose non-empty presence marks a caller authenticated.
    pub authenticated_headers: Vec<HeaderName>,
    /// Cross-endpoint bucket name.
    pub shared_bucket: Option<String>,
    /// Escalating penalties, if configured and enabled.
    pub penalty: Option<PenaltyConfig>,
    /// Kill-switch.
    pub enabled: bool,
    pub(crate) resolver: Arc<dyn KeyResolver>,
    pub(crate) exempt_when: Option<Predicate>,
    pub(crate) authenticated_when: Option<Predicate>,
    pub(crate) cost_fn: Option<CostFn>,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("cost", &self.cost)
            .field("authenticated_limit", &self.authenticated_limit)
            .field("anonymous_limit", &self.anonymous_limit)
            .field("authenticated_headers", &self.authenticated_headers)
            .field("shared_bucket", &self.shared_bucket)
            .field("penalty", &self.penalty)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl Policy {
    /// Normalize a configured policy, validating every invariant.
    pub fn normalize(name: &str, config: PolicyConfig) -> Result<Self, ConfigError> {
        let policy = || name.to_string();

        // Per-period convenience fields materialize into limit + window;
        // an explicit limit/window pair wins over them.
        let (limit, window_secs) = if let (Some(limit), Some(window)) =
            (config.limit, config.window_secs)
        {
            (limit, window)
        } else if let Some(limit) = config.limit_per_second {
            (limit, 1)
        } else if let Some(limit) = config.limit_per_minute {
            (limit, 60)
        } else if let Some(limit) = config.limit_per_hour {
            (limit, 3_600)
        } else if config.limit.is_some() {
            return Err(ConfigError::MissingWindow { policy: policy() });
        } else {
            return Err(ConfigError::MissingLimit { policy: policy() });
        };

        if limit == 0 {
            return Err(ConfigError::NotPositive { policy: policy(), field: "limit" });
        }
        if window_secs == 0 {
            return Err(ConfigError::NotPositive { policy: policy(), field: "window" });
        }

        let cost = config.cost.unwrap_or(1);
        if cost == 0 {
            return Err(ConfigError::NotPositive { policy: policy(), field: "cost" });
        }
        if cost > limit {
            return Err(ConfigError::CostExceedsLimit { policy: policy(), cost, limit });
        }
        for (field, value) in [
            ("authenticated_limit", config.authenticated_limit),
            ("anonymous_limit", config.anonymous_limit),
        ] {
            if value == Some(0) {
                return Err(ConfigError::NotPositive { policy: policy(), field });
            }
        }

        let penalty = match config.penalty {
            Some(spec) if spec.enabled => {
                for secs in &spec.penalties_secs {
                    if *secs == 0 {
                        return Err(ConfigError::NotPositive {
                            policy: policy(),
                            field: "penalties",
                        });
                    }
                }
                Some(PenaltyConfig {
                    violation_window: Duration::from_secs(spec.violation_window_secs),
                    penalties: spec.penalties_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
                })
            }
            _ => None,
        };

        let mut authenticated_headers = Vec::with_capacity(config.authenticated_headers.len());
        for header in &config.authenticated_headers {
            let name = HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
                ConfigError::InvalidHeader { policy: policy(), header: header.clone() }
            })?;
            authenticated_headers.push(name);
        }

        let resolver = match config.resolver {
            Some(resolver) => resolver,
            None => {
                let specs: Vec<String> = if !config.key_resolvers.is_empty() {
                    config.key_resolvers.clone()
                } else if let Some(strategy) = &config.key_strategy {
                    strategy
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                } else {
                    Vec::new()
                };
                resolver::compile(name, &specs)?
            }
        };

        Ok(Policy {
            name: name.to_string(),
            limit,
            window: Duration::from_secs(window_secs),
            cost,
            authenticated_limit: config.authenticated_limit,
            anonymous_limit: config.anonymous_limit,
            authenticated_headers,
            shared_bucket: config.shared_bucket,
            penalty,
            enabled: config.enabled.unwrap_or(true),
            resolver,
            exempt_when: config.exempt_when,
            authenticated_when: config.authenticated_when,
            cost_fn: config.cost_fn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_period_limits_materialize() {
        let p = Policy::normalize("a", PolicyConfig {
            limit_per_minute: Some(120),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(p.limit, 120);
        assert_eq!(p.window, Duration::from_secs(60));

        let p = Policy::normalize("b", PolicyConfig {
            limit_per_second: Some(5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!((p.limit, p.window.as_secs()), (5, 1));

        let p = Policy::normalize("c", PolicyConfig {
            limit_per_hour: Some(1000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!((p.limit, p.window.as_secs()), (1000, 3_600));
    }

    #[test]
    fn explicit_limit_and_window_win_over_per_period() {
        let p = Policy::normalize("a", PolicyConfig {
            limit: Some(10),
            window_secs: Some(30),
            limit_per_minute: Some(999),
            ..Default::default()
        })
        .unwrap();
        assert_eq!((p.limit, p.window.as_secs()), (10, 30));
    }

    #[test]
    fn cost_defaults_to_one() {
        let p = Policy::normalize("a", PolicyConfig::new(10, 60)).unwrap();
        assert_eq!(p.cost, 1);
    }

    #[test]
    fn invariants_fail_fast_naming_the_policy() {
        let err = Policy::normalize("empty", PolicyConfig::default()).unwrap_err();
        assert!(err.to_string().contains("empty"));

        let err = Policy::normalize("zero-window", PolicyConfig {
            limit: Some(10),
            window_secs: Some(0),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("window"));

        let err = Policy::normalize("greedy", PolicyConfig {
            cost: Some(11),
            ..PolicyConfig::new(10, 60)
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::CostExceedsLimit { .. }));

        let err = Policy::normalize("pen", PolicyConfig {
            penalty: Some(PenaltySpec {
                penalties_secs: vec![2, 0, 15],
                ..Default::default()
            }),
            ..PolicyConfig::new(10, 60)
        })
        .unwrap_err();
        assert!(err.to_string().contains("penalties"));
    }

    #[test]
    fn disabled_penalty_block_is_dropped() {
        let p = Policy::normalize("a", PolicyConfig {
            penalty: Some(PenaltySpec {
                enabled: false,
                violation_window_secs: 30,
                penalties_secs: vec![2],
            }),
            ..PolicyConfig::new(10, 60)
        })
        .unwrap();
        assert!(p.penalty.is_none());
    }

    #[test]
    fn key_strategy_is_comma_split() {
        let p = Policy::normalize("a", PolicyConfig {
            key_strategy: Some("ip, api-key".into()),
            ..PolicyConfig::new(10, 60)
        })
        .unwrap();
        // Compound key: both dimensions contribute.
        let map = {
            let mut m = http::HeaderMap::new();
            m.insert("x-forwarded-for", "203.0.113.7".parse().unwrap());
            m.insert("x-api-key", "k-9".parse().unwrap());
            m
        };
        let ctx = RequestContext::new(&map);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert_eq!(rt.block_on(p.resolver.resolve(&ctx)).as_deref(), Some("203.0.113.7|k-9"));
    }

    #[test]
    fn unknown_resolver_spec_is_fatal() {
        let err = Policy::normalize("a", PolicyConfig {
            key_resolvers: vec!["session-cookie".into()],
            ..PolicyConfig::new(10, 60)
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownResolver { .. }));
    }

    #[test]
    fn config_deserializes_schema_keys() {
        let config: PolicyConfig = serde_json::from_str(
            r#"{
                "limit": 30,
                "window_secs": 60,
                "cost": 2,
                "authenticated_limit": 60,
                "shared_bucket": "exports",
                "key_resolvers": ["ip"],
                "penalty": { "violation_window_secs": 30, "penalties_secs": [2, 5, 15] },
                "enabled": true
            }"#,
        )
        .unwrap();
        let p = Policy::normalize("exports", config).unwrap();
        assert_eq!(p.limit, 30);
        assert_eq!(p.cost, 2);
        assert_eq!(p.authenticated_limit, Some(60));
        assert_eq!(p.shared_bucket.as_deref(), Some("exports"));
        let penalty = p.penalty.unwrap();
        assert_eq!(penalty.violation_window, Duration::from_secs(30));
        assert_eq!(penalty.penalties.len(), 3);
    }
}
