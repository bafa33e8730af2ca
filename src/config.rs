//! Limiter-wide configuration: the options object a host application binds
//! from its settings source and hands to the builder.

use crate::policy::PolicyConfig;
use serde::Deserialize;
use std::collections::HashMap;

/// Default store key prefix.
pub const DEFAULT_PREFIX: &str = "elf:accessrl";

/// Default rejection body.
pub const DEFAULT_REJECTION_BODY: &str = "Too Many Requests";

/// Default rejection content type.
pub const DEFAULT_REJECTION_CONTENT_TYPE: &str = "text/plain";

/// Top-level limiter configuration.
///
/// Everything here is data; programmatic hooks (global predicates, custom
/// fallback resolver, rejection handler, metrics sinks) attach through the
/// limiter and layer builders.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Store key prefix shared by every instance of the fleet.
    pub prefix: String,
    /// On store transport failure, let the request through (`true`, the
    /// default) or surface an infrastructure failure (`false`).
    pub fail_open: bool,
    /// Attach `X-RateLimit-*` response headers.
    pub headers_enabled: bool,
    /// Body written on rejection when no custom handler is installed.
    pub rejection_body: String,
    /// Content type of the rejection body.
    pub rejection_content_type: String,
    /// Policy applied when endpoint metadata names none.
    pub default_policy: Option<String>,
    /// Named policies.
    pub policies: HashMap<String, PolicyConfig>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            fail_open: true,
            headers_enabled: true,
            rejection_body: DEFAULT_REJECTION_BODY.to_string(),
            rejection_content_type: DEFAULT_REJECTION_CONTENT_TYPE.to_string(),
            default_policy: None,
            policies: HashMap::new(),
        }
    }
}

impl RateLimiterConfig {
    /// Add or replace a named policy.
    pub fn policy(mut self, name: impl Into<String>, config: PolicyConfig) -> Self {
        self.policies.insert(name.into(), config);
        self
    }

    /// Set the default policy name.
    pub fn default_policy(mut self, name: impl Into<String>) -> Self {
        self.default_policy = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_wire_contract() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.prefix, "elf:accessrl");
        assert!(config.fail_open);
        assert!(config.headers_enabled);
        assert_eq!(config.rejection_body, "Too Many Requests");
        assert_eq!(config.rejection_content_type, "text/plain");
    }

    #[test]
    fn binds_from_json() {
        let config: RateLimiterConfig = serde_json::from_str(
            r#"{
                "prefix": "acme:rl",
                "fail_open": false,
                "default_policy": "api",
                "policies": {
                    "api": { "limit_per_minute": 600 },
                    "downloads": { "limit": 3, "window_secs": 10 }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.prefix, "acme:rl");
        assert!(!config.fail_open);
        assert_eq!(config.default_policy.as_deref(), Some("api"));
        assert_eq!(config.policies.len(), 2);
    }
}
