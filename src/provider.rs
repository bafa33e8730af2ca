//! Policy provider: immutable snapshots with atomic republication.
//!
//! Reconfiguration builds a fully normalized snapshot off to the side and
//! publishes it with a single pointer swap; readers either see the old set
//! or the new one, never a torn mix. Lookups are lock-free.

use crate::config::RateLimiterConfig;
use crate::error::ConfigError;
use crate::policy::Policy;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// One immutable generation of normalized policies.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    policies: HashMap<String, Arc<Policy>>,
    default_policy: Option<String>,
}

impl PolicySnapshot {
    /// Normalize every policy in `config`. Any invalid policy fails the
    /// whole snapshot.
    pub fn build(config: &RateLimiterConfig) -> Result<Self, ConfigError> {
        let mut policies = HashMap::with_capacity(config.policies.len());
        for (name, policy_config) in &config.policies {
            let key = name.to_ascii_lowercase();
            let policy = Policy::normalize(name, policy_config.clone())?;
            if policies.insert(key.clone(), Arc::new(policy)).is_some() {
                return Err(ConfigError::DuplicatePolicy { policy: key });
            }
        }
        Ok(Self {
            policies,
            default_policy: config.default_policy.as_ref().map(|n| n.to_ascii_lowercase()),
        })
    }

    /// Case-insensitive lookup. `None` simply means "no limiting applies".
    pub fn policy(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(&name.to_ascii_lowercase()).cloned()
    }

    /// The configured default policy, if any and if it names a real policy.
    pub fn default_policy_name(&self) -> Option<&str> {
        self.default_policy.as_deref()
    }
}

/// Lock-free view over the current [`PolicySnapshot`].
///
/// A reader loads the snapshot once per request and keeps that local
/// reference for the duration of the decision, so a concurrent reload never
/// mixes generations within one request.
#[derive(Debug)]
pub struct PolicyProvider {
    current: ArcSwap<PolicySnapshot>,
}

impl PolicyProvider {
    /// Build the initial snapshot from configuration.
    pub fn from_config(config: &RateLimiterConfig) -> Result<Self, ConfigError> {
        Ok(Self { current: ArcSwap::from_pointee(PolicySnapshot::build(config)?) })
    }

    /// An empty provider (no policies, no default).
    pub fn empty() -> Self {
        Self { current: ArcSwap::from_pointee(PolicySnapshot::default()) }
    }

    /// Rebuild and atomically publish a fresh snapshot.
    ///
    /// On error the previous snapshot stays in place untouched.
    pub fn reload(&self, config: &RateLimiterConfig) -> Result<(), ConfigError> {
        let snapshot = PolicySnapshot::build(config)?;
        self.current.store(Arc::new(snapshot));
        Ok(())
    }

    /// Grab the current generation.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    /// Case-insensitive lookup against the current generation.
    pub fn policy(&self, name: &str) -> Option<Arc<Policy>> {
        self.current.load().policy(name)
    }

    /// The default policy of the current generation.
    pub fn default_policy(&self) -> Option<Arc<Policy>> {
        let snapshot = self.current.load();
        snapshot.default_policy_name().and_then(|name| snapshot.policy(name))
    }
}
