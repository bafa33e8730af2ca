//! Error types for policy registration and store access.

use std::time::Duration;

/// Raised while normalizing policy configuration. Fatal at registration:
/// a provider never publishes a snapshot containing an invalid policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// The policy declares no capacity at all.
    #[error("policy `{policy}`: no limit configured (set `limit` or one of the per-period limits)")]
    MissingLimit {
        /// Offending policy name.
        policy: String,
    },
    /// The policy sets an explicit limit without a refill window.
    #[error("policy `{policy}`: `limit` requires `window_secs`")]
    MissingWindow {
        /// Offending policy name.
        policy: String,
    },
    /// A numeric field that must be strictly positive is zero.
    #[error("policy `{policy}`: `{field}` must be greater than zero")]
    NotPositive {
        /// Offending policy name.
        policy: String,
        /// Offending field name.
        field: &'static str,
    },
    /// Per-request cost exceeds the bucket capacity.
    #[error("policy `{policy}`: cost {cost} exceeds limit {limit}")]
    CostExceedsLimit {
        /// Offending policy name.
        policy: String,
        /// Configured cost.
        cost: u64,
        /// Configured limit.
        limit: u64,
    },
    /// A key-resolver spec did not match any known resolver.
    #[error("policy `{policy}`: unknown key resolver spec `{spec}`")]
    UnknownResolver {
        /// Offending policy name.
        policy: String,
        /// The spec as written in configuration.
        spec: String,
    },
    /// A configured header name is not a valid HTTP header.
    #[error("policy `{policy}`: invalid header name `{header}`")]
    InvalidHeader {
        /// Offending policy name.
        policy: String,
        /// The header as written in configuration.
        header: String,
    },
    /// Two policies collide on their case-insensitive name.
    #[error("duplicate policy name `{policy}` (names are case-insensitive)")]
    DuplicatePolicy {
        /// The colliding name, lowercased.
        policy: String,
    },
    /// The limiter was built without a backing store.
    #[error("no rate store configured")]
    MissingStore,
}

/// Failures crossing the store boundary.
///
/// Transport failures are subject to the fail-open setting; a protocol
/// violation is a bug on one side of the wire contract and always propagates.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Network, connection, or server-side error talking to the store.
    #[error("store transport failure: {0}")]
    Transport(String),
    /// The store call did not complete within the configured deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// The store returned a malformed result (wrong arity or non-numeric).
    #[error("store protocol violation: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Whether this failure is a transport-class error (eligible for
    /// fail-open). Protocol violations are not.
    pub fn is_transport(&self) -> bool {
        !matches!(self, StoreError::Protocol(_))
    }
}
