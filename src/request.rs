//! Request-side views consumed by key resolvers and the decision driver.
//!
//! The crate never depends on a specific HTTP framework. The middleware (or a
//! host application embedding the driver directly) assembles a
//! [`RequestContext`] from whatever it has at hand: the header map, the
//! transport-level peer address, and an authenticated principal if an auth
//! layer established one. Endpoint metadata and route information travel as
//! request extensions.

use http::HeaderMap;
use std::net::IpAddr;

/// A single identity claim attached to a [`Principal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Claim type, e.g. [`claims::NAME_ID`] or [`claims::SUBJECT`].
    pub kind: String,
    /// Claim value.
    pub value: String,
}

/// Well-known claim types recognized by the built-in resolvers.
pub mod claims {
    /// Stable per-user identifier claim.
    pub const NAME_ID: &str = "name_id";
    /// OAuth/JWT subject claim.
    pub const SUBJECT: &str = "sub";
}

/// The authenticated caller, as established by an upstream auth layer.
///
/// Insert one into the request extensions to make claim-based resolvers and
/// identity-conditional limits work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    /// Whether the caller passed authentication.
    pub authenticated: bool,
    /// Claims attached to the caller.
    pub claims: Vec<Claim>,
}

impl Principal {
    /// An authenticated principal with the given claims.
    pub fn authenticated(claims: Vec<Claim>) -> Self {
        Self { authenticated: true, claims }
    }

    /// First claim value of the given type, if present and non-empty.
    pub fn claim(&self, kind: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.value.as_str())
            .filter(|v| !v.is_empty())
    }
}

/// Transport-level peer address, inserted into request extensions by the
/// host server (the equivalent of a connect-info layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub std::net::SocketAddr);

/// Borrowed view of one request, handed to key resolvers and predicates.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Request headers.
    pub headers: &'a HeaderMap,
    /// Transport-level client address, if the server recorded one.
    pub remote_addr: Option<IpAddr>,
    /// Authenticated principal, if an auth layer established one.
    pub principal: Option<&'a Principal>,
}

impl<'a> RequestContext<'a> {
    /// Context over a bare header map, with no transport address and no
    /// principal.
    pub fn new(headers: &'a HeaderMap) -> Self {
        Self { headers, remote_addr: None, principal: None }
    }

    /// Attach the transport-level client address.
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Attach the authenticated principal.
    pub fn with_principal(mut self, principal: &'a Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// First value of `name` as a string, if present and valid UTF-8.
    pub(crate) fn header_str(&self, name: &http::HeaderName) -> Option<&'a str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Per-endpoint rate-limit metadata, attached as a request extension.
///
/// Routers that layer metadata (group-level defaults refined per route)
/// attach a [`MetaChain`] instead; fields are merged last-wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointMeta {
    /// Name of the policy governing this endpoint.
    pub policy: Option<String>,
    /// Explicit bucket partition, overriding shared-bucket and route scoping.
    pub scope: Option<String>,
    /// Explicit per-request cost, overriding the policy cost.
    pub cost: Option<u64>,
}

impl EndpointMeta {
    /// Metadata naming a policy and nothing else.
    pub fn policy(name: impl Into<String>) -> Self {
        Self { policy: Some(name.into()), ..Self::default() }
    }

    /// Set the explicit scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the explicit cost.
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Merge an ordered chain of metadata entries, later entries winning
    /// field by field.
    pub fn merged<'a>(chain: impl IntoIterator<Item = &'a EndpointMeta>) -> EndpointMeta {
        let mut out = EndpointMeta::default();
        for meta in chain {
            if meta.policy.is_some() {
                out.policy.clone_from(&meta.policy);
            }
            if meta.scope.is_some() {
                out.scope.clone_from(&meta.scope);
            }
            if meta.cost.is_some() {
                out.cost = meta.cost;
            }
        }
        out
    }
}

/// Ordered stack of [`EndpointMeta`] entries for hosts that accumulate
/// metadata across router layers.
#[derive(Debug, Clone, Default)]
pub struct MetaChain(pub Vec<EndpointMeta>);

/// Route identity used for default bucket scoping, attached as a request
/// extension by the host router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInfo {
    /// The matched route pattern, e.g. `/api/reports/{id}`.
    pub pattern: Option<String>,
    /// Human-readable endpoint name.
    pub display_name: Option<String>,
}
