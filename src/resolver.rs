//! Caller-identity resolution.
//!
//! A resolver maps a request to a nullable identity string; `None` means
//! "no stable identity, skip limiting". Built-ins cover the common sources
//! (client IP, identity claims, API-key headers); [`CompositeResolver`]
//! concatenates several sources into one compound key. Resolver specs are
//! parsed once at policy normalization and never re-parsed per request.

use crate::error::ConfigError;
use crate::request::{claims, RequestContext};
use async_trait::async_trait;
use http::HeaderName;
use std::net::IpAddr;
use std::sync::Arc;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
static X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
static X_CLIENT_ID: HeaderName = HeaderName::from_static("x-client-id");

/// Maps a request to a stable caller identity.
///
/// Implementations must be cheap; the built-ins never perform I/O. A custom
/// resolver that does is cancelled by dropping its future when the request
/// is abandoned.
#[async_trait]
pub trait KeyResolver: Send + Sync + std::fmt::Debug {
    /// Resolve the caller identity, or `None` when the request carries no
    /// stable identity for this source.
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String>;
}

/// The resolvers available through configuration specs.
///
/// Spec keys are case-insensitive: `ip`, `user` / `user-id`, `sub`,
/// `api-key`, `client-id`, `claim:<type>`, `header:<name>`.
#[derive(Debug, Clone)]
pub enum BuiltinResolver {
    /// Client IP: forwarding headers first, then the transport peer address.
    Ip,
    /// Stable user identifier claim of the authenticated principal.
    UserId,
    /// `sub` claim of the authenticated principal.
    Subject,
    /// `X-Api-Key` header value.
    ApiKey,
    /// `X-Client-Id` header value.
    ClientId,
    /// Arbitrary claim type.
    Claim(String),
    /// Arbitrary header, first value.
    Header(HeaderName),
}

impl BuiltinResolver {
    /// Parse a configuration spec. Returns `None` for unknown specs so the
    /// caller can raise a [`ConfigError`] naming the policy.
    pub fn parse(spec: &str) -> Option<Self> {
        let lower = spec.trim().to_ascii_lowercase();
        match lower.as_str() {
            "ip" => Some(Self::Ip),
            "user" | "user-id" => Some(Self::UserId),
            "sub" => Some(Self::Subject),
            "api-key" => Some(Self::ApiKey),
            "client-id" => Some(Self::ClientId),
            _ => {
                if let Some(kind) = lower.strip_prefix("claim:") {
                    let kind = kind.trim();
                    if kind.is_empty() {
                        return None;
                    }
                    return Some(Self::Claim(kind.to_string()));
                }
                if let Some(name) = lower.strip_prefix("header:") {
                    let name = name.trim();
                    return HeaderName::from_bytes(name.as_bytes()).ok().map(Self::Header);
                }
                None
            }
        }
    }

    fn resolve_sync(&self, ctx: &RequestContext<'_>) -> Option<String> {
        match self {
            Self::Ip => client_ip(ctx),
            Self::UserId => {
                ctx.principal.and_then(|p| p.claim(claims::NAME_ID)).map(str::to_owned)
            }
            Self::Subject => {
                ctx.principal.and_then(|p| p.claim(claims::SUBJECT)).map(str::to_owned)
            }
            Self::ApiKey => ctx.header_str(&X_API_KEY).map(str::to_owned),
            Self::ClientId => ctx.header_str(&X_CLIENT_ID).map(str::to_owned),
            Self::Claim(kind) => ctx.principal.and_then(|p| p.claim(kind)).map(str::to_owned),
            Self::Header(name) => ctx.header_str(name).map(str::to_owned),
        }
    }
}

#[async_trait]
impl KeyResolver for BuiltinResolver {
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        self.resolve_sync(ctx)
    }
}

/// Ordered composition of resolvers.
///
/// Every member runs; all non-empty results are joined with `|`. This is a
/// concatenation, not a fallback chain: a compound key like `ip|api-key`
/// partitions by both dimensions at once. `None` only when every member
/// came back empty.
#[derive(Debug)]
pub struct CompositeResolver {
    parts: Vec<Arc<dyn KeyResolver>>,
}

impl CompositeResolver {
    /// Compose the given resolvers in order.
    pub fn new(parts: Vec<Arc<dyn KeyResolver>>) -> Self {
        Self { parts }
    }
}

#[async_trait]
impl KeyResolver for CompositeResolver {
    async fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        let mut pieces = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            if let Some(piece) = part.resolve(ctx).await {
                if !piece.is_empty() {
                    pieces.push(piece);
                }
            }
        }
        if pieces.is_empty() {
            None
        } else {
            Some(pieces.join("|"))
        }
    }
}

/// Compile an ordered list of specs into a single resolver.
///
/// One spec compiles to the resolver itself; several compile to a
/// [`CompositeResolver`]. An unknown spec is a fatal configuration error
/// naming the policy and the spec.
pub fn compile(policy: &str, specs: &[String]) -> Result<Arc<dyn KeyResolver>, ConfigError> {
    let mut compiled: Vec<Arc<dyn KeyResolver>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let resolver = BuiltinResolver::parse(spec).ok_or_else(|| ConfigError::UnknownResolver {
            policy: policy.to_string(),
            spec: spec.clone(),
        })?;
        compiled.push(Arc::new(resolver));
    }
    match compiled.len() {
        0 => Ok(Arc::new(BuiltinResolver::Ip)),
        1 => Ok(compiled.pop().unwrap_or_else(|| Arc::new(BuiltinResolver::Ip))),
        _ => Ok(Arc::new(CompositeResolver::new(compiled))),
    }
}

/// Client IP per the forwarding conventions: first parseable address from
/// `X-Forwarded-For`, then `X-Real-IP`, then the transport peer address.
fn client_ip(ctx: &RequestContext<'_>) -> Option<String> {
    for header in [&X_FORWARDED_FOR, &X_REAL_IP] {
        for value in ctx.headers.get_all(header) {
            let Ok(raw) = value.to_str() else { continue };
            for candidate in raw.split(',') {
                if let Some(ip) = parse_forwarded_ip(candidate) {
                    return Some(ip.to_string());
                }
            }
        }
    }
    ctx.remote_addr.map(|ip| ip.to_string())
}

/// Normalize one forwarded-for entry into an address.
///
/// Strips `[...]` IPv6 brackets, and a trailing `:port` only when the entry
/// has exactly one colon and at least one dot (an IPv4:port pair; bare IPv6
/// addresses have several colons and no dots).
fn parse_forwarded_ip(raw: &str) -> Option<IpAddr> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if let Some(rest) = trimmed.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        }
    } else if trimmed.matches(':').count() == 1 && trimmed.contains('.') {
        trimmed.split(':').next().unwrap_or(trimmed)
    } else {
        trimmed
    };
    candidate.parse().ok()
}
