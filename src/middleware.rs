//! Tower middleware that enforces the limiter and shapes responses.
//!
//! The service is generic over the HTTP body types: any stack whose
//! response body converts from `String` works (axum, or `Response<String>`
//! in tests). Request-side inputs travel as extensions: [`EndpointMeta`] /
//! [`MetaChain`] for per-endpoint metadata, [`RouteInfo`] for default
//! scoping, [`RemoteAddr`] for the transport peer, [`Principal`] for the
//! authenticated caller.

use crate::decision::Decision;
use crate::driver::{Outcome, RateLimiter};
use crate::request::{EndpointMeta, MetaChain, Principal, RemoteAddr, RequestContext, RouteInfo};
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Custom rejection body writer: returns `(content_type, body)`.
/// Exclusive with the configured static body; when installed, it wins.
pub type RejectionHandler = Arc<dyn Fn(&Decision) -> (String, String) + Send + Sync>;

#[derive(Clone)]
struct Shaping {
    headers_enabled: bool,
    body: String,
    content_type: String,
    on_rejected: Option<RejectionHandler>,
}

/// Layer wrapping a service with rate-limit enforcement.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    shaping: Shaping,
}

impl RateLimitLayer {
    /// Enforce `limiter`, shaping responses per its configuration.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        let shaping = Shaping {
            headers_enabled: limiter.headers_enabled,
            body: limiter.rejection_body.clone(),
            content_type: limiter.rejection_content_type.clone(),
            on_rejected: None,
        };
        Self { limiter, shaping }
    }

    /// Override whether `X-RateLimit-*` headers are attached.
    pub fn headers(mut self, enabled: bool) -> Self {
        self.shaping.headers_enabled = enabled;
        self
    }

    /// Write rejection bodies through `handler` instead of the configured
    /// static body.
    pub fn on_rejected(
        mut self,
        handler: impl Fn(&Decision) -> (String, String) + Send + Sync + 'static,
    ) -> Self {
        self.shaping.on_rejected = Some(Arc::new(handler));
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            shaping: Arc::new(self.shaping.clone()),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    shaping: Arc<Shaping>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        let shaping = self.shaping.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let meta: Vec<EndpointMeta> =
                if let Some(chain) = req.extensions().get::<MetaChain>() {
                    chain.0.clone()
                } else if let Some(meta) = req.extensions().get::<EndpointMeta>() {
                    vec![meta.clone()]
                } else {
                    Vec::new()
                };
            let route = req.extensions().get::<RouteInfo>().cloned();
            let remote_addr = req.extensions().get::<RemoteAddr>().map(|r| r.0.ip());

            let outcome = {
                let mut ctx = RequestContext::new(req.headers());
                ctx.remote_addr = remote_addr;
                ctx.principal = req.extensions().get::<Principal>();
                limiter.check(&ctx, &meta, route.as_ref()).await
            };

            match outcome {
                Ok(Outcome::Bypass) => inner.call(req).await,
                Ok(Outcome::Decision(decision)) if decision.allowed => {
                    let mut response = inner.call(req).await?;
                    if shaping.headers_enabled {
                        attach_rate_headers(response.headers_mut(), &decision);
                    }
                    Ok(response)
                }
                Ok(Outcome::Decision(decision)) => Ok(reject(&decision, &shaping)),
                Err(err) => {
                    tracing::error!(error = %err, "rate limit store failure surfaced to caller");
                    let mut response = Response::new(ResBody::from(String::new()));
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                }
            }
        })
    }
}

fn attach_rate_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(decision.reset_unix_secs()));
}

fn reject<ResBody: From<String>>(decision: &Decision, shaping: &Shaping) -> Response<ResBody> {
    let (content_type, body) = match &shaping.on_rejected {
        Some(handler) => handler(decision),
        None => (shaping.content_type.clone(), shaping.body.clone()),
    };

    let mut response = Response::new(ResBody::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()));
    if shaping.headers_enabled {
        attach_rate_headers(headers, decision);
    }
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    response
}
