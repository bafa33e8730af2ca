//! End-to-end driver scenarios over the in-memory store.

mod common;

use accessrl::prelude::*;
use common::{decision, penalty, Fixture};

fn downloads(limit: u64, window_secs: u64) -> RateLimiterConfig {
    RateLimiterConfig::default().policy("downloads", PolicyConfig::new(limit, window_secs))
}

fn meta() -> Vec<EndpointMeta> {
    vec![EndpointMeta::policy("downloads")]
}

#[tokio::test]
async fn burst_drains_then_denies_with_refill_hint() {
    let fx = Fixture::new(downloads(3, 10));

    for expected_remaining in [2, 1, 0] {
        let outcome = fx.check_ip("203.0.113.7", &meta()).await;
        let d = decision(&outcome);
        assert!(d.allowed);
        assert_eq!(d.remaining, expected_remaining);
        assert_eq!(d.retry_after_secs(), 0);
        fx.clock.advance(0.1);
    }

    // Fourth call at t=0.3: 0.09 tokens refilled, one whole token is
    // (1 - 0.09) / 0.3 seconds away, rounded up to 4.
    let outcome = fx.check_ip("203.0.113.7", &meta()).await;
    let d = decision(&outcome);
    assert!(!d.allowed);
    assert!(!d.blocked);
    assert_eq!(d.remaining, 0);
    assert_eq!(d.retry_after_secs(), 4);
    assert_eq!(d.violations, 0);
}

#[tokio::test]
async fn denials_count_violations_once_a_window_is_configured() {
    let config = RateLimiterConfig::default().policy(
        "downloads",
        PolicyConfig { penalty: Some(penalty(30, &[])), ..PolicyConfig::new(3, 10) },
    );
    let fx = Fixture::new(config);

    for _ in 0..3 {
        assert!(decision(&fx.check_ip("203.0.113.7", &meta()).await).allowed);
    }
    let d_first = fx.check_ip("203.0.113.7", &meta()).await;
    assert_eq!(decision(&d_first).violations, 1);
    let d_second = fx.check_ip("203.0.113.7", &meta()).await;
    let d = decision(&d_second);
    assert_eq!(d.violations, 2);
    // An empty escalation ladder counts violations but never blocks.
    assert!(!d.blocked);
}

#[tokio::test]
async fn whole_cost_drains_in_one_call() {
    let config = RateLimiterConfig::default().policy(
        "downloads",
        PolicyConfig { cost: Some(2), ..PolicyConfig::new(2, 10) },
    );
    let fx = Fixture::new(config);

    let first = fx.check_ip("203.0.113.7", &meta()).await;
    let d = decision(&first);
    assert!(d.allowed);
    assert_eq!(d.remaining, 0);

    let second = fx.check_ip("203.0.113.7", &meta()).await;
    let d = decision(&second);
    assert!(!d.allowed);
    assert_eq!(d.retry_after_secs(), 10);
}

#[tokio::test]
async fn repeated_bursts_escalate_penalties() {
    let config = RateLimiterConfig::default().policy(
        "downloads",
        PolicyConfig { penalty: Some(penalty(30, &[2, 5, 15])), ..PolicyConfig::new(3, 10) },
    );
    let fx = Fixture::new(config);
    let ip = "203.0.113.7";

    // First burst: three allowed, the fourth denial sets a 2s block.
    for _ in 0..3 {
        assert!(decision(&fx.check_ip(ip, &meta()).await).allowed);
    }
    let d_out = fx.check_ip(ip, &meta()).await;
    let d = decision(&d_out);
    assert!(d.blocked);
    assert_eq!(d.violations, 1);
    assert_eq!(d.retry_after_secs(), 2);

    // Second burst after 3s: the block lapsed but the bucket only refilled
    // 0.9 tokens, so the first call already violates again -> 5s block.
    fx.clock.advance(3.0);
    let d_out = fx.check_ip(ip, &meta()).await;
    let d = decision(&d_out);
    assert!(d.blocked);
    assert_eq!(d.violations, 2);
    assert_eq!(d.retry_after_secs(), 5);
    for _ in 0..3 {
        let gated_out = fx.check_ip(ip, &meta()).await;
        let gated = decision(&gated_out);
        assert!(gated.blocked);
        assert_eq!(gated.retry_after_secs(), 5);
    }

    // Third burst after 6s: 2.7 tokens refilled, so two calls pass before
    // the third violation saturates into the 15s block.
    fx.clock.advance(6.0);
    assert!(decision(&fx.check_ip(ip, &meta()).await).allowed);
    assert!(decision(&fx.check_ip(ip, &meta()).await).allowed);
    let d_out = fx.check_ip(ip, &meta()).await;
    let d = decision(&d_out);
    assert!(d.blocked);
    assert_eq!(d.violations, 3);
    assert_eq!(d.retry_after_secs(), 15);
}

#[tokio::test]
async fn shared_bucket_spans_endpoints() {
    let config = RateLimiterConfig::default().policy(
        "exports",
        PolicyConfig { shared_bucket: Some("exports".into()), ..PolicyConfig::new(3, 60) },
    );
    let fx = Fixture::new(config);
    let meta = vec![EndpointMeta::policy("exports")];
    let routes = [
        RouteInfo { pattern: Some("/api/reports".into()), display_name: None },
        RouteInfo { pattern: Some("/api/downloads".into()), display_name: None },
    ];

    let mut allowed = 0;
    let mut denied = 0;
    for call in 0..4 {
        let outcome = fx.check_ip_on_route("203.0.113.7", &meta, &routes[call % 2]).await;
        let d = decision(&outcome);
        assert_eq!(d.scope, "exports");
        if d.allowed {
            allowed += 1;
        } else {
            denied += 1;
        }
    }
    assert_eq!((allowed, denied), (3, 1));
}

#[tokio::test]
async fn separate_routes_get_separate_buckets_without_a_shared_name() {
    let fx = Fixture::new(downloads(1, 60));
    let meta = meta();
    let a = RouteInfo { pattern: Some("/api/a".into()), display_name: None };
    let b = RouteInfo { pattern: Some("/api/b".into()), display_name: None };

    assert!(decision(&fx.check_ip_on_route("203.0.113.7", &meta, &a).await).allowed);
    assert!(decision(&fx.check_ip_on_route("203.0.113.7", &meta, &b).await).allowed);
    assert!(!decision(&fx.check_ip_on_route("203.0.113.7", &meta, &a).await).allowed);
}

#[tokio::test]
async fn missing_identity_bypasses_without_store_writes() {
    let config = RateLimiterConfig::default().policy(
        "keyed",
        PolicyConfig {
            key_resolvers: vec!["header:x-api-key".into()],
            ..PolicyConfig::new(3, 10)
        },
    );
    let fx = Fixture::build(config, |builder| builder.no_fallback_resolver());

    let headers = http::HeaderMap::new();
    let ctx = RequestContext::new(&headers);
    let outcome = fx
        .limiter
        .check(&ctx, &[EndpointMeta::policy("keyed")], None)
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Bypass));
    assert_eq!(fx.store.calls(), 0);
}

#[tokio::test]
async fn missing_identity_falls_back_to_ip_once() {
    let config = RateLimiterConfig::default().policy(
        "keyed",
        PolicyConfig {
            key_resolvers: vec!["header:x-api-key".into()],
            ..PolicyConfig::new(3, 10)
        },
    );
    let fx = Fixture::new(config);

    // No API key, but the IP fallback still yields an identity.
    let outcome = fx.check_ip("203.0.113.7", &[EndpointMeta::policy("keyed")]).await;
    assert!(decision(&outcome).allowed);
    assert_eq!(fx.store.calls(), 1);
}

#[tokio::test]
async fn unknown_policy_bypasses() {
    let fx = Fixture::new(downloads(3, 10));
    let outcome = fx.check_ip("203.0.113.7", &[EndpointMeta::policy("y")]).await;
    assert!(matches!(outcome, Outcome::Bypass));
    assert_eq!(fx.store.calls(), 0);
}

#[tokio::test]
async fn no_policy_name_anywhere_bypasses() {
    let fx = Fixture::new(downloads(3, 10));
    let outcome = fx.check_ip("203.0.113.7", &[]).await;
    assert!(matches!(outcome, Outcome::Bypass));
    assert_eq!(fx.store.calls(), 0);
}

#[tokio::test]
async fn default_policy_applies_when_metadata_is_silent() {
    let fx = Fixture::new(downloads(3, 10).default_policy("downloads"));
    let outcome = fx.check_ip("203.0.113.7", &[]).await;
    let d = decision(&outcome);
    assert_eq!(d.policy, "downloads");
    assert!(d.allowed);
}

#[tokio::test]
async fn disabled_policy_never_reaches_the_store() {
    let config = RateLimiterConfig::default().policy(
        "downloads",
        PolicyConfig { enabled: Some(false), ..PolicyConfig::new(3, 10) },
    );
    let fx = Fixture::new(config);
    for _ in 0..5 {
        let outcome = fx.check_ip("203.0.113.7", &meta()).await;
        assert!(matches!(outcome, Outcome::Bypass));
    }
    assert_eq!(fx.store.calls(), 0);
}

#[tokio::test]
async fn exempt_predicates_never_reach_the_store() {
    let config = RateLimiterConfig::default().policy(
        "downloads",
        PolicyConfig::new(3, 10).exempt_when(|ctx| ctx.headers.contains_key("x-internal")),
    );
    let fx = Fixture::new(config);

    let mut headers = common::ip_headers("203.0.113.7");
    headers.insert("x-internal", "1".parse().unwrap());
    let ctx = RequestContext::new(&headers);
    let outcome = fx.limiter.check(&ctx, &meta(), None).await.unwrap();
    assert!(matches!(outcome, Outcome::Bypass));
    assert_eq!(fx.store.calls(), 0);

    // Without the marker header the same policy limits normally.
    let outcome = fx.check_ip("203.0.113.7", &meta()).await;
    assert!(decision(&outcome).allowed);
    assert_eq!(fx.store.calls(), 1);
}

#[tokio::test]
async fn global_exemption_covers_every_policy() {
    let fx = Fixture::build(downloads(3, 10), |builder| {
        builder.exempt_when(|ctx| ctx.headers.contains_key("x-healthcheck"))
    });
    let mut headers = common::ip_headers("203.0.113.7");
    headers.insert("x-healthcheck", "1".parse().unwrap());
    let ctx = RequestContext::new(&headers);
    let outcome = fx.limiter.check(&ctx, &meta(), None).await.unwrap();
    assert!(matches!(outcome, Outcome::Bypass));
    assert_eq!(fx.store.calls(), 0);
}

#[tokio::test]
async fn blocked_requests_report_zero_remaining() {
    let config = RateLimiterConfig::default().policy(
        "downloads",
        PolicyConfig { penalty: Some(penalty(30, &[60])), ..PolicyConfig::new(1, 10) },
    );
    let fx = Fixture::new(config);
    let ip = "203.0.113.7";

    assert!(decision(&fx.check_ip(ip, &meta()).await).allowed);
    assert!(decision(&fx.check_ip(ip, &meta()).await).blocked);

    // Inside the block the store reports -1 remaining tokens; the driver
    // floors that to zero for display.
    fx.clock.advance(10.0);
    let outcome = fx.check_ip(ip, &meta()).await;
    let d = decision(&outcome);
    assert!(d.blocked);
    assert!(!d.allowed);
    assert_eq!(d.remaining, 0);
    assert_eq!(d.retry_after_secs(), 50);
    assert!(d.retry_after_secs() > 0);
}

#[tokio::test]
async fn authenticated_limit_applies_to_authenticated_callers() {
    let config = RateLimiterConfig::default().policy(
        "api",
        PolicyConfig {
            authenticated_limit: Some(5),
            anonymous_limit: Some(2),
            key_resolvers: vec!["ip".into()],
            ..PolicyConfig::new(3, 60)
        },
    );
    let fx = Fixture::new(config);
    let meta = vec![EndpointMeta::policy("api")];

    let headers = common::ip_headers("203.0.113.7");
    let principal = Principal::authenticated(vec![]);
    let ctx = RequestContext::new(&headers).with_principal(&principal);
    let outcome = fx.limiter.check(&ctx, &meta, None).await.unwrap();
    let d = decision(&outcome);
    assert_eq!(d.limit, 5);
    assert_eq!(d.remaining, 4);

    // A different anonymous caller gets the anonymous override.
    let outcome = fx.check_ip("198.51.100.4", &meta).await;
    let d = decision(&outcome);
    assert_eq!(d.limit, 2);
    assert_eq!(d.remaining, 1);
}

#[tokio::test]
async fn authenticated_headers_mark_the_caller_authenticated() {
    let config = RateLimiterConfig::default().policy(
        "api",
        PolicyConfig {
            authenticated_limit: Some(6),
            authenticated_headers: vec!["x-api-key".into()],
            ..PolicyConfig::new(3, 60)
        },
    );
    let fx = Fixture::new(config);
    let meta = vec![EndpointMeta::policy("api")];

    let mut headers = common::ip_headers("203.0.113.7");
    headers.insert("x-api-key", "k-1".parse().unwrap());
    let ctx = RequestContext::new(&headers);
    let outcome = fx.limiter.check(&ctx, &meta, None).await.unwrap();
    assert_eq!(decision(&outcome).limit, 6);

    // An empty header value does not count.
    let mut headers = common::ip_headers("198.51.100.4");
    headers.insert("x-api-key", "".parse().unwrap());
    let ctx = RequestContext::new(&headers);
    let outcome = fx.limiter.check(&ctx, &meta, None).await.unwrap();
    assert_eq!(decision(&outcome).limit, 3);
}

#[tokio::test]
async fn metadata_cost_overrides_and_is_clamped() {
    let config = RateLimiterConfig::default().policy("api", PolicyConfig::new(4, 60));
    let fx = Fixture::new(config);

    let outcome = fx
        .check_ip("203.0.113.7", &[EndpointMeta::policy("api").with_cost(3)])
        .await;
    let d = decision(&outcome);
    assert_eq!(d.cost, 3);
    assert_eq!(d.remaining, 1);

    // A cost beyond the limit clamps to it instead of wedging the bucket.
    let outcome = fx
        .check_ip("198.51.100.4", &[EndpointMeta::policy("api").with_cost(99)])
        .await;
    let d = decision(&outcome);
    assert_eq!(d.cost, 4);
    assert_eq!(d.remaining, 0);
}

#[tokio::test]
async fn dynamic_cost_resolver_is_consulted() {
    let config = RateLimiterConfig::default().policy(
        "api",
        PolicyConfig::new(10, 60)
            .cost_with(|ctx| if ctx.headers.contains_key("x-bulk") { 5 } else { 1 }),
    );
    let fx = Fixture::new(config);
    let meta = vec![EndpointMeta::policy("api")];

    let mut headers = common::ip_headers("203.0.113.7");
    headers.insert("x-bulk", "1".parse().unwrap());
    let ctx = RequestContext::new(&headers);
    let outcome = fx.limiter.check(&ctx, &meta, None).await.unwrap();
    assert_eq!(decision(&outcome).cost, 5);
}

#[tokio::test]
async fn metadata_chain_merges_last_wins() {
    let config = RateLimiterConfig::default()
        .policy("a", PolicyConfig::new(3, 10))
        .policy("b", PolicyConfig::new(7, 10));
    let fx = Fixture::new(config);

    let chain = vec![
        EndpointMeta::policy("a").with_cost(2),
        EndpointMeta { policy: Some("b".into()), ..Default::default() },
    ];
    let outcome = fx.check_ip("203.0.113.7", &chain).await;
    let d = decision(&outcome);
    assert_eq!(d.policy, "b");
    // The cost from the earlier entry survives the merge.
    assert_eq!(d.cost, 2);
}

#[tokio::test]
async fn policy_lookup_is_case_insensitive() {
    let fx = Fixture::new(downloads(3, 10));
    let outcome = fx.check_ip("203.0.113.7", &[EndpointMeta::policy("DOWNLOADS")]).await;
    assert!(decision(&outcome).allowed);
}

#[tokio::test]
async fn live_reload_swaps_policies_between_requests() {
    let fx = Fixture::new(downloads(1, 10));
    let ip = "203.0.113.7";

    assert!(decision(&fx.check_ip(ip, &meta()).await).allowed);
    assert!(!decision(&fx.check_ip(ip, &meta()).await).allowed);

    // Raising the limit takes effect on the next request: the faster refill
    // rate earns a token within two seconds.
    let raised = RateLimiterConfig::default().policy("downloads", PolicyConfig::new(10, 10));
    fx.limiter.provider().reload(&raised).unwrap();
    fx.clock.advance(2.0);
    let outcome = fx.check_ip(ip, &meta()).await;
    let d = decision(&outcome);
    assert!(d.allowed);
    assert_eq!(d.limit, 10);
}

#[tokio::test]
async fn decision_reports_key_fingerprint_not_the_key() {
    let fx = Fixture::new(downloads(3, 10));
    let outcome = fx.check_ip("203.0.113.7", &meta()).await;
    let d = decision(&outcome);
    assert_eq!(d.key_hash.len(), 64);
    assert!(d.key_hash.bytes().all(|b| b.is_ascii_hexdigit()));
    assert!(!d.key_hash.contains("203"));
}
