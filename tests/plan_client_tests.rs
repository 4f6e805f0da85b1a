/// Integration tests for the resilient plan data client with a mocked
/// pricing API. Exercises caching, request coalescing, retries, the circuit
/// breaker, and snapshot-backed degraded mode without real external services.
use plan_pricing_api::cache::TieredCache;
use plan_pricing_api::circuit_breaker::{CircuitBreaker, CircuitState};
use plan_pricing_api::config::Config;
use plan_pricing_api::errors::AppError;
use plan_pricing_api::models::{PlanFilters, PlanListResponse, PlanQuery, PlanRecord};
use plan_pricing_api::plan_client::PlanDataClient;
use plan_pricing_api::pricing_client::PricingApiClient;
use plan_pricing_api::rate_limiter::RateLimiter;
use plan_pricing_api::snapshot::{MemorySnapshotStore, SnapshotStore};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ONCOR: &str = "1039940674000";

/// Helper function to create test config pointing at a mock server
fn test_config(pricing_base_url: String) -> Config {
    Config {
        database_url: "postgresql://test".to_string(),
        port: 8080,
        pricing_api_base_url: pricing_base_url.clone(),
        pricing_api_key: "test_key".to_string(),
        resolution_api_base_url: pricing_base_url,
        redis_url: None,
        plans_cache_ttl_secs: 300,
        reference_cache_ttl_secs: 86_400,
        cache_capacity: 1_000,
        breaker_failure_threshold: 3,
        breaker_cooldown_secs: 60,
        upstream_rate_limit: 100,
        upstream_rate_window_secs: 60,
        client_rate_limit: 10,
        client_rate_window_secs: 60,
        retry_max_attempts: 2,
        http_timeout_secs: 5,
    }
}

/// Plan list JSON in the upstream wire shape.
fn plan_body(count: usize) -> serde_json::Value {
    let plans: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            serde_json::json!({
                "id": format!("plan-{i}"),
                "name": format!("Texas Saver {}", 12 + i),
                "provider": { "name": "Lone Star Retail", "rating": 4.1 },
                "pricing": { "rate500": 15.2, "rate1000": 12.4, "rate2000": 11.1 },
                "contract": { "termMonths": 12, "type": "fixed", "earlyTerminationFee": 150.0 },
                "features": { "greenEnergyPercent": 6, "billCredit": null, "depositRequired": false }
            })
        })
        .collect();
    serde_json::json!({ "plans": plans })
}

/// One plan in the upstream wire shape with a chosen contract length.
fn plan_with_term(id: &str, term: u32) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": format!("Texas Saver {term}"),
        "provider": { "name": "Lone Star Retail", "rating": 4.1 },
        "pricing": { "rate500": 15.2, "rate1000": 12.4, "rate2000": 11.1 },
        "contract": { "termMonths": term, "type": "fixed", "earlyTerminationFee": 150.0 },
        "features": { "greenEnergyPercent": 6, "billCredit": null, "depositRequired": false }
    })
}

fn sample_plans(count: usize) -> Vec<PlanRecord> {
    serde_json::from_value::<PlanListResponse>(plan_body(count))
        .expect("sample plans deserialize")
        .plans
}

struct Harness {
    client: PlanDataClient,
    snapshots: Arc<MemorySnapshotStore>,
}

/// Builds a client over an in-memory cache and snapshot store, with the
/// breaker, upstream budget, and retry count under test control.
fn build_client(
    base_url: String,
    failure_threshold: u32,
    cooldown: Duration,
    upstream_limit: u32,
    retry_max_attempts: u32,
) -> Harness {
    let config = test_config(base_url);
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let client = PlanDataClient::new(
        Arc::new(TieredCache::new(1_000, None)),
        Arc::new(CircuitBreaker::new(failure_threshold, cooldown)),
        Arc::new(RateLimiter::new(upstream_limit, Duration::from_secs(60))),
        PricingApiClient::new(&config).expect("pricing client"),
        snapshots.clone(),
        Duration::from_secs(300),
        retry_max_attempts,
    );
    Harness { client, snapshots }
}

#[tokio::test]
async fn test_second_fetch_is_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .and(query_param("tdspDuns", ONCOR))
        .and(query_param("usage", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plan_body(3)))
        .expect(1)
        .mount(&server)
        .await;

    let harness = build_client(server.uri(), 3, Duration::from_secs(60), 100, 2);
    let query = PlanQuery::new(ONCOR, 1000);

    let first = harness.client.fetch_plans(query.clone()).await.unwrap();
    assert_eq!(first.plans.len(), 3);
    assert!(!first.degraded);
    assert!(first.warnings.is_empty());

    // Same query again: answered from cache, upstream sees one call total.
    let second = harness.client.fetch_plans(query).await.unwrap();
    assert_eq!(second.plans.len(), 3);
    assert!(!second.degraded);
}

#[tokio::test]
async fn test_concurrent_identical_queries_share_one_upstream_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(plan_body(2))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = build_client(server.uri(), 3, Duration::from_secs(60), 100, 1);
    let query = PlanQuery::new(ONCOR, 1000);

    let (a, b) = tokio::join!(
        harness.client.fetch_plans(query.clone()),
        harness.client.fetch_plans(query.clone())
    );
    assert_eq!(a.unwrap().plans.len(), 2);
    assert_eq!(b.unwrap().plans.len(), 2);
}

#[tokio::test]
async fn test_retryable_failure_then_success_within_one_fetch() {
    let server = MockServer::start().await;
    // First call fails transiently, the retry succeeds.
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plan_body(4)))
        .expect(1)
        .mount(&server)
        .await;

    let harness = build_client(server.uri(), 5, Duration::from_secs(60), 100, 2);
    let result = harness
        .client
        .fetch_plans(PlanQuery::new(ONCOR, 1000))
        .await
        .unwrap();

    assert_eq!(result.plans.len(), 4);
    assert!(!result.degraded);
    // The successful attempt closed the failure streak.
    assert_eq!(
        harness.client.breaker_snapshot().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_breaker_opens_and_serves_snapshot_without_upstream_io() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let harness = build_client(server.uri(), 2, Duration::from_secs(60), 100, 1);
    harness
        .snapshots
        .save_snapshot(ONCOR, 1000, &sample_plans(5))
        .await
        .unwrap();

    let query = PlanQuery::new(ONCOR, 1000);

    // Two failures trip the breaker; both are absorbed by the snapshot.
    for _ in 0..2 {
        let result = harness.client.fetch_plans(query.clone()).await.unwrap();
        assert!(result.degraded);
        assert_eq!(result.plans.len(), 5);
        assert!(result.warnings[0].starts_with("Live pricing is unavailable"));
    }
    assert_eq!(harness.client.breaker_snapshot().state, CircuitState::Open);

    // Open circuit: served from snapshot with no third upstream call
    // (the mock's expect(2) fails the test otherwise).
    let third = harness.client.fetch_plans(query).await.unwrap();
    assert!(third.degraded);
    assert_eq!(harness.client.diagnostics().snapshot_fallbacks, 3);
}

#[tokio::test]
async fn test_open_breaker_probes_after_cooldown_and_recloses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plan_body(3)))
        .expect(1)
        .mount(&server)
        .await;

    let harness = build_client(server.uri(), 1, Duration::from_millis(100), 100, 1);
    let query = PlanQuery::new(ONCOR, 1000);

    // No snapshot yet, so the failure surfaces as the origin error.
    let err = harness.client.fetch_plans(query.clone()).await.unwrap_err();
    assert!(matches!(err, AppError::ApiServerError(_)));
    assert_eq!(harness.client.breaker_snapshot().state, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Cooldown elapsed: the next fetch claims the probe, succeeds, recloses.
    let recovered = harness.client.fetch_plans(query).await.unwrap();
    assert!(!recovered.degraded);
    assert_eq!(recovered.plans.len(), 3);
    assert_eq!(
        harness.client.breaker_snapshot().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    // Three attempts allowed, but an auth failure must use only one.
    let harness = build_client(server.uri(), 5, Duration::from_secs(60), 100, 3);
    let err = harness
        .client
        .fetch_plans(PlanQuery::new(ONCOR, 1000))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ApiUnauthorized(_)));
}

#[tokio::test]
async fn test_exhausted_call_budget_reports_rate_limit_not_stale_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plan_body(2)))
        .expect(1)
        .mount(&server)
        .await;

    // Budget of one upstream call per window.
    let harness = build_client(server.uri(), 3, Duration::from_secs(60), 1, 1);
    harness
        .snapshots
        .save_snapshot(ONCOR, 500, &sample_plans(2))
        .await
        .unwrap();

    let first = harness
        .client
        .fetch_plans(PlanQuery::new(ONCOR, 1000))
        .await
        .unwrap();
    assert!(!first.degraded);

    // Different usage level misses the cache and needs a permit; the
    // self-imposed budget is exhausted, and that is reported as such even
    // though a snapshot exists. Stale data must not mask our own throttle.
    let err = harness
        .client
        .fetch_plans(PlanQuery::new(ONCOR, 500))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ApiRateLimited(_)));
}

#[tokio::test]
async fn test_degraded_result_is_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plan_body(6)))
        .expect(1)
        .mount(&server)
        .await;

    let harness = build_client(server.uri(), 5, Duration::from_secs(60), 100, 1);
    harness
        .snapshots
        .save_snapshot(ONCOR, 1000, &sample_plans(1))
        .await
        .unwrap();

    let query = PlanQuery::new(ONCOR, 1000);

    let degraded = harness.client.fetch_plans(query.clone()).await.unwrap();
    assert!(degraded.degraded);
    assert_eq!(degraded.plans.len(), 1);

    // The degraded answer was not written to the cache, so the recovered
    // upstream is consulted and fresh data replaces the stale set.
    let fresh = harness.client.fetch_plans(query).await.unwrap();
    assert!(!fresh.degraded);
    assert_eq!(fresh.plans.len(), 6);
}

#[tokio::test]
async fn test_filtered_fetch_does_not_overwrite_territory_snapshot() {
    let server = MockServer::start().await;
    // Mount the filtered mock first so it wins over the catch-all.
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .and(query_param("termMonths", "36"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "plans": [plan_with_term("p-36", 36)]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plan_body(6)))
        .expect(1)
        .mount(&server)
        .await;

    let harness = build_client(server.uri(), 3, Duration::from_secs(60), 100, 1);

    let full = harness
        .client
        .fetch_plans(PlanQuery::new(ONCOR, 1000))
        .await
        .unwrap();
    assert_eq!(full.plans.len(), 6);

    let filtered = harness
        .client
        .fetch_plans(PlanQuery::new(ONCOR, 1000).with_filters(PlanFilters {
            term_months: Some(36),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(filtered.plans.len(), 1);

    // The filtered subset must not replace the territory's full snapshot.
    let (snapshot, _) = harness
        .snapshots
        .load_snapshot(ONCOR, 1000)
        .await
        .unwrap()
        .expect("snapshot from the unfiltered fetch");
    assert_eq!(snapshot.len(), 6);
}

#[tokio::test]
async fn test_degraded_fetch_honors_callers_filters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let harness = build_client(server.uri(), 5, Duration::from_secs(60), 100, 1);
    let mixed: Vec<PlanRecord> = serde_json::from_value::<PlanListResponse>(serde_json::json!({
        "plans": [
            plan_with_term("p-12a", 12),
            plan_with_term("p-12b", 12),
            plan_with_term("p-36", 36),
        ]
    }))
    .unwrap()
    .plans;
    harness
        .snapshots
        .save_snapshot(ONCOR, 1000, &mixed)
        .await
        .unwrap();

    // Upstream is down; the snapshot answers, but only with plans matching
    // the caller's term filter.
    let result = harness
        .client
        .fetch_plans(PlanQuery::new(ONCOR, 1000).with_filters(PlanFilters {
            term_months: Some(36),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert!(result.degraded);
    assert_eq!(result.plans.len(), 1);
    assert_eq!(result.plans[0].id, "p-36");
}

#[tokio::test]
async fn test_territory_invalidation_drops_cached_plans() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/plans"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plan_body(3)))
        .expect(2)
        .mount(&server)
        .await;

    let harness = build_client(server.uri(), 3, Duration::from_secs(60), 100, 1);
    let query = PlanQuery::new(ONCOR, 1000);

    harness.client.fetch_plans(query.clone()).await.unwrap();
    assert_eq!(harness.client.cached_plan_count(&query).await, Some(3));

    let dropped = harness.client.invalidate_territory(ONCOR).await;
    assert_eq!(dropped, 1);
    assert_eq!(harness.client.cached_plan_count(&query).await, None);

    // Next fetch goes upstream again.
    let refetched = harness.client.fetch_plans(query).await.unwrap();
    assert!(!refetched.degraded);
}
