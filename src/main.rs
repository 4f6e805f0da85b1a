mod cache;
mod cache_validator;
mod circuit_breaker;
mod config;
mod errors;
mod fallback;
mod handlers;
mod models;
mod plan_client;
mod pricing_client;
mod rate_limiter;
mod resolution_client;
mod resolver;
mod snapshot;
mod tdsp;

use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::{DistributedTier, RedisTier, TieredCache};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::plan_client::PlanDataClient;
use crate::pricing_client::PricingApiClient;
use crate::rate_limiter::{KeyedRateLimiter, RateLimiter};
use crate::resolution_client::ResolutionServiceClient;
use crate::resolver::TerritoryResolver;
use crate::snapshot::PgSnapshotStore;

/// Main entry point for the application.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - Database connection (plan snapshots for degraded operation).
/// - Tiered cache, circuit breaker, and rate limiters.
/// - Upstream pricing and resolution sub-service clients.
/// - HTTP routes and middleware (CORS, Rate Limiting).
///
/// It then starts the Axum server.
///
/// # Returns
///
/// * `anyhow::Result<()>` - Ok if the server runs successfully, or an error if initialization fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plan_pricing_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Initialize database connection pool (stores last-good plan snapshots)
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection pool established");

    // Tiered cache: in-memory always, distributed tier only when configured.
    // A missing or unreachable distributed tier is never fatal.
    let distributed: Option<Arc<dyn DistributedTier>> = match &config.redis_url {
        Some(url) => match RedisTier::connect(url, "plan-pricing").await {
            Ok(tier) => {
                tracing::info!("✓ Distributed cache tier connected");
                Some(Arc::new(tier))
            }
            Err(e) => {
                tracing::warn!("Distributed cache tier unavailable, starting without it: {}", e);
                None
            }
        },
        None => None,
    };
    let cache = Arc::new(TieredCache::new(config.cache_capacity, distributed));
    tracing::info!("Tiered cache initialized ({} entries)", config.cache_capacity);

    // Circuit breaker and self-imposed upstream call budget
    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker_failure_threshold,
        Duration::from_secs(config.breaker_cooldown_secs),
    ));
    let upstream_limiter = Arc::new(RateLimiter::new(
        config.upstream_rate_limit,
        Duration::from_secs(config.upstream_rate_window_secs),
    ));

    // Upstream clients
    let pricing = PricingApiClient::new(&config)?;
    tracing::info!("✓ Pricing API client initialized: {}", config.pricing_api_base_url);
    let resolution = ResolutionServiceClient::new(&config)?;
    tracing::info!(
        "✓ Resolution sub-service client initialized: {}",
        config.resolution_api_base_url
    );

    let plan_client = PlanDataClient::new(
        cache.clone(),
        breaker,
        upstream_limiter,
        pricing,
        Arc::new(PgSnapshotStore::new(pool)),
        Duration::from_secs(config.plans_cache_ttl_secs),
        config.retry_max_attempts,
    );

    let resolver = Arc::new(TerritoryResolver::new(
        resolution,
        cache,
        Duration::from_secs(config.reference_cache_ttl_secs),
        config.retry_max_attempts,
    ));

    // Per-client budget for the public ZIP validation endpoint
    let zip_limiter = Arc::new(KeyedRateLimiter::new(
        config.client_rate_limit,
        Duration::from_secs(config.client_rate_window_secs),
    ));

    // Build application state
    let app_state = Arc::new(crate::handlers::AppState {
        config: config.clone(),
        plan_client,
        resolver,
        zip_limiter,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    // Build protected routes with security layers
    let protected_routes = handlers::api_routes().layer(
        ServiceBuilder::new()
            // Request size limit: 1MB max payload (prevents memory exhaustion)
            .layer(RequestBodyLimitLayer::new(1024 * 1024))
            // Rate limiting: 10 req/sec per IP, burst of 20 (prevents DDoS)
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Build final app with health check (bypasses rate limiting for orchestrator probes)
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
