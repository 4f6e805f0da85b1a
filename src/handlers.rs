use crate::cache::CacheStats;
use crate::config::Config;
use crate::errors::AppError;
use crate::models::*;
use crate::plan_client::{PlanClientDiagnostics, PlanDataClient};
use crate::rate_limiter::KeyedRateLimiter;
use crate::resolver::TerritoryResolver;
use crate::tdsp;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Resilient client for the upstream pricing API.
    pub plan_client: PlanDataClient,
    /// Territory resolution engine (reference data + sub-service).
    pub resolver: Arc<TerritoryResolver>,
    /// Per-client limiter for the exposed ZIP validation endpoint.
    pub zip_limiter: Arc<KeyedRateLimiter>,
}

/// API route table without state or infrastructure layers attached.
///
/// The binary layers per-IP throttling and body limits on top of this; the
/// health check is registered separately so orchestrator probes bypass them.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/zip/validate", post(validate_zip))
        .route("/api/v1/plans", get(get_plans))
        .route("/api/v1/resolve", post(resolve_territory))
        .route("/api/v1/resolve/select", post(select_territory))
        .route("/api/v1/diagnostics", get(diagnostics))
        .route("/api/v1/admin/cache/clear", post(admin_clear_cache))
        .route("/api/v1/admin/cache/stats", get(admin_cache_stats))
}

/// Complete router with the health check included. Used by integration tests;
/// the binary assembles the same routes with its protective layers.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api_routes())
        .with_state(state)
}

/// Health check endpoint.
///
/// Returns the service status, version, and cache tier reachability.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let (memory, distributed) = state.plan_client.cache_health().await;
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "plan-pricing-api",
            "version": "0.1.0",
            "cache": {
                "memory": memory,
                "distributed": distributed,
            }
        })),
    )
}

/// POST /api/v1/zip/validate
///
/// Public ZIP validation behind the site's ZIP entry form. Answers from local
/// reference data and cache only, never the upstream pricing API, so the
/// response stays fast regardless of upstream health.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `request` - ZIP code, the city page the visitor is on, and an optional
///   session identifier used for per-client throttling.
///
/// # Returns
///
/// * `200` with territory info and a redirect target when the ZIP is serviceable.
/// * `422` with market suggestions when the ZIP is outside the deregulated market.
/// * `400` when the ZIP is malformed or the city slug is missing.
/// * `429` when the client exceeds its validation budget.
pub async fn validate_zip(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ZipValidationRequest>,
) -> Result<(StatusCode, Json<ZipValidationResponse>), AppError> {
    tracing::info!(
        "POST /zip/validate - zip: {}, city: {:?}, session: {:?}",
        request.zip_code,
        request.city_slug,
        request.session_id
    );

    // Throttle before any validation so malformed spam is also bounded.
    let client_key = request
        .session_id
        .clone()
        .unwrap_or_else(|| "anonymous".to_string());
    if !state.zip_limiter.try_acquire(&client_key) {
        tracing::warn!("ZIP validation rate limit hit for client {}", client_key);
        return Err(AppError::ApiRateLimited(
            "Too many validation requests from this client; retry shortly".to_string(),
        ));
    }

    let city_slug = request
        .city_slug
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("citySlug is required".to_string()))?
        .to_string();

    let zip = request.zip_code.trim().to_string();

    let resolve = ResolveRequest {
        address: None,
        zip_code: zip.clone(),
        usage: None,
        return_alternatives: Some(false),
    };

    let envelope = match state.resolver.resolve(&resolve).await {
        Ok(envelope) => envelope,
        // Out-of-market ZIPs are an expected outcome, not an error: answer
        // 422 with pointers to markets we do serve.
        Err(AppError::ResolutionFailed(reason)) => {
            tracing::info!("ZIP {} not serviceable: {}", zip, reason);
            return Ok((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ZipValidationResponse {
                    zip_code: zip,
                    is_valid: false,
                    tdsp: None,
                    city_slug,
                    redirect_target: None,
                    available_plan_count: 0,
                    suggestions: tdsp::market_suggestions(),
                }),
            ));
        }
        Err(other) => return Err(other),
    };

    let tdsp_info = envelope.resolution.tdsp.clone();

    // Prefer a live count from cache; fall back to the static estimate so the
    // response never waits on the pricing API.
    let query = PlanQuery::new(tdsp_info.duns_id.clone(), envelope.api_params.usage);
    let available_plan_count = match state.plan_client.cached_plan_count(&query).await {
        Some(count) => count as u32,
        None => tdsp::plan_count_estimate(&tdsp_info.duns_id),
    };

    let redirect_target = format!("/electricity-plans/{}/?zip={}", city_slug, zip);

    tracing::info!(
        "ZIP {} valid -> {} ({} plans)",
        zip,
        tdsp_info.name,
        available_plan_count
    );

    Ok((
        StatusCode::OK,
        Json(ZipValidationResponse {
            zip_code: zip,
            is_valid: true,
            tdsp: Some(tdsp_info),
            city_slug,
            redirect_target: Some(redirect_target),
            available_plan_count,
            suggestions: Vec::new(),
        }),
    ))
}

/// Query parameters for the plan listing endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanListParams {
    /// Utility territory DUNS number.
    pub tdsp_duns: String,
    /// Usage benchmark in kWh, snapped to the 500/1000/2000 ladder.
    pub usage: Option<u32>,
    pub term_months: Option<u32>,
    pub rate_type: Option<RateType>,
    pub min_green_energy_percent: Option<u32>,
}

/// GET /api/v1/plans
///
/// Lists plans for a territory at a usage benchmark, served through the
/// resilient pricing pipeline (cache, coalescing, breaker, snapshots).
///
/// # Arguments
///
/// * `state` - The application state.
/// * `params` - Territory DUNS, usage benchmark, and optional filters.
///
/// # Returns
///
/// * `Result<Json<PlanFetchResult>, AppError>` - Plans plus degradation
///   metadata, or an error when no data source could answer.
pub async fn get_plans(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PlanListParams>,
) -> Result<Json<PlanFetchResult>, AppError> {
    tracing::info!("GET /plans - params: {:?}", params);

    if tdsp::tdsp_by_duns(&params.tdsp_duns).is_none() {
        return Err(AppError::BadRequest(format!(
            "Unknown utility territory: {}",
            params.tdsp_duns
        )));
    }

    let usage = params.usage.unwrap_or(1000);
    if !(USAGE_MIN..=USAGE_MAX).contains(&usage) {
        return Err(AppError::BadRequest(format!(
            "usage must be between {} and {} kWh",
            USAGE_MIN, USAGE_MAX
        )));
    }

    let query = PlanQuery::new(params.tdsp_duns, usage).with_filters(PlanFilters {
        term_months: params.term_months,
        rate_type: params.rate_type,
        min_green_energy_percent: params.min_green_energy_percent,
    });

    let result = state.plan_client.fetch_plans(query).await?;

    tracing::info!(
        "Returning {} plans (degraded: {})",
        result.plans.len(),
        result.degraded
    );

    Ok(Json(result))
}

/// POST /api/v1/resolve
///
/// Resolves a ZIP code or full address to its utility territory, escalating
/// from local reference data to the resolution sub-service only when needed.
pub async fn resolve_territory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolutionEnvelope>, AppError> {
    tracing::info!(
        "POST /resolve - zip: {}, has_address: {}",
        request.zip_code,
        request.address.is_some()
    );

    let envelope = state.resolver.resolve(&request).await?;

    tracing::info!(
        "Resolved {} -> {} (method: {:?}, confidence: {:?})",
        request.zip_code,
        envelope.resolution.tdsp.name,
        envelope.resolution.method,
        envelope.resolution.confidence
    );

    Ok(Json(envelope))
}

/// POST /api/v1/resolve/select
///
/// Applies a caller's explicit territory choice after an ambiguous
/// resolution, e.g. picking their utility from a split-ZIP candidate list.
pub async fn select_territory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectAlternativeRequest>,
) -> Result<Json<ResolutionEnvelope>, AppError> {
    tracing::info!(
        "POST /resolve/select - zip: {}, selected: {}",
        request.zip_code,
        request.selected_duns
    );

    let envelope = state.resolver.select_alternative(&request).await?;
    Ok(Json(envelope))
}

/// GET /api/v1/diagnostics
///
/// Operational snapshot: breaker state, upstream rate-limit headroom, cache
/// counters, and how often pricing fell back to stored snapshots.
pub async fn diagnostics(State(state): State<Arc<AppState>>) -> Json<PlanClientDiagnostics> {
    Json(state.plan_client.diagnostics())
}

/// Query parameters for the admin cache purge endpoint.
#[derive(Debug, Deserialize)]
pub struct CacheClearParams {
    /// Restrict the purge to one territory's entries (DUNS number).
    pub territory: Option<String>,
}

/// POST /api/v1/admin/cache/clear
///
/// Purges cached pricing data, either for one territory or everything.
pub async fn admin_clear_cache(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CacheClearParams>,
) -> Json<serde_json::Value> {
    match params.territory {
        Some(territory) => {
            let dropped = state.plan_client.invalidate_territory(&territory).await;
            tracing::info!(
                "Cache purge for territory {}: {} keys dropped",
                territory,
                dropped
            );
            Json(json!({
                "status": "cleared",
                "territory": territory,
                "keysDropped": dropped,
            }))
        }
        None => {
            state.plan_client.clear_cache().await;
            tracing::info!("Full cache purge requested");
            Json(json!({ "status": "cleared" }))
        }
    }
}

/// GET /api/v1/admin/cache/stats
pub async fn admin_cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.plan_client.cache_stats())
}
