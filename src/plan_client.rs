//! Resilient access to electricity plan data.
//!
//! Lookup order for a query: tiered cache, then a coalesced upstream fetch
//! guarded by the client-side rate limiter and the circuit breaker, with
//! bounded retries. When the upstream is unreachable the last snapshot for
//! the (territory, usage) pair is served, marked degraded. Only fresh
//! upstream results are written back to the cache.

use crate::cache::{CacheStats, TieredCache};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::errors::AppError;
use crate::models::{PlanFetchResult, PlanQuery, PlanRecord};
use crate::pricing_client::PricingApiClient;
use crate::rate_limiter::{RateLimitInfo, RateLimiter};
use crate::snapshot::SnapshotStore;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Attempts to take an upstream permit before reporting rate exhaustion.
const PERMIT_ATTEMPTS: u32 = 3;
/// Delay before the second permit attempt; doubles per attempt.
const PERMIT_BACKOFF: Duration = Duration::from_millis(100);
/// Delay before the first upstream retry; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

type SharedFetch = Shared<BoxFuture<'static, Result<PlanFetchResult, AppError>>>;

/// Point-in-time operational view, embedded in the diagnostics payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanClientDiagnostics {
    pub breaker: BreakerSnapshot,
    pub upstream_limiter: RateLimitInfo,
    pub cache: CacheStats,
    /// Requests served from the database snapshot since startup.
    pub snapshot_fallbacks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_upstream_latency_ms: Option<u64>,
}

/// Cheaply cloneable handle; all state is shared behind `Arc`s so every
/// clone observes the same cache, breaker, and counters.
#[derive(Clone)]
pub struct PlanDataClient {
    cache: Arc<TieredCache>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    upstream: Arc<PricingApiClient>,
    snapshots: Arc<dyn SnapshotStore>,
    /// One entry per cache key currently being fetched. Concurrent identical
    /// queries await the same shared future instead of dogpiling upstream;
    /// the entry removes itself when the fetch completes.
    in_flight: Arc<DashMap<String, SharedFetch>>,
    plans_ttl: Duration,
    retry_max_attempts: u32,
    snapshot_fallbacks: Arc<AtomicU64>,
    /// Duration of the most recent upstream call; 0 = none made yet.
    last_upstream_latency_ms: Arc<AtomicU64>,
}

impl PlanDataClient {
    pub fn new(
        cache: Arc<TieredCache>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        upstream: PricingApiClient,
        snapshots: Arc<dyn SnapshotStore>,
        plans_ttl: Duration,
        retry_max_attempts: u32,
    ) -> Self {
        Self {
            cache,
            breaker,
            limiter,
            upstream: Arc::new(upstream),
            snapshots,
            in_flight: Arc::new(DashMap::new()),
            plans_ttl,
            retry_max_attempts: retry_max_attempts.max(1),
            snapshot_fallbacks: Arc::new(AtomicU64::new(0)),
            last_upstream_latency_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fetches plans for a query, resiliently.
    ///
    /// Callers that drop mid-flight do not cancel the fetch for concurrent
    /// waiters on the same key; the shared future runs to completion as long
    /// as any waiter remains.
    pub async fn fetch_plans(&self, query: PlanQuery) -> Result<PlanFetchResult, AppError> {
        let key = query.cache_key();

        if let Some((plans, tier)) = self.cache.get::<Vec<PlanRecord>>(&key).await {
            tracing::debug!(key = %key, tier = ?tier, "plan cache hit");
            return Ok(PlanFetchResult {
                plans,
                degraded: false,
                warnings: Vec::new(),
            });
        }

        let fetch = {
            use dashmap::mapref::entry::Entry;
            match self.in_flight.entry(key.clone()) {
                Entry::Occupied(existing) => {
                    tracing::debug!(key = %key, "joining in-flight fetch");
                    existing.get().clone()
                }
                Entry::Vacant(slot) => {
                    let client = self.clone();
                    let fut = async move {
                        let outcome = client.fetch_uncached(&query).await;
                        client.in_flight.remove(&key);
                        outcome
                    }
                    .boxed()
                    .shared();
                    slot.insert(fut.clone());
                    fut
                }
            }
        };

        fetch.await
    }

    async fn fetch_uncached(&self, query: &PlanQuery) -> Result<PlanFetchResult, AppError> {
        // While the circuit is open and still cooling down, go straight to
        // the snapshot without burning a permit or claiming the probe slot.
        if self
            .breaker
            .time_until_probe()
            .is_some_and(|d| d > Duration::ZERO)
        {
            tracing::warn!(territory = %query.territory_id, "circuit open, skipping upstream");
            return self.degrade_to_snapshot(query, suspended_error()).await;
        }

        if !self.acquire_permit().await {
            tracing::warn!(territory = %query.territory_id, "upstream call budget exhausted");
            return Err(AppError::ApiRateLimited(
                "upstream call budget exhausted, retry shortly".to_string(),
            ));
        }

        match self.fetch_with_retries(query).await {
            Ok(plans) => {
                self.cache
                    .set(
                        &query.cache_key(),
                        &plans,
                        self.plans_ttl,
                        &[query.territory_tag()],
                    )
                    .await;
                // Snapshots hold the territory's full plan set, so only
                // unfiltered fetches may write one; a filtered result would
                // shrink the snapshot to its subset. Persistence is best
                // effort; a write failure must not fail a request we already
                // have fresh data for.
                if query.filters.is_empty() {
                    if let Err(e) = self
                        .snapshots
                        .save_snapshot(&query.territory_id, query.usage_level, &plans)
                        .await
                    {
                        tracing::warn!(
                            territory = %query.territory_id,
                            error = %e,
                            "snapshot save failed"
                        );
                    }
                }
                Ok(PlanFetchResult {
                    plans,
                    degraded: false,
                    warnings: Vec::new(),
                })
            }
            Err(err) => self.degrade_to_snapshot(query, err).await,
        }
    }

    /// Calls the pricing API with bounded exponential backoff. Every attempt
    /// consults the breaker and reports its outcome back to it; a breaker
    /// denial mid-retry surfaces as the suspension error.
    async fn fetch_with_retries(&self, query: &PlanQuery) -> Result<Vec<PlanRecord>, AppError> {
        let mut delay = RETRY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if !self.breaker.can_proceed() {
                return Err(suspended_error());
            }

            let started = Instant::now();
            let outcome = self.upstream.fetch_plans(query).await;
            self.last_upstream_latency_ms.store(
                (started.elapsed().as_millis() as u64).max(1),
                Ordering::Relaxed,
            );

            match outcome {
                Ok(plans) => {
                    self.breaker.record_success();
                    return Ok(plans);
                }
                Err(err) => {
                    self.breaker.record_failure();
                    if err.retryable() && attempt < self.retry_max_attempts {
                        tracing::warn!(
                            territory = %query.territory_id,
                            attempt,
                            error = %err,
                            "pricing API call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Serves the last snapshot for the query, or propagates `origin` when
    /// none exists. Degraded results are never written to the cache so stale
    /// plans cannot shadow a recovered upstream.
    async fn degrade_to_snapshot(
        &self,
        query: &PlanQuery,
        origin: AppError,
    ) -> Result<PlanFetchResult, AppError> {
        match self
            .snapshots
            .load_snapshot(&query.territory_id, query.usage_level)
            .await
        {
            Ok(Some((plans, captured_at))) => {
                self.snapshot_fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    territory = %query.territory_id,
                    usage = query.usage_level,
                    captured_at = %captured_at,
                    error = %origin,
                    "serving plans from snapshot"
                );
                // Snapshots are stored unfiltered per (territory, usage);
                // the caller's filters are applied here so a degraded answer
                // honors the same contract as a live one.
                let plans: Vec<PlanRecord> = plans
                    .into_iter()
                    .filter(|plan| query.filters.matches(plan))
                    .collect();
                Ok(PlanFetchResult {
                    plans,
                    degraded: true,
                    warnings: vec![format!(
                        "Live pricing is unavailable; plans reflect data captured {}.",
                        captured_at.to_rfc3339()
                    )],
                })
            }
            Ok(None) => {
                tracing::error!(
                    territory = %query.territory_id,
                    usage = query.usage_level,
                    "no snapshot to fall back to"
                );
                Err(origin)
            }
            Err(db_err) => {
                tracing::error!(error = %db_err, "snapshot load failed during fallback");
                Err(origin)
            }
        }
    }

    /// Takes an upstream permit, waiting across up to two short backoffs for
    /// the window to roll before giving up.
    async fn acquire_permit(&self) -> bool {
        let mut delay = PERMIT_BACKOFF;
        for attempt in 0..PERMIT_ATTEMPTS {
            if self.limiter.try_acquire() {
                return true;
            }
            if attempt + 1 < PERMIT_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        false
    }

    /// Plan count for a query if (and only if) it is already cached.
    pub async fn cached_plan_count(&self, query: &PlanQuery) -> Option<usize> {
        self.cache
            .get::<Vec<PlanRecord>>(&query.cache_key())
            .await
            .map(|(plans, _)| plans.len())
    }

    /// Drops everything cached for one territory. Returns the key count.
    pub async fn invalidate_territory(&self, territory_id: &str) -> usize {
        self.cache
            .invalidate_tag(&format!("territory:{territory_id}"))
            .await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        tracing::info!("plan cache cleared");
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub async fn cache_health(&self) -> (bool, Option<bool>) {
        self.cache.health().await
    }

    pub fn diagnostics(&self) -> PlanClientDiagnostics {
        let latency = self.last_upstream_latency_ms.load(Ordering::Relaxed);
        PlanClientDiagnostics {
            breaker: self.breaker.snapshot(),
            upstream_limiter: self.limiter.info(),
            cache: self.cache.stats(),
            snapshot_fallbacks: self.snapshot_fallbacks.load(Ordering::Relaxed),
            last_upstream_latency_ms: (latency > 0).then_some(latency),
        }
    }
}

fn suspended_error() -> AppError {
    AppError::ApiServerError(
        "pricing API calls suspended while the service recovers".to_string(),
    )
}
