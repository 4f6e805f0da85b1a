//! Multi-tier cache: a bounded in-process tier (moka, TinyLFU eviction with
//! per-entry TTL) in front of an optional distributed Redis tier.
//!
//! Lookup order is memory → distributed → miss. A distributed hit is
//! promoted into memory with its remaining TTL. The distributed tier is
//! best-effort: its failures are counted and logged but always degrade to a
//! miss, never to a caller-visible error.

use crate::cache_validator::CheckedPayload;
use crate::errors::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which tier satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierOrigin {
    Memory,
    Distributed,
}

/// One cached value with its bookkeeping. Owned exclusively by the cache;
/// callers see only the deserialized payload and the tier it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Serialized payload (JSON).
    pub value: String,
    pub written_at: DateTime<Utc>,
    pub ttl: Duration,
    pub tier_origin: TierOrigin,
    pub tags: Vec<String>,
}

impl CacheEntry {
    /// TTL left on this entry, measured from `written_at`. None once expired.
    fn remaining_ttl(&self) -> Option<Duration> {
        let age = (Utc::now() - self.written_at).to_std().ok()?;
        self.ttl.checked_sub(age).filter(|d| !d.is_zero())
    }
}

/// moka expiry policy that honors each entry's own TTL, re-arming it on
/// overwrite so writes are last-writer-wins with a fresh clock.
struct EntryTtl;

impl Expiry<String, CacheEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Cross-process cache tier. Implementations must be cheap to clone calls
/// onto (multiplexed connections) and treat the store as eventually
/// consistent.
#[async_trait]
pub trait DistributedTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
    /// Drops every key in this service's namespace.
    async fn clear_namespace(&self) -> Result<u64, AppError>;
    async fn ping(&self) -> Result<(), AppError>;
}

/// Redis-backed distributed tier using a multiplexed connection manager.
pub struct RedisTier {
    manager: redis::aio::ConnectionManager,
    namespace: String,
}

impl RedisTier {
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::ConfigurationMissing(format!("invalid redis URL: {e}")))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::NetworkError(format!("redis connect: {e}")))?;
        tracing::info!(url = %redact_url(url), namespace, "distributed cache tier connected");
        Ok(Self {
            manager,
            namespace: namespace.to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl DistributedTier for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::NetworkError(format!("redis GET: {e}")))
    }

    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("SETEX")
            .arg(self.full_key(key))
            .arg(ttl.as_secs().max(1))
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| AppError::NetworkError(format!("redis SETEX: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| AppError::NetworkError(format!("redis DEL: {e}")))
    }

    async fn clear_namespace(&self) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}:*", self.namespace);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| AppError::NetworkError(format!("redis SCAN: {e}")))?;
            if !keys.is_empty() {
                let count: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| AppError::NetworkError(format!("redis DEL: {e}")))?;
                removed += count;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| AppError::NetworkError(format!("redis PING: {e}")))
    }
}

/// Strips credentials from a connection URL before logging.
fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable>".to_string(),
    }
}

/// Aggregate hit/miss counters, serialized into the diagnostics payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookups satisfied by either tier.
    pub hits: u64,
    /// Lookups that fell through to origin.
    pub misses: u64,
    pub memory_hits: u64,
    pub memory_lookups: u64,
    pub memory_hit_rate: f64,
    pub distributed_hits: u64,
    pub distributed_lookups: u64,
    pub distributed_hit_rate: f64,
    /// Distributed-tier operations that failed and degraded to a miss.
    pub distributed_errors: u64,
    pub distributed_enabled: bool,
}

/// The cache tier manager.
pub struct TieredCache {
    memory: Cache<String, CacheEntry>,
    distributed: Option<Arc<dyn DistributedTier>>,
    /// tag → keys written under it. The memory tier's eviction listener
    /// prunes expired and evicted keys; invalidating an absent key is a
    /// no-op. Shared with the listener closure.
    tag_index: Arc<DashMap<String, HashSet<String>>>,
    memory_hits: AtomicU64,
    memory_lookups: AtomicU64,
    distributed_hits: AtomicU64,
    distributed_lookups: AtomicU64,
    misses: AtomicU64,
    distributed_errors: AtomicU64,
}

impl TieredCache {
    pub fn new(capacity: u64, distributed: Option<Arc<dyn DistributedTier>>) -> Self {
        let tag_index: Arc<DashMap<String, HashSet<String>>> = Arc::new(DashMap::new());
        let index = Arc::clone(&tag_index);
        let memory = Cache::builder()
            .max_capacity(capacity)
            .expire_after(EntryTtl)
            // Keeps the tag index bounded by the cache itself: when moka
            // drops an entry (TTL or capacity), its key leaves every tag
            // set it was registered under. Replacements keep their key.
            .eviction_listener(move |key: Arc<String>, entry: CacheEntry, cause| {
                if !cause.was_evicted() {
                    return;
                }
                for tag in &entry.tags {
                    let emptied = index
                        .get_mut(tag.as_str())
                        .map(|mut keys| {
                            keys.remove(key.as_str());
                            keys.is_empty()
                        })
                        .unwrap_or(false);
                    if emptied {
                        index.remove_if(tag.as_str(), |_, keys| keys.is_empty());
                    }
                }
            })
            .build();
        Self {
            memory,
            distributed,
            tag_index,
            memory_hits: AtomicU64::new(0),
            memory_lookups: AtomicU64::new(0),
            distributed_hits: AtomicU64::new(0),
            distributed_lookups: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            distributed_errors: AtomicU64::new(0),
        }
    }

    /// Typed lookup. Returns the value and the tier that held it, or None on
    /// a full miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<(T, TierOrigin)> {
        self.memory_lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.memory.get(key).await {
            match serde_json::from_str::<T>(&entry.value) {
                Ok(value) => {
                    self.memory_hits.fetch_add(1, Ordering::Relaxed);
                    return Some((value, TierOrigin::Memory));
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "cached payload failed to decode, evicting");
                    self.memory.invalidate(key).await;
                }
            }
        }

        if let Some(tier) = &self.distributed {
            self.distributed_lookups.fetch_add(1, Ordering::Relaxed);
            match tier.get(key).await {
                Ok(Some(raw)) => {
                    if let Some((value, entry)) = self.decode_distributed::<T>(key, &raw) {
                        self.distributed_hits.fetch_add(1, Ordering::Relaxed);
                        self.promote(key, entry).await;
                        return Some((value, TierOrigin::Distributed));
                    }
                    // Corrupt or expired payload: drop it so the next writer
                    // starts clean.
                    if let Err(e) = tier.delete(key).await {
                        self.distributed_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(key, error = %e, "failed to drop bad distributed entry");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.distributed_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key, error = %e, "distributed tier unavailable, degrading to miss");
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Writes through every tier. Last writer wins per key.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, tags: &[String]) {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(key, error = %e, "value not serializable, skipping cache write");
                return;
            }
        };
        let entry = CacheEntry {
            value: payload,
            written_at: Utc::now(),
            ttl,
            tier_origin: TierOrigin::Memory,
            tags: tags.to_vec(),
        };

        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }

        self.memory.insert(key.to_string(), entry.clone()).await;

        if let Some(tier) = &self.distributed {
            let sealed = match serde_json::to_string(&entry) {
                Ok(raw) => CheckedPayload::seal(raw).encode(),
                Err(e) => {
                    tracing::error!(key, error = %e, "entry not serializable for distributed tier");
                    return;
                }
            };
            if let Err(e) = tier.set(key, &sealed, ttl).await {
                self.distributed_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, error = %e, "distributed write failed, memory tier only");
            }
        }
    }

    /// Invalidates a tag if one matches, otherwise treats the argument as a
    /// single key. Returns how many keys were dropped.
    pub async fn invalidate(&self, tag_or_key: &str) -> usize {
        if self.tag_index.contains_key(tag_or_key) {
            self.invalidate_tag(tag_or_key).await
        } else {
            self.invalidate_key(tag_or_key).await;
            1
        }
    }

    pub async fn invalidate_key(&self, key: &str) {
        self.memory.invalidate(key).await;
        if let Some(tier) = &self.distributed {
            if let Err(e) = tier.delete(key).await {
                self.distributed_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key, error = %e, "distributed delete failed");
            }
        }
    }

    /// Drops every key written under `tag`, in both tiers.
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        let Some((_, keys)) = self.tag_index.remove(tag) else {
            return 0;
        };
        let count = keys.len();
        for key in keys {
            self.invalidate_key(&key).await;
        }
        tracing::info!(tag, keys = count, "tag invalidated");
        count
    }

    /// Administrative flush of both tiers.
    pub async fn clear(&self) {
        self.memory.invalidate_all();
        self.tag_index.clear();
        if let Some(tier) = &self.distributed {
            match tier.clear_namespace().await {
                Ok(removed) => tracing::info!(removed, "distributed namespace cleared"),
                Err(e) => {
                    self.distributed_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "distributed clear failed");
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let memory_lookups = self.memory_lookups.load(Ordering::Relaxed);
        let distributed_hits = self.distributed_hits.load(Ordering::Relaxed);
        let distributed_lookups = self.distributed_lookups.load(Ordering::Relaxed);
        CacheStats {
            hits: memory_hits + distributed_hits,
            misses: self.misses.load(Ordering::Relaxed),
            memory_hits,
            memory_lookups,
            memory_hit_rate: rate(memory_hits, memory_lookups),
            distributed_hits,
            distributed_lookups,
            distributed_hit_rate: rate(distributed_hits, distributed_lookups),
            distributed_errors: self.distributed_errors.load(Ordering::Relaxed),
            distributed_enabled: self.distributed.is_some(),
        }
    }

    /// Memory tier is process-local and always reachable; the distributed
    /// tier reports its ping result when configured.
    pub async fn health(&self) -> (bool, Option<bool>) {
        let distributed = match &self.distributed {
            Some(tier) => Some(tier.ping().await.is_ok()),
            None => None,
        };
        (true, distributed)
    }

    fn decode_distributed<T: DeserializeOwned>(
        &self,
        key: &str,
        raw: &str,
    ) -> Option<(T, CacheEntry)> {
        let payload = CheckedPayload::decode_verified(raw)?;
        let entry: CacheEntry = match serde_json::from_str(&payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(key, error = %e, "distributed entry undecodable");
                return None;
            }
        };
        // The distributed tier expires by TTL too, but its clock may lag;
        // trust the entry's own timestamps.
        entry.remaining_ttl()?;
        let value = serde_json::from_str::<T>(&entry.value).ok()?;
        Some((value, entry))
    }

    async fn promote(&self, key: &str, mut entry: CacheEntry) {
        let Some(remaining) = entry.remaining_ttl() else {
            return;
        };
        entry.ttl = remaining;
        entry.tier_origin = TierOrigin::Distributed;
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.memory.insert(key.to_string(), entry).await;
        tracing::debug!(key, "promoted distributed entry into memory tier");
    }
}

fn rate(hits: u64, lookups: u64) -> f64 {
    if lookups == 0 {
        0.0
    } else {
        hits as f64 / lookups as f64
    }
}
