use crate::errors::{AppError, ResultExt};
use crate::models::PlanRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Durable last-known-good plan data, served when the upstream pricing API
/// is unreachable or the circuit is open. One row per (territory, usage)
/// pair, overwritten on every successful fetch.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot(
        &self,
        territory_id: &str,
        usage_level: u32,
        plans: &[PlanRecord],
    ) -> Result<(), AppError>;

    async fn load_snapshot(
        &self,
        territory_id: &str,
        usage_level: u32,
    ) -> Result<Option<(Vec<PlanRecord>, DateTime<Utc>)>, AppError>;
}

/// Postgres-backed snapshot store. Plans are stored as a JSONB document
/// rather than normalized rows: snapshots are read back whole and never
/// queried by field.
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn save_snapshot(
        &self,
        territory_id: &str,
        usage_level: u32,
        plans: &[PlanRecord],
    ) -> Result<(), AppError> {
        let document = serde_json::to_value(plans)
            .map_err(|e| AppError::DatabaseError(sqlx::Error::Decode(Box::new(e))))?;

        sqlx::query(
            r#"
            INSERT INTO pricing.plan_snapshots (territory_id, usage_level, plans, captured_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (territory_id, usage_level) DO UPDATE
            SET plans = EXCLUDED.plans,
                captured_at = now()
            "#,
        )
        .bind(territory_id)
        .bind(usage_level as i32)
        .bind(&document)
        .execute(&self.pool)
        .await
        .context("saving plan snapshot")?;

        tracing::debug!(
            territory = %territory_id,
            usage = usage_level,
            count = plans.len(),
            "plan snapshot saved"
        );

        Ok(())
    }

    async fn load_snapshot(
        &self,
        territory_id: &str,
        usage_level: u32,
    ) -> Result<Option<(Vec<PlanRecord>, DateTime<Utc>)>, AppError> {
        let row = sqlx::query_as::<_, (serde_json::Value, DateTime<Utc>)>(
            r#"
            SELECT plans, captured_at
            FROM pricing.plan_snapshots
            WHERE territory_id = $1 AND usage_level = $2
            LIMIT 1
            "#,
        )
        .bind(territory_id)
        .bind(usage_level as i32)
        .fetch_optional(&self.pool)
        .await
        .context("loading plan snapshot")?;

        match row {
            Some((document, captured_at)) => {
                let plans: Vec<PlanRecord> = serde_json::from_value(document)
                    .map_err(|e| AppError::DatabaseError(sqlx::Error::Decode(Box::new(e))))?;
                Ok(Some((plans, captured_at)))
            }
            None => Ok(None),
        }
    }
}

/// In-memory snapshot store for tests and single-node deployments without
/// Postgres configured.
pub struct MemorySnapshotStore {
    inner: parking_lot::Mutex<std::collections::HashMap<(String, u32), (Vec<PlanRecord>, DateTime<Utc>)>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save_snapshot(
        &self,
        territory_id: &str,
        usage_level: u32,
        plans: &[PlanRecord],
    ) -> Result<(), AppError> {
        self.inner.lock().insert(
            (territory_id.to_string(), usage_level),
            (plans.to_vec(), Utc::now()),
        );
        Ok(())
    }

    async fn load_snapshot(
        &self,
        territory_id: &str,
        usage_level: u32,
    ) -> Result<Option<(Vec<PlanRecord>, DateTime<Utc>)>, AppError> {
        Ok(self
            .inner
            .lock()
            .get(&(territory_id.to_string(), usage_level))
            .cloned())
    }
}
