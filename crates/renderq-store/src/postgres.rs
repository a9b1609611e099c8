//! Postgres implementation of the job store.
//!
//! All competing mutations are single conditional statements (or a short
//! transaction pairing the lease write with its product write), so any
//! number of worker instances can share one database with no other lock
//! service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info};

use renderq_models::{
    LeaseRecord, LeaseStatus, ProductStatus, RenderSpec, ResultPayload, WorkKey, WorkKind,
    WorkProduct,
};

use crate::error::{StoreError, StoreResult};
use crate::metrics::{record_conflict, record_operation};
use crate::store::JobStore;

// =============================================================================
// Configuration
// =============================================================================

/// Postgres store configuration.
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    /// Postgres connection URL
    pub database_url: String,
    /// Maximum pool connections
    pub max_connections: u32,
    /// Connection acquire timeout
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| StoreError::config("DATABASE_URL must be set to reach the job store"))?;

        Ok(Self {
            database_url,
            max_connections: std::env::var("STORE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            acquire_timeout: Duration::from_secs(
                std::env::var("STORE_ACQUIRE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
        })
    }
}

// =============================================================================
// Row mapping
// =============================================================================

#[derive(FromRow)]
struct ProductRow {
    key: String,
    kind: String,
    spec: serde_json::Value,
    status: String,
    result_payload: Option<serde_json::Value>,
    artifact_ref: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for WorkProduct {
    type Error = StoreError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        let key = WorkKey::parse(&row.key)
            .map_err(|e| StoreError::corrupt(&row.key, e.to_string()))?;
        let kind = WorkKind::from_str_opt(&row.kind)
            .ok_or_else(|| StoreError::corrupt(&row.key, format!("unknown kind '{}'", row.kind)))?;
        let status = ProductStatus::from_str_opt(&row.status).ok_or_else(|| {
            StoreError::corrupt(&row.key, format!("unknown product status '{}'", row.status))
        })?;
        let spec = serde_json::from_value::<RenderSpec>(row.spec)?;
        let result_payload = row
            .result_payload
            .map(serde_json::from_value::<ResultPayload>)
            .transpose()?;

        Ok(WorkProduct {
            key,
            kind,
            spec,
            status,
            result_payload,
            artifact_ref: row.artifact_ref,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct LeaseRow {
    key: String,
    status: String,
    owner_instance_id: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    last_error: Option<String>,
}

impl TryFrom<LeaseRow> for LeaseRecord {
    type Error = StoreError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        let key = WorkKey::parse(&row.key)
            .map_err(|e| StoreError::corrupt(&row.key, e.to_string()))?;
        let status = LeaseStatus::from_str_opt(&row.status).ok_or_else(|| {
            StoreError::corrupt(&row.key, format!("unknown lease status '{}'", row.status))
        })?;

        Ok(LeaseRecord {
            key,
            status,
            owner_instance_id: row.owner_instance_id,
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            started_at: row.started_at,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error: row.last_error,
        })
    }
}

// =============================================================================
// Store
// =============================================================================

/// Postgres-backed job store.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Connect and run embedded migrations.
    pub async fn connect(config: &PgStoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Connected to job store ({} max connections)", config.max_connections);

        Ok(Self { pool })
    }

    /// Create from environment variables.
    pub async fn from_env() -> StoreResult<Self> {
        let config = PgStoreConfig::from_env()?;
        Self::connect(&config).await
    }

    /// Wrap an existing pool (tests, shared pools).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_new(&self, product: &WorkProduct) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let spec_json = serde_json::to_value(&product.spec)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO work_products (key, kind, spec, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(product.key.as_str())
        .bind(product.kind.as_str())
        .bind(spec_json)
        .bind(product.status.as_str())
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            record_conflict("insert_new");
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO lease_records (key, status, attempt_count)
            VALUES ($1, 'queued', 0)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(product.key.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        record_operation("insert_new", true);
        debug!(key = %product.key, "Created work product and lease");
        Ok(true)
    }

    async fn remove_new(&self, key: &WorkKey) -> StoreResult<bool> {
        // Lease rows cascade with the product delete.
        let removed = sqlx::query(
            r#"
            DELETE FROM work_products p
            USING lease_records l
            WHERE p.key = $1
              AND l.key = p.key
              AND p.status = 'queued'
              AND l.status = 'queued'
              AND l.owner_instance_id IS NULL
            "#,
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if removed == 0 {
            record_conflict("remove_new");
        }
        Ok(removed > 0)
    }

    async fn get_product(&self, key: &WorkKey) -> StoreResult<Option<WorkProduct>> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT * FROM work_products WHERE key = $1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkProduct::try_from).transpose()
    }

    async fn get_lease(&self, key: &WorkKey) -> StoreResult<Option<LeaseRecord>> {
        let row = sqlx::query_as::<_, LeaseRow>(
            "SELECT * FROM lease_records WHERE key = $1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(LeaseRecord::try_from).transpose()
    }

    async fn claim(&self, key: &WorkKey, owner: &str) -> StoreResult<Option<LeaseRecord>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            UPDATE lease_records
            SET status = 'processing',
                owner_instance_id = $2,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                started_at = NOW()
            WHERE key = $1 AND status = 'queued' AND owner_instance_id IS NULL
            RETURNING *
            "#,
        )
        .bind(key.as_str())
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            record_conflict("claim");
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE work_products
            SET status = 'processing', updated_at = NOW()
            WHERE key = $1 AND status = 'queued'
            "#,
        )
        .bind(key.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        record_operation("claim", true);
        Ok(Some(row.try_into()?))
    }

    async fn heartbeat(&self, key: &WorkKey, owner: &str) -> StoreResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE lease_records
            SET heartbeat_at = NOW()
            WHERE key = $1 AND owner_instance_id = $2 AND status = 'processing'
            "#,
        )
        .bind(key.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            record_conflict("heartbeat");
        }
        Ok(updated > 0)
    }

    async fn complete(
        &self,
        key: &WorkKey,
        artifact_ref: &str,
        payload: &ResultPayload,
    ) -> StoreResult<bool> {
        let payload_json = serde_json::to_value(payload)?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE work_products
            SET status = 'completed',
                artifact_ref = $2,
                result_payload = $3,
                error = NULL,
                updated_at = NOW()
            WHERE key = $1 AND status IN ('queued', 'processing')
            "#,
        )
        .bind(key.as_str())
        .bind(artifact_ref)
        .bind(payload_json)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            record_conflict("complete");
            return Ok(false);
        }

        sqlx::query("DELETE FROM lease_records WHERE key = $1")
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        record_operation("complete", true);
        Ok(true)
    }

    async fn fail(&self, key: &WorkKey, error: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE work_products
            SET status = 'failed',
                error = $2,
                artifact_ref = NULL,
                result_payload = NULL,
                updated_at = NOW()
            WHERE key = $1 AND status IN ('queued', 'processing')
            "#,
        )
        .bind(key.as_str())
        .bind(error)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            record_conflict("fail");
            return Ok(false);
        }

        sqlx::query("DELETE FROM lease_records WHERE key = $1")
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        record_operation("fail", true);
        Ok(true)
    }

    async fn requeue(&self, key: &WorkKey, owner: &str, last_error: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE lease_records
            SET status = 'queued',
                owner_instance_id = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                started_at = NULL,
                attempt_count = attempt_count + 1,
                last_error = $3
            WHERE key = $1 AND owner_instance_id = $2 AND status = 'processing'
            "#,
        )
        .bind(key.as_str())
        .bind(owner)
        .bind(last_error)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            record_conflict("requeue");
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE work_products
            SET status = 'queued', updated_at = NOW()
            WHERE key = $1 AND status = 'processing'
            "#,
        )
        .bind(key.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        record_operation("requeue", true);
        Ok(true)
    }

    async fn release_owned(&self, owner: &str) -> StoreResult<Vec<WorkKey>> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE lease_records
            SET status = 'queued',
                owner_instance_id = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                started_at = NULL
            WHERE owner_instance_id = $1 AND status = 'processing'
            RETURNING key
            "#,
        )
        .bind(owner)
        .fetch_all(&mut *tx)
        .await?;

        let keys: Vec<String> = rows.into_iter().map(|(k,)| k).collect();

        if !keys.is_empty() {
            sqlx::query(
                r#"
                UPDATE work_products
                SET status = 'queued', updated_at = NOW()
                WHERE key::text = ANY($1) AND status = 'processing'
                "#,
            )
            .bind(&keys)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        record_operation("release_owned", true);

        keys.iter()
            .map(|k| WorkKey::parse(k).map_err(|e| StoreError::corrupt(k, e.to_string())))
            .collect()
    }

    async fn list_stale(&self, cutoff_secs: i64) -> StoreResult<Vec<LeaseRecord>> {
        let rows = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT * FROM lease_records
            WHERE status = 'processing'
              AND (
                (heartbeat_at IS NOT NULL AND heartbeat_at < NOW() - make_interval(secs => $1))
                OR (heartbeat_at IS NULL AND claimed_at IS NOT NULL
                    AND claimed_at < NOW() - make_interval(secs => $1))
                OR (heartbeat_at IS NULL AND claimed_at IS NULL)
              )
            "#,
        )
        .bind(cutoff_secs as f64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LeaseRecord::try_from).collect()
    }

    async fn recover_stale(&self, key: &WorkKey, expected_owner: &str) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE lease_records
            SET status = 'queued',
                owner_instance_id = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL,
                started_at = NULL,
                attempt_count = attempt_count + 1,
                last_error = NULL
            WHERE key = $1 AND owner_instance_id = $2 AND status = 'processing'
            "#,
        )
        .bind(key.as_str())
        .bind(expected_owner)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            record_conflict("recover_stale");
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE work_products
            SET status = 'queued', updated_at = NOW()
            WHERE key = $1 AND status = 'processing'
            "#,
        )
        .bind(key.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        record_operation("recover_stale", true);
        Ok(true)
    }

    async fn list_queued(&self, limit: usize) -> StoreResult<Vec<LeaseRecord>> {
        let rows = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT l.* FROM lease_records l
            JOIN work_products p ON p.key = l.key
            WHERE l.status = 'queued'
            ORDER BY p.created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LeaseRecord::try_from).collect()
    }

    async fn list_unleased(&self, limit: usize) -> StoreResult<Vec<WorkProduct>> {
        let rows = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT p.* FROM work_products p
            LEFT JOIN lease_records l ON l.key = p.key
            WHERE l.key IS NULL AND p.status IN ('queued', 'processing')
            ORDER BY p.created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkProduct::try_from).collect()
    }

    async fn ensure_lease(&self, key: &WorkKey) -> StoreResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO lease_records (key, status, attempt_count)
            VALUES ($1, 'queued', 0)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(inserted > 0)
    }
}
