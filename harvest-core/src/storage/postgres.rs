//! PostgreSQL storage backend.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;

use crate::error::{HarvestError, Result};
use crate::metric::{Metric, MetricKind, MetricValue};
use crate::retry::RetryPolicy;

use super::Storage;

/// Upsert keeping the merge semantics in SQL: counter deltas accumulate,
/// gauge values overwrite. The `WHERE` guard skips rows whose stored kind
/// differs, which the callers turn into a conflict.
const UPSERT_QUERY: &str = r#"
INSERT INTO metric (id, mtype, delta, value)
VALUES ($1, $2, $3, $4)
ON CONFLICT(id)
DO UPDATE SET
    delta = EXCLUDED.delta + metric.delta,
    value = EXCLUDED.value
WHERE metric.mtype = EXCLUDED.mtype
"#;

/// Metric storage over a PostgreSQL pool. Batch writes run in one
/// transaction; concurrent safety comes from row-level isolation.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to `dsn`, retrying on the given policy, and bootstrap the
    /// schema.
    pub async fn connect(dsn: &str, retry: &RetryPolicy) -> Result<Self> {
        let pool = retry
            .run(|| async {
                PgPoolOptions::new()
                    .max_connections(5)
                    .connect(dsn)
                    .await
                    .map_err(|e| HarvestError::transient(e))
            })
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metric (
              id TEXT NOT NULL,
              mtype TEXT NOT NULL,
              delta BIGINT,
              value DOUBLE PRECISION,

              CONSTRAINT id_pkey PRIMARY KEY (id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("database storage ready");
        Ok(Self { pool })
    }

    async fn stored_kind(&self, id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT mtype FROM metric WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("mtype")))
    }

    async fn conflict(&self, metric: &Metric) -> HarvestError {
        let existing = self
            .stored_kind(&metric.id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "unknown".to_string());
        HarvestError::Conflict { id: metric.id.clone(), existing }
    }
}

fn metric_from_row(row: &sqlx::postgres::PgRow) -> Result<Metric> {
    let id: String = row.try_get("id")?;
    let mtype: String = row.try_get("mtype")?;
    let delta: Option<i64> = row.try_get("delta")?;
    let value: Option<f64> = row.try_get("value")?;

    let kind: MetricKind = mtype.parse()?;
    let value = match (kind, delta, value) {
        (MetricKind::Counter, Some(delta), _) => MetricValue::Counter(delta),
        (MetricKind::Gauge, _, Some(value)) => MetricValue::Gauge(value),
        _ => {
            return Err(HarvestError::Database(format!(
                "metric {id} row carries no payload for its kind"
            )))
        }
    };

    Ok(Metric { id, value })
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn set(&self, metric: Metric) -> Result<()> {
        let done = sqlx::query(UPSERT_QUERY)
            .bind(&metric.id)
            .bind(metric.kind().as_str())
            .bind(metric.delta())
            .bind(metric.gauge_value())
            .execute(&self.pool)
            .await?;

        if done.rows_affected() == 0 {
            return Err(self.conflict(&metric).await);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Metric>> {
        let row = sqlx::query("SELECT id, mtype, delta, value FROM metric WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(metric_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Metric>> {
        let rows = sqlx::query("SELECT id, mtype, delta, value FROM metric")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(metric_from_row).collect()
    }

    async fn update(&self, batch: Vec<Metric>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for metric in &batch {
            let done = sqlx::query(UPSERT_QUERY)
                .bind(&metric.id)
                .bind(metric.kind().as_str())
                .bind(metric.delta())
                .bind(metric.gauge_value())
                .execute(&mut *tx)
                .await?;

            if done.rows_affected() == 0 {
                drop(tx);
                return Err(self.conflict(metric).await);
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn replace_all(&self, list: Vec<Metric>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("TRUNCATE TABLE metric").execute(&mut *tx).await?;

        for metric in &list {
            sqlx::query("INSERT INTO metric (id, mtype, delta, value) VALUES ($1, $2, $3, $4)")
                .bind(&metric.id)
                .bind(metric.kind().as_str())
                .bind(metric.delta())
                .bind(metric.gauge_value())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
