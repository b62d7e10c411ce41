use crate::models::{Switch, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;

/// Upper bound on rows returned by a range query.
const RANGE_LIMIT: i64 = 1000;

/// Rows per INSERT statement, kept well below the Postgres bind limit.
const INSERT_CHUNK: usize = 1000;

/// Storage errors, split by whether a retry can possibly succeed. The flush
/// writer retries `Transient` errors only.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("transient database error: {0}")]
    Transient(String),

    #[error("fatal database error: {0}")]
    Fatal(String),
}

impl RepoError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepoError::Transient(_))
    }
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code();
                let code = code.as_deref().unwrap_or("");
                // Data, constraint and schema violations cannot succeed on
                // retry; connection-level failures can.
                if code.starts_with("22") || code.starts_with("23") || code.starts_with("42") {
                    RepoError::Fatal(err.to_string())
                } else {
                    RepoError::Transient(err.to_string())
                }
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Configuration(_) => RepoError::Fatal(err.to_string()),
            _ => RepoError::Transient(err.to_string()),
        }
    }
}

/// Durable storage of switches and telemetry rows. Rows are append-only;
/// only switches are ever updated in place.
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn upsert_switch(&self, switch: &Switch) -> Result<(), RepoError>;
    async fn get_switch(&self, switch_id: &str) -> Result<Switch, RepoError>;
    async fn list_switches(&self) -> Result<Vec<Switch>, RepoError>;

    async fn bulk_insert(&self, records: &[TelemetryRecord]) -> Result<(), RepoError>;
    async fn latest_for(&self, switch_id: &str) -> Result<TelemetryRecord, RepoError>;
    async fn range_for(
        &self,
        switch_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, RepoError>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError>;
    async fn count(&self) -> Result<i64, RepoError>;
    async fn health_probe(&self) -> Result<(), RepoError>;
}

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricsRepository for PgRepository {
    async fn upsert_switch(&self, switch: &Switch) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO switches (id, name, location, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                location = EXCLUDED.location
            "#,
        )
        .bind(&switch.id)
        .bind(&switch.name)
        .bind(&switch.location)
        .bind(switch.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_switch(&self, switch_id: &str) -> Result<Switch, RepoError> {
        let switch = sqlx::query_as::<_, Switch>(
            r#"
            SELECT id, name, location, created_at
            FROM switches
            WHERE id = $1
            "#,
        )
        .bind(switch_id)
        .fetch_optional(&self.pool)
        .await?;

        switch.ok_or_else(|| RepoError::NotFound(format!("switch {switch_id}")))
    }

    async fn list_switches(&self) -> Result<Vec<Switch>, RepoError> {
        let switches = sqlx::query_as::<_, Switch>(
            r#"
            SELECT id, name, location, created_at
            FROM switches
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(switches)
    }

    async fn bulk_insert(&self, records: &[TelemetryRecord]) -> Result<(), RepoError> {
        if records.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO telemetry_metrics \
                 (switch_id, timestamp, bandwidth_mbps, latency_ms, packet_errors, \
                  utilization_pct, temperature_c, created_at) ",
            );
            builder.push_values(chunk.iter(), |mut b, record| {
                let timestamp = if record.timestamp.timestamp() == 0 {
                    now
                } else {
                    record.timestamp
                };
                b.push_bind(&record.switch_id)
                    .push_bind(timestamp)
                    .push_bind(record.bandwidth_mbps)
                    .push_bind(record.latency_ms)
                    .push_bind(record.packet_errors)
                    .push_bind(record.utilization_pct)
                    .push_bind(record.temperature_c)
                    .push_bind(record.created_at.unwrap_or(now));
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn latest_for(&self, switch_id: &str) -> Result<TelemetryRecord, RepoError> {
        let record = sqlx::query_as::<_, TelemetryRecord>(
            r#"
            SELECT switch_id, timestamp, bandwidth_mbps, latency_ms,
                   packet_errors, utilization_pct, temperature_c, created_at
            FROM telemetry_metrics
            WHERE switch_id = $1
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(switch_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| RepoError::NotFound(format!("metrics for switch {switch_id}")))
    }

    async fn range_for(
        &self,
        switch_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, RepoError> {
        let records = sqlx::query_as::<_, TelemetryRecord>(
            r#"
            SELECT switch_id, timestamp, bandwidth_mbps, latency_ms,
                   packet_errors, utilization_pct, temperature_c, created_at
            FROM telemetry_metrics
            WHERE switch_id = $1 AND timestamp >= $2 AND timestamp <= $3
            ORDER BY timestamp DESC
            LIMIT $4
            "#,
        )
        .bind(switch_id)
        .bind(from)
        .bind(to)
        .bind(RANGE_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM telemetry_metrics WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<i64, RepoError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_metrics")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn health_probe(&self) -> Result<(), RepoError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
