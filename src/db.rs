use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("failed to create lazy database pool for {database_url}"))
}

/// Creates the telemetry tables and indexes when they are missing. Safe to
/// call on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS switches (
            id text PRIMARY KEY,
            name text NOT NULL,
            location text NOT NULL,
            created_at timestamptz NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create switches table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS telemetry_metrics (
            id bigserial PRIMARY KEY,
            switch_id text NOT NULL REFERENCES switches(id),
            timestamp timestamptz NOT NULL,
            bandwidth_mbps double precision NOT NULL CHECK (bandwidth_mbps >= 0),
            latency_ms double precision NOT NULL CHECK (latency_ms >= 0),
            packet_errors bigint NOT NULL CHECK (packet_errors >= 0),
            utilization_pct double precision NOT NULL CHECK (utilization_pct BETWEEN 0 AND 100),
            temperature_c double precision NOT NULL CHECK (temperature_c BETWEEN -50 AND 150),
            created_at timestamptz NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create telemetry_metrics table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_telemetry_metrics_switch_ts
        ON telemetry_metrics (switch_id, timestamp DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create switch/timestamp index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_telemetry_metrics_created_at
        ON telemetry_metrics (created_at DESC)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create created_at index")?;

    Ok(())
}
