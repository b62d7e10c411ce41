use crate::error::TelemetryError;
use crate::models::{
    AllMetricsResponse, HealthStatus, MetricResponse, MetricType, MetricsListResponse,
    PerformanceMetrics, Switch, TelemetryRecord,
};
use crate::store::HybridStore;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache data older than this marks the service degraded.
const DATA_FRESHNESS_LIMIT_SECONDS: f64 = 300.0;

/// Business logic over the hybrid store: input validation and
/// normalization on the way in, aggregation on the way out.
pub struct TelemetryService {
    store: Arc<HybridStore>,
    dropped_records: AtomicU64,
}

impl TelemetryService {
    pub fn new(store: Arc<HybridStore>) -> Self {
        Self {
            store,
            dropped_records: AtomicU64::new(0),
        }
    }

    pub async fn start(&self) -> Result<(), TelemetryError> {
        tracing::info!("starting telemetry service");
        self.store.start().await
    }

    pub async fn stop(&self) {
        self.store.stop().await;
        tracing::info!("telemetry service stopped");
    }

    fn validate(record: &TelemetryRecord) -> Result<(), TelemetryError> {
        if record.bandwidth_mbps < 0.0 {
            return Err(TelemetryError::Validation(format!(
                "bandwidth cannot be negative for switch {}",
                record.switch_id
            )));
        }
        if record.latency_ms < 0.0 {
            return Err(TelemetryError::Validation(format!(
                "latency cannot be negative for switch {}",
                record.switch_id
            )));
        }
        if record.packet_errors < 0 {
            return Err(TelemetryError::Validation(format!(
                "packet errors cannot be negative for switch {}",
                record.switch_id
            )));
        }
        if !(0.0..=100.0).contains(&record.utilization_pct) {
            return Err(TelemetryError::Validation(format!(
                "utilization must be between 0 and 100 for switch {}",
                record.switch_id
            )));
        }
        if !(-50.0..=150.0).contains(&record.temperature_c) {
            return Err(TelemetryError::Validation(format!(
                "temperature must be between -50 and 150 for switch {}",
                record.switch_id
            )));
        }
        Ok(())
    }

    /// Ingests a single record. Invalid records never reach the cache.
    pub fn ingest_one(&self, record: TelemetryRecord) -> Result<(), TelemetryError> {
        if record.switch_id.is_empty() {
            return Err(TelemetryError::EmptySwitchId);
        }
        Self::validate(&record)?;
        self.store.store_one(record)
    }

    /// Ingests a batch. Records with an empty switch id are dropped with a
    /// warning; a record with out-of-range values rejects the whole batch
    /// before any cache write. Returns the number of records stored.
    pub fn ingest_batch(&self, records: Vec<TelemetryRecord>) -> Result<usize, TelemetryError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            if record.switch_id.is_empty() {
                self.dropped_records.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("dropping telemetry record with empty switch id");
                continue;
            }
            valid.push(record);
        }

        if valid.is_empty() {
            return Err(TelemetryError::Validation(
                "no valid telemetry records to ingest".to_string(),
            ));
        }

        for record in &valid {
            Self::validate(record)?;
        }

        let stored = valid.len();
        self.store.store_bulk(valid)?;
        tracing::debug!(records = stored, "ingested telemetry batch");
        Ok(stored)
    }

    pub fn dropped_records(&self) -> u64 {
        self.dropped_records.load(Ordering::Relaxed)
    }

    pub fn get_metric(
        &self,
        switch_id: &str,
        metric_type: &str,
    ) -> Result<MetricResponse, TelemetryError> {
        if switch_id.is_empty() {
            return Err(TelemetryError::EmptySwitchId);
        }
        let metric: MetricType = metric_type
            .parse()
            .map_err(|_| TelemetryError::InvalidMetricType(metric_type.to_string()))?;

        let record = self
            .store
            .get_record(switch_id)
            .ok_or_else(|| TelemetryError::SwitchNotFound(switch_id.to_string()))?;

        Ok(MetricResponse {
            switch_id: switch_id.to_string(),
            metric_type: metric,
            value: record.metric_value(metric),
            timestamp: record.timestamp,
        })
    }

    pub fn get_switch_metrics(&self, switch_id: &str) -> Result<MetricsListResponse, TelemetryError> {
        if switch_id.is_empty() {
            return Err(TelemetryError::EmptySwitchId);
        }
        let record = self
            .store
            .get_record(switch_id)
            .ok_or_else(|| TelemetryError::SwitchNotFound(switch_id.to_string()))?;

        Ok(MetricsListResponse {
            switch_id: switch_id.to_string(),
            metrics: record.metrics_map(),
            timestamp: record.timestamp,
        })
    }

    pub fn get_all_metrics(&self) -> AllMetricsResponse {
        let all = self.store.list_all();
        let mut switches: Vec<MetricsListResponse> = all
            .into_iter()
            .map(|(switch_id, record)| MetricsListResponse {
                switch_id,
                metrics: record.metrics_map(),
                timestamp: record.timestamp,
            })
            .collect();
        switches.sort_by(|a, b| a.switch_id.cmp(&b.switch_id));

        AllMetricsResponse {
            count: switches.len(),
            switches,
            timestamp: Utc::now(),
        }
    }

    pub async fn register_switch(&self, switch: Switch) -> Result<(), TelemetryError> {
        if switch.id.is_empty() {
            return Err(TelemetryError::EmptySwitchId);
        }
        self.store.upsert_switch(&switch).await?;
        tracing::debug!(switch = %switch.id, location = %switch.location, "registered switch");
        Ok(())
    }

    pub async fn switches(&self) -> Result<Vec<Switch>, TelemetryError> {
        Ok(self.store.switches().await?)
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.store.performance_metrics()
    }

    pub async fn health_status(&self) -> HealthStatus {
        let switch_count = self.store.switch_count();
        let performance = self.store.performance_metrics();

        let mut status = "healthy";
        let mut checks = BTreeMap::new();
        checks.insert("cache".to_string(), "ok".to_string());
        checks.insert("switches".to_string(), "ok".to_string());

        match self.store.health_probe().await {
            Ok(()) => {
                checks.insert("storage".to_string(), "ok".to_string());
            }
            Err(err) => {
                tracing::warn!(error = %err, "storage health probe failed");
                status = "degraded";
                checks.insert("storage".to_string(), "error".to_string());
            }
        }

        if performance.data_age_seconds > DATA_FRESHNESS_LIMIT_SECONDS {
            status = "degraded";
            checks.insert("data_freshness".to_string(), "warning".to_string());
        }
        if switch_count == 0 {
            status = "degraded";
            checks.insert("switches".to_string(), "no_data".to_string());
        }

        let uptime = (Utc::now() - self.store.started_at())
            .to_std()
            .unwrap_or_default();

        HealthStatus {
            service: "telemetry".to_string(),
            status: status.to_string(),
            uptime: format!("{uptime:?}"),
            switch_count,
            checks,
            performance,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
