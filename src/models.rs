use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// A fabric switch, created on first observation and upserted afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct Switch {
    pub id: String,
    pub name: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

/// The five scalar channels a switch reports per measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
pub enum MetricType {
    #[serde(rename = "bandwidth_mbps")]
    Bandwidth,
    #[serde(rename = "latency_ms")]
    Latency,
    #[serde(rename = "packet_errors")]
    PacketErrors,
    #[serde(rename = "utilization_pct")]
    Utilization,
    #[serde(rename = "temperature_c")]
    Temperature,
}

impl MetricType {
    pub const ALL: [MetricType; 5] = [
        MetricType::Bandwidth,
        MetricType::Latency,
        MetricType::PacketErrors,
        MetricType::Utilization,
        MetricType::Temperature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Bandwidth => "bandwidth_mbps",
            MetricType::Latency => "latency_ms",
            MetricType::PacketErrors => "packet_errors",
            MetricType::Utilization => "utilization_pct",
            MetricType::Temperature => "temperature_c",
        }
    }
}

impl FromStr for MetricType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bandwidth_mbps" => Ok(MetricType::Bandwidth),
            "latency_ms" => Ok(MetricType::Latency),
            "packet_errors" => Ok(MetricType::PacketErrors),
            "utilization_pct" => Ok(MetricType::Utilization),
            "temperature_c" => Ok(MetricType::Temperature),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric scalar. Packet errors are integral, everything else is a float.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, utoipa::ToSchema)]
#[serde(untagged)]
pub enum MetricValue {
    Count(i64),
    Float(f64),
}

impl From<MetricValue> for serde_json::Value {
    fn from(value: MetricValue) -> Self {
        match value {
            MetricValue::Count(n) => serde_json::Value::from(n),
            MetricValue::Float(f) => serde_json::Value::from(f),
        }
    }
}

/// One complete measurement for one switch.
///
/// `created_at` is the ingest instant, stamped by the repository when the
/// row is written; records that have not been persisted carry `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow, utoipa::ToSchema)]
pub struct TelemetryRecord {
    pub switch_id: String,
    pub timestamp: DateTime<Utc>,
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    pub packet_errors: i64,
    pub utilization_pct: f64,
    pub temperature_c: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl TelemetryRecord {
    pub fn metric_value(&self, metric: MetricType) -> MetricValue {
        match metric {
            MetricType::Bandwidth => MetricValue::Float(self.bandwidth_mbps),
            MetricType::Latency => MetricValue::Float(self.latency_ms),
            MetricType::PacketErrors => MetricValue::Count(self.packet_errors),
            MetricType::Utilization => MetricValue::Float(self.utilization_pct),
            MetricType::Temperature => MetricValue::Float(self.temperature_c),
        }
    }

    pub fn metrics_map(&self) -> BTreeMap<String, MetricValue> {
        MetricType::ALL
            .iter()
            .map(|metric| (metric.as_str().to_string(), self.metric_value(*metric)))
            .collect()
    }
}

/// The cache's current view, materialized for a read. Never persisted.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub generation_id: String,
    pub switches: HashMap<String, TelemetryRecord>,
}

/// Standard response envelope for the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct MetricResponse {
    pub switch_id: String,
    pub metric_type: MetricType,
    pub value: MetricValue,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct MetricsListResponse {
    pub switch_id: String,
    pub metrics: BTreeMap<String, MetricValue>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct AllMetricsResponse {
    pub switches: Vec<MetricsListResponse>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Projection of the all-switches view onto a requested subset of metrics.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct FilteredMetricsResponse {
    pub metric_types: Vec<MetricType>,
    #[schema(value_type = Vec<Object>)]
    pub switches: Vec<serde_json::Value>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct SwitchListResponse {
    pub switches: Vec<Switch>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct MetricTypesResponse {
    pub metric_types: Vec<String>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Coarse operational snapshot served by `/telemetry/performance`.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct PerformanceMetrics {
    pub api_latency_ms: f64,
    pub active_switches: usize,
    pub total_requests: u64,
    pub memory_usage_mb: f64,
    pub data_age_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct HealthStatus {
    pub service: String,
    pub status: String,
    pub uptime: String,
    pub switch_count: usize,
    pub checks: BTreeMap<String, String>,
    pub performance: PerformanceMetrics,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}
