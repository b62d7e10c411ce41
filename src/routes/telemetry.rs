use crate::error::TelemetryError;
use crate::models::{FilteredMetricsResponse, MetricType, MetricTypesResponse, SwitchListResponse};
use crate::routes::{respond_error, respond_ok};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::time::Instant;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/telemetry/metrics", get(list_all_metrics))
        .route("/telemetry/metrics/{switch_id}", get(list_switch_metrics))
        .route(
            "/telemetry/metrics/{switch_id}/{metric_type}",
            get(get_metric),
        )
        .route("/telemetry/performance", get(get_performance))
        .route("/telemetry/health", get(get_health))
        .route("/telemetry/switches", get(list_switches))
        .route("/telemetry/metric-types", get(list_metric_types))
}

fn with_response_time(mut response: Response, started: Instant) -> Response {
    let elapsed = format!("{:?}", started.elapsed());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response.headers_mut().insert("x-response-time", value);
    }
    response
}

#[utoipa::path(
    get,
    path = "/telemetry/metrics/{switch_id}/{metric_type}",
    tag = "telemetry",
    params(
        ("switch_id" = String, Path, description = "Switch identifier"),
        ("metric_type" = String, Path, description = "Metric type token")
    ),
    responses(
        (status = 200, description = "Metric value", body = crate::models::MetricResponse),
        (status = 404, description = "Switch not found"),
        (status = 400, description = "Invalid metric type")
    )
)]
pub(crate) async fn get_metric(
    State(state): State<AppState>,
    Path((switch_id, metric_type)): Path<(String, String)>,
) -> Response {
    let started = Instant::now();
    let response = match state.service.get_metric(&switch_id, &metric_type) {
        Ok(metric) => respond_ok(metric),
        Err(err @ TelemetryError::SwitchNotFound(_)) => {
            respond_error(StatusCode::NOT_FOUND, format!("metric not found: {err}"))
        }
        Err(err) => respond_error(err.status_code(), err.to_string()),
    };
    with_response_time(response, started)
}

#[utoipa::path(
    get,
    path = "/telemetry/metrics/{switch_id}",
    tag = "telemetry",
    params(("switch_id" = String, Path, description = "Switch identifier")),
    responses(
        (status = 200, description = "All metrics for one switch", body = crate::models::MetricsListResponse),
        (status = 404, description = "Switch not found")
    )
)]
pub(crate) async fn list_switch_metrics(
    State(state): State<AppState>,
    Path(switch_id): Path<String>,
) -> Response {
    let started = Instant::now();
    let response = match state.service.get_switch_metrics(&switch_id) {
        Ok(metrics) => respond_ok(metrics),
        Err(err @ TelemetryError::SwitchNotFound(_)) => respond_error(
            StatusCode::NOT_FOUND,
            format!("switch metrics not found: {err}"),
        ),
        Err(err) => respond_error(err.status_code(), err.to_string()),
    };
    with_response_time(response, started)
}

#[derive(Debug, Deserialize)]
pub(crate) struct MetricsQuery {
    metrics: Option<String>,
}

#[utoipa::path(
    get,
    path = "/telemetry/metrics",
    tag = "telemetry",
    params(("metrics" = Option<String>, Query, description = "Comma-separated metric type filter")),
    responses(
        (status = 200, description = "Metrics for all switches", body = crate::models::AllMetricsResponse),
        (status = 400, description = "Unknown metric type in filter")
    )
)]
pub(crate) async fn list_all_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let started = Instant::now();

    let response = match query.metrics.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(filter) => filtered_metrics(&state, filter),
        None => respond_ok(state.service.get_all_metrics()),
    };
    with_response_time(response, started)
}

fn filtered_metrics(state: &AppState, filter: &str) -> Response {
    let mut requested: Vec<MetricType> = Vec::new();
    for token in filter.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse::<MetricType>() {
            Ok(metric) => {
                if !requested.contains(&metric) {
                    requested.push(metric);
                }
            }
            Err(()) => {
                return respond_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid metric type: {token}"),
                );
            }
        }
    }
    if requested.is_empty() {
        return respond_error(StatusCode::BAD_REQUEST, "no valid metric types provided");
    }

    let all = state.service.get_all_metrics();
    let switches: Vec<serde_json::Value> = all
        .switches
        .into_iter()
        .map(|switch| {
            let mut entry = serde_json::Map::new();
            entry.insert("switch_id".to_string(), switch.switch_id.into());
            entry.insert(
                "timestamp".to_string(),
                serde_json::to_value(switch.timestamp).unwrap_or(serde_json::Value::Null),
            );
            for metric in &requested {
                if let Some(value) = switch.metrics.get(metric.as_str()) {
                    entry.insert(metric.as_str().to_string(), (*value).into());
                }
            }
            serde_json::Value::Object(entry)
        })
        .collect();

    respond_ok(FilteredMetricsResponse {
        metric_types: requested,
        count: switches.len(),
        switches,
        timestamp: Utc::now(),
    })
}

#[utoipa::path(
    get,
    path = "/telemetry/performance",
    tag = "telemetry",
    responses((status = 200, description = "Performance snapshot", body = crate::models::PerformanceMetrics))
)]
pub(crate) async fn get_performance(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let response = respond_ok(state.service.performance_metrics());
    with_response_time(response, started)
}

#[utoipa::path(
    get,
    path = "/telemetry/health",
    tag = "telemetry",
    responses(
        (status = 200, description = "Service healthy", body = crate::models::HealthStatus),
        (status = 503, description = "Service degraded", body = crate::models::HealthStatus)
    )
)]
pub(crate) async fn get_health(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let health = state.service.health_status().await;
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    with_response_time((status, Json(health)).into_response(), started)
}

#[utoipa::path(
    get,
    path = "/telemetry/switches",
    tag = "telemetry",
    responses((status = 200, description = "Known switches", body = crate::models::SwitchListResponse))
)]
pub(crate) async fn list_switches(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let response = match state.service.switches().await {
        Ok(switches) => respond_ok(SwitchListResponse {
            count: switches.len(),
            switches,
            timestamp: Utc::now(),
        }),
        Err(err) => {
            tracing::error!(error = %err, "failed to list switches");
            respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to retrieve switches",
            )
        }
    };
    with_response_time(response, started)
}

#[utoipa::path(
    get,
    path = "/telemetry/metric-types",
    tag = "telemetry",
    responses((status = 200, description = "Supported metric types", body = crate::models::MetricTypesResponse))
)]
pub(crate) async fn list_metric_types() -> Response {
    let metric_types: Vec<String> = MetricType::ALL
        .iter()
        .map(|metric| metric.as_str().to_string())
        .collect();
    respond_ok(MetricTypesResponse {
        count: metric_types.len(),
        metric_types,
        timestamp: Utc::now(),
    })
}
