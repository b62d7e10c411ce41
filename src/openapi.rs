use crate::models;
use crate::routes;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "fabric-aggregator",
        description = "Fabric telemetry aggregation and query surface"
    ),
    paths(
        routes::health::healthz_handler,
        routes::telemetry::get_metric,
        routes::telemetry::list_switch_metrics,
        routes::telemetry::list_all_metrics,
        routes::telemetry::get_performance,
        routes::telemetry::get_health,
        routes::telemetry::list_switches,
        routes::telemetry::list_metric_types,
    ),
    components(schemas(
        models::Switch,
        models::MetricType,
        models::MetricValue,
        models::TelemetryRecord,
        models::MetricResponse,
        models::MetricsListResponse,
        models::AllMetricsResponse,
        models::FilteredMetricsResponse,
        models::SwitchListResponse,
        models::MetricTypesResponse,
        models::PerformanceMetrics,
        models::HealthStatus,
        routes::health::HealthResponse,
    )),
    tags((name = "telemetry", description = "Switch counter queries"))
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_route() {
        let doc = openapi_json();
        let paths = doc["paths"].as_object().unwrap();
        for path in [
            "/healthz",
            "/telemetry/metrics",
            "/telemetry/metrics/{switch_id}",
            "/telemetry/metrics/{switch_id}/{metric_type}",
            "/telemetry/performance",
            "/telemetry/health",
            "/telemetry/switches",
            "/telemetry/metric-types",
        ] {
            assert!(paths.contains_key(path), "missing {path}");
        }
    }
}
