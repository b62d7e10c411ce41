use crate::config::AggregatorConfig;
use crate::service::TelemetryService;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AggregatorConfig>,
    pub service: Arc<TelemetryService>,
}
