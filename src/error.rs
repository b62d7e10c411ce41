use crate::repository::RepoError;
use axum::http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the telemetry service. Handlers map these onto the
/// response envelope; messages stay short and never carry internals.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("switch id cannot be empty")]
    EmptySwitchId,

    #[error("invalid metric type: {0}")]
    InvalidMetricType(String),

    #[error("switch {0} not found")]
    SwitchNotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("telemetry store already started")]
    AlreadyStarted,

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("storage error: {0}")]
    Storage(#[from] RepoError),
}

impl TelemetryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TelemetryError::EmptySwitchId
            | TelemetryError::InvalidMetricType(_)
            | TelemetryError::Validation(_) => StatusCode::BAD_REQUEST,
            TelemetryError::SwitchNotFound(_) => StatusCode::NOT_FOUND,
            TelemetryError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            TelemetryError::AlreadyStarted => StatusCode::INTERNAL_SERVER_ERROR,
            TelemetryError::Storage(RepoError::NotFound(_)) => StatusCode::NOT_FOUND,
            TelemetryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            TelemetryError::EmptySwitchId.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TelemetryError::InvalidMetricType("nope".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TelemetryError::SwitchNotFound("sw-01".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TelemetryError::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TelemetryError::Storage(RepoError::Transient("lost connection".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
