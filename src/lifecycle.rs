use crate::client::GeneratorClient;
use crate::service::TelemetryService;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on the whole shutdown sequence, ingest stop through HTTP
/// drain.
const GLOBAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling for the service/store drain step.
const SERVICE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Orders teardown so that in-flight data is not lost while new ingress is
/// refused: stop the poller first, drain the store, then release the HTTP
/// surface. The repository pool is closed by the caller once the server
/// future has returned.
pub struct ShutdownController {
    client: Option<Arc<GeneratorClient>>,
    service: Arc<TelemetryService>,
    http_cancel: CancellationToken,
}

impl ShutdownController {
    pub fn new(
        client: Option<Arc<GeneratorClient>>,
        service: Arc<TelemetryService>,
        http_cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            service,
            http_cancel,
        }
    }

    /// Waits for a termination signal, then runs the ordered shutdown.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            wait_for_signal().await;

            // Failsafe: the process must not outlive the global deadline
            // even if a drain step wedges.
            tokio::spawn(async {
                tokio::time::sleep(GLOBAL_SHUTDOWN_TIMEOUT).await;
                tracing::warn!("global shutdown deadline exceeded, exiting");
                std::process::exit(0);
            });

            self.run().await;
        })
    }

    async fn run(self) {
        tracing::info!(
            timeout_s = GLOBAL_SHUTDOWN_TIMEOUT.as_secs(),
            "shutdown signal received, starting graceful shutdown"
        );

        // Step 1: no new batches may arrive at the service during drain.
        if let Some(client) = &self.client {
            client.stop().await;
        }

        // Step 2: drain accepted work into the repository.
        let stopped = tokio::time::timeout(SERVICE_STOP_TIMEOUT, self.service.stop()).await;
        if stopped.is_err() {
            tracing::warn!(
                timeout_s = SERVICE_STOP_TIMEOUT.as_secs(),
                "telemetry service stop exceeded its deadline"
            );
        }

        // Step 3: release the HTTP surface; axum finishes in-flight
        // requests before the server future returns.
        self.http_cancel.cancel();
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for terminate signal");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{started_service, MemoryRepository};

    #[tokio::test]
    async fn run_stops_service_and_releases_http() {
        let (service, repo) = started_service(Arc::new(MemoryRepository::new())).await;
        service
            .ingest_one(crate::models::TelemetryRecord {
                switch_id: "sw-01".to_string(),
                timestamp: chrono::Utc::now(),
                bandwidth_mbps: 1.0,
                latency_ms: 1.0,
                packet_errors: 0,
                utilization_pct: 50.0,
                temperature_c: 40.0,
                created_at: None,
            })
            .unwrap();

        let http_cancel = CancellationToken::new();
        let controller = ShutdownController::new(None, service.clone(), http_cancel.clone());
        controller.run().await;

        assert!(http_cancel.is_cancelled());
        // Accepted records were drained into the repository before the HTTP
        // surface was released.
        assert_eq!(repo.record_count(), 1);
        assert!(service.ingest_one(crate::models::TelemetryRecord {
            switch_id: "sw-02".to_string(),
            timestamp: chrono::Utc::now(),
            bandwidth_mbps: 1.0,
            latency_ms: 1.0,
            packet_errors: 0,
            utilization_pct: 50.0,
            temperature_c: 40.0,
            created_at: None,
        })
        .is_err());
    }
}
