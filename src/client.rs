use crate::models::{Switch, TelemetryRecord};
use crate::service::TelemetryService;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Bounded wait for the in-flight poll when stopping.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

const EXPECTED_COLUMNS: usize = 7;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub generator_url: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub startup_delay: Duration,
    pub readiness_check: bool,
}

#[derive(Debug, Default)]
struct ClientStats {
    total_polls: AtomicU64,
    successful_polls: AtomicU64,
    duplicate_skips: AtomicU64,
    errors: AtomicU64,
    row_errors: AtomicU64,
    last_poll_unix_ms: AtomicU64,
}

#[derive(Debug, Default, Clone)]
struct DedupState {
    last_generation_id: Option<String>,
    last_data_timestamp: Option<DateTime<Utc>>,
}

/// Polls the upstream generator for CSV counter snapshots and feeds them to
/// the telemetry service.
///
/// Deduplication prefers the upstream `X-Generation-ID`; when the upstream
/// does not provide one, the data timestamp (header, else first CSV row) is
/// compared instead and must be strictly newer. Operators diagnosing
/// duplicate ingest should check which of the two keys the upstream emits.
pub struct GeneratorClient {
    settings: ClientSettings,
    http: reqwest::Client,
    service: Arc<TelemetryService>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    dedup: Mutex<DedupState>,
    stats: ClientStats,
}

impl GeneratorClient {
    pub fn new(settings: ClientSettings, service: Arc<TelemetryService>) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(5))
            .build()
            .context("failed to build generator http client")?;

        Ok(Arc::new(Self {
            settings,
            http,
            service,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            dedup: Mutex::new(DedupState::default()),
            stats: ClientStats::default(),
        }))
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            anyhow::bail!("generator client already running");
        }

        let client = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { client.run_loop().await }));
        tracing::info!(
            url = %self.settings.generator_url,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "generator client started"
        );
        Ok(())
    }

    /// Stops fetching: cancels the loop (aborting any in-flight request) and
    /// waits briefly for the worker to return.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };

        if tokio::time::timeout(STOP_TIMEOUT, worker).await.is_err() {
            tracing::warn!("generator client stop timed out, abandoning worker");
        } else {
            tracing::info!("generator client stopped");
        }
    }

    async fn run_loop(self: Arc<Self>) {
        if !self.settings.startup_delay.is_zero() {
            tracing::info!(
                delay_ms = self.settings.startup_delay.as_millis() as u64,
                "delaying first generator poll"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.settings.startup_delay) => {}
            }
        }

        if self.settings.readiness_check {
            match self.check_readiness().await {
                Ok(()) => tracing::info!("generator readiness check passed"),
                Err(err) => tracing::warn!(error = %err, "generator readiness check failed"),
            }
        }

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick completes immediately, so each iteration is one
        // full synchronous poll before the next tick is considered.
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
    }

    async fn check_readiness(&self) -> Result<()> {
        let url = format!("{}/health", self.settings.generator_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("generator health request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("generator health returned status {}", response.status());
        }
        Ok(())
    }

    async fn poll_once(&self) {
        self.stats.total_polls.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_poll_unix_ms
            .store(Utc::now().timestamp_millis().max(0) as u64, Ordering::Relaxed);

        let url = format!("{}/counters", self.settings.generator_url);
        let response = match self.http.get(&url).header("Accept", "text/csv").send().await {
            Ok(response) => response,
            Err(err) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "generator fetch failed");
                return;
            }
        };

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            tracing::debug!("generator not ready, skipping poll");
            return;
        }
        if !response.status().is_success() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(status = %response.status(), "generator returned unexpected status");
            return;
        }

        let generation_id = header_string(&response, "X-Generation-ID");
        let header_timestamp =
            header_string(&response, "X-Data-Timestamp").and_then(|raw| parse_timestamp(&raw));
        if let Some(count) = header_string(&response, "X-Switch-Count") {
            tracing::debug!(switch_count = %count, "generator snapshot header");
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "failed to read generator response body");
                return;
            }
        };

        let data_timestamp = header_timestamp.or_else(|| first_row_timestamp(&body));

        if self.is_duplicate(generation_id.as_deref(), data_timestamp) {
            self.stats.duplicate_skips.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                generation_id = generation_id.as_deref().unwrap_or(""),
                "skipping duplicate generator snapshot"
            );
            return;
        }

        let records = self.parse_csv(&body);
        if records.is_empty() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("generator snapshot contained no usable rows");
            return;
        }

        self.register_switches(&records).await;

        match self.service.ingest_batch(records) {
            Ok(stored) => {
                {
                    let mut dedup = self.dedup.lock();
                    dedup.last_generation_id = generation_id.clone();
                    if data_timestamp.is_some() {
                        dedup.last_data_timestamp = data_timestamp;
                    }
                }
                self.stats.successful_polls.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    records = stored,
                    generation_id = generation_id.as_deref().unwrap_or(""),
                    "ingested telemetry snapshot"
                );
            }
            Err(err) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "failed to ingest telemetry snapshot");
            }
        }
    }

    fn is_duplicate(
        &self,
        generation_id: Option<&str>,
        data_timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        let dedup = self.dedup.lock();
        match generation_id {
            Some(generation_id) if !generation_id.is_empty() => {
                dedup.last_generation_id.as_deref() == Some(generation_id)
            }
            _ => match (data_timestamp, dedup.last_data_timestamp) {
                (Some(timestamp), Some(last)) => timestamp <= last,
                _ => false,
            },
        }
    }

    fn parse_csv(&self, body: &str) -> Vec<TelemetryRecord> {
        let mut records = Vec::new();
        // First line is the column header.
        for (index, line) in body.lines().enumerate().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_row(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    self.stats.row_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(row = index + 1, error = %err, "skipping malformed CSV row");
                }
            }
        }
        records
    }

    async fn register_switches(&self, records: &[TelemetryRecord]) {
        let mut seen = HashSet::new();
        for record in records {
            if record.switch_id.is_empty() || !seen.insert(record.switch_id.as_str()) {
                continue;
            }
            let switch = Switch {
                id: record.switch_id.clone(),
                name: record.switch_id.clone(),
                location: "data center".to_string(),
                created_at: Utc::now(),
            };
            if let Err(err) = self.service.register_switch(switch).await {
                tracing::warn!(switch = %record.switch_id, error = %err, "failed to register switch");
            }
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        let total = self.stats.total_polls.load(Ordering::Relaxed);
        let successful = self.stats.successful_polls.load(Ordering::Relaxed);
        let duplicates = self.stats.duplicate_skips.load(Ordering::Relaxed);
        let rate = |count: u64| {
            if total > 0 {
                count as f64 / total as f64 * 100.0
            } else {
                0.0
            }
        };
        let dedup = self.dedup.lock().clone();

        serde_json::json!({
            "total_polls": total,
            "successful_polls": successful,
            "duplicate_skips": duplicates,
            "errors": self.stats.errors.load(Ordering::Relaxed),
            "row_errors": self.stats.row_errors.load(Ordering::Relaxed),
            "success_rate": format!("{:.2}%", rate(successful)),
            "duplicate_rate": format!("{:.2}%", rate(duplicates)),
            "last_poll_unix_ms": self.stats.last_poll_unix_ms.load(Ordering::Relaxed),
            "last_generation_id": dedup.last_generation_id,
            "last_data_timestamp": dedup.last_data_timestamp,
            "poll_interval_ms": self.settings.poll_interval.as_millis() as u64,
        })
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

fn first_row_timestamp(body: &str) -> Option<DateTime<Utc>> {
    let row = body.lines().nth(1)?;
    let field = row.split(',').nth(1)?;
    parse_timestamp(field.trim())
}

/// Columns: switch_id, timestamp, bandwidth_mbps, latency_ms,
/// packet_errors, utilization_pct, temperature_c.
fn parse_row(line: &str) -> Result<TelemetryRecord> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < EXPECTED_COLUMNS {
        anyhow::bail!("insufficient columns ({})", fields.len());
    }

    let timestamp = parse_timestamp(fields[1]).context("invalid timestamp")?;
    let bandwidth_mbps: f64 = fields[2].parse().context("invalid bandwidth")?;
    let latency_ms: f64 = fields[3].parse().context("invalid latency")?;
    let packet_errors: i64 = fields[4].parse().context("invalid packet errors")?;
    let utilization_pct: f64 = fields[5].parse().context("invalid utilization")?;
    let temperature_c: f64 = fields[6].parse().context("invalid temperature")?;

    Ok(TelemetryRecord {
        switch_id: fields[0].to_string(),
        timestamp,
        bandwidth_mbps,
        latency_ms,
        packet_errors,
        utilization_pct,
        temperature_c,
        created_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{started_service, MemoryRepository};
    use axum::http::header::HeaderMap;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    const CSV_BODY: &str = "switch_id,timestamp,bandwidth_mbps,latency_ms,packet_errors,utilization_pct,temperature_c\n\
        sw-01,2025-01-01T00:00:00.000000000Z,100.0,1.0,0,50.0,40.0\n\
        sw-02,2025-01-01T00:00:00.000000000Z,200.0,2.0,1,60.0,41.0\n";

    #[derive(Clone)]
    struct Upstream {
        generation_id: &'static str,
        body: &'static str,
        hits: Arc<AtomicUsize>,
    }

    async fn spawn_upstream(upstream: Upstream) -> SocketAddr {
        let app = Router::new().route(
            "/counters",
            get(move || {
                let upstream = upstream.clone();
                async move {
                    upstream.hits.fetch_add(1, Ordering::Relaxed);
                    let mut headers = HeaderMap::new();
                    headers.insert("X-Generation-ID", upstream.generation_id.parse().unwrap());
                    headers.insert("X-Switch-Count", "2".parse().unwrap());
                    (headers, upstream.body.to_string())
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    fn settings(addr: SocketAddr) -> ClientSettings {
        ClientSettings {
            generator_url: format!("http://{addr}"),
            poll_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(1),
            startup_delay: Duration::ZERO,
            readiness_check: false,
        }
    }

    async fn test_client(addr: SocketAddr) -> Arc<GeneratorClient> {
        let (service, _repo) = started_service(Arc::new(MemoryRepository::new())).await;
        GeneratorClient::new(settings(addr), service).unwrap()
    }

    #[tokio::test]
    async fn repeated_generation_id_is_ingested_once() {
        let addr = spawn_upstream(Upstream {
            generation_id: "gen_42",
            body: CSV_BODY,
            hits: Arc::new(AtomicUsize::new(0)),
        })
        .await;
        let client = test_client(addr).await;

        client.poll_once().await;
        client.poll_once().await;

        let stats = client.stats();
        assert_eq!(stats["successful_polls"], 1);
        assert_eq!(stats["duplicate_skips"], 1);
        assert_eq!(stats["last_generation_id"], "gen_42");
        assert_eq!(client.service.get_all_metrics().count, 2);
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped_and_counted() {
        let addr = spawn_upstream(Upstream {
            generation_id: "gen_1",
            body: "switch_id,timestamp,bandwidth_mbps,latency_ms,packet_errors,utilization_pct,temperature_c\n\
                sw-01,2025-01-01T00:00:00Z,100.0,1.0,0,50.0\n\
                sw-02,2025-01-01T00:00:00Z,200.0,2.0,1,60.0,41.0\n\
                sw-03,not-a-timestamp,1.0,1.0,1,1.0,1.0\n",
            hits: Arc::new(AtomicUsize::new(0)),
        })
        .await;
        let client = test_client(addr).await;

        client.poll_once().await;

        let stats = client.stats();
        assert_eq!(stats["row_errors"], 2);
        assert_eq!(stats["successful_polls"], 1);
        assert_eq!(client.service.get_all_metrics().count, 1);
        assert!(client.service.get_switch_metrics("sw-02").is_ok());
    }

    #[tokio::test]
    async fn switches_are_registered_from_snapshot() {
        let addr = spawn_upstream(Upstream {
            generation_id: "gen_7",
            body: CSV_BODY,
            hits: Arc::new(AtomicUsize::new(0)),
        })
        .await;
        let client = test_client(addr).await;

        client.poll_once().await;

        let switches = client.service.switches().await.unwrap();
        assert_eq!(switches.len(), 2);
        assert!(switches.iter().all(|s| s.location == "data center"));
    }

    #[tokio::test]
    async fn transport_errors_count_and_skip_the_tick() {
        // Nothing is listening on this address.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = test_client(addr).await;
        client.poll_once().await;

        let stats = client.stats();
        assert_eq!(stats["errors"], 1);
        assert_eq!(stats["successful_polls"], 0);
        assert_eq!(client.service.get_all_metrics().count, 0);
    }

    #[tokio::test]
    async fn not_ready_upstream_is_not_an_error() {
        let app = Router::new().route(
            "/counters",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "warming up") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let client = test_client(addr).await;
        client.poll_once().await;

        let stats = client.stats();
        assert_eq!(stats["errors"], 0);
        assert_eq!(stats["total_polls"], 1);
        assert_eq!(stats["successful_polls"], 0);
    }

    #[tokio::test]
    async fn timestamp_dedup_applies_without_generation_id() {
        let app = Router::new().route("/counters", get(|| async { CSV_BODY }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let client = test_client(addr).await;
        client.poll_once().await;
        client.poll_once().await;

        let stats = client.stats();
        assert_eq!(stats["successful_polls"], 1);
        assert_eq!(stats["duplicate_skips"], 1);
    }

    #[tokio::test]
    async fn polling_loop_runs_and_stop_halts_fetching() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_upstream(Upstream {
            generation_id: "gen_loop",
            body: CSV_BODY,
            hits: hits.clone(),
        })
        .await;
        let client = test_client(addr).await;

        client.start().unwrap();
        assert!(client.start().is_err());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::Relaxed) < 2 {
            assert!(std::time::Instant::now() < deadline, "loop never polled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        client.stop().await;
        // Let any request that was already in flight settle before sampling.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_stop = hits.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::Relaxed), after_stop);
    }
}
