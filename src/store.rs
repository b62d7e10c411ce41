use crate::cache::{CacheStats, MetricsCache};
use crate::error::TelemetryError;
use crate::models::{PerformanceMetrics, Snapshot, Switch, TelemetryRecord};
use crate::pipeline::{self, FlushQueue, FlushStats, RetryPolicy};
use crate::repository::{MetricsRepository, RepoError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{get_current_pid, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ceiling for waiting on background workers during stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub cache_ttl: Duration,
    pub max_retries: u32,
    pub queue_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            batch_size: 100,
            cache_ttl: Duration::from_secs(300),
            max_retries: 3,
            queue_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// Hybrid storage: an in-memory latest-value cache in front of a durable
/// repository, decoupled by the bounded flush queue.
///
/// Writes land in the cache first so readers see fresh data immediately; the
/// repository catches up asynchronously. Durability is therefore best-effort
/// for the most recent rows, by design.
pub struct HybridStore {
    cache: MetricsCache,
    repository: Arc<dyn MetricsRepository>,
    queue: FlushQueue,
    flush_rx: Mutex<Option<mpsc::Receiver<Vec<TelemetryRecord>>>>,
    stats: Arc<FlushStats>,
    config: StoreConfig,
    cancel: CancellationToken,
    state: Mutex<StoreState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    total_requests: AtomicU64,
    started_at: DateTime<Utc>,
}

impl HybridStore {
    pub fn new(repository: Arc<dyn MetricsRepository>, config: StoreConfig) -> Self {
        let stats = Arc::new(FlushStats::new());
        let (queue, rx) = FlushQueue::new(config.queue_capacity, stats.clone());
        Self {
            cache: MetricsCache::new(),
            repository,
            queue,
            flush_rx: Mutex::new(Some(rx)),
            stats,
            config,
            cancel: CancellationToken::new(),
            state: Mutex::new(StoreState::Created),
            workers: Mutex::new(Vec::new()),
            total_requests: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), TelemetryError> {
        {
            let mut state = self.state.lock();
            if *state != StoreState::Created {
                return Err(TelemetryError::AlreadyStarted);
            }
            *state = StoreState::Started;
        }

        let rx = self
            .flush_rx
            .lock()
            .take()
            .ok_or(TelemetryError::AlreadyStarted)?;

        if let Err(err) = self.warm_cache().await {
            tracing::warn!(error = %err, "failed to warm cache from repository");
        }

        let writer = pipeline::spawn_writer(
            self.repository.clone(),
            rx,
            self.stats.clone(),
            self.config.batch_size,
            RetryPolicy {
                max_retries: self.config.max_retries,
                backoff: pipeline::RETRY_BACKOFF,
            },
            self.cancel.child_token(),
        );

        let cleanup = {
            let store = Arc::clone(self);
            let ttl = self.config.cache_ttl;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ttl);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = store.cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let removed = store.cache.cleanup_stale(ttl);
                            if removed > 0 {
                                tracing::debug!(removed, "evicted stale cache entries");
                            }
                        }
                    }
                }
            })
        };

        let reporter = {
            let store = Arc::clone(self);
            let interval = self.config.flush_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = store.cancel.cancelled() => break,
                        _ = ticker.tick() => store.report_performance(),
                    }
                }
            })
        };

        self.workers.lock().extend([writer, cleanup, reporter]);
        tracing::info!(
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            cache_ttl_ms = self.config.cache_ttl.as_millis() as u64,
            "hybrid telemetry store started"
        );
        Ok(())
    }

    /// Idempotent. Switches the writer into bounded-drain mode and waits for
    /// the background workers to wind down.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                StoreState::Created => {
                    *state = StoreState::Stopped;
                    return;
                }
                StoreState::Started => *state = StoreState::Stopping,
                StoreState::Stopping | StoreState::Stopped => return,
            }
        }

        tracing::info!("stopping hybrid telemetry store");
        self.cancel.cancel();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let shutdown = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(STOP_TIMEOUT, shutdown).await.is_err() {
            tracing::warn!(
                timeout_ms = STOP_TIMEOUT.as_millis() as u64,
                "hybrid store workers did not stop in time"
            );
        }

        *self.state.lock() = StoreState::Stopped;
        tracing::info!("hybrid telemetry store stopped");
    }

    fn is_started(&self) -> bool {
        *self.state.lock() == StoreState::Started
    }

    /// Loads the latest persisted record per known switch into the cache so
    /// reads are warm immediately after a restart.
    async fn warm_cache(&self) -> Result<(), RepoError> {
        let switches = self.repository.list_switches().await?;
        let mut loaded = 0usize;
        for switch in &switches {
            match self.repository.latest_for(&switch.id).await {
                Ok(record) => {
                    if self.cache.update_one(record).is_ok() {
                        loaded += 1;
                    }
                }
                Err(RepoError::NotFound(_)) => {}
                Err(err) => {
                    tracing::warn!(switch = %switch.id, error = %err, "failed to load latest metrics");
                }
            }
        }
        if loaded > 0 {
            tracing::info!(loaded, "warmed cache from repository");
        }
        Ok(())
    }

    /// Stores a single record: cache first, then the flush queue.
    pub fn store_one(&self, record: TelemetryRecord) -> Result<(), TelemetryError> {
        if !self.is_started() {
            return Err(TelemetryError::ShuttingDown);
        }
        self.cache.update_one(record.clone())?;
        self.queue.enqueue(vec![record]);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Batch ingest path: the cache receives the latest record per switch id
    /// (by arrival order within the batch); the entire batch is queued for
    /// historical persistence.
    pub fn store_bulk(&self, records: Vec<TelemetryRecord>) -> Result<(), TelemetryError> {
        if !self.is_started() {
            return Err(TelemetryError::ShuttingDown);
        }
        if records.is_empty() {
            return Ok(());
        }

        let mut latest: HashMap<String, TelemetryRecord> = HashMap::new();
        for record in &records {
            latest.insert(record.switch_id.clone(), record.clone());
        }
        self.cache.update_batch(latest.into_values());

        self.queue.enqueue(records);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn get_record(&self, switch_id: &str) -> Option<TelemetryRecord> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.cache.get_all(switch_id)
    }

    pub fn list_all(&self) -> HashMap<String, TelemetryRecord> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.cache.list_all()
    }

    pub fn last_update(&self, switch_id: &str) -> Option<DateTime<Utc>> {
        self.cache.last_update(switch_id)
    }

    pub fn switch_count(&self) -> usize {
        self.cache.switch_count()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.cache.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn upsert_switch(&self, switch: &Switch) -> Result<(), RepoError> {
        self.repository.upsert_switch(switch).await
    }

    pub async fn switches(&self) -> Result<Vec<Switch>, RepoError> {
        self.repository.list_switches().await
    }

    pub async fn health_probe(&self) -> Result<(), RepoError> {
        self.repository.health_probe().await
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let switches = self.cache.list_all();
        let now = Utc::now();
        let data_age_seconds = if switches.is_empty() {
            0.0
        } else {
            let total: f64 = switches
                .values()
                .map(|record| (now - record.timestamp).num_milliseconds() as f64 / 1000.0)
                .sum();
            total / switches.len() as f64
        };

        PerformanceMetrics {
            // Reads are served from the in-process cache; sub-millisecond.
            api_latency_ms: 0.5,
            active_switches: switches.len(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            memory_usage_mb: process_memory_mb(),
            data_age_seconds,
            last_update: self.stats.last_flush(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn report_performance(&self) {
        let perf = self.performance_metrics();
        tracing::info!(
            active_switches = perf.active_switches,
            total_requests = perf.total_requests,
            memory_mb = perf.memory_usage_mb,
            data_age_seconds = perf.data_age_seconds,
            pending_items = self.stats.pending_items.load(Ordering::Relaxed),
            dropped_batches = self.stats.dropped_batches.load(Ordering::Relaxed),
            db_writes = self.stats.total_db_writes.load(Ordering::Relaxed),
            db_write_errors = self.stats.total_db_write_errors.load(Ordering::Relaxed),
            "telemetry performance report"
        );
    }
}

fn process_memory_mb() -> f64 {
    let Ok(pid) = get_current_pid() else {
        return 0.0;
    };
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| process.memory() as f64 / 1024.0 / 1024.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryRepository;
    use std::time::Instant;

    fn record(switch_id: &str, bandwidth: f64) -> TelemetryRecord {
        TelemetryRecord {
            switch_id: switch_id.to_string(),
            timestamp: Utc::now(),
            bandwidth_mbps: bandwidth,
            latency_ms: 1.0,
            packet_errors: 0,
            utilization_pct: 50.0,
            temperature_c: 40.0,
            created_at: None,
        }
    }

    fn test_config() -> StoreConfig {
        StoreConfig {
            flush_interval: Duration::from_millis(50),
            batch_size: 100,
            cache_ttl: Duration::from_secs(60),
            max_retries: 3,
            queue_capacity: 16,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn start_is_exclusive_and_stop_is_idempotent() {
        let repo = Arc::new(MemoryRepository::new());
        let store = Arc::new(HybridStore::new(repo, test_config()));

        store.start().await.unwrap();
        assert!(matches!(
            store.start().await,
            Err(TelemetryError::AlreadyStarted)
        ));

        store.stop().await;
        store.stop().await;

        assert!(matches!(
            store.store_bulk(vec![record("sw-01", 1.0)]),
            Err(TelemetryError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn bulk_store_keeps_latest_per_switch_and_queues_all_rows() {
        let repo = Arc::new(MemoryRepository::new());
        let store = Arc::new(HybridStore::new(repo.clone(), test_config()));
        store.start().await.unwrap();

        store
            .store_bulk(vec![
                record("sw-01", 1.0),
                record("sw-01", 2.0),
                record("sw-02", 3.0),
            ])
            .unwrap();

        // Later record in the batch wins in the cache.
        assert_eq!(store.get_record("sw-01").unwrap().bandwidth_mbps, 2.0);
        assert_eq!(store.switch_count(), 2);

        // The repository receives every row.
        let repo_check = repo.clone();
        wait_until(move || repo_check.record_count() == 3).await;

        store.stop().await;
    }

    #[tokio::test]
    async fn records_accepted_before_stop_are_drained() {
        let repo = Arc::new(MemoryRepository::new());
        let mut config = test_config();
        // Long flush interval so the drain, not the steady-state writer,
        // must pick the batches up.
        config.flush_interval = Duration::from_secs(60);
        let store = Arc::new(HybridStore::new(repo.clone(), config));
        store.start().await.unwrap();

        for i in 0..5 {
            store.store_one(record("sw-01", i as f64)).unwrap();
        }
        store.stop().await;

        assert_eq!(repo.record_count(), 5);
    }

    #[tokio::test]
    async fn warm_start_loads_latest_rows_into_cache() {
        let repo = Arc::new(MemoryRepository::new());
        repo.seed_switch(Switch {
            id: "sw-01".to_string(),
            name: "sw-01".to_string(),
            location: "data center".to_string(),
            created_at: Utc::now(),
        });
        repo.seed_records(vec![record("sw-01", 7.0)]);

        let store = Arc::new(HybridStore::new(repo, test_config()));
        store.start().await.unwrap();

        assert_eq!(store.get_record("sw-01").unwrap().bandwidth_mbps, 7.0);
        store.stop().await;
    }

    #[tokio::test]
    async fn performance_metrics_reflect_cache_contents() {
        let repo = Arc::new(MemoryRepository::new());
        let store = Arc::new(HybridStore::new(repo, test_config()));
        store.start().await.unwrap();

        store.store_bulk(vec![record("sw-01", 1.0)]).unwrap();
        let perf = store.performance_metrics();
        assert_eq!(perf.active_switches, 1);
        assert!(perf.total_requests >= 1);
        assert!(perf.data_age_seconds >= 0.0);

        assert!(store.last_update("sw-01").is_some());
        assert_eq!(store.snapshot().switches.len(), 1);
        assert_eq!(store.cache_stats().switch_count, 1);

        store.stop().await;
    }
}
