//! In-memory collaborators for exercising the pipeline without Postgres.

use crate::config::{AggregatorConfig, IngestionConfig, StorageConfig};
use crate::models::{Switch, TelemetryRecord};
use crate::repository::{MetricsRepository, RepoError};
use crate::service::TelemetryService;
use crate::state::AppState;
use crate::store::{HybridStore, StoreConfig};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// `MetricsRepository` backed by vectors, with injectable failures for the
/// writer's retry paths.
#[derive(Default)]
pub struct MemoryRepository {
    switches: Mutex<Vec<Switch>>,
    records: Mutex<Vec<TelemetryRecord>>,
    bulk_attempts: AtomicU64,
    transient_failures: AtomicU64,
    fatal_failures: Mutex<bool>,
    probe_failures: AtomicU64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` bulk inserts fail with a retryable error.
    pub fn fail_transient(&self, count: u64) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// All bulk inserts fail with a non-retryable error while set.
    pub fn fail_fatal(&self, enabled: bool) {
        *self.fatal_failures.lock() = enabled;
    }

    /// The next `count` health probes fail.
    pub fn fail_probe(&self, count: u64) {
        self.probe_failures.store(count, Ordering::SeqCst);
    }

    pub fn bulk_attempts(&self) -> u64 {
        self.bulk_attempts.load(Ordering::SeqCst)
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().clone()
    }

    pub fn seed_switch(&self, switch: Switch) {
        self.switches.lock().push(switch);
    }

    pub fn seed_records(&self, records: Vec<TelemetryRecord>) {
        let now = Utc::now();
        let mut stored = self.records.lock();
        for mut record in records {
            record.created_at.get_or_insert(now);
            stored.push(record);
        }
    }

    fn take_injected_failure(&self) -> Option<RepoError> {
        if *self.fatal_failures.lock() {
            return Some(RepoError::Fatal("injected fatal failure".to_string()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Some(RepoError::Transient("injected transient failure".to_string()));
        }
        None
    }
}

#[async_trait]
impl MetricsRepository for MemoryRepository {
    async fn upsert_switch(&self, switch: &Switch) -> Result<(), RepoError> {
        let mut switches = self.switches.lock();
        if let Some(existing) = switches.iter_mut().find(|s| s.id == switch.id) {
            existing.name = switch.name.clone();
            existing.location = switch.location.clone();
        } else {
            switches.push(switch.clone());
        }
        Ok(())
    }

    async fn get_switch(&self, switch_id: &str) -> Result<Switch, RepoError> {
        self.switches
            .lock()
            .iter()
            .find(|s| s.id == switch_id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("switch {switch_id}")))
    }

    async fn list_switches(&self) -> Result<Vec<Switch>, RepoError> {
        let mut switches = self.switches.lock().clone();
        switches.sort_by_key(|s| s.created_at);
        Ok(switches)
    }

    async fn bulk_insert(&self, records: &[TelemetryRecord]) -> Result<(), RepoError> {
        self.bulk_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }

        let now = Utc::now();
        let mut stored = self.records.lock();
        for record in records {
            let mut record = record.clone();
            record.created_at.get_or_insert(now);
            stored.push(record);
        }
        Ok(())
    }

    async fn latest_for(&self, switch_id: &str) -> Result<TelemetryRecord, RepoError> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.switch_id == switch_id)
            .max_by_key(|record| record.timestamp)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("metrics for switch {switch_id}")))
    }

    async fn range_for(
        &self,
        switch_id: &str,
        from: chrono::DateTime<Utc>,
        to: chrono::DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, RepoError> {
        let mut records: Vec<TelemetryRecord> = self
            .records
            .lock()
            .iter()
            .filter(|record| {
                record.switch_id == switch_id
                    && record.timestamp >= from
                    && record.timestamp <= to
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(1000);
        Ok(records)
    }

    async fn delete_older_than(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64, RepoError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|record| record.created_at.map(|c| c >= cutoff).unwrap_or(true));
        Ok((before - records.len()) as u64)
    }

    async fn count(&self) -> Result<i64, RepoError> {
        Ok(self.records.lock().len() as i64)
    }

    async fn health_probe(&self) -> Result<(), RepoError> {
        let remaining = self.probe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.probe_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RepoError::Transient("injected probe failure".to_string()));
        }
        Ok(())
    }
}

pub fn test_store_config() -> StoreConfig {
    StoreConfig {
        flush_interval: Duration::from_millis(50),
        cache_ttl: Duration::from_secs(60),
        ..StoreConfig::default()
    }
}

/// Builds and starts a service over the given repository.
pub async fn started_service(
    repository: Arc<MemoryRepository>,
) -> (Arc<TelemetryService>, Arc<MemoryRepository>) {
    let store = Arc::new(HybridStore::new(repository.clone(), test_store_config()));
    let service = Arc::new(TelemetryService::new(store));
    service.start().await.expect("service should start");
    (service, repository)
}

pub fn test_config() -> AggregatorConfig {
    AggregatorConfig {
        database_url: "postgres://localhost/unused".to_string(),
        db_pool_size: 1,
        telemetry_enabled: true,
        ingestion: IngestionConfig {
            enabled: false,
            generator_url: "http://localhost:9001".to_string(),
            poll_interval_ms: 1_000,
            timeout_ms: 1_000,
            max_retries: 3,
            startup_delay_ms: 0,
            readiness_check: false,
        },
        storage: StorageConfig {
            cache_ttl_ms: 60_000,
            batch_size: 100,
            flush_interval_ms: 50,
            max_retries: 3,
            queue_capacity: 100,
        },
    }
}

pub fn test_state(service: Arc<TelemetryService>) -> AppState {
    AppState {
        config: Arc::new(test_config()),
        service,
    }
}
