use crate::error::TelemetryError;
use crate::models::{MetricType, MetricValue, Snapshot, TelemetryRecord};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Clone)]
struct CacheEntry {
    record: TelemetryRecord,
    last_updated: DateTime<Utc>,
}

/// Latest-value store: one record per switch id, replaced atomically.
///
/// Readers take the lock briefly and clone out whole records, so a read can
/// never observe a half-written record. Request/hit counters are best-effort
/// relaxed atomics and deliberately not transactional with the reads.
pub struct MetricsCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    request_count: AtomicU64,
    hit_count: AtomicU64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub hit_rate: f64,
    pub switch_count: usize,
}

impl Default for MetricsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            request_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
        }
    }

    fn normalize(record: &mut TelemetryRecord, now: DateTime<Utc>) {
        // Upstream may omit the measurement instant; an epoch timestamp is
        // treated as absent and replaced with the ingest instant.
        if record.timestamp.timestamp() == 0 {
            record.timestamp = now;
        }
    }

    pub fn update_one(&self, mut record: TelemetryRecord) -> Result<(), TelemetryError> {
        if record.switch_id.is_empty() {
            return Err(TelemetryError::EmptySwitchId);
        }
        let now = Utc::now();
        Self::normalize(&mut record, now);

        let mut entries = self.entries.write();
        entries.insert(
            record.switch_id.clone(),
            CacheEntry {
                record,
                last_updated: now,
            },
        );
        Ok(())
    }

    /// Replaces entries for every keyed record under a single lock. Records
    /// with an empty switch id are skipped.
    pub fn update_batch(&self, records: impl IntoIterator<Item = TelemetryRecord>) {
        let now = Utc::now();
        let mut entries = self.entries.write();
        for mut record in records {
            if record.switch_id.is_empty() {
                continue;
            }
            Self::normalize(&mut record, now);
            entries.insert(
                record.switch_id.clone(),
                CacheEntry {
                    record,
                    last_updated: now,
                },
            );
        }
    }

    pub fn get_metric(&self, switch_id: &str, metric: MetricType) -> Option<MetricValue> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.read();
        let value = entries
            .get(switch_id)
            .map(|entry| entry.record.metric_value(metric));
        if value.is_some() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub fn get_all(&self, switch_id: &str) -> Option<TelemetryRecord> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.read();
        let record = entries.get(switch_id).map(|entry| entry.record.clone());
        if record.is_some() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    /// Returns an independent copy of the current view; callers may retain it.
    pub fn list_all(&self) -> HashMap<String, TelemetryRecord> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let entries = self.entries.read();
        if !entries.is_empty() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        }
        entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.record.clone()))
            .collect()
    }

    pub fn last_update(&self, switch_id: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.read();
        entries.get(switch_id).map(|entry| entry.last_updated)
    }

    pub fn switch_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Evicts entries whose last update is older than `max_age`. Returns the
    /// number of evicted entries.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - age;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.last_updated >= cutoff);
        before - entries.len()
    }

    pub fn snapshot(&self) -> Snapshot {
        let now = Utc::now();
        Snapshot {
            timestamp: now,
            generation_id: format!("cache_{}", now.timestamp_nanos_opt().unwrap_or_default()),
            switches: self.list_all(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let total_requests = self.request_count.load(Ordering::Relaxed);
        let cache_hits = self.hit_count.load(Ordering::Relaxed);
        let hit_rate = if total_requests > 0 {
            cache_hits as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };
        CacheStats {
            total_requests,
            cache_hits,
            hit_rate,
            switch_count: self.switch_count(),
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        self.request_count.store(0, Ordering::Relaxed);
        self.hit_count.store(0, Ordering::Relaxed);
    }
}
