use crate::models::TelemetryRecord;
use crate::repository::MetricsRepository;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ceiling for writing out queued batches once shutdown has begun.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Base for the writer's linearly increasing retry backoff (1s, 2s, 3s, ...).
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

/// Counters shared between the queue handle, the writer and the store.
#[derive(Debug, Default)]
pub struct FlushStats {
    pub pending_items: AtomicU64,
    pub dropped_batches: AtomicU64,
    pub total_db_writes: AtomicU64,
    pub total_db_write_errors: AtomicU64,
    pub fatal_write_errors: AtomicU64,
    last_flush_unix_ms: AtomicU64,
}

impl FlushStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_flush(&self) {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
    }

    pub fn last_flush(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_flush_unix_ms.load(Ordering::Relaxed);
        if ms == 0 {
            return None;
        }
        DateTime::from_timestamp_millis(ms as i64)
    }
}

/// Producer side of the bounded flush queue.
///
/// Enqueueing never blocks: when the queue is full the batch is dropped and
/// counted. The cache already holds the freshest view at that point, so
/// losing historical rows is preferred over stalling ingestion.
#[derive(Clone)]
pub struct FlushQueue {
    tx: mpsc::Sender<Vec<TelemetryRecord>>,
    stats: Arc<FlushStats>,
}

impl FlushQueue {
    pub fn new(
        capacity: usize,
        stats: Arc<FlushStats>,
    ) -> (Self, mpsc::Receiver<Vec<TelemetryRecord>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, stats }, rx)
    }

    /// Returns false when the batch was dropped because the queue is full.
    pub fn enqueue(&self, batch: Vec<TelemetryRecord>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let len = batch.len() as u64;
        match self.tx.try_send(batch) {
            Ok(()) => {
                self.stats.pending_items.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(batch)) => {
                self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    records = batch.len(),
                    "flush queue is full, dropping telemetry batch"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(batch)) => {
                self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    records = batch.len(),
                    "flush queue is closed, dropping telemetry batch"
                );
                false
            }
        }
    }
}

/// Spawns the single drain loop that moves queued batches into the
/// repository. Adjacent batches are merged up to the soft `batch_size` row
/// target before each write.
pub fn spawn_writer(
    repository: Arc<dyn MetricsRepository>,
    mut rx: mpsc::Receiver<Vec<TelemetryRecord>>,
    stats: Arc<FlushStats>,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    drain(&*repository, &mut rx, &stats).await;
                    return;
                }
                batch = rx.recv() => {
                    let Some(mut records) = batch else {
                        return;
                    };
                    stats
                        .pending_items
                        .fetch_sub(records.len() as u64, Ordering::Relaxed);

                    while records.len() < batch_size {
                        match rx.try_recv() {
                            Ok(next) => {
                                stats
                                    .pending_items
                                    .fetch_sub(next.len() as u64, Ordering::Relaxed);
                                records.extend(next);
                            }
                            Err(_) => break,
                        }
                    }

                    write_with_retry(&*repository, &records, &retry, &stats, &cancel).await;
                }
            }
        }
    })
}

async fn write_with_retry(
    repository: &dyn MetricsRepository,
    records: &[TelemetryRecord],
    retry: &RetryPolicy,
    stats: &FlushStats,
    cancel: &CancellationToken,
) {
    let attempts = retry.max_retries.max(1);
    for attempt in 1..=attempts {
        match repository.bulk_insert(records).await {
            Ok(()) => {
                stats
                    .total_db_writes
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                stats.mark_flush();
                tracing::debug!(records = records.len(), attempt, "flushed telemetry batch");
                return;
            }
            Err(err) => {
                stats.total_db_write_errors.fetch_add(1, Ordering::Relaxed);
                if !err.is_retryable() {
                    stats.fatal_write_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        records = records.len(),
                        error = %err,
                        "dropping batch after fatal database error"
                    );
                    return;
                }
                if attempt == attempts {
                    tracing::error!(
                        records = records.len(),
                        attempts,
                        error = %err,
                        "giving up on batch after exhausting retries"
                    );
                    return;
                }

                let backoff = retry.backoff * attempt;
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "database write failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::warn!(records = records.len(), "retry aborted by shutdown");
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

/// Best-effort write-out of whatever is still queued, bounded by
/// `DRAIN_TIMEOUT`. Anything that cannot be written in time is reported and
/// lost.
async fn drain(
    repository: &dyn MetricsRepository,
    rx: &mut mpsc::Receiver<Vec<TelemetryRecord>>,
    stats: &FlushStats,
) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    let mut written: usize = 0;
    let mut lost: usize = 0;

    while let Ok(batch) = rx.try_recv() {
        stats
            .pending_items
            .fetch_sub(batch.len() as u64, Ordering::Relaxed);

        if tokio::time::Instant::now() >= deadline {
            lost += batch.len();
            continue;
        }

        match tokio::time::timeout_at(deadline, repository.bulk_insert(&batch)).await {
            Ok(Ok(())) => {
                written += batch.len();
                stats
                    .total_db_writes
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                stats.mark_flush();
            }
            Ok(Err(err)) => {
                lost += batch.len();
                stats.total_db_write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, "failed to flush batch during shutdown");
            }
            Err(_) => {
                lost += batch.len();
                tracing::warn!(records = batch.len(), "drain deadline hit mid-write");
            }
        }
    }

    if lost > 0 {
        tracing::warn!(written, lost, "flush queue drained during shutdown");
    } else if written > 0 {
        tracing::info!(written, "flush queue drained during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryRepository;
    use chrono::Utc;
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

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(10),
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
    async fn full_queue_drops_without_blocking() {
        let stats = Arc::new(FlushStats::new());
        let (queue, _rx) = FlushQueue::new(1, stats.clone());

        assert!(queue.enqueue(vec![record("sw-01", 1.0)]));

        // No consumer is running, so the second enqueue must drop instantly
        // instead of back-pressuring the caller.
        let started = Instant::now();
        assert!(!queue.enqueue(vec![record("sw-02", 2.0)]));
        assert!(started.elapsed() < Duration::from_millis(50));

        assert_eq!(stats.dropped_batches.load(Ordering::Relaxed), 1);
        assert_eq!(stats.pending_items.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn writer_persists_queued_batches() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(FlushStats::new());
        let (queue, rx) = FlushQueue::new(16, stats.clone());
        let cancel = CancellationToken::new();
        let _writer = spawn_writer(
            repo.clone(),
            rx,
            stats.clone(),
            100,
            fast_retry(),
            cancel.clone(),
        );

        queue.enqueue(vec![record("sw-01", 1.0), record("sw-02", 2.0)]);

        let repo_check = repo.clone();
        wait_until(move || repo_check.record_count() == 2).await;
        assert_eq!(stats.total_db_writes.load(Ordering::Relaxed), 2);
        assert_eq!(stats.pending_items.load(Ordering::Relaxed), 0);
        assert!(stats.last_flush().is_some());
    }

    // A transient failure sequence followed by success writes the batch
    // exactly once, within the configured number of attempts.
    #[tokio::test]
    async fn transient_errors_are_retried_to_convergence() {
        let repo = Arc::new(MemoryRepository::new());
        repo.fail_transient(2);
        let stats = Arc::new(FlushStats::new());
        let (queue, rx) = FlushQueue::new(16, stats.clone());
        let cancel = CancellationToken::new();
        let _writer = spawn_writer(
            repo.clone(),
            rx,
            stats.clone(),
            100,
            fast_retry(),
            cancel.clone(),
        );

        queue.enqueue(vec![record("sw-01", 1.0)]);

        let repo_check = repo.clone();
        wait_until(move || repo_check.record_count() == 1).await;
        assert_eq!(repo.bulk_attempts(), 3);
        assert_eq!(stats.total_db_writes.load(Ordering::Relaxed), 1);
        assert_eq!(stats.total_db_write_errors.load(Ordering::Relaxed), 2);
        assert_eq!(stats.fatal_write_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn fatal_errors_skip_the_batch_without_retry() {
        let repo = Arc::new(MemoryRepository::new());
        repo.fail_fatal(true);
        let stats = Arc::new(FlushStats::new());
        let (queue, rx) = FlushQueue::new(16, stats.clone());
        let cancel = CancellationToken::new();
        let _writer = spawn_writer(
            repo.clone(),
            rx,
            stats.clone(),
            100,
            fast_retry(),
            cancel.clone(),
        );

        queue.enqueue(vec![record("sw-01", 1.0)]);

        let stats_check = stats.clone();
        wait_until(move || stats_check.fatal_write_errors.load(Ordering::Relaxed) == 1).await;
        assert_eq!(repo.bulk_attempts(), 1);
        assert_eq!(repo.record_count(), 0);
        assert_eq!(stats.total_db_writes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn cancellation_drains_remaining_batches() {
        let repo = Arc::new(MemoryRepository::new());
        let stats = Arc::new(FlushStats::new());
        let (queue, rx) = FlushQueue::new(16, stats.clone());
        let cancel = CancellationToken::new();

        // Queue before the writer starts so the batches are pending at
        // cancellation time.
        queue.enqueue(vec![record("sw-01", 1.0)]);
        queue.enqueue(vec![record("sw-02", 2.0)]);

        let writer = spawn_writer(
            repo.clone(),
            rx,
            stats.clone(),
            100,
            fast_retry(),
            cancel.clone(),
        );
        cancel.cancel();
        writer.await.unwrap();

        assert_eq!(repo.record_count(), 2);
        assert_eq!(stats.pending_items.load(Ordering::Relaxed), 0);
    }
}
