use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use tokio::sync::watch;
use tracing::warn;

use etl_common::deadletter::{DeadLetter, DeadLetterSink};
use etl_common::error::ErrorKind;
use etl_common::health::HealthHandle;
use etl_common::records::EnrichedRecord;
use etl_common::retry::RetryPolicy;
use etl_common::store::{KeyedStore, StoreError};
use etl_common::stream::{StreamRecord, StreamSource};
use etl_common::throttle::ThrottleMonitor;

use crate::error::SinkError;

/// Assign contiguous partition slices to workers. With fewer partitions than
/// workers, the surplus workers get no slice and are not spawned.
pub fn partition_slices(partition_count: u32, workers: usize) -> Vec<Vec<u32>> {
    if workers == 0 {
        return Vec::new();
    }
    let base = partition_count as usize / workers;
    let remainder = partition_count as usize % workers;

    let mut slices = Vec::new();
    let mut next = 0u32;
    for worker in 0..workers {
        let len = base + usize::from(worker < remainder);
        if len == 0 {
            break;
        }
        slices.push((next..next + len as u32).collect());
        next += len as u32;
    }
    slices
}

/// Consumes enriched records from a slice of output partitions and upserts
/// them into the keyed store.
///
/// A batch is acknowledged (the partition cursor advances) only after every
/// record in it has either been stored or dead-lettered, so a restart replays
/// the whole batch: at-least-once delivery, made safe by the idempotent
/// full-row upsert. Shutdown is honored at batch boundaries only, keeping
/// batches from being half-acknowledged.
pub struct SinkConsumer {
    pub worker_id: usize,
    pub partitions: Vec<u32>,
    pub source: Arc<dyn StreamSource>,
    pub store: Arc<dyn KeyedStore>,
    pub dead_letter: Arc<dyn DeadLetterSink>,
    pub retry_policy: RetryPolicy,
    pub throttle: Arc<ThrottleMonitor>,
    /// One cursor per partition, indexed by partition id; owned by the
    /// supervisor so restarts resume at the last acknowledged batch.
    pub cursors: Arc<Vec<AtomicU64>>,
    pub batch_size: usize,
    pub upsert_timeout: Duration,
    pub batch_deadline: Duration,
    pub poll_interval: Duration,
    pub liveness: HealthHandle,
}

impl SinkConsumer {
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SinkError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.liveness.report_healthy().await;

            let mut processed = 0;
            for &partition in &self.partitions {
                if *shutdown.borrow() {
                    return Ok(());
                }
                processed += self.process_batch(partition).await?;
            }

            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    async fn process_batch(&self, partition: u32) -> Result<usize, SinkError> {
        let effective = self.throttle.effective_batch_size(self.batch_size);
        gauge!("etl_sink_throttle_ratio").set(self.throttle.throttle_ratio());
        gauge!("etl_sink_effective_batch_size").set(effective as f64);

        let cursor = self.cursors[partition as usize].load(Ordering::Acquire);
        let records = self.source.fetch(partition, cursor, effective).await?;
        if records.is_empty() {
            return Ok(0);
        }

        histogram!("etl_sink_batch_size").record(records.len() as f64);
        let deadline = Instant::now() + self.batch_deadline;
        for record in &records {
            self.process_record(record, deadline).await?;
        }

        // Every record is now stored or dead-lettered; acknowledge the batch.
        let last = records.last().expect("batch checked non-empty");
        self.cursors[partition as usize].store(last.offset + 1, Ordering::Release);

        Ok(records.len())
    }

    async fn process_record(
        &self,
        record: &StreamRecord,
        deadline: Instant,
    ) -> Result<(), SinkError> {
        let enriched: EnrichedRecord = match serde_json::from_slice(&record.payload) {
            Ok(enriched) => enriched,
            Err(error) => {
                counter!("etl_sink_malformed_total").increment(1);
                self.dead_letter
                    .send(DeadLetter::from_raw(
                        &record.payload,
                        ErrorKind::Schema,
                        error.to_string(),
                        1,
                    ))
                    .await?;
                return Ok(());
            }
        };

        self.upsert_with_retry(enriched, deadline).await
    }

    async fn upsert_with_retry(
        &self,
        record: EnrichedRecord,
        deadline: Instant,
    ) -> Result<(), SinkError> {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(self.upsert_timeout, self.store.upsert(&record)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StoreError::Timeout),
                };
            histogram!("etl_sink_upsert_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            let error = match outcome {
                Ok(()) => {
                    self.throttle.record_ok();
                    counter!("etl_sink_upserted_total").increment(1);
                    return Ok(());
                }
                Err(error) => error,
            };

            // Only throttling responses feed the backpressure window; other
            // failures say nothing about store saturation.
            if matches!(error, StoreError::Throttled) {
                self.throttle.record_throttled();
                counter!("etl_sink_throttled_total").increment(1);
            }

            let kind = error.kind();
            let out_of_time = Instant::now() >= deadline;
            if out_of_time || !self.retry_policy.should_retry(attempts, kind) {
                warn!(
                    key = %record.sink_key(),
                    attempts,
                    "dead-lettering record: {error}"
                );
                self.dead_letter
                    .send(DeadLetter::new(
                        serde_json::to_value(&record)?,
                        kind,
                        error.to_string(),
                        attempts,
                    ))
                    .await?;
                counter!("etl_sink_dead_letter_total").increment(1);
                return Ok(());
            }

            counter!("etl_sink_upsert_retries_total").increment(1);
            let backoff = self
                .retry_policy
                .backoff_duration(attempts)
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(backoff).await;
        }
    }
}
