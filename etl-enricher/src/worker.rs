use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::warn;

use etl_common::deadletter::{DeadLetter, DeadLetterSink};
use etl_common::error::ErrorKind;
use etl_common::health::HealthHandle;
use etl_common::records::{EnrichedRecord, OrderLineRecord, RecordType};
use etl_common::retry::RetryPolicy;
use etl_common::schema;
use etl_common::stream::{StreamSink, StreamSource};

use crate::config::{MalformedPolicy, MissPolicy};
use crate::error::EnricherError;
use crate::reference::ReferenceStore;

/// Joins one ingest partition against the product catalog, emitting enriched
/// records to the same partition of the output log in arrival order.
///
/// A lookup miss under the retry-after-delay policy is retried in place: the
/// worker sleeps the backoff and re-attempts before touching the next record,
/// so later records cannot overtake and per-partition order survives. The
/// retry bound keeps one orphaned record from stalling its partition forever.
pub struct EnrichmentWorker {
    pub partition: u32,
    pub source: Arc<dyn StreamSource>,
    pub output: Arc<dyn StreamSink>,
    pub reference: Arc<ReferenceStore>,
    pub dead_letter: Arc<dyn DeadLetterSink>,
    pub retry_policy: RetryPolicy,
    pub miss_policy: MissPolicy,
    pub malformed_policy: MalformedPolicy,
    /// Next offset to read; owned by the supervisor so restarts resume here.
    pub cursor: Arc<AtomicU64>,
    pub fetch_max: usize,
    pub poll_interval: Duration,
    pub liveness: HealthHandle,
}

impl EnrichmentWorker {
    /// Consume the partition until shutdown. Returns `Err` only on systemic
    /// failures; the supervisor restarts us with the cursor intact.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EnricherError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.liveness.report_healthy().await;

            let cursor = self.cursor.load(Ordering::Acquire);
            let records = self
                .source
                .fetch(self.partition, cursor, self.fetch_max)
                .await?;

            if records.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            histogram!("etl_enricher_batch_size").record(records.len() as f64);
            for record in records {
                self.process(&record.payload).await?;
                self.cursor.store(record.offset + 1, Ordering::Release);
            }
        }
    }

    async fn process(&self, payload: &[u8]) -> Result<(), EnricherError> {
        counter!("etl_enricher_records_total").increment(1);

        let order = match schema::parse_order_line(payload) {
            Ok(order) => order,
            Err(error) => return self.handle_malformed(payload, error).await,
        };

        match order.record_type {
            // Aggregate rows need no lookup; they keep the output schema
            // unified for consumers that want both levels.
            RecordType::Order => self.emit(EnrichedRecord::passthrough(order)).await,
            RecordType::Item => self.join_item(order).await,
        }
    }

    async fn handle_malformed(
        &self,
        payload: &[u8],
        error: schema::SchemaError,
    ) -> Result<(), EnricherError> {
        counter!("etl_enricher_malformed_total").increment(1);

        match self.malformed_policy {
            MalformedPolicy::DeadLetter => {
                warn!(partition = self.partition, "malformed record: {error}");
                self.dead_letter
                    .send(DeadLetter::from_raw(
                        payload,
                        ErrorKind::Schema,
                        error.to_string(),
                        1,
                    ))
                    .await?;
                Ok(())
            }
            MalformedPolicy::AbortBatch => Err(EnricherError::AbortedBatch(error)),
        }
    }

    async fn join_item(&self, order: OrderLineRecord) -> Result<(), EnricherError> {
        let key = order.product_key();
        let mut attempts: u32 = 1;

        loop {
            if let Some(product) = self.reference.get(key) {
                counter!("etl_enricher_enriched_total").increment(1);
                return self.emit(EnrichedRecord::from_item(order, &product)).await;
            }

            counter!("etl_enricher_lookup_miss_total").increment(1);
            match self.miss_policy {
                MissPolicy::DropAndLog => {
                    warn!(
                        order_id = order.order_id,
                        item_id = order.item_id,
                        "no product row for item, dropping"
                    );
                    counter!("etl_enricher_dropped_total").increment(1);
                    return Ok(());
                }
                MissPolicy::EmitWithNullFields => {
                    return self.emit(EnrichedRecord::passthrough(order)).await;
                }
                // Reference data may lag behind order arrival; give the next
                // refresh a chance before giving up on the record.
                MissPolicy::RetryAfterDelay => {
                    if self.retry_policy.should_retry(attempts, ErrorKind::LookupMiss) {
                        counter!("etl_enricher_lookup_retries_total").increment(1);
                        tokio::time::sleep(self.retry_policy.backoff_duration(attempts)).await;
                        attempts += 1;
                    } else {
                        self.dead_letter
                            .send(DeadLetter::new(
                                serde_json::to_value(&order)?,
                                ErrorKind::LookupMiss,
                                format!("no product row for key {key}"),
                                attempts,
                            ))
                            .await?;
                        counter!("etl_enricher_dead_letter_total").increment(1);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn emit(&self, record: EnrichedRecord) -> Result<(), EnricherError> {
        let payload = serde_json::to_vec(&record)?;
        let mut attempts: u32 = 1;

        loop {
            match self
                .output
                .append(self.partition, &record.key(), payload.clone())
                .await
            {
                Ok(()) => {
                    counter!("etl_enricher_emitted_total").increment(1);
                    return Ok(());
                }
                Err(error) => {
                    if self.retry_policy.should_retry(attempts, ErrorKind::TransientStore) {
                        warn!(
                            partition = self.partition,
                            "output append failed, backing off: {error}"
                        );
                        tokio::time::sleep(self.retry_policy.backoff_duration(attempts)).await;
                        attempts += 1;
                    } else {
                        return Err(EnricherError::OutputExhausted(error));
                    }
                }
            }
        }
    }
}
