//! Kafka bindings for the partitioned-log seams: a partition-pinning
//! producer for the write side, an assign/seek consumer for the read side,
//! and a dead-letter topic producer.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use envconfig::Envconfig;
use metrics::gauge;
use rdkafka::config::{ClientConfig, FromClientConfigAndContext};
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::future_producer::{FutureProducer, FutureRecord};
use rdkafka::producer::Producer;
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::info;

use crate::deadletter::{DeadLetter, DeadLetterSink};
use crate::stream::{StreamError, StreamRecord, StreamSink, StreamSource};

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
    #[envconfig(default = "order-etl")]
    pub kafka_consumer_group: String,
}

impl From<&KafkaConfig> for ClientConfig {
    fn from(config: &KafkaConfig) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", config.kafka_consumer_group.clone());

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }
}

struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("etl_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("etl_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
    }
}

const PRODUCE_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes to a fixed topic, pinning each payload to its caller-chosen
/// partition. Awaits the broker ack per record so per-partition append order
/// is the call order.
pub struct KafkaStreamWriter {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    partitions: u32,
}

impl KafkaStreamWriter {
    pub fn new(config: &KafkaConfig, topic: &str, partitions: u32) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);
        let client_config: ClientConfig = config.into();
        let producer = FutureProducer::from_config_and_context(&client_config, KafkaContext)?;

        // Ping the cluster to make sure we can reach brokers
        drop(
            producer
                .client()
                .fetch_metadata(Some(topic), Timeout::After(Duration::new(10, 0)))?,
        );
        info!("connected to Kafka brokers");

        Ok(Self {
            producer,
            topic: topic.to_owned(),
            partitions,
        })
    }
}

#[async_trait]
impl StreamSink for KafkaStreamWriter {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    async fn append(
        &self,
        partition: u32,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<(), StreamError> {
        if partition >= self.partitions {
            return Err(StreamError::UnknownPartition(partition));
        }

        let record: FutureRecord<[u8], [u8]> = FutureRecord {
            topic: &self.topic,
            partition: Some(partition as i32),
            payload: Some(payload.as_slice()),
            key: Some(key.as_bytes()),
            timestamp: None,
            headers: None,
        };

        self.producer
            .send(record, Timeout::After(PRODUCE_ACK_TIMEOUT))
            .await
            .map_err(|(e, _)| StreamError::Transport(e.to_string()))?;

        Ok(())
    }
}

/// Reads one partition at a time with an explicit cursor, via assign + seek.
/// Offset management stays with the caller, which only advances its cursor
/// after a fetched batch is fully handled.
pub struct KafkaPartitionReader {
    consumer: Arc<Mutex<BaseConsumer>>,
    topic: String,
    partitions: u32,
    poll_timeout: Duration,
}

impl KafkaPartitionReader {
    pub fn new(
        config: &KafkaConfig,
        topic: &str,
        partitions: u32,
        poll_timeout: Duration,
    ) -> Result<Self, KafkaError> {
        let mut client_config: ClientConfig = config.into();
        client_config
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        let consumer: BaseConsumer = client_config.create()?;

        Ok(Self {
            consumer: Arc::new(Mutex::new(consumer)),
            topic: topic.to_owned(),
            partitions,
            poll_timeout,
        })
    }
}

#[async_trait]
impl StreamSource for KafkaPartitionReader {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    async fn fetch(
        &self,
        partition: u32,
        cursor: u64,
        max: usize,
    ) -> Result<Vec<StreamRecord>, StreamError> {
        if partition >= self.partitions {
            return Err(StreamError::UnknownPartition(partition));
        }

        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let poll_timeout = self.poll_timeout;

        tokio::task::spawn_blocking(move || {
            let consumer = consumer.lock().expect("poisoned KafkaPartitionReader mutex");

            let mut assignment = TopicPartitionList::new();
            assignment
                .add_partition_offset(&topic, partition as i32, Offset::Offset(cursor as i64))
                .map_err(|e| StreamError::Transport(e.to_string()))?;
            consumer
                .assign(&assignment)
                .map_err(|e| StreamError::Transport(e.to_string()))?;

            let deadline = Instant::now() + poll_timeout;
            let mut records = Vec::new();
            while records.len() < max {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match consumer.poll(remaining) {
                    None => break,
                    Some(Err(e)) => return Err(StreamError::Transport(e.to_string())),
                    Some(Ok(message)) => {
                        if message.partition() != partition as i32 {
                            continue;
                        }
                        records.push(StreamRecord {
                            offset: message.offset() as u64,
                            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        });
                    }
                }
            }
            Ok(records)
        })
        .await
        .map_err(|e| StreamError::Transport(e.to_string()))?
    }
}

/// Publishes dead letters onto a Kafka topic, partitioned by the broker.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(config: &KafkaConfig, topic: &str) -> Result<Self, KafkaError> {
        let client_config: ClientConfig = config.into();
        let producer = FutureProducer::from_config_and_context(&client_config, KafkaContext)?;

        Ok(Self {
            producer,
            topic: topic.to_owned(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), StreamError> {
        let payload = serde_json::to_vec(&letter)
            .map_err(|e| StreamError::Transport(format!("failed to serialize dead letter: {e}")))?;
        let key = letter.error_kind.to_string();

        let record: FutureRecord<[u8], [u8]> = FutureRecord {
            topic: &self.topic,
            partition: None,
            payload: Some(payload.as_slice()),
            key: Some(key.as_bytes()),
            timestamp: None,
            headers: None,
        };

        self.producer
            .send(record, Timeout::After(PRODUCE_ACK_TIMEOUT))
            .await
            .map_err(|(e, _)| StreamError::Transport(e.to_string()))?;

        Ok(())
    }
}
