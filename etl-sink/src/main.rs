//! Consume enriched records from the output stream and upsert them into the
//! keyed store, in parallel across partition slices.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use etl_common::health::HealthRegistry;
use etl_common::kafka::{KafkaDeadLetterSink, KafkaPartitionReader};
use etl_common::metrics::{serve, setup_metrics_router};
use etl_common::store::PostgresKeyedStore;
use etl_common::supervisor::supervise;
use etl_common::throttle::ThrottleMonitor;

use etl_sink::config::Config;
use etl_sink::consumer::{partition_slices, SinkConsumer};

pub async fn index() -> &'static str {
    "order enrichment sink service"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("invalid configuration:");

    let liveness = HealthRegistry::new("liveness");

    let router = setup_metrics_router()
        .route("/", get(index))
        .route("/_liveness", {
            let liveness = liveness.clone();
            get(move || std::future::ready(liveness.get_status()))
        });
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let source = Arc::new(KafkaPartitionReader::new(
        &config.kafka,
        &config.enriched_topic,
        config.partition_count,
        config.consumer_poll_timeout.0,
    )?);
    let dead_letter = Arc::new(KafkaDeadLetterSink::new(
        &config.kafka,
        &config.dead_letter_topic,
    )?);
    let store = Arc::new(
        PostgresKeyedStore::from_url(
            &config.database_url,
            config.max_pg_connections,
            &config.table_name,
        )
        .await
        .expect("failed to connect to the keyed store"),
    );

    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for shutdown signal");
        info!("shutdown requested");
        _ = shutdown_tx.send(true);
    });

    let throttle = Arc::new(ThrottleMonitor::new(
        Duration::from_secs(config.throttle_window_secs),
        config.throttle_min_factor,
    ));
    let cursors: Arc<Vec<AtomicU64>> = Arc::new(
        (0..config.partition_count)
            .map(|_| AtomicU64::new(0))
            .collect(),
    );

    let retry_policy = config.retry_policy();
    let restart_pause = Duration::from_secs(config.worker_restart_secs);
    let slices = partition_slices(config.partition_count, config.parallelization_factor);

    let mut workers = Vec::new();
    for (worker_id, partitions) in slices.into_iter().enumerate() {
        let worker_liveness = liveness
            .register(format!("sink-{worker_id}"), chrono::Duration::seconds(60))
            .await;
        let consumer = Arc::new(SinkConsumer {
            worker_id,
            partitions,
            source: source.clone(),
            store: store.clone(),
            dead_letter: dead_letter.clone(),
            retry_policy,
            throttle: throttle.clone(),
            cursors: cursors.clone(),
            batch_size: config.batch_size,
            upsert_timeout: config.upsert_timeout.0,
            batch_deadline: Duration::from_secs(config.batch_deadline_secs),
            poll_interval: config.poll_interval.0,
            liveness: worker_liveness,
        });

        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            supervise(
                &format!("sink-worker-{worker_id}"),
                shutdown.clone(),
                restart_pause,
                || {
                    let consumer = consumer.clone();
                    let shutdown = shutdown.clone();
                    async move { consumer.run(shutdown).await }
                },
            )
            .await
        }));
    }

    info!(
        partitions = config.partition_count,
        workers = workers.len(),
        "sink service started"
    );

    futures::future::join_all(workers).await;

    Ok(())
}
