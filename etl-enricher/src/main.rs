//! Consume the order stream, join it against the product catalog, and emit
//! enriched records onto the output stream.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use envconfig::Envconfig;
use tokio::sync::{watch, Notify};
use tracing::info;
use tracing_subscriber::EnvFilter;

use etl_common::health::HealthRegistry;
use etl_common::kafka::{KafkaDeadLetterSink, KafkaPartitionReader, KafkaStreamWriter};
use etl_common::metrics::{serve, setup_metrics_router};
use etl_common::supervisor::supervise;

use etl_enricher::blob::S3BlobClient;
use etl_enricher::config::Config;
use etl_enricher::reference::{ReferenceLoader, ReferenceStore};
use etl_enricher::worker::EnrichmentWorker;

pub async fn index() -> &'static str {
    "order enrichment service"
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
        &config.order_topic,
        config.partition_count,
        config.consumer_poll_timeout.0,
    )?);
    let output = Arc::new(KafkaStreamWriter::new(
        &config.kafka,
        &config.enriched_topic,
        config.partition_count,
    )?);
    let dead_letter = Arc::new(KafkaDeadLetterSink::new(
        &config.kafka,
        &config.dead_letter_topic,
    )?);

    let aws_config = aws_config::load_from_env().await;
    let blob = Arc::new(S3BlobClient::new(aws_sdk_s3::Client::new(&aws_config)));

    let (shutdown_tx, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for shutdown signal");
        info!("shutdown requested");
        _ = shutdown_tx.send(true);
    });

    let reference = Arc::new(ReferenceStore::empty());
    let refresh_signal = Arc::new(Notify::new());
    let loader = ReferenceLoader::new(
        reference.clone(),
        blob,
        &config.products_bucket,
        &config.products_key,
    );
    let refresh_liveness = liveness
        .register(
            "reference-refresh".to_string(),
            chrono::Duration::seconds(config.refresh_interval_secs as i64 * 2),
        )
        .await;
    let refresh_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let signal = refresh_signal.clone();
        let interval = Duration::from_secs(config.refresh_interval_secs);
        async move { loader.run(interval, signal, shutdown, refresh_liveness).await }
    });

    let retry_policy = config.retry_policy();
    let restart_pause = Duration::from_secs(config.worker_restart_secs);
    let mut workers = Vec::new();
    for partition in 0..config.partition_count {
        let worker_liveness = liveness
            .register(format!("worker-{partition}"), chrono::Duration::seconds(60))
            .await;
        let worker = Arc::new(EnrichmentWorker {
            partition,
            source: source.clone(),
            output: output.clone(),
            reference: reference.clone(),
            dead_letter: dead_letter.clone(),
            retry_policy,
            miss_policy: config.miss_policy,
            malformed_policy: config.malformed_policy,
            cursor: Arc::new(AtomicU64::new(0)),
            fetch_max: config.fetch_max,
            poll_interval: config.poll_interval.0,
            liveness: worker_liveness,
        });

        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            supervise(
                &format!("enrichment-worker-{partition}"),
                shutdown.clone(),
                restart_pause,
                || {
                    let worker = worker.clone();
                    let shutdown = shutdown.clone();
                    async move { worker.run(shutdown).await }
                },
            )
            .await
        }));
    }

    info!(
        partitions = config.partition_count,
        "enrichment service started"
    );

    futures::future::join_all(workers).await;
    refresh_task.await?;

    Ok(())
}
