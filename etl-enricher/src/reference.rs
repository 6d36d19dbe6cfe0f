//! The product catalog: a fully-materialized, periodically-refreshed side
//! table for the stream-table join.
//!
//! The active snapshot is replaced wholesale on every refresh, never patched
//! row-by-row. Readers load a reference-counted snapshot, so a swap cannot
//! expose a partially-populated catalog and an old snapshot is freed once the
//! last in-flight join drops its handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::counter;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use etl_common::health::HealthHandle;
use etl_common::records::ProductRecord;
use etl_common::schema;

use crate::blob::BlobClient;
use crate::error::RefreshError;

pub type ProductSnapshot = HashMap<i64, ProductRecord>;

pub struct ReferenceStore {
    snapshot: ArcSwap<ProductSnapshot>,
}

impl Default for ReferenceStore {
    fn default() -> Self {
        Self::empty()
    }
}

impl ReferenceStore {
    pub fn empty() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(ProductSnapshot::new()),
        }
    }

    /// Point lookup against the active snapshot. Non-blocking; concurrent
    /// with refresh.
    pub fn get(&self, product_id: i64) -> Option<ProductRecord> {
        self.snapshot.load().get(&product_id).cloned()
    }

    /// The whole active snapshot, for callers that need a consistent view
    /// across several lookups.
    pub fn snapshot(&self) -> Arc<ProductSnapshot> {
        self.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn install(&self, snapshot: ProductSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }
}

/// Parse the reference blob: either one JSON array of product rows, or
/// newline-delimited JSON objects. Every row goes through the schema mapper
/// and product ids must be unique.
pub fn parse_products(body: &str) -> Result<ProductSnapshot, RefreshError> {
    let trimmed = body.trim();

    let rows: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| RefreshError::Parse(e.to_string()))?
    } else {
        trimmed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()
            .map_err(|e| RefreshError::Parse(e.to_string()))?
    };

    if rows.is_empty() {
        return Err(RefreshError::Empty);
    }

    let mut snapshot = ProductSnapshot::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let product =
            schema::map_product(row).map_err(|source| RefreshError::Row { index, source })?;
        if snapshot.insert(product.product_id, product.clone()).is_some() {
            return Err(RefreshError::DuplicateProduct(product.product_id));
        }
    }

    Ok(snapshot)
}

/// Drives refreshes of a `ReferenceStore` from the reference blob.
pub struct ReferenceLoader {
    store: Arc<ReferenceStore>,
    blob: Arc<dyn BlobClient>,
    bucket: String,
    key: String,
}

impl ReferenceLoader {
    pub fn new(
        store: Arc<ReferenceStore>,
        blob: Arc<dyn BlobClient>,
        bucket: &str,
        key: &str,
    ) -> Self {
        Self {
            store,
            blob,
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        }
    }

    /// Read, parse and validate the blob, then swap the active snapshot.
    /// On any failure the previous snapshot remains active.
    pub async fn refresh(&self) -> Result<usize, RefreshError> {
        let body = self.blob.get_string(&self.bucket, &self.key).await?;
        let snapshot = parse_products(&body)?;
        let count = snapshot.len();
        self.store.install(snapshot);
        Ok(count)
    }

    /// Refresh on a schedule, or immediately when poked through `signal`
    /// (standing in for a blob-write notification), until shutdown.
    pub async fn run(
        &self,
        interval: Duration,
        signal: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
        liveness: HealthHandle,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = signal.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            liveness.report_healthy().await;

            match self.refresh().await {
                Ok(count) => {
                    counter!("etl_reference_refresh_success_total").increment(1);
                    info!("reference snapshot refreshed with {count} products");
                }
                Err(error) => {
                    // Stale-but-consistent beats total failure: keep serving
                    // the previous snapshot.
                    counter!("etl_reference_refresh_failure_total").increment(1);
                    warn!("reference refresh failed, keeping previous snapshot: {error}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobError, MockBlobClient};

    const BUCKET: &str = "products-bucket";
    const KEY: &str = "products/products.json";

    fn loader_with(blob: MockBlobClient) -> (Arc<ReferenceStore>, ReferenceLoader) {
        let store = Arc::new(ReferenceStore::empty());
        let loader = ReferenceLoader::new(store.clone(), Arc::new(blob), BUCKET, KEY);
        (store, loader)
    }

    fn product_json(id: i64, name: &str, price: f64) -> String {
        format!(r#"{{"productId": {id}, "productName": "{name}", "productPrice": {price}}}"#)
    }

    #[tokio::test]
    async fn test_refresh_loads_a_json_array() {
        let blob = MockBlobClient::new().with_object(
            BUCKET,
            KEY,
            Ok(format!("[{}]", product_json(1, "Widget", 9.99))),
        );
        let (store, loader) = loader_with(blob);

        assert_eq!(loader.refresh().await.unwrap(), 1);
        let product = store.get(1).unwrap();
        assert_eq!(product.product_name, "Widget");
        assert!(store.get(2).is_none());
    }

    #[tokio::test]
    async fn test_refresh_loads_newline_delimited_rows() {
        let body = format!(
            "{}\n{}\n",
            product_json(1, "Widget", 9.99),
            product_json(2, "Gadget", 19.99)
        );
        let blob = MockBlobClient::new().with_object(BUCKET, KEY, Ok(body));
        let (store, loader) = loader_with(blob);

        assert_eq!(loader.refresh().await.unwrap(), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_replaces_the_snapshot_wholesale() {
        let blob = MockBlobClient::new().with_object(
            BUCKET,
            KEY,
            Ok(format!("[{}]", product_json(1, "Widget", 9.99))),
        );
        let (store, loader) = loader_with(blob);
        loader.refresh().await.unwrap();

        let blob = MockBlobClient::new().with_object(
            BUCKET,
            KEY,
            Ok(format!("[{}]", product_json(2, "Gadget", 19.99))),
        );
        let loader = ReferenceLoader::new(store.clone(), Arc::new(blob), BUCKET, KEY);
        loader.refresh().await.unwrap();

        // Product 1 is gone, not merged.
        assert!(store.get(1).is_none());
        assert!(store.get(2).is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let blob = MockBlobClient::new().with_object(
            BUCKET,
            KEY,
            Ok(format!("[{}]", product_json(1, "Widget", 9.99))),
        );
        let (store, loader) = loader_with(blob);
        loader.refresh().await.unwrap();

        for bad in [
            Err(BlobError::OperationFailed("503".to_string())),
            Ok("{ not json".to_string()),
            Ok("[]".to_string()),
            Ok(format!(
                "[{}, {}]",
                product_json(7, "Doodad", 1.0),
                product_json(7, "Doodad", 1.0)
            )),
        ] {
            let blob = MockBlobClient::new().with_object(BUCKET, KEY, bad);
            let loader = ReferenceLoader::new(store.clone(), Arc::new(blob), BUCKET, KEY);
            assert!(loader.refresh().await.is_err());
            // Previous snapshot still active.
            assert_eq!(store.get(1).unwrap().product_name, "Widget");
        }
    }

    #[tokio::test]
    async fn test_duplicate_product_id_is_rejected() {
        let body = format!(
            "[{}, {}]",
            product_json(1, "Widget", 9.99),
            product_json(1, "Widget Again", 8.99)
        );
        let blob = MockBlobClient::new().with_object(BUCKET, KEY, Ok(body));
        let (_, loader) = loader_with(blob);

        assert!(matches!(
            loader.refresh().await,
            Err(RefreshError::DuplicateProduct(1))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_never_observe_a_mixed_snapshot() {
        let store = Arc::new(ReferenceStore::empty());

        // Generation g prices every product at g; a mixed snapshot would show
        // two different prices at once.
        let generation = |g: f64| -> ProductSnapshot {
            (0..500)
                .map(|id| {
                    (
                        id,
                        ProductRecord {
                            product_id: id,
                            product_name: format!("product-{id}"),
                            product_price: g,
                        },
                    )
                })
                .collect()
        };
        store.install(generation(1.0));

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..100u32 {
                    store.install(generation(f64::from(i % 2) + 1.0));
                    tokio::task::yield_now().await;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let snapshot = store.snapshot();
                        let price = snapshot[&0].product_price;
                        assert!(snapshot.values().all(|p| p.product_price == price));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
