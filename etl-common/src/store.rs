use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::records::{EnrichedRecord, ItemStatus, OrderStatus, RecordType, SinkKey};

/// Failures of a keyed-store write, split by whether a retry can help.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("throttled by the store")]
    Throttled,
    #[error("attempt timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("rejected by the store: {0}")]
    Validation(String),
    #[error("not authorized: {0}")]
    Unauthorized(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Throttled | StoreError::Timeout | StoreError::Unavailable(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::TransientStore
        } else {
            ErrorKind::PermanentStore
        }
    }
}

/// External table keyed by `(orderId, itemId)` with atomic single-row upsert.
///
/// `upsert` is a full-row replace conditioned on `orderDateTime`, so
/// redelivering a record is a no-op and cross-partition interleavings
/// resolve last-write-wins.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), StoreError>;
    async fn get(&self, key: SinkKey) -> Result<Option<EnrichedRecord>, StoreError>;
}

/// In-memory keyed store used by tests and local runs.
#[derive(Default)]
pub struct MemoryKeyedStore {
    rows: Mutex<HashMap<SinkKey, EnrichedRecord>>,
}

impl MemoryKeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("poisoned MemoryKeyedStore mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyedStore for MemoryKeyedStore {
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("poisoned MemoryKeyedStore mutex");
        let key = record.sink_key();
        match rows.get(&key) {
            Some(existing) if existing.order_date_time > record.order_date_time => Ok(()),
            _ => {
                rows.insert(key, record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, key: SinkKey) -> Result<Option<EnrichedRecord>, StoreError> {
        Ok(self
            .rows
            .lock()
            .expect("poisoned MemoryKeyedStore mutex")
            .get(&key)
            .cloned())
    }
}

/// Keyed store backed by a PostgreSQL table.
pub struct PostgresKeyedStore {
    pool: PgPool,
    table: String,
}

impl PostgresKeyedStore {
    pub fn new(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_owned(),
        }
    }

    pub async fn from_url(
        url: &str,
        max_connections: u32,
        table: &str,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(classify)?;

        Ok(Self::new(pool, table))
    }
}

#[async_trait]
impl KeyedStore for PostgresKeyedStore {
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        let query = format!(
            r#"
INSERT INTO "{0}" (
    order_id, item_id, item_quantity, item_amount, item_status,
    order_date_time, record_type, order_amount, order_status,
    ship_to_name, ship_to_address, ship_to_city, ship_to_state, ship_to_zip,
    product_name, product_price, line_total
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
ON CONFLICT (order_id, item_id) DO UPDATE
SET
    item_quantity = EXCLUDED.item_quantity,
    item_amount = EXCLUDED.item_amount,
    item_status = EXCLUDED.item_status,
    order_date_time = EXCLUDED.order_date_time,
    record_type = EXCLUDED.record_type,
    order_amount = EXCLUDED.order_amount,
    order_status = EXCLUDED.order_status,
    ship_to_name = EXCLUDED.ship_to_name,
    ship_to_address = EXCLUDED.ship_to_address,
    ship_to_city = EXCLUDED.ship_to_city,
    ship_to_state = EXCLUDED.ship_to_state,
    ship_to_zip = EXCLUDED.ship_to_zip,
    product_name = EXCLUDED.product_name,
    product_price = EXCLUDED.product_price,
    line_total = EXCLUDED.line_total
WHERE "{0}".order_date_time <= EXCLUDED.order_date_time
            "#,
            &self.table
        );

        sqlx::query(&query)
            .bind(record.order_id)
            .bind(record.item_id)
            .bind(record.item_quantity)
            .bind(record.item_amount)
            .bind(record.item_status.to_string())
            .bind(record.order_date_time)
            .bind(record.record_type.to_string())
            .bind(record.order_amount)
            .bind(record.order_status.to_string())
            .bind(&record.ship_to_name)
            .bind(&record.ship_to_address)
            .bind(&record.ship_to_city)
            .bind(&record.ship_to_state)
            .bind(&record.ship_to_zip)
            .bind(&record.product_name)
            .bind(record.product_price)
            .bind(record.line_total)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn get(&self, key: SinkKey) -> Result<Option<EnrichedRecord>, StoreError> {
        let query = format!(
            r#"
SELECT
    order_id, item_id, item_quantity, item_amount, item_status,
    order_date_time, record_type, order_amount, order_status,
    ship_to_name, ship_to_address, ship_to_city, ship_to_state, ship_to_zip,
    product_name, product_price, line_total
FROM "{0}"
WHERE order_id = $1 AND item_id = $2
            "#,
            &self.table
        );

        let row = sqlx::query(&query)
            .bind(key.order_id)
            .bind(key.item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;

        row.map(|row| {
            Ok(EnrichedRecord {
                order_id: row.try_get("order_id").map_err(classify)?,
                item_id: row.try_get("item_id").map_err(classify)?,
                item_quantity: row.try_get("item_quantity").map_err(classify)?,
                item_amount: row.try_get("item_amount").map_err(classify)?,
                item_status: parse_enum::<ItemStatus>(&row, "item_status")?,
                order_date_time: row.try_get("order_date_time").map_err(classify)?,
                record_type: parse_enum::<RecordType>(&row, "record_type")?,
                order_amount: row.try_get("order_amount").map_err(classify)?,
                order_status: parse_enum::<OrderStatus>(&row, "order_status")?,
                ship_to_name: row.try_get("ship_to_name").map_err(classify)?,
                ship_to_address: row.try_get("ship_to_address").map_err(classify)?,
                ship_to_city: row.try_get("ship_to_city").map_err(classify)?,
                ship_to_state: row.try_get("ship_to_state").map_err(classify)?,
                ship_to_zip: row.try_get("ship_to_zip").map_err(classify)?,
                product_name: row.try_get("product_name").map_err(classify)?,
                product_price: row.try_get("product_price").map_err(classify)?,
                line_total: row.try_get("line_total").map_err(classify)?,
            })
        })
        .transpose()
    }
}

fn parse_enum<T>(row: &sqlx::postgres::PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let text: String = row.try_get(column).map_err(classify)?;
    text.parse::<T>()
        .map_err(|e| StoreError::Validation(e.to_string()))
}

/// Split sqlx failures into transient and permanent store errors.
fn classify(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut => StoreError::Throttled,
        sqlx::Error::Io(e) => StoreError::Unavailable(e.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // too_many_connections / cannot_connect_now
            Some("53300") | Some("57P03") => StoreError::Throttled,
            Some("28000") | Some("28P01") => StoreError::Unauthorized(db.message().to_owned()),
            // integrity, data and syntax violations will not pass on retry
            Some(code) if code.starts_with("22") || code.starts_with("23") || code.starts_with("42") => {
                StoreError::Validation(db.message().to_owned())
            }
            _ => StoreError::Unavailable(db.message().to_owned()),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ItemStatus, OrderStatus, RecordType};
    use chrono::NaiveDate;

    fn enriched(order_date_time: chrono::NaiveDateTime) -> EnrichedRecord {
        EnrichedRecord {
            order_id: 100,
            item_id: 1,
            item_quantity: 3,
            item_amount: 29.97,
            item_status: ItemStatus::Pending,
            order_date_time,
            record_type: RecordType::Item,
            order_amount: 29.97,
            order_status: OrderStatus::Pending,
            ship_to_name: "Jess Doe".to_string(),
            ship_to_address: "1 Main St".to_string(),
            ship_to_city: "Springfield".to_string(),
            ship_to_state: "OR".to_string(),
            ship_to_zip: "97477".to_string(),
            product_name: Some("Widget".to_string()),
            product_price: Some(9.99),
            line_total: Some(29.97),
        }
    }

    fn at(hour: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 11, 5)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_upsert_is_idempotent() {
        let store = MemoryKeyedStore::new();
        let record = enriched(at(12));

        store.upsert(&record).await.unwrap();
        store.upsert(&record).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get(record.sink_key()).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_stale_write_loses_to_newer_row() {
        let store = MemoryKeyedStore::new();
        let newer = enriched(at(14));
        let mut stale = enriched(at(10));
        stale.item_quantity = 99;

        store.upsert(&newer).await.unwrap();
        store.upsert(&stale).await.unwrap();

        let stored = store.get(newer.sink_key()).await.unwrap().unwrap();
        assert_eq!(stored, newer);
    }

    #[tokio::test]
    async fn test_newer_write_replaces_the_row() {
        let store = MemoryKeyedStore::new();
        let older = enriched(at(10));
        let mut newer = enriched(at(14));
        newer.item_quantity = 5;

        store.upsert(&older).await.unwrap();
        store.upsert(&newer).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get(older.sink_key()).await.unwrap().unwrap();
        assert_eq!(stored.item_quantity, 5);
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Throttled.is_transient());
        assert!(StoreError::Timeout.is_transient());
        assert!(StoreError::Unavailable("conn reset".into()).is_transient());
        assert!(!StoreError::Validation("bad key".into()).is_transient());
        assert!(!StoreError::Unauthorized("denied".into()).is_transient());
        assert_eq!(StoreError::Throttled.kind(), ErrorKind::TransientStore);
        assert_eq!(
            StoreError::Validation("bad".into()).kind(),
            ErrorKind::PermanentStore
        );
    }
}
