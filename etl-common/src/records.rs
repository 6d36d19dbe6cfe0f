use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire format for `TIMESTAMP` columns, fixed by the upstream producer.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Serialize/deserialize `NaiveDateTime` in the fixed wire format.
pub mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{value} is not a valid {expected}")]
pub struct ParseEnumError {
    pub value: String,
    pub expected: &'static str,
}

/// Whether a record carries an order line item or an order-level aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    Order,
    Item,
}

impl FromStr for RecordType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_ref() {
            "ORDER" => Ok(RecordType::Order),
            "ITEM" => Ok(RecordType::Item),
            invalid => Err(ParseEnumError {
                value: invalid.to_owned(),
                expected: "RecordType",
            }),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordType::Order => write!(f, "ORDER"),
            RecordType::Item => write!(f, "ITEM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    Pending,
    Shipped,
    Returned,
    Canceled,
}

impl FromStr for ItemStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_ref() {
            "PENDING" => Ok(ItemStatus::Pending),
            "SHIPPED" => Ok(ItemStatus::Shipped),
            "RETURNED" => Ok(ItemStatus::Returned),
            "CANCELED" => Ok(ItemStatus::Canceled),
            invalid => Err(ParseEnumError {
                value: invalid.to_owned(),
                expected: "ItemStatus",
            }),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "PENDING"),
            ItemStatus::Shipped => write!(f, "SHIPPED"),
            ItemStatus::Returned => write!(f, "RETURNED"),
            ItemStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Complete,
    Canceled,
}

impl FromStr for OrderStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_ref() {
            "PENDING" => Ok(OrderStatus::Pending),
            "COMPLETE" => Ok(OrderStatus::Complete),
            "CANCELED" => Ok(OrderStatus::Canceled),
            invalid => Err(ParseEnumError {
                value: invalid.to_owned(),
                expected: "OrderStatus",
            }),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Complete => write!(f, "COMPLETE"),
            OrderStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// A raw order-line event as produced onto the order stream.
///
/// Built by the schema mapper from untyped JSON; immutable once read.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineRecord {
    pub order_id: i64,
    pub item_id: i64,
    pub item_quantity: i32,
    pub item_amount: f64,
    pub item_status: ItemStatus,
    #[serde(with = "timestamp")]
    pub order_date_time: NaiveDateTime,
    pub record_type: RecordType,
    pub order_amount: f64,
    pub order_status: OrderStatus,
    pub ship_to_name: String,
    pub ship_to_address: String,
    pub ship_to_city: String,
    pub ship_to_state: String,
    pub ship_to_zip: String,
}

impl OrderLineRecord {
    /// The product key used to join against the reference catalog.
    ///
    /// The upstream producer writes the product id straight into `itemId`,
    /// so the mapping is an identity pass-through. Kept behind a method so a
    /// non-identity mapping only ever touches this one place.
    pub fn product_key(&self) -> i64 {
        self.item_id
    }
}

/// One row of the product reference catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub product_id: i64,
    pub product_name: String,
    pub product_price: f64,
}

/// Unique identity of an upsert target in the keyed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkKey {
    pub order_id: i64,
    pub item_id: i64,
}

impl fmt::Display for SinkKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.order_id, self.item_id)
    }
}

/// An order-line record joined against the product catalog.
///
/// Product fields are optional so that aggregate ORDER rows and the
/// emit-with-null-fields miss policy share one output schema with ITEM rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedRecord {
    pub order_id: i64,
    pub item_id: i64,
    pub item_quantity: i32,
    pub item_amount: f64,
    pub item_status: ItemStatus,
    #[serde(with = "timestamp")]
    pub order_date_time: NaiveDateTime,
    pub record_type: RecordType,
    pub order_amount: f64,
    pub order_status: OrderStatus,
    pub ship_to_name: String,
    pub ship_to_address: String,
    pub ship_to_city: String,
    pub ship_to_state: String,
    pub ship_to_zip: String,
    pub product_name: Option<String>,
    pub product_price: Option<f64>,
    pub line_total: Option<f64>,
}

impl EnrichedRecord {
    /// Join an ITEM record with its product row, deriving the line total.
    pub fn from_item(order: OrderLineRecord, product: &ProductRecord) -> Self {
        let line_total = f64::from(order.item_quantity) * product.product_price;
        Self {
            product_name: Some(product.product_name.clone()),
            product_price: Some(product.product_price),
            line_total: Some(line_total),
            ..Self::passthrough(order)
        }
    }

    /// Emit a record without product fields: ORDER aggregates, or ITEM rows
    /// under the emit-with-null-fields miss policy.
    pub fn passthrough(order: OrderLineRecord) -> Self {
        Self {
            order_id: order.order_id,
            item_id: order.item_id,
            item_quantity: order.item_quantity,
            item_amount: order.item_amount,
            item_status: order.item_status,
            order_date_time: order.order_date_time,
            record_type: order.record_type,
            order_amount: order.order_amount,
            order_status: order.order_status,
            ship_to_name: order.ship_to_name,
            ship_to_address: order.ship_to_address,
            ship_to_city: order.ship_to_city,
            ship_to_state: order.ship_to_state,
            ship_to_zip: order.ship_to_zip,
            product_name: None,
            product_price: None,
            line_total: None,
        }
    }

    pub fn sink_key(&self) -> SinkKey {
        SinkKey {
            order_id: self.order_id,
            item_id: self.item_id,
        }
    }

    /// Message key for partitioned transports; orders for one order id stay
    /// on one partition.
    pub fn key(&self) -> String {
        self.order_id.to_string()
    }
}
