//! Field-by-field extraction of raw JSON events into typed rows.
//!
//! Both input schemas are fixed: the order stream row and the product
//! reference row. Each field is pulled by its JSON path and coerced to its
//! declared SQL-like type (`INT`, `REAL`/`DOUBLE`, `VARCHAR(n)`, `TIMESTAMP`),
//! failing per field. Malformed records are never dropped here; the caller
//! decides between the dead-letter path and aborting the batch.

use std::str::FromStr;

use chrono::NaiveDateTime;
use serde_json::Value;
use thiserror::Error;

use crate::records::{
    OrderLineRecord, ParseEnumError, ProductRecord, TIMESTAMP_FORMAT,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field {field}: {reason}")]
pub struct SchemaError {
    pub field: &'static str,
    pub reason: String,
}

impl SchemaError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Map a raw order stream event to an `OrderLineRecord`.
///
/// Column declarations, in stream order:
/// `$.orderId INT`, `$.itemId INT`, `$.itemQuantity INT`, `$.itemAmount REAL`,
/// `$.itemStatus VARCHAR(8)`, `$.orderDateTime TIMESTAMP`,
/// `$.recordType VARCHAR(16)`, `$.orderAmount DOUBLE`,
/// `$.orderStatus VARCHAR(8)`, `$.shipToName VARCHAR(32)`,
/// `$.shipToAddress VARCHAR(32)`, `$.shipToCity VARCHAR(32)`,
/// `$.shipToState VARCHAR(16)`, `$.shipToZip VARCHAR(16)`.
pub fn map_order_line(raw: &Value) -> Result<OrderLineRecord, SchemaError> {
    Ok(OrderLineRecord {
        order_id: int_field(raw, "orderId")?,
        item_id: int_field(raw, "itemId")?,
        item_quantity: int32_field(raw, "itemQuantity")?,
        item_amount: real_field(raw, "itemAmount")?,
        item_status: enum_field(raw, "itemStatus")?,
        order_date_time: timestamp_field(raw, "orderDateTime")?,
        record_type: enum_field(raw, "recordType")?,
        order_amount: real_field(raw, "orderAmount")?,
        order_status: enum_field(raw, "orderStatus")?,
        ship_to_name: varchar_field(raw, "shipToName", 32)?,
        ship_to_address: varchar_field(raw, "shipToAddress", 32)?,
        ship_to_city: varchar_field(raw, "shipToCity", 32)?,
        ship_to_state: varchar_field(raw, "shipToState", 16)?,
        ship_to_zip: varchar_field(raw, "shipToZip", 16)?,
    })
}

/// Map one row of the product reference blob.
///
/// Column declarations: `$.productId INT`, `$.productName VARCHAR(32)`,
/// `$.productPrice REAL`.
pub fn map_product(raw: &Value) -> Result<ProductRecord, SchemaError> {
    Ok(ProductRecord {
        product_id: int_field(raw, "productId")?,
        product_name: varchar_field(raw, "productName", 32)?,
        product_price: real_field(raw, "productPrice")?,
    })
}

/// Decode raw bytes off the order stream and map them in one step.
pub fn parse_order_line(payload: &[u8]) -> Result<OrderLineRecord, SchemaError> {
    let raw: Value = serde_json::from_slice(payload)
        .map_err(|e| SchemaError::new("$", format!("invalid JSON: {e}")))?;
    map_order_line(&raw)
}

fn require<'a>(raw: &'a Value, field: &'static str) -> Result<&'a Value, SchemaError> {
    match raw.get(field) {
        Some(Value::Null) | None => Err(SchemaError::new(field, "required field is missing")),
        Some(value) => Ok(value),
    }
}

fn int_field(raw: &Value, field: &'static str) -> Result<i64, SchemaError> {
    let value = require(raw, field)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| SchemaError::new(field, format!("{n} is not a valid INT"))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| SchemaError::new(field, format!("'{s}' is not a valid INT"))),
        other => Err(SchemaError::new(
            field,
            format!("expected INT, got {other}"),
        )),
    }
}

fn int32_field(raw: &Value, field: &'static str) -> Result<i32, SchemaError> {
    let wide = int_field(raw, field)?;
    i32::try_from(wide).map_err(|_| SchemaError::new(field, format!("{wide} overflows INT")))
}

fn real_field(raw: &Value, field: &'static str) -> Result<f64, SchemaError> {
    let value = require(raw, field)?;
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| SchemaError::new(field, format!("{n} is not a valid REAL"))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| SchemaError::new(field, format!("'{s}' is not a valid REAL"))),
        other => Err(SchemaError::new(
            field,
            format!("expected REAL, got {other}"),
        )),
    }
}

fn varchar_field(raw: &Value, field: &'static str, width: usize) -> Result<String, SchemaError> {
    let value = require(raw, field)?;
    match value {
        // Over-width values are truncated, as a VARCHAR(n) column would.
        Value::String(s) => Ok(s.chars().take(width).collect()),
        other => Err(SchemaError::new(
            field,
            format!("expected VARCHAR({width}), got {other}"),
        )),
    }
}

fn timestamp_field(raw: &Value, field: &'static str) -> Result<NaiveDateTime, SchemaError> {
    let value = require(raw, field)?;
    match value {
        Value::String(s) => NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).map_err(|_| {
            SchemaError::new(
                field,
                format!("'{s}' does not match TIMESTAMP format {TIMESTAMP_FORMAT}"),
            )
        }),
        other => Err(SchemaError::new(
            field,
            format!("expected TIMESTAMP, got {other}"),
        )),
    }
}

fn enum_field<T>(raw: &Value, field: &'static str) -> Result<T, SchemaError>
where
    T: FromStr<Err = ParseEnumError>,
{
    let value = require(raw, field)?;
    match value {
        Value::String(s) => s
            .parse::<T>()
            .map_err(|e| SchemaError::new(field, e.to_string())),
        other => Err(SchemaError::new(
            field,
            format!("expected VARCHAR, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{ItemStatus, OrderStatus, RecordType};
    use serde_json::json;

    fn order_json() -> Value {
        json!({
            "orderId": 100,
            "itemId": 1,
            "itemQuantity": 3,
            "itemAmount": 29.97,
            "itemStatus": "PENDING",
            "orderDateTime": "2023-11-05 12:30:00",
            "recordType": "ITEM",
            "orderAmount": 29.97,
            "orderStatus": "PENDING",
            "shipToName": "Jess Doe",
            "shipToAddress": "1 Main St",
            "shipToCity": "Springfield",
            "shipToState": "OR",
            "shipToZip": "97477"
        })
    }

    #[test]
    fn test_map_order_line() {
        let record = map_order_line(&order_json()).unwrap();

        assert_eq!(record.order_id, 100);
        assert_eq!(record.item_quantity, 3);
        assert_eq!(record.item_status, ItemStatus::Pending);
        assert_eq!(record.record_type, RecordType::Item);
        assert_eq!(record.order_status, OrderStatus::Pending);
        assert_eq!(
            record.order_date_time.format(TIMESTAMP_FORMAT).to_string(),
            "2023-11-05 12:30:00"
        );
    }

    #[test]
    fn test_numeric_strings_coerce() {
        let mut raw = order_json();
        raw["orderId"] = json!("100");
        raw["itemAmount"] = json!("29.97");

        let record = map_order_line(&raw).unwrap();
        assert_eq!(record.order_id, 100);
        assert!((record.item_amount - 29.97).abs() < 1e-9);
    }

    #[test]
    fn test_missing_field_names_the_field() {
        let mut raw = order_json();
        raw.as_object_mut().unwrap().remove("itemQuantity");

        let err = map_order_line(&raw).unwrap_err();
        assert_eq!(err.field, "itemQuantity");
    }

    #[test]
    fn test_non_numeric_int_fails() {
        let mut raw = order_json();
        raw["orderId"] = json!("not-a-number");

        let err = map_order_line(&raw).unwrap_err();
        assert_eq!(err.field, "orderId");
    }

    #[test]
    fn test_bad_timestamp_fails() {
        let mut raw = order_json();
        raw["orderDateTime"] = json!("2023-11-05T12:30:00Z");

        let err = map_order_line(&raw).unwrap_err();
        assert_eq!(err.field, "orderDateTime");
    }

    #[test]
    fn test_unknown_enum_value_fails() {
        let mut raw = order_json();
        raw["recordType"] = json!("REFUND");

        let err = map_order_line(&raw).unwrap_err();
        assert_eq!(err.field, "recordType");
    }

    #[test]
    fn test_varchar_truncates_to_width() {
        let mut raw = order_json();
        raw["shipToName"] = json!("a name that is much longer than thirty-two characters");

        let record = map_order_line(&raw).unwrap();
        assert_eq!(record.ship_to_name.chars().count(), 32);
    }

    #[test]
    fn test_map_product() {
        let product = map_product(&json!({
            "productId": 1,
            "productName": "Widget",
            "productPrice": 9.99
        }))
        .unwrap();

        assert_eq!(product.product_id, 1);
        assert_eq!(product.product_name, "Widget");
        assert!((product.product_price - 9.99).abs() < 1e-9);
    }

    #[test]
    fn test_parse_order_line_rejects_invalid_json() {
        let err = parse_order_line(b"{not json").unwrap_err();
        assert_eq!(err.field, "$");
    }
}
