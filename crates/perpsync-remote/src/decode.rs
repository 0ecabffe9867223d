//! Record-by-record decoding of remote payloads.
//!
//! A malformed record is skipped and counted; its siblings are unaffected.
//! Only named-field objects are accepted: a positional tuple is schema drift
//! and is reported as a decode error rather than guessed at.

use perpsync_core::fixed::int_string;
use perpsync_core::{OrderId, SyncError, SyncResult};
use perpsync_telemetry::Metrics;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

/// Decode one named-field record.
pub fn decode_record<T: DeserializeOwned>(value: Value) -> SyncResult<T> {
    if !value.is_object() {
        return Err(SyncError::Decode(format!(
            "expected named-field record, got {}",
            shape(&value)
        )));
    }
    serde_json::from_value(value).map_err(SyncError::from)
}

/// Decode an array of records, skipping the ones that fail.
///
/// A payload that is not an array at all fails as a whole.
pub fn decode_records<T: DeserializeOwned>(
    resource: &'static str,
    value: Value,
) -> SyncResult<Vec<T>> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(SyncError::Decode(format!(
                "{resource}: expected array, got {}",
                shape(&other)
            )))
        }
    };

    let mut records = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        match decode_record(item) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(resource, idx, error = %e, "Skipping undecodable record");
                Metrics::decode_skipped(resource);
            }
        }
    }
    Ok(records)
}

/// Decode an order id list. Ids may arrive as numbers or integer strings.
pub fn decode_ids(value: Value) -> SyncResult<Vec<OrderId>> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(SyncError::Decode(format!(
                "order ids: expected array, got {}",
                shape(&other)
            )))
        }
    };

    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let parsed = match &item {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => int_string::parse_int(s)
                .ok()
                .and_then(|v| u64::try_from(v).ok()),
            _ => None,
        };
        match parsed {
            Some(id) => ids.push(OrderId(id)),
            None => {
                warn!(value = %item, "Skipping undecodable order id");
                Metrics::decode_skipped("order-ids");
            }
        }
    }
    Ok(ids)
}

/// Decode a single integer-encoded scalar.
pub fn decode_int(value: &Value) -> SyncResult<i128> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .ok_or_else(|| SyncError::Decode(format!("integer out of range: {n}"))),
        Value::String(s) => int_string::parse_int(s).map_err(SyncError::Decode),
        other => Err(SyncError::Decode(format!(
            "expected integer, got {}",
            shape(other)
        ))),
    }
}

fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "positional tuple",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpsync_core::RawPosition;
    use serde_json::json;

    #[test]
    fn test_bad_record_is_skipped_siblings_kept() {
        let payload = json!([
            {"marketId": "ETH", "signedSize": "1000000000000000000", "entryPrice": "100000000", "marginLocked": "10000000"},
            {"marketId": "BTC", "signedSize": "not-a-number", "entryPrice": "1", "marginLocked": "1"},
            ["SOL", "1", "1", "1"],
            {"marketId": "ARB", "signedSize": "-5", "entryPrice": "1000000", "marginLocked": "1000000"}
        ]);
        let positions: Vec<RawPosition> = decode_records("positions", payload).unwrap();
        let markets: Vec<&str> = positions.iter().map(|p| p.market_id.as_str()).collect();
        assert_eq!(markets, vec!["eth", "arb"]);
    }

    #[test]
    fn test_positional_tuple_is_decode_error() {
        let err = decode_record::<RawPosition>(json!(["ETH", "1", "1", "1"])).unwrap_err();
        assert!(matches!(err, SyncError::Decode(msg) if msg.contains("positional tuple")));
    }

    #[test]
    fn test_non_array_payload_fails_whole() {
        assert!(decode_records::<RawPosition>("positions", json!({"a": 1})).is_err());
    }

    #[test]
    fn test_ids_accept_numbers_and_strings() {
        let ids = decode_ids(json!([1, "2", "0x10", -3, null])).unwrap();
        assert_eq!(ids, vec![OrderId(1), OrderId(2), OrderId(16)]);
    }

    #[test]
    fn test_decode_int() {
        assert_eq!(decode_int(&json!("1000000000000000000000")).unwrap(), 10i128.pow(21));
        assert_eq!(decode_int(&json!(42)).unwrap(), 42);
        assert!(decode_int(&json!(true)).is_err());
    }
}
