use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::ErrorKind;
use crate::stream::StreamError;

/// A record that exhausted its policy-defined handling, with enough context
/// to triage it offline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub payload: Value,
    pub error_kind: ErrorKind,
    pub error: String,
    pub attempt_count: u32,
}

impl DeadLetter {
    pub fn new(
        payload: Value,
        error_kind: ErrorKind,
        error: impl Into<String>,
        attempt_count: u32,
    ) -> Self {
        Self {
            payload,
            error_kind,
            error: error.into(),
            attempt_count,
        }
    }

    /// Wrap raw stream bytes. Bytes that do not decode as JSON are carried
    /// as a lossy string so nothing is silently dropped.
    pub fn from_raw(
        payload: &[u8],
        error_kind: ErrorKind,
        error: impl Into<String>,
        attempt_count: u32,
    ) -> Self {
        let payload = serde_json::from_slice(payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()));
        Self::new(payload, error_kind, error, attempt_count)
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> Result<(), StreamError>;
}

/// In-memory dead-letter sink used by tests and local runs.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .expect("poisoned MemoryDeadLetterSink mutex")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.letters
            .lock()
            .expect("poisoned MemoryDeadLetterSink mutex")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), StreamError> {
        self.letters
            .lock()
            .expect("poisoned MemoryDeadLetterSink mutex")
            .push(letter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dead_letter_round_trip() {
        let sink = MemoryDeadLetterSink::new();
        sink.send(DeadLetter::new(
            json!({"orderId": 100}),
            ErrorKind::LookupMiss,
            "no product 99",
            3,
        ))
        .await
        .unwrap();

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error_kind, ErrorKind::LookupMiss);
        assert_eq!(letters[0].attempt_count, 3);
    }

    #[test]
    fn test_from_raw_keeps_unparseable_bytes() {
        let letter = DeadLetter::from_raw(b"{not json", ErrorKind::Schema, "bad", 1);
        assert_eq!(letter.payload, Value::String("{not json".to_string()));

        let letter = DeadLetter::from_raw(b"{\"a\":1}", ErrorKind::Schema, "bad", 1);
        assert_eq!(letter.payload, json!({"a": 1}));
    }

    #[test]
    fn test_error_kind_serializes_verbatim() {
        let letter = DeadLetter::new(json!({}), ErrorKind::LookupMiss, "x", 3);
        let json = serde_json::to_value(&letter).unwrap();
        assert_eq!(json["errorKind"], "LookupMiss");
        assert_eq!(json["attemptCount"], 3);
    }
}
