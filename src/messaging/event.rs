use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::context::{HEADER_MESSAGE_ID, HEADER_TIMESTAMP};

// ============================================================================
// Event envelope
// ============================================================================

/// Broker position of a consumed event, used for manual commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTag {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Handler attempts made so far. Only the consumer loop increments it.
    #[serde(default)]
    pub attempt: u32,
    #[serde(skip)]
    pub delivery: Option<DeliveryTag>,
}

impl Event {
    /// Builds the envelope a backend hands to the consumer loop. The id comes
    /// from the `message_id` header when the producer set one.
    pub fn received(
        topic: impl Into<String>,
        key: Option<String>,
        payload: Vec<u8>,
        headers: IndexMap<String, String>,
        delivery: Option<DeliveryTag>,
    ) -> Self {
        let id = headers
            .get(HEADER_MESSAGE_ID)
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            id,
            topic: topic.into(),
            key,
            payload,
            headers,
            attempt: 0,
            delivery,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Publish time from the `timestamp` header (unix nanoseconds).
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        let nanos: i64 = self.header(HEADER_TIMESTAMP)?.parse().ok()?;
        Some(DateTime::from_timestamp_nanos(nanos))
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> crate::error::Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| crate::error::Error::PermanentDecode(format!("{}: {}", self.topic, e)))
    }
}

/// Payload of a message on the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_message: Event,
    pub error: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(original_message: Event, error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            original_message,
            error: error.into(),
            retry_count,
            timestamp: Utc::now(),
        }
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_received_uses_message_id_header() {
        let mut headers = IndexMap::new();
        headers.insert(HEADER_MESSAGE_ID.to_string(), "msg-1".to_string());
        headers.insert(HEADER_TIMESTAMP.to_string(), "1700000000000000000".to_string());

        let event = Event::received("product-events", None, b"{}".to_vec(), headers, None);

        assert_eq!(event.id, "msg-1");
        assert_eq!(event.attempt, 0);
        assert_eq!(event.published_at().map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_dead_letter_record_wire_shape() {
        let mut event = Event::received("orders", Some("k".into()), b"hello".to_vec(), IndexMap::new(), None);
        event.attempt = 3;
        let record = DeadLetterRecord::new(event, "boom", 3);

        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["error"], "boom");
        assert_eq!(json["retry_count"], 3);
        assert_eq!(json["original_message"]["payload"], "aGVsbG8=");
        assert_eq!(json["original_message"]["attempt"], 3);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_decode_failure_is_permanent() {
        let event = Event::received("orders", None, b"not json".to_vec(), IndexMap::new(), None);
        let result: crate::error::Result<serde_json::Value> = event.decode();
        assert!(matches!(result, Err(crate::error::Error::PermanentDecode(_))));
    }
}
