//! Event schema and wire codec
//!
//! Every stream entry carries the same six string fields, in this order:
//! `event_id`, `source`, `type`, `payload`, `timestamp`, `correlation_id`.
//! The payload travels as JSON text and `correlation_id` is `""` when absent.

use chrono::{SecondsFormat, Utc};
use logstore::{Fields, field};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const FIELD_EVENT_ID: &str = "event_id";
pub const FIELD_SOURCE: &str = "source";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_CORRELATION_ID: &str = "correlation_id";

/// Optional field naming the wire schema version. Absent means version 1.
pub const FIELD_SCHEMA_VERSION: &str = "schema_version";

/// The only wire schema version this crate reads and writes
pub const SCHEMA_VERSION: &str = "1";

const SUFFIX_LEN: usize = 9;
const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Errors converting between events and their wire form
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unsupported schema version: {0}")]
    UnsupportedVersion(String),
}

/// The unit of transfer between producers and consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: String,
    pub correlation_id: String,
}

impl Event {
    /// Stamp a new event with a fresh id and the current time
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        correlation_id: Option<&str>,
    ) -> Self {
        Self {
            event_id: generate_event_id(),
            source: source.into(),
            event_type: event_type.into(),
            payload,
            timestamp: timestamp_now(),
            correlation_id: correlation_id.unwrap_or_default().to_string(),
        }
    }

    /// The correlation id, or None for the empty sentinel
    pub fn correlation(&self) -> Option<&str> {
        if self.correlation_id.is_empty() {
            None
        } else {
            Some(&self.correlation_id)
        }
    }

    /// Deserialize the payload into a concrete type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Encode into the fixed-arity wire fields
    pub fn to_fields(&self) -> Result<Fields, CodecError> {
        Ok(vec![
            (FIELD_EVENT_ID.to_string(), self.event_id.clone()),
            (FIELD_SOURCE.to_string(), self.source.clone()),
            (FIELD_TYPE.to_string(), self.event_type.clone()),
            (FIELD_PAYLOAD.to_string(), encode_payload(&self.payload)?),
            (FIELD_TIMESTAMP.to_string(), self.timestamp.clone()),
            (FIELD_CORRELATION_ID.to_string(), self.correlation_id.clone()),
        ])
    }

    /// Decode from wire fields
    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, CodecError> {
        if let Some(version) = field(fields, FIELD_SCHEMA_VERSION) {
            if version != SCHEMA_VERSION {
                return Err(CodecError::UnsupportedVersion(version.to_string()));
            }
        }
        let required = |name: &'static str| field(fields, name).ok_or(CodecError::MissingField(name));
        Ok(Self {
            event_id: required(FIELD_EVENT_ID)?.to_string(),
            source: required(FIELD_SOURCE)?.to_string(),
            event_type: required(FIELD_TYPE)?.to_string(),
            payload: decode_payload(required(FIELD_PAYLOAD)?)?,
            timestamp: required(FIELD_TIMESTAMP)?.to_string(),
            correlation_id: field(fields, FIELD_CORRELATION_ID).unwrap_or_default().to_string(),
        })
    }
}

/// Serialize an application payload to its transport string
pub fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(payload)?)
}

/// Parse a transport string back into a structured payload
pub fn decode_payload(raw: &str) -> Result<Value, CodecError> {
    Ok(serde_json::from_str(raw)?)
}

/// Generate an event id of the form `{unixMillis}-{randomSuffix}`
pub fn generate_event_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", Utc::now().timestamp_millis(), suffix)
}

/// Current time as ISO-8601 with millisecond precision, e.g. `2024-05-01T12:00:00.000Z`
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn wire(pairs: &[(&str, &str)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_event_id_format() {
        let id = generate_event_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().unwrap() > 1_600_000_000_000);
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_event_ids_do_not_collide() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_event_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_timestamp_is_iso8601_utc_millis() {
        let ts = timestamp_now();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2024-05-01T12:00:00.000Z".len());
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn test_wire_fields_are_fixed_and_ordered() {
        let event = Event::new("gateway", "message", json!({"update_id": 42}), None);
        let fields = event.to_fields().unwrap();
        let names: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec!["event_id", "source", "type", "payload", "timestamp", "correlation_id"]
        );
        assert_eq!(field(&fields, "payload"), Some(r#"{"update_id":42}"#));
        assert_eq!(field(&fields, "correlation_id"), Some(""));
    }

    #[test]
    fn test_correlation_sentinel() {
        let with = Event::new("s", "t", Value::Null, Some("abc-123"));
        assert_eq!(with.correlation(), Some("abc-123"));
        let without = Event::new("s", "t", Value::Null, None);
        assert_eq!(without.correlation_id, "");
        assert_eq!(without.correlation(), None);
    }

    #[test]
    fn test_decode_from_foreign_producer() {
        let fields = wire(&[
            ("event_id", "1714564800000-abcdefghi"),
            ("source", "webhook:telegram"),
            ("type", "message"),
            ("payload", r#"{"update_id":42,"text":"hi"}"#),
            ("timestamp", "2024-05-01T12:00:00.000Z"),
            ("correlation_id", "42"),
        ]);
        let event = Event::from_fields(&fields).unwrap();
        assert_eq!(event.event_type, "message");
        assert_eq!(event.payload["update_id"], 42);
        assert_eq!(event.correlation(), Some("42"));
    }

    #[test]
    fn test_decode_missing_correlation_is_empty() {
        let fields = wire(&[
            ("event_id", "1-a"),
            ("source", "s"),
            ("type", "t"),
            ("payload", "null"),
            ("timestamp", "2024-05-01T12:00:00.000Z"),
        ]);
        assert_eq!(Event::from_fields(&fields).unwrap().correlation_id, "");
    }

    #[test]
    fn test_decode_missing_required_field() {
        let fields = wire(&[("event_id", "1-a"), ("source", "s"), ("payload", "{}")]);
        match Event::from_fields(&fields) {
            Err(CodecError::MissingField(name)) => assert_eq!(name, "type"),
            other => panic!("Expected MissingField, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_payload() {
        let fields = wire(&[
            ("event_id", "1-a"),
            ("source", "s"),
            ("type", "t"),
            ("payload", "{not json"),
            ("timestamp", "x"),
        ]);
        assert!(matches!(Event::from_fields(&fields), Err(CodecError::Payload(_))));
    }

    #[test]
    fn test_schema_version_checked() {
        let mut fields = wire(&[
            ("event_id", "1-a"),
            ("source", "s"),
            ("type", "t"),
            ("payload", "1"),
            ("timestamp", "x"),
            ("correlation_id", ""),
        ]);
        fields.push(("schema_version".to_string(), "1".to_string()));
        assert!(Event::from_fields(&fields).is_ok());

        fields.pop();
        fields.push(("schema_version".to_string(), "2".to_string()));
        assert!(matches!(
            Event::from_fields(&fields),
            Err(CodecError::UnsupportedVersion(v)) if v == "2"
        ));
    }

    #[test]
    fn test_payload_as_typed() {
        #[derive(Deserialize)]
        struct Update {
            update_id: u64,
        }
        let event = Event::new("s", "t", json!({"update_id": 7}), None);
        assert_eq!(event.payload_as::<Update>().unwrap().update_id, 7);
        assert!(event.payload_as::<Vec<String>>().is_err());
    }

    #[test]
    fn test_encode_payload_string_is_json_text() {
        assert_eq!(encode_payload("hi").unwrap(), "\"hi\"");
        assert_eq!(decode_payload("\"hi\"").unwrap(), json!("hi"));
    }
}
