//! Dead-letter sink for entries that cannot be processed

use std::fmt;
use std::sync::Arc;

use logstore::{Delivery, EntryId};
use tracing::{debug, info, warn};

use crate::client::LogClient;
use crate::error::BusResult;
use crate::event::timestamp_now;

pub const FIELD_REASON: &str = "dead_letter_reason";
pub const FIELD_ORIGINAL_ENTRY_ID: &str = "original_entry_id";
pub const FIELD_ORIGINAL_GROUP: &str = "original_group";
pub const FIELD_DELIVERY_COUNT: &str = "delivery_count";
pub const FIELD_DEAD_LETTERED_AT: &str = "dead_lettered_at";

/// How many of the newest dead letters are checked for an earlier copy
const DEDUP_WINDOW: usize = 256;

/// Why an entry was taken out of normal processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Delivered more times than allowed
    MaxDeliveries(u32),
    /// Fields could not be decoded into an event
    Decode(String),
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::MaxDeliveries(max) => write!(f, "max_deliveries exceeded ({})", max),
            DeadLetterReason::Decode(err) => write!(f, "decode: {}", err),
        }
    }
}

/// Appends dead letters to a dedicated stream
#[derive(Clone)]
pub struct DeadLetterSink {
    client: Arc<dyn LogClient>,
    stream: String,
}

impl DeadLetterSink {
    pub fn new(client: Arc<dyn LogClient>, stream: impl Into<String>) -> Self {
        Self {
            client,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Find a recent dead letter already written for this group's entry
    pub async fn find(&self, group: &str, original: EntryId) -> BusResult<Option<EntryId>> {
        debug!(stream = %self.stream, %group, %original, "find: called");
        let original = original.to_string();
        let recent = self.client.rev_range(&self.stream, DEDUP_WINDOW).await?;
        Ok(recent
            .into_iter()
            .find(|e| {
                e.get(FIELD_ORIGINAL_ENTRY_ID) == Some(original.as_str()) && e.get(FIELD_ORIGINAL_GROUP) == Some(group)
            })
            .map(|e| e.id))
    }

    /// Copy the delivery's original fields plus diagnostics onto the dead-letter stream
    ///
    /// An entry whose earlier dead letter was written but never acked is not
    /// copied a second time; the existing dead-letter id is returned.
    pub async fn send(&self, group: &str, delivery: &Delivery, reason: &DeadLetterReason) -> BusResult<EntryId> {
        debug!(stream = %self.stream, %group, entry_id = %delivery.entry.id, %reason, "send: called");
        if let Some(existing) = self.find(group, delivery.entry.id).await? {
            info!(
                stream = %self.stream,
                %group,
                original_entry_id = %delivery.entry.id,
                entry_id = %existing,
                "Entry already dead-lettered"
            );
            return Ok(existing);
        }

        let mut fields = delivery.entry.fields.clone();
        fields.extend([
            (FIELD_REASON.to_string(), reason.to_string()),
            (FIELD_ORIGINAL_ENTRY_ID.to_string(), delivery.entry.id.to_string()),
            (FIELD_ORIGINAL_GROUP.to_string(), group.to_string()),
            (FIELD_DELIVERY_COUNT.to_string(), delivery.delivery_count.to_string()),
            (FIELD_DEAD_LETTERED_AT.to_string(), timestamp_now()),
        ]);

        let entry_id = self.client.append(&self.stream, fields).await?;
        warn!(
            stream = %self.stream,
            %group,
            original_entry_id = %delivery.entry.id,
            %entry_id,
            %reason,
            "Entry dead-lettered"
        );
        Ok(entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StoreClient;
    use logstore::{Entry, field};
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_preserves_original_fields() {
        let client: Arc<dyn LogClient> = Arc::new(StoreClient::open_in_memory(Duration::from_millis(10)).unwrap());
        let sink = DeadLetterSink::new(client.clone(), "events:dead");
        let delivery = Delivery {
            entry: Entry {
                id: EntryId::new(1700000000000, 3),
                fields: vec![("event_id".to_string(), "1-abc".to_string())],
            },
            delivery_count: 6,
        };

        sink.send("gateway", &delivery, &DeadLetterReason::MaxDeliveries(5))
            .await
            .unwrap();

        let entries = client.rev_range("events:dead", 1).await.unwrap();
        let fields = &entries[0].fields;
        assert_eq!(field(fields, "event_id"), Some("1-abc"));
        assert_eq!(field(fields, FIELD_ORIGINAL_ENTRY_ID), Some("1700000000000-3"));
        assert_eq!(field(fields, FIELD_ORIGINAL_GROUP), Some("gateway"));
        assert_eq!(field(fields, FIELD_DELIVERY_COUNT), Some("6"));
        assert_eq!(field(fields, FIELD_REASON), Some("max_deliveries exceeded (5)"));
        assert!(field(fields, FIELD_DEAD_LETTERED_AT).is_some());
    }

    #[tokio::test]
    async fn test_resend_reuses_existing_dead_letter() {
        let client: Arc<dyn LogClient> = Arc::new(StoreClient::open_in_memory(Duration::from_millis(10)).unwrap());
        let sink = DeadLetterSink::new(client.clone(), "events:dead");
        let delivery = |seq, count| Delivery {
            entry: Entry {
                id: EntryId::new(1700000000000, seq),
                fields: vec![("event_id".to_string(), format!("1-{}", seq))],
            },
            delivery_count: count,
        };
        let reason = DeadLetterReason::MaxDeliveries(5);

        let first = sink.send("gateway", &delivery(1, 6), &reason).await.unwrap();
        let again = sink.send("gateway", &delivery(1, 7), &reason).await.unwrap();
        assert_eq!(first, again);

        // Same entry in another group, and another entry, are separate dead letters
        let other_group = sink.send("audit", &delivery(1, 6), &reason).await.unwrap();
        let other_entry = sink.send("gateway", &delivery(2, 6), &reason).await.unwrap();
        assert_ne!(first, other_group);
        assert_ne!(first, other_entry);
        assert_eq!(client.rev_range("events:dead", 10).await.unwrap().len(), 3);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            DeadLetterReason::Decode("Missing field: type".to_string()).to_string(),
            "decode: Missing field: type"
        );
    }
}
