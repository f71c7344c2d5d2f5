//! Producer: stamps, encodes and appends events

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::client::LogClient;
use crate::error::{BusError, BusResult};
use crate::event::{CodecError, Event};

/// Publishes events onto one stream
///
/// Failures propagate to the caller; nothing is buffered or retried here.
#[derive(Clone)]
pub struct Producer {
    client: Arc<dyn LogClient>,
    stream: String,
}

impl Producer {
    pub fn new(client: Arc<dyn LogClient>, stream: impl Into<String>) -> Self {
        Self {
            client,
            stream: stream.into(),
        }
    }

    /// Publish an event and return its `event_id`
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        source: &str,
        event_type: &str,
        payload: &T,
        correlation_id: Option<&str>,
    ) -> BusResult<String> {
        debug!(%source, %event_type, ?correlation_id, "publish: called");
        if source.trim().is_empty() {
            return Err(BusError::InvalidArgument("source must not be empty".to_string()));
        }
        if event_type.trim().is_empty() {
            return Err(BusError::InvalidArgument("type must not be empty".to_string()));
        }

        let payload = serde_json::to_value(payload).map_err(CodecError::from)?;
        let event = Event::new(source, event_type, payload, correlation_id);
        self.publish_event(&event).await?;
        Ok(event.event_id)
    }

    /// Append an already stamped event
    pub async fn publish_event(&self, event: &Event) -> BusResult<()> {
        debug!(event_id = %event.event_id, "publish_event: called");
        let fields = event.to_fields()?;
        match self.client.append(&self.stream, fields).await {
            Ok(entry_id) => {
                info!(
                    event_id = %event.event_id,
                    %entry_id,
                    source = %event.source,
                    event_type = %event.event_type,
                    "Event published"
                );
                Ok(())
            }
            Err(e) => {
                error!(event_id = %event.event_id, error = %e, "Failed to publish event");
                Err(e)
            }
        }
    }
}
