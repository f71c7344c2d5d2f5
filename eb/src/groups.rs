//! Consumer group registry

use std::sync::Arc;

use logstore::{GroupInfo, StartPosition};
use tracing::{debug, error, info};

use crate::client::LogClient;
use crate::error::{BusError, BusResult};

/// Creates and lists consumer groups on one stream
#[derive(Clone)]
pub struct GroupRegistry {
    client: Arc<dyn LogClient>,
    stream: String,
}

impl GroupRegistry {
    pub fn new(client: Arc<dyn LogClient>, stream: impl Into<String>) -> Self {
        Self {
            client,
            stream: stream.into(),
        }
    }

    /// Make sure a group exists, starting at the stream tail when newly created
    pub async fn ensure_group(&self, name: &str) -> BusResult<()> {
        self.ensure_group_at(name, StartPosition::Latest).await
    }

    /// Make sure a group exists. An existing group keeps its cursor.
    pub async fn ensure_group_at(&self, name: &str, start: StartPosition) -> BusResult<()> {
        debug!(stream = %self.stream, group = %name, ?start, "ensure_group_at: called");
        if name.trim().is_empty() {
            return Err(BusError::InvalidArgument("group name must not be empty".to_string()));
        }

        match self.client.create_group(&self.stream, name, start).await {
            Ok(()) => {
                info!(stream = %self.stream, group = %name, ?start, "Consumer group created");
                Ok(())
            }
            Err(e) if e.is_group_exists() => {
                debug!(stream = %self.stream, group = %name, "ensure_group_at: group already exists");
                Ok(())
            }
            Err(e) => {
                error!(stream = %self.stream, group = %name, error = %e, "Failed to create consumer group");
                Err(e)
            }
        }
    }

    /// Groups registered on the stream
    pub async fn list_groups(&self) -> BusResult<Vec<GroupInfo>> {
        debug!(stream = %self.stream, "list_groups: called");
        self.client.groups(&self.stream).await
    }
}
