//! Log store client
//!
//! Everything above this module talks to the store through the [`LogClient`]
//! trait. [`StoreClient`] implements it with an actor that owns the single
//! SQLite connection and serializes every command.

mod actor;
mod messages;

use std::time::Duration;

use async_trait::async_trait;
use logstore::{
    Delivery, Entry, EntryId, Fields, GroupInfo, PendingEntry, PendingQuery, PendingSummary, ReadFrom, StartPosition,
};

use crate::error::BusResult;

pub use actor::StoreClient;
pub use messages::LogCommand;

/// Async access to an append-only log with consumer groups
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Append an entry and return its store-assigned id
    async fn append(&self, stream: &str, fields: Fields) -> BusResult<EntryId>;

    /// Create a consumer group; fails with `GroupExists` when already present
    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> BusResult<()>;

    /// Read for a group member, waiting up to `block` for new entries when none are ready
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
        block: Option<Duration>,
    ) -> BusResult<Vec<Delivery>>;

    /// Acknowledge entries for a group
    async fn ack(&self, stream: &str, group: &str, ids: Vec<EntryId>) -> BusResult<usize>;

    /// Claim pending entries idle for at least `min_idle`, scanning from `start`
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> BusResult<(EntryId, Vec<Delivery>)>;

    /// The newest `count` entries, newest first
    async fn rev_range(&self, stream: &str, count: usize) -> BusResult<Vec<Entry>>;

    /// Groups registered on a stream
    async fn groups(&self, stream: &str) -> BusResult<Vec<GroupInfo>>;

    /// Aggregate pending state of a group
    async fn pending_summary(&self, stream: &str, group: &str) -> BusResult<PendingSummary>;

    /// Individual pending entries of a group
    async fn pending(&self, stream: &str, group: &str, query: PendingQuery) -> BusResult<Vec<PendingEntry>>;

    /// Release the underlying connection. Further calls fail with `ChannelClosed`.
    async fn close(&self) -> BusResult<()>;
}
