//! Store client messages
//!
//! Commands sent to the actor that owns the store connection.

use std::time::Duration;

use logstore::{
    Delivery, Entry, EntryId, Fields, GroupInfo, PendingEntry, PendingQuery, PendingSummary, ReadFrom, StartPosition,
    StoreResult,
};
use tokio::sync::oneshot;

/// Reply channel for a store command
pub type Reply<T> = oneshot::Sender<StoreResult<T>>;

/// Commands sent to the store actor
#[derive(Debug)]
pub enum LogCommand {
    Append {
        stream: String,
        fields: Fields,
        reply: Reply<EntryId>,
    },
    CreateGroup {
        stream: String,
        group: String,
        start: StartPosition,
        reply: Reply<()>,
    },
    ReadGroup {
        stream: String,
        group: String,
        consumer: String,
        count: usize,
        from: ReadFrom,
        reply: Reply<Vec<Delivery>>,
    },
    Ack {
        stream: String,
        group: String,
        ids: Vec<EntryId>,
        reply: Reply<usize>,
    },
    AutoClaim {
        stream: String,
        group: String,
        consumer: String,
        min_idle: Duration,
        start: EntryId,
        count: usize,
        reply: Reply<(EntryId, Vec<Delivery>)>,
    },
    RevRange {
        stream: String,
        count: usize,
        reply: Reply<Vec<Entry>>,
    },
    Groups {
        stream: String,
        reply: Reply<Vec<GroupInfo>>,
    },
    PendingSummary {
        stream: String,
        group: String,
        reply: Reply<PendingSummary>,
    },
    Pending {
        stream: String,
        group: String,
        query: PendingQuery,
        reply: Reply<Vec<PendingEntry>>,
    },

    // Shutdown; the reply fires after the connection is dropped
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
