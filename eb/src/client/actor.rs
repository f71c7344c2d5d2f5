//! Store client actor
//!
//! One blocking task owns the `logstore::Store` and processes commands in
//! arrival order. Cloned handles share that task.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use logstore::{
    Delivery, Entry, EntryId, Fields, GroupInfo, PendingEntry, PendingQuery, PendingSummary, ReadFrom, StartPosition,
    Store,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use super::LogClient;
use super::messages::{LogCommand, Reply};
use crate::error::{BusError, BusResult};

/// Handle to the store actor
///
/// Appends made through any handle wake blocking reads immediately. Appends made
/// by other processes on the same database file are picked up by re-polling
/// every `poll_interval`.
#[derive(Clone)]
pub struct StoreClient {
    tx: mpsc::Sender<LogCommand>,
    appended: watch::Receiver<u64>,
    poll_interval: Duration,
}

impl StoreClient {
    /// Spawn the actor around an open store. Must be called within a tokio runtime.
    pub fn spawn(store: Store, poll_interval: Duration) -> Self {
        debug!(?poll_interval, "StoreClient::spawn: called");
        let (tx, rx) = mpsc::channel(256);
        let (appended_tx, appended) = watch::channel(0u64);

        tokio::task::spawn_blocking(move || actor_loop(store, rx, appended_tx));

        info!("StoreClient spawned");
        Self {
            tx,
            appended,
            poll_interval,
        }
    }

    /// Open (or create) a database file and spawn the actor
    pub fn open(path: impl AsRef<Path>, poll_interval: Duration) -> BusResult<Self> {
        debug!(path = %path.as_ref().display(), "StoreClient::open: called");
        let store = Store::open(path)?;
        Ok(Self::spawn(store, poll_interval))
    }

    /// Spawn the actor around a private in-memory store
    pub fn open_in_memory(poll_interval: Duration) -> BusResult<Self> {
        debug!("StoreClient::open_in_memory: called");
        let store = Store::open_in_memory()?;
        Ok(Self::spawn(store, poll_interval))
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> LogCommand) -> BusResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| BusError::ChannelClosed)?;
        let result = reply_rx.await.map_err(|_| BusError::ChannelClosed)?;
        Ok(result?)
    }
}

#[async_trait]
impl LogClient for StoreClient {
    async fn append(&self, stream: &str, fields: Fields) -> BusResult<EntryId> {
        debug!(%stream, field_count = fields.len(), "append: called");
        self.request(|reply| LogCommand::Append {
            stream: stream.to_string(),
            fields,
            reply,
        })
        .await
    }

    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> BusResult<()> {
        debug!(%stream, %group, ?start, "create_group: called");
        self.request(|reply| LogCommand::CreateGroup {
            stream: stream.to_string(),
            group: group.to_string(),
            start,
            reply,
        })
        .await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
        block: Option<Duration>,
    ) -> BusResult<Vec<Delivery>> {
        debug!(%stream, %group, %consumer, count, ?from, ?block, "read_group: called");
        let deadline = block.map(|b| Instant::now() + b);
        let mut appended = self.appended.clone();

        loop {
            // Mark the current append count as seen before reading so an append
            // racing with the read still wakes the wait below.
            appended.borrow_and_update();

            let batch = self
                .request(|reply| LogCommand::ReadGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                    consumer: consumer.to_string(),
                    count,
                    from,
                    reply,
                })
                .await?;

            if !batch.is_empty() || matches!(from, ReadFrom::Pending(_)) {
                return Ok(batch);
            }
            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }

            let wait = (deadline - now).min(self.poll_interval);
            match tokio::time::timeout(wait, appended.changed()).await {
                Ok(Ok(())) | Err(_) => continue,
                Ok(Err(_)) => return Err(BusError::ChannelClosed),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: Vec<EntryId>) -> BusResult<usize> {
        debug!(%stream, %group, count = ids.len(), "ack: called");
        self.request(|reply| LogCommand::Ack {
            stream: stream.to_string(),
            group: group.to_string(),
            ids,
            reply,
        })
        .await
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> BusResult<(EntryId, Vec<Delivery>)> {
        debug!(%stream, %group, %consumer, ?min_idle, %start, count, "auto_claim: called");
        self.request(|reply| LogCommand::AutoClaim {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            min_idle,
            start,
            count,
            reply,
        })
        .await
    }

    async fn rev_range(&self, stream: &str, count: usize) -> BusResult<Vec<Entry>> {
        debug!(%stream, count, "rev_range: called");
        self.request(|reply| LogCommand::RevRange {
            stream: stream.to_string(),
            count,
            reply,
        })
        .await
    }

    async fn groups(&self, stream: &str) -> BusResult<Vec<GroupInfo>> {
        debug!(%stream, "groups: called");
        self.request(|reply| LogCommand::Groups {
            stream: stream.to_string(),
            reply,
        })
        .await
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> BusResult<PendingSummary> {
        debug!(%stream, %group, "pending_summary: called");
        self.request(|reply| LogCommand::PendingSummary {
            stream: stream.to_string(),
            group: group.to_string(),
            reply,
        })
        .await
    }

    async fn pending(&self, stream: &str, group: &str, query: PendingQuery) -> BusResult<Vec<PendingEntry>> {
        debug!(%stream, %group, ?query, "pending: called");
        self.request(|reply| LogCommand::Pending {
            stream: stream.to_string(),
            group: group.to_string(),
            query,
            reply,
        })
        .await
    }

    async fn close(&self) -> BusResult<()> {
        debug!("close: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Shutdown { reply: reply_tx }).await.is_err() {
            debug!("close: actor already stopped");
            return Ok(());
        }
        let _ = reply_rx.await;
        info!("StoreClient closed");
        Ok(())
    }
}

fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<LogCommand>, appended: watch::Sender<u64>) {
    debug!("actor_loop: called");

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            LogCommand::Append { stream, fields, reply } => {
                let result = store.append(&stream, &fields);
                if result.is_ok() {
                    appended.send_modify(|n| *n = n.wrapping_add(1));
                }
                let _ = reply.send(result);
            }

            LogCommand::CreateGroup {
                stream,
                group,
                start,
                reply,
            } => {
                let _ = reply.send(store.create_group(&stream, &group, start));
            }

            LogCommand::ReadGroup {
                stream,
                group,
                consumer,
                count,
                from,
                reply,
            } => {
                let _ = reply.send(store.read_group(&stream, &group, &consumer, count, from));
            }

            LogCommand::Ack {
                stream,
                group,
                ids,
                reply,
            } => {
                let _ = reply.send(store.ack(&stream, &group, &ids));
            }

            LogCommand::AutoClaim {
                stream,
                group,
                consumer,
                min_idle,
                start,
                count,
                reply,
            } => {
                let _ = reply.send(store.auto_claim(&stream, &group, &consumer, min_idle, start, count));
            }

            LogCommand::RevRange { stream, count, reply } => {
                let _ = reply.send(store.rev_range(&stream, count));
            }

            LogCommand::Groups { stream, reply } => {
                let _ = reply.send(store.groups(&stream));
            }

            LogCommand::PendingSummary { stream, group, reply } => {
                let _ = reply.send(store.pending_summary(&stream, &group));
            }

            LogCommand::Pending {
                stream,
                group,
                query,
                reply,
            } => {
                let _ = reply.send(store.pending(&stream, &group, &query));
            }

            LogCommand::Shutdown { reply } => {
                info!("StoreClient actor shutting down");
                drop(store);
                let _ = reply.send(());
                return;
            }
        }
    }

    debug!("actor_loop: all handles dropped");
}
