//! Broker: the owner of the store client and every running consumer loop
//!
//! Collaborating services hold one `Broker` per process and use only
//! [`Broker::publish`], [`Broker::subscribe`] and [`Broker::history`].

use std::collections::HashMap;
use std::collections::hash_map::Entry as HashEntry;
use std::sync::Arc;

use logstore::{GroupInfo, PendingEntry, PendingQuery, PendingSummary, StartPosition};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{LogClient, StoreClient};
use crate::config::Config;
use crate::consumer::{ConsumerLoop, ConsumerStats, EventHandler, consumer_name};
use crate::error::{BusError, BusResult};
use crate::event::Event;
use crate::groups::GroupRegistry;
use crate::producer::Producer;

struct SubscriptionTask {
    group: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<BusResult<ConsumerStats>>,
}

type Tasks = Arc<Mutex<HashMap<String, SubscriptionTask>>>;

async fn finish(consumer: &str, task: SubscriptionTask) -> BusResult<ConsumerStats> {
    debug!(%consumer, group = %task.group, "finish: called");
    let _ = task.stop.send(true);
    task.handle
        .await
        .map_err(|e| BusError::Task(format!("consumer {}: {}", consumer, e)))?
}

/// Handle to a running consumer loop
pub struct Subscription {
    group: String,
    consumer: String,
    tasks: Tasks,
}

impl Subscription {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Signal the loop, wait for its in-flight batch, and return its counters.
    /// Returns zeroed counters if the broker already closed it.
    pub async fn stop(self) -> BusResult<ConsumerStats> {
        debug!(group = %self.group, consumer = %self.consumer, "Subscription::stop: called");
        let task = self.tasks.lock().await.remove(&self.consumer);
        match task {
            Some(task) => finish(&self.consumer, task).await,
            None => Ok(ConsumerStats::default()),
        }
    }
}

/// Event distribution entry point
pub struct Broker {
    client: Arc<dyn LogClient>,
    config: Config,
    producer: Producer,
    registry: GroupRegistry,
    tasks: Tasks,
}

impl Broker {
    /// Open the configured database file and spawn the store client
    pub fn open(config: &Config) -> BusResult<Self> {
        debug!(path = %config.store.path.display(), "Broker::open: called");
        config
            .validate()
            .map_err(|e| BusError::InvalidArgument(e.to_string()))?;
        let client = StoreClient::open(&config.store.path, config.consumer.poll_interval())?;
        info!(path = %config.store.path.display(), stream = %config.store.stream, "Broker opened");
        Ok(Self::with_client(Arc::new(client), config))
    }

    /// Broker over a private in-memory store
    pub fn open_in_memory(config: &Config) -> BusResult<Self> {
        debug!("Broker::open_in_memory: called");
        config
            .validate()
            .map_err(|e| BusError::InvalidArgument(e.to_string()))?;
        let client = StoreClient::open_in_memory(config.consumer.poll_interval())?;
        Ok(Self::with_client(Arc::new(client), config))
    }

    /// Broker over any [`LogClient`]
    pub fn with_client(client: Arc<dyn LogClient>, config: &Config) -> Self {
        let stream = config.store.stream.clone();
        Self {
            producer: Producer::new(client.clone(), stream.clone()),
            registry: GroupRegistry::new(client.clone(), stream),
            client,
            config: config.clone(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Publish an event and return its `event_id`
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        source: &str,
        event_type: &str,
        payload: &T,
        correlation_id: Option<&str>,
    ) -> BusResult<String> {
        self.producer
            .publish(source, event_type, payload, correlation_id)
            .await
    }

    /// Join `group` under a generated consumer name and start processing
    pub async fn subscribe<H: EventHandler + 'static>(&self, group: &str, handler: H) -> BusResult<Subscription> {
        self.subscribe_as(group, &consumer_name(group), Arc::new(handler))
            .await
    }

    /// Join `group` under a chosen consumer name
    ///
    /// A stable name lets a restarted process pick up the entries it left pending.
    pub async fn subscribe_as(
        &self,
        group: &str,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        debug!(%group, %consumer, "subscribe_as: called");
        if consumer.trim().is_empty() {
            return Err(BusError::InvalidArgument("consumer name must not be empty".to_string()));
        }
        self.registry.ensure_group(group).await?;

        // Checked and inserted under one lock so a concurrent call cannot claim the same name
        let mut tasks = self.tasks.lock().await;
        let HashEntry::Vacant(slot) = tasks.entry(consumer.to_string()) else {
            return Err(BusError::InvalidArgument(format!(
                "consumer '{}' is already subscribed",
                consumer
            )));
        };

        let (stop, shutdown) = watch::channel(false);
        let consumer_loop = ConsumerLoop::new(self.client.clone(), &self.config, group, consumer);
        let handle = tokio::spawn(consumer_loop.run(handler, shutdown));
        slot.insert(SubscriptionTask {
            group: group.to_string(),
            stop,
            handle,
        });
        drop(tasks);
        info!(%group, %consumer, "Subscribed");

        Ok(Subscription {
            group: group.to_string(),
            consumer: consumer.to_string(),
            tasks: self.tasks.clone(),
        })
    }

    /// Make sure a group exists at an explicit start position
    pub async fn ensure_group_at(&self, group: &str, start: StartPosition) -> BusResult<()> {
        self.registry.ensure_group_at(group, start).await
    }

    /// The newest `limit` events, newest first, regardless of any group's progress
    pub async fn history(&self, limit: usize) -> BusResult<Vec<Event>> {
        debug!(limit, "history: called");
        let entries = self.client.rev_range(&self.config.store.stream, limit).await?;
        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match Event::from_fields(&entry.fields) {
                Ok(event) => events.push(event),
                Err(e) => warn!(entry_id = %entry.id, error = %e, "history: skipping undecodable entry"),
            }
        }
        Ok(events)
    }

    /// Groups on the event stream
    pub async fn groups(&self) -> BusResult<Vec<GroupInfo>> {
        self.registry.list_groups().await
    }

    /// Pending summary for a group
    pub async fn pending(&self, group: &str) -> BusResult<PendingSummary> {
        debug!(%group, "pending: called");
        self.client.pending_summary(&self.config.store.stream, group).await
    }

    /// Oldest pending entries of a group, up to `count`
    pub async fn pending_entries(&self, group: &str, count: usize) -> BusResult<Vec<PendingEntry>> {
        debug!(%group, count, "pending_entries: called");
        let query = PendingQuery {
            count,
            ..PendingQuery::default()
        };
        self.client.pending(&self.config.store.stream, group, query).await
    }

    /// Stop every subscription, then release the store client
    ///
    /// Returns each consumer's counters. The first loop or client failure is
    /// returned after everything has been shut down.
    pub async fn close(&self) -> BusResult<Vec<(String, ConsumerStats)>> {
        debug!("close: called");
        let tasks: Vec<(String, SubscriptionTask)> = self.tasks.lock().await.drain().collect();
        for (_, task) in &tasks {
            let _ = task.stop.send(true);
        }

        let mut stats = Vec::with_capacity(tasks.len());
        let mut first_error = None;
        for (consumer, task) in tasks {
            match finish(&consumer, task).await {
                Ok(s) => stats.push((consumer, s)),
                Err(e) => {
                    error!(%consumer, error = %e, "Consumer loop ended with error");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.client.close().await {
            first_error.get_or_insert(e);
        }
        info!(subscriptions = stats.len(), "Broker closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}
