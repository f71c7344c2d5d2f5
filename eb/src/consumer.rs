//! Consumer loop
//!
//! One loop is one member of a consumer group. It first reprocesses whatever
//! its own name still holds pending, then repeatedly reads new entries, hands
//! each decoded event to the handler and acks on success. Failed entries stay
//! pending; entries delivered more than `max_deliveries` times, or that cannot
//! be decoded, go to the dead-letter stream.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use logstore::{Delivery, EntryId, ReadFrom};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::client::LogClient;
use crate::config::Config;
use crate::deadletter::{DeadLetterReason, DeadLetterSink};
use crate::error::BusResult;
use crate::event::Event;
use crate::groups::GroupRegistry;

/// Application callback invoked once per delivered event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> eyre::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> eyre::Result<()> {
        self(event).await
    }
}

#[async_trait]
impl EventHandler for Arc<dyn EventHandler> {
    async fn handle(&self, event: Event) -> eyre::Result<()> {
        (**self).handle(event).await
    }
}

/// Counters reported when a loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Entries handed to this loop, including redeliveries
    pub delivered: u64,
    pub acked: u64,
    /// Handler errors and panics
    pub failed: u64,
    pub dead_lettered: u64,
    /// Transient read failures that were retried
    pub read_errors: u64,
}

/// Loop tuning, usually derived from [`Config`]
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub batch_size: usize,
    pub block: Duration,
    pub max_deliveries: u32,
    pub claim_idle: Option<Duration>,
    pub backoff: Backoff,
}

impl From<&Config> for ConsumerOptions {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.consumer.batch_size,
            block: config.consumer.block(),
            max_deliveries: config.consumer.max_deliveries,
            claim_idle: config.consumer.claim_idle(),
            backoff: Backoff::from(&config.backoff),
        }
    }
}

/// Default consumer name: `{group}-{host}-{pid}-{random}`
pub fn consumer_name(group: &str) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "local".to_string());
    let unique = Uuid::now_v7().simple().to_string();
    // The leading hex digits of a v7 uuid are the timestamp; take the random tail.
    let suffix = &unique[unique.len() - 8..];
    format!("{}-{}-{}-{}", group, host, std::process::id(), suffix)
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// A single member of a consumer group
pub struct ConsumerLoop {
    client: Arc<dyn LogClient>,
    registry: GroupRegistry,
    dead_letters: DeadLetterSink,
    stream: String,
    group: String,
    consumer: String,
    options: ConsumerOptions,
    stats: ConsumerStats,
}

impl ConsumerLoop {
    pub fn new(client: Arc<dyn LogClient>, config: &Config, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        let stream = config.store.stream.clone();
        Self {
            registry: GroupRegistry::new(client.clone(), stream.clone()),
            dead_letters: DeadLetterSink::new(client.clone(), config.dead_letter_stream()),
            client,
            stream,
            group: group.into(),
            consumer: consumer.into(),
            options: ConsumerOptions::from(config),
            stats: ConsumerStats::default(),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Run until `shutdown` turns true (or its sender is dropped) or a fatal store error occurs
    ///
    /// The group must already exist. A batch that has been read is always
    /// processed to the end before the loop exits.
    pub async fn run(
        mut self,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BusResult<ConsumerStats> {
        info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "Consumer loop starting"
        );

        self.drain_own_pending(handler.as_ref(), &mut shutdown).await?;

        let mut attempt = 0u32;
        let mut claim_cursor = EntryId::MIN;
        let mut last_claim: Option<Instant> = None;

        while !shutdown_requested(&shutdown) {
            if let Some(min_idle) = self.options.claim_idle {
                if last_claim.is_none_or(|at| at.elapsed() >= min_idle) {
                    claim_cursor = self.claim_idle(handler.as_ref(), min_idle, claim_cursor).await;
                    last_claim = Some(Instant::now());
                }
            }

            let block = Some(self.options.block);
            if let Some(batch) = self.read(ReadFrom::New, block, &mut attempt, &mut shutdown).await? {
                self.process_batch(handler.as_ref(), batch).await;
            }
        }

        info!(
            group = %self.group,
            consumer = %self.consumer,
            stats = ?self.stats,
            "Consumer loop stopped"
        );
        Ok(self.stats)
    }

    /// Reprocess entries this consumer name received earlier but never acked
    async fn drain_own_pending(
        &mut self,
        handler: &dyn EventHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) -> BusResult<()> {
        debug!(group = %self.group, consumer = %self.consumer, "drain_own_pending: called");
        let mut cursor = EntryId::MIN;
        let mut attempt = 0u32;
        let mut recovered = 0usize;

        while !shutdown_requested(shutdown) {
            let Some(batch) = self.read(ReadFrom::Pending(cursor), None, &mut attempt, shutdown).await? else {
                continue;
            };
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.entry.id;
            recovered += batch.len();
            self.process_batch(handler, batch).await;
        }

        if recovered > 0 {
            info!(
                group = %self.group,
                consumer = %self.consumer,
                recovered,
                "Reprocessed entries left pending by a previous run"
            );
        }
        Ok(())
    }

    /// One read with failure classification. `Ok(None)` means the failure was
    /// handled and the caller should simply try again.
    async fn read(
        &mut self,
        from: ReadFrom,
        block: Option<Duration>,
        attempt: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> BusResult<Option<Vec<Delivery>>> {
        let result = self
            .client
            .read_group(
                &self.stream,
                &self.group,
                &self.consumer,
                self.options.batch_size,
                from,
                block,
            )
            .await;

        match result {
            Ok(batch) => {
                *attempt = 0;
                Ok(Some(batch))
            }
            Err(e) if e.is_no_group() => {
                warn!(group = %self.group, "Consumer group disappeared, recreating");
                self.registry.ensure_group(&self.group).await?;
                Ok(None)
            }
            Err(e) if e.is_retryable() => {
                self.stats.read_errors += 1;
                let delay = self.options.backoff.delay(*attempt);
                *attempt = attempt.saturating_add(1);
                warn!(
                    group = %self.group,
                    consumer = %self.consumer,
                    error = %e,
                    attempt = *attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Read failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
                Ok(None)
            }
            Err(e) => {
                error!(group = %self.group, consumer = %self.consumer, error = %e, "Read failed fatally");
                Err(e)
            }
        }
    }

    async fn claim_idle(&mut self, handler: &dyn EventHandler, min_idle: Duration, cursor: EntryId) -> EntryId {
        debug!(group = %self.group, ?min_idle, %cursor, "claim_idle: called");
        let result = self
            .client
            .auto_claim(
                &self.stream,
                &self.group,
                &self.consumer,
                min_idle,
                cursor,
                self.options.batch_size,
            )
            .await;

        match result {
            Ok((next, batch)) => {
                if !batch.is_empty() {
                    info!(group = %self.group, consumer = %self.consumer, claimed = batch.len(), "Claimed idle entries");
                }
                self.process_batch(handler, batch).await;
                next
            }
            Err(e) => {
                warn!(group = %self.group, error = %e, "Idle claim failed");
                cursor
            }
        }
    }

    async fn process_batch(&mut self, handler: &dyn EventHandler, batch: Vec<Delivery>) {
        for delivery in batch {
            self.process(handler, delivery).await;
        }
    }

    async fn process(&mut self, handler: &dyn EventHandler, delivery: Delivery) {
        self.stats.delivered += 1;
        let entry_id = delivery.entry.id;

        let event = match Event::from_fields(&delivery.entry.fields) {
            Ok(event) => event,
            Err(e) => {
                warn!(group = %self.group, %entry_id, error = %e, "Undecodable entry");
                self.dead_letter(&delivery, DeadLetterReason::Decode(e.to_string()))
                    .await;
                return;
            }
        };

        if delivery.delivery_count > self.options.max_deliveries {
            warn!(
                group = %self.group,
                event_id = %event.event_id,
                delivery_count = delivery.delivery_count,
                "Delivery limit exceeded"
            );
            self.dead_letter(&delivery, DeadLetterReason::MaxDeliveries(self.options.max_deliveries))
                .await;
            return;
        }

        let event_id = event.event_id.clone();
        let event_type = event.event_type.clone();
        debug!(%event_id, %event_type, %entry_id, delivery_count = delivery.delivery_count, "process: handling");

        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => {
                if self.ack(entry_id, &event_id).await {
                    self.stats.acked += 1;
                    info!(group = %self.group, %event_id, %event_type, "Event processed");
                }
            }
            Ok(Err(e)) => {
                self.stats.failed += 1;
                error!(
                    group = %self.group,
                    %event_id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Handler failed, entry left pending"
                );
            }
            Err(_) => {
                self.stats.failed += 1;
                error!(
                    group = %self.group,
                    %event_id,
                    delivery_count = delivery.delivery_count,
                    "Handler panicked, entry left pending"
                );
            }
        }
    }

    async fn dead_letter(&mut self, delivery: &Delivery, reason: DeadLetterReason) {
        match self.dead_letters.send(&self.group, delivery, &reason).await {
            Ok(dead_letter_id) => {
                if self.ack(delivery.entry.id, "").await {
                    self.stats.dead_lettered += 1;
                } else {
                    error!(
                        group = %self.group,
                        entry_id = %delivery.entry.id,
                        %dead_letter_id,
                        "Dead letter written but ack failed, entry stays pending until redelivered"
                    );
                }
            }
            Err(e) => {
                error!(
                    group = %self.group,
                    entry_id = %delivery.entry.id,
                    error = %e,
                    "Dead-letter append failed, entry left pending"
                );
            }
        }
    }

    async fn ack(&self, entry_id: EntryId, event_id: &str) -> bool {
        match self.client.ack(&self.stream, &self.group, vec![entry_id]).await {
            Ok(_) => true,
            Err(e) => {
                warn!(group = %self.group, %event_id, %entry_id, error = %e, "Ack failed, entry stays pending");
                false
            }
        }
    }
}
