//! Eventbus - durable event distribution for platform services
//!
//! Producers append events to an ordered, append-only log; consumer groups
//! read it with independent cursors, at-least-once delivery and explicit
//! acknowledgment. Several instances sharing a group name split the work
//! between them.
//!
//! # Modules
//!
//! - [`broker`] - Owner object: `publish`, `subscribe`, `history`
//! - [`producer`] - Stamps, encodes and appends events
//! - [`groups`] - Idempotent consumer group creation
//! - [`consumer`] - The per-member read/handle/ack loop
//! - [`event`] - Event schema and wire codec
//! - [`client`] - Async store client (actor over `logstore`)
//! - [`deadletter`] - Sink for poison and undecodable entries
//! - [`backoff`] - Retry delays for transient store failures
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod backoff;
pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod consumer;
pub mod deadletter;
pub mod error;
pub mod event;
pub mod groups;
pub mod producer;

pub use broker::{Broker, Subscription};
pub use client::{LogClient, StoreClient};
pub use config::Config;
pub use consumer::{ConsumerLoop, ConsumerStats, EventHandler};
pub use error::{BusError, BusResult};
pub use event::{CodecError, Event};
