//! LogStore - durable append-only stream log with consumer groups
//!
//! A single SQLite file holds any number of named streams. Each stream is a
//! totally ordered sequence of entries addressed by store-assigned [`EntryId`]s.
//! Consumer groups are named cursors over a stream; every entry handed to a
//! group member sits in the group's pending list until it is acknowledged.
//!
//! # Architecture
//!
//! ```text
//! events.db
//! ├── entries       (stream, id_ms, id_seq) -> fields_json
//! ├── stream_meta   (stream) -> last assigned id
//! ├── groups        (stream, name) -> last delivered id
//! └── pending       (stream, group, id) -> consumer, delivered_at, delivery_count
//! ```
//!
//! # Example
//!
//! ```ignore
//! use logstore::{ReadFrom, StartPosition, Store};
//!
//! let mut store = Store::open("events.db")?;
//! store.create_group("events", "gateway", StartPosition::Latest)?;
//! let id = store.append("events", &[("type".to_string(), "message".to_string())])?;
//! let batch = store.read_group("events", "gateway", "gw-1", 10, ReadFrom::New)?;
//! store.ack("events", "gateway", &[id])?;
//! ```

mod error;
mod id;
mod schema;
mod store;

pub use error::{StoreError, StoreResult};
pub use id::EntryId;
pub use store::{
    Delivery, Entry, Fields, GroupInfo, PendingEntry, PendingQuery, PendingSummary, ReadFrom, StartPosition, Store,
    field,
};
