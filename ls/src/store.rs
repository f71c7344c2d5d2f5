//! Core Store implementation

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::id::EntryId;
use crate::schema;

/// Ordered field/value pairs of an entry
pub type Fields = Vec<(String, String)>;

/// Look up a field by name
pub fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

/// A stream entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub fields: Fields,
}

impl Entry {
    /// Get a field value by name
    pub fn get(&self, name: &str) -> Option<&str> {
        field(&self.fields, name)
    }
}

/// An entry handed to a consumer, with the number of times it has been delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub entry: Entry,
    pub delivery_count: u32,
}

/// Where a newly created group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only entries appended after the group is created
    #[default]
    Latest,
    /// Every entry in the stream
    Beginning,
    /// Entries after the given id
    After(EntryId),
}

/// What a group read returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to any consumer of the group
    New,
    /// The calling consumer's own pending entries with id greater than the given one
    Pending(EntryId),
}

/// A row of a group's pending list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u32,
}

/// Aggregate view of a group's pending list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: u64,
    pub min: Option<EntryId>,
    pub max: Option<EntryId>,
    /// Pending count per consumer, sorted by consumer name
    pub consumers: Vec<(String, u64)>,
}

/// Filter for listing pending entries
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub consumer: Option<String>,
    pub min_idle: Duration,
    pub count: usize,
}

impl Default for PendingQuery {
    fn default() -> Self {
        Self {
            consumer: None,
            min_idle: Duration::ZERO,
            count: 100,
        }
    }
}

/// Consumer group information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub last_delivered: EntryId,
    pub pending: u64,
    pub consumers: u64,
}

/// Durable stream log backed by SQLite
pub struct Store {
    conn: Connection,
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn limit(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn idle_cutoff(now: u64, min_idle: Duration) -> i64 {
    let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
    now.saturating_sub(min_idle_ms) as i64
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        debug!(?path, "Store::open: called");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        schema::configure(&conn)?;
        schema::migrate(&conn)?;
        info!(?path, "Opened log store");
        Ok(Self { conn })
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory()?;
        schema::configure(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Begin a write transaction holding the database write lock from the start
    ///
    /// Other connections on the same file wait on `busy_timeout` instead of
    /// failing with `SQLITE_BUSY` when a deferred read upgrades to a write.
    fn write_tx(&mut self) -> StoreResult<Transaction<'_>> {
        Ok(self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    // === Stream operations ===

    /// Append an entry and return its assigned id
    pub fn append(&mut self, stream: &str, fields: &[(String, String)]) -> StoreResult<EntryId> {
        debug!(%stream, field_count = fields.len(), "Store::append: called");
        let fields_json = serde_json::to_string(fields)?;
        let tx = self.write_tx()?;
        let last = last_id_tx(&tx, stream)?.unwrap_or(EntryId::MIN);
        let id = EntryId::next_after(last, now_ms());
        let (ms, seq) = id.to_sql();
        tx.execute(
            "INSERT INTO entries (stream, id_ms, id_seq, fields_json) VALUES (?1, ?2, ?3, ?4)",
            params![stream, ms, seq, fields_json],
        )?;
        tx.execute(
            "INSERT INTO stream_meta (stream, last_ms, last_seq) VALUES (?1, ?2, ?3)
             ON CONFLICT(stream) DO UPDATE SET last_ms = excluded.last_ms, last_seq = excluded.last_seq",
            params![stream, ms, seq],
        )?;
        tx.commit()?;
        debug!(%stream, %id, "Store::append: appended");
        Ok(id)
    }

    /// Number of entries in a stream
    pub fn len(&self, stream: &str) -> StoreResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE stream = ?1",
            params![stream],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Whether a stream has no entries
    pub fn is_empty(&self, stream: &str) -> StoreResult<bool> {
        Ok(self.len(stream)? == 0)
    }

    /// The last id ever assigned in a stream
    pub fn last_id(&self, stream: &str) -> StoreResult<Option<EntryId>> {
        let row = self
            .conn
            .query_row(
                "SELECT last_ms, last_seq FROM stream_meta WHERE stream = ?1",
                params![stream],
                |row| Ok(EntryId::from_sql(row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Entries with `start <= id <= end` in ascending order
    pub fn range(&self, stream: &str, start: EntryId, end: EntryId, count: usize) -> StoreResult<Vec<Entry>> {
        debug!(%stream, %start, %end, count, "Store::range: called");
        let (start_ms, start_seq) = start.to_sql();
        let (end_ms, end_seq) = end.to_sql();
        let mut stmt = self.conn.prepare(
            "SELECT id_ms, id_seq, fields_json FROM entries
             WHERE stream = ?1 AND (id_ms, id_seq) >= (?2, ?3) AND (id_ms, id_seq) <= (?4, ?5)
             ORDER BY id_ms ASC, id_seq ASC LIMIT ?6",
        )?;
        let rows = stmt.query_map(
            params![stream, start_ms, start_seq, end_ms, end_seq, limit(count)],
            row_to_raw_entry,
        )?;
        collect_entries(rows)
    }

    /// The most recent `count` entries, newest first
    pub fn rev_range(&self, stream: &str, count: usize) -> StoreResult<Vec<Entry>> {
        debug!(%stream, count, "Store::rev_range: called");
        let mut stmt = self.conn.prepare(
            "SELECT id_ms, id_seq, fields_json FROM entries
             WHERE stream = ?1 ORDER BY id_ms DESC, id_seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![stream, limit(count)], row_to_raw_entry)?;
        collect_entries(rows)
    }

    // === Consumer groups ===

    /// Create a consumer group. Fails with [`StoreError::GroupExists`] if it already exists.
    pub fn create_group(&mut self, stream: &str, group: &str, start: StartPosition) -> StoreResult<()> {
        debug!(%stream, %group, ?start, "Store::create_group: called");
        let tx = self.write_tx()?;
        if group_cursor_tx(&tx, stream, group)?.is_some() {
            debug!(%stream, %group, "Store::create_group: group exists");
            return Err(StoreError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let cursor = match start {
            StartPosition::Latest => last_id_tx(&tx, stream)?.unwrap_or(EntryId::MIN),
            StartPosition::Beginning => EntryId::MIN,
            StartPosition::After(id) => id,
        };
        let (ms, seq) = cursor.to_sql();
        tx.execute(
            "INSERT INTO groups (stream, name, last_ms, last_seq, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![stream, group, ms, seq, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        info!(%stream, %group, %cursor, "Created consumer group");
        Ok(())
    }

    /// Remove a group, its cursor and its pending list. Returns false if it did not exist.
    pub fn destroy_group(&mut self, stream: &str, group: &str) -> StoreResult<bool> {
        debug!(%stream, %group, "Store::destroy_group: called");
        let tx = self.write_tx()?;
        tx.execute(
            "DELETE FROM pending WHERE stream = ?1 AND group_name = ?2",
            params![stream, group],
        )?;
        let removed = tx.execute(
            "DELETE FROM groups WHERE stream = ?1 AND name = ?2",
            params![stream, group],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// List the groups of a stream, sorted by name
    pub fn groups(&self, stream: &str) -> StoreResult<Vec<GroupInfo>> {
        debug!(%stream, "Store::groups: called");
        let mut stmt = self.conn.prepare(
            "SELECT g.name, g.last_ms, g.last_seq,
                    (SELECT COUNT(*) FROM pending p WHERE p.stream = g.stream AND p.group_name = g.name),
                    (SELECT COUNT(DISTINCT consumer) FROM pending p WHERE p.stream = g.stream AND p.group_name = g.name)
             FROM groups g WHERE g.stream = ?1 ORDER BY g.name",
        )?;
        let rows = stmt.query_map(params![stream], |row| {
            Ok(GroupInfo {
                name: row.get(0)?,
                last_delivered: EntryId::from_sql(row.get(1)?, row.get(2)?),
                pending: row.get::<_, i64>(3)? as u64,
                consumers: row.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Read entries for a group member
    ///
    /// With [`ReadFrom::New`] the group cursor advances past every returned entry and each
    /// entry joins the pending list owned by `consumer`. With [`ReadFrom::Pending`] the
    /// consumer's own unacknowledged entries are returned again and their delivery count grows.
    pub fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
    ) -> StoreResult<Vec<Delivery>> {
        debug!(%stream, %group, %consumer, count, ?from, "Store::read_group: called");
        let now = now_ms() as i64;
        let tx = self.write_tx()?;
        let cursor = group_cursor_tx(&tx, stream, group)?.ok_or_else(|| StoreError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;

        let deliveries = match from {
            ReadFrom::New => {
                let entries = {
                    let (ms, seq) = cursor.to_sql();
                    let mut stmt = tx.prepare(
                        "SELECT id_ms, id_seq, fields_json FROM entries
                         WHERE stream = ?1 AND (id_ms, id_seq) > (?2, ?3)
                         ORDER BY id_ms ASC, id_seq ASC LIMIT ?4",
                    )?;
                    let rows = stmt.query_map(params![stream, ms, seq, limit(count)], row_to_raw_entry)?;
                    collect_entries(rows)?
                };
                for entry in &entries {
                    let (ms, seq) = entry.id.to_sql();
                    tx.execute(
                        "INSERT INTO pending (stream, group_name, id_ms, id_seq, consumer, delivered_at_ms, delivery_count)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
                         ON CONFLICT(stream, group_name, id_ms, id_seq) DO UPDATE SET
                             consumer = excluded.consumer,
                             delivered_at_ms = excluded.delivered_at_ms,
                             delivery_count = pending.delivery_count + 1",
                        params![stream, group, ms, seq, consumer, now],
                    )?;
                }
                if let Some(last) = entries.last() {
                    let (ms, seq) = last.id.to_sql();
                    tx.execute(
                        "UPDATE groups SET last_ms = ?3, last_seq = ?4 WHERE stream = ?1 AND name = ?2",
                        params![stream, group, ms, seq],
                    )?;
                }
                let mut deliveries = Vec::with_capacity(entries.len());
                for entry in entries {
                    let delivery_count = delivery_count_tx(&tx, stream, group, entry.id)?;
                    deliveries.push(Delivery { entry, delivery_count });
                }
                deliveries
            }
            ReadFrom::Pending(after) => {
                let (after_ms, after_seq) = after.to_sql();
                let entries = {
                    let mut stmt = tx.prepare(
                        "SELECT e.id_ms, e.id_seq, e.fields_json FROM pending p
                         JOIN entries e ON e.stream = p.stream AND e.id_ms = p.id_ms AND e.id_seq = p.id_seq
                         WHERE p.stream = ?1 AND p.group_name = ?2 AND p.consumer = ?3
                           AND (p.id_ms, p.id_seq) > (?4, ?5)
                         ORDER BY p.id_ms ASC, p.id_seq ASC LIMIT ?6",
                    )?;
                    let rows = stmt.query_map(
                        params![stream, group, consumer, after_ms, after_seq, limit(count)],
                        row_to_raw_entry,
                    )?;
                    collect_entries(rows)?
                };
                let mut deliveries = Vec::with_capacity(entries.len());
                for entry in entries {
                    let delivery_count = redeliver_tx(&tx, stream, group, consumer, entry.id, now)?;
                    deliveries.push(Delivery { entry, delivery_count });
                }
                deliveries
            }
        };

        tx.commit()?;
        debug!(%stream, %group, %consumer, delivered = deliveries.len(), "Store::read_group: done");
        Ok(deliveries)
    }

    /// Acknowledge entries, removing them from the group's pending list.
    /// Returns how many were actually pending.
    pub fn ack(&mut self, stream: &str, group: &str, ids: &[EntryId]) -> StoreResult<usize> {
        debug!(%stream, %group, count = ids.len(), "Store::ack: called");
        let tx = self.write_tx()?;
        let mut removed = 0;
        for id in ids {
            let (ms, seq) = id.to_sql();
            removed += tx.execute(
                "DELETE FROM pending WHERE stream = ?1 AND group_name = ?2 AND id_ms = ?3 AND id_seq = ?4",
                params![stream, group, ms, seq],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Summarize a group's pending list
    pub fn pending_summary(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
        debug!(%stream, %group, "Store::pending_summary: called");
        self.require_group(stream, group)?;

        let mut stmt = self.conn.prepare(
            "SELECT consumer, COUNT(*) FROM pending WHERE stream = ?1 AND group_name = ?2
             GROUP BY consumer ORDER BY consumer",
        )?;
        let rows = stmt.query_map(params![stream, group], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut consumers = Vec::new();
        for row in rows {
            consumers.push(row?);
        }

        let edge = |order: &str| -> StoreResult<Option<EntryId>> {
            let sql = format!(
                "SELECT id_ms, id_seq FROM pending WHERE stream = ?1 AND group_name = ?2
                 ORDER BY id_ms {order}, id_seq {order} LIMIT 1"
            );
            Ok(self
                .conn
                .query_row(&sql, params![stream, group], |row| {
                    Ok(EntryId::from_sql(row.get(0)?, row.get(1)?))
                })
                .optional()?)
        };

        Ok(PendingSummary {
            count: consumers.iter().map(|(_, n)| n).sum(),
            min: edge("ASC")?,
            max: edge("DESC")?,
            consumers,
        })
    }

    /// List pending entries of a group
    pub fn pending(&self, stream: &str, group: &str, query: &PendingQuery) -> StoreResult<Vec<PendingEntry>> {
        debug!(%stream, %group, ?query, "Store::pending: called");
        self.require_group(stream, group)?;
        let now = now_ms();
        let cutoff = idle_cutoff(now, query.min_idle);
        let mut stmt = self.conn.prepare(
            "SELECT id_ms, id_seq, consumer, delivered_at_ms, delivery_count FROM pending
             WHERE stream = ?1 AND group_name = ?2 AND (?3 IS NULL OR consumer = ?3) AND delivered_at_ms <= ?4
             ORDER BY id_ms ASC, id_seq ASC LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![stream, group, query.consumer, cutoff, limit(query.count)],
            |row| {
                let delivered_at: i64 = row.get(3)?;
                Ok(PendingEntry {
                    id: EntryId::from_sql(row.get(0)?, row.get(1)?),
                    consumer: row.get(2)?,
                    idle: Duration::from_millis(now.saturating_sub(delivered_at.max(0) as u64)),
                    delivery_count: row.get::<_, i64>(4)? as u32,
                })
            },
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Transfer ownership of pending entries idle for at least `min_idle` to `consumer`
    pub fn claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> StoreResult<Vec<Delivery>> {
        debug!(%stream, %group, %consumer, ?min_idle, count = ids.len(), "Store::claim: called");
        let now = now_ms();
        let tx = self.write_tx()?;
        if group_cursor_tx(&tx, stream, group)?.is_none() {
            return Err(StoreError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let deliveries = claim_tx(&tx, stream, group, consumer, now, min_idle, ids)?;
        tx.commit()?;
        Ok(deliveries)
    }

    /// Scan the pending list from `start` and claim up to `count` idle entries
    ///
    /// Returns the id to resume the scan from (`0-0` once the scan is complete) and
    /// the claimed deliveries.
    pub fn auto_claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> StoreResult<(EntryId, Vec<Delivery>)> {
        debug!(%stream, %group, %consumer, ?min_idle, %start, count, "Store::auto_claim: called");
        let now = now_ms();
        let cutoff = idle_cutoff(now, min_idle);
        let tx = self.write_tx()?;
        if group_cursor_tx(&tx, stream, group)?.is_none() {
            return Err(StoreError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let mut candidates = {
            let (ms, seq) = start.to_sql();
            let mut stmt = tx.prepare(
                "SELECT id_ms, id_seq FROM pending
                 WHERE stream = ?1 AND group_name = ?2 AND (id_ms, id_seq) >= (?3, ?4) AND delivered_at_ms <= ?5
                 ORDER BY id_ms ASC, id_seq ASC LIMIT ?6",
            )?;
            let rows = stmt.query_map(
                params![stream, group, ms, seq, cutoff, limit(count).saturating_add(1)],
                |row| Ok(EntryId::from_sql(row.get(0)?, row.get(1)?)),
            )?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        let next = if candidates.len() > count {
            candidates.pop().unwrap_or(EntryId::MIN)
        } else {
            EntryId::MIN
        };
        let deliveries = claim_tx(&tx, stream, group, consumer, now, min_idle, &candidates)?;
        tx.commit()?;
        Ok((next, deliveries))
    }

    fn require_group(&self, stream: &str, group: &str) -> StoreResult<EntryId> {
        let cursor = self
            .conn
            .query_row(
                "SELECT last_ms, last_seq FROM groups WHERE stream = ?1 AND name = ?2",
                params![stream, group],
                |row| Ok(EntryId::from_sql(row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        cursor.ok_or_else(|| StoreError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })
    }
}

type RawEntry = (EntryId, String);

fn row_to_raw_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((EntryId::from_sql(row.get(0)?, row.get(1)?), row.get(2)?))
}

fn collect_entries(rows: impl Iterator<Item = rusqlite::Result<RawEntry>>) -> StoreResult<Vec<Entry>> {
    let mut entries = Vec::new();
    for row in rows {
        let (id, fields_json) = row?;
        let fields: Fields = serde_json::from_str(&fields_json)?;
        entries.push(Entry { id, fields });
    }
    Ok(entries)
}

fn last_id_tx(tx: &Transaction<'_>, stream: &str) -> StoreResult<Option<EntryId>> {
    Ok(tx
        .query_row(
            "SELECT last_ms, last_seq FROM stream_meta WHERE stream = ?1",
            params![stream],
            |row| Ok(EntryId::from_sql(row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

fn group_cursor_tx(tx: &Transaction<'_>, stream: &str, group: &str) -> StoreResult<Option<EntryId>> {
    Ok(tx
        .query_row(
            "SELECT last_ms, last_seq FROM groups WHERE stream = ?1 AND name = ?2",
            params![stream, group],
            |row| Ok(EntryId::from_sql(row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

fn delivery_count_tx(tx: &Transaction<'_>, stream: &str, group: &str, id: EntryId) -> StoreResult<u32> {
    let (ms, seq) = id.to_sql();
    let count: i64 = tx.query_row(
        "SELECT delivery_count FROM pending WHERE stream = ?1 AND group_name = ?2 AND id_ms = ?3 AND id_seq = ?4",
        params![stream, group, ms, seq],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

fn redeliver_tx(
    tx: &Transaction<'_>,
    stream: &str,
    group: &str,
    consumer: &str,
    id: EntryId,
    now: i64,
) -> StoreResult<u32> {
    let (ms, seq) = id.to_sql();
    tx.execute(
        "UPDATE pending SET consumer = ?5, delivered_at_ms = ?6, delivery_count = delivery_count + 1
         WHERE stream = ?1 AND group_name = ?2 AND id_ms = ?3 AND id_seq = ?4",
        params![stream, group, ms, seq, consumer, now],
    )?;
    delivery_count_tx(tx, stream, group, id)
}

fn claim_tx(
    tx: &Transaction<'_>,
    stream: &str,
    group: &str,
    consumer: &str,
    now: u64,
    min_idle: Duration,
    ids: &[EntryId],
) -> StoreResult<Vec<Delivery>> {
    let cutoff = idle_cutoff(now, min_idle);
    let mut deliveries = Vec::new();
    for id in ids {
        let (ms, seq) = id.to_sql();
        let changed = tx.execute(
            "UPDATE pending SET consumer = ?5, delivered_at_ms = ?6, delivery_count = delivery_count + 1
             WHERE stream = ?1 AND group_name = ?2 AND id_ms = ?3 AND id_seq = ?4 AND delivered_at_ms <= ?7",
            params![stream, group, ms, seq, consumer, now as i64, cutoff],
        )?;
        if changed == 0 {
            debug!(%id, "claim: entry not pending or not idle long enough");
            continue;
        }
        let fields_json: Option<String> = tx
            .query_row(
                "SELECT fields_json FROM entries WHERE stream = ?1 AND id_ms = ?2 AND id_seq = ?3",
                params![stream, ms, seq],
                |row| row.get(0),
            )
            .optional()?;
        let Some(fields_json) = fields_json else {
            continue;
        };
        let fields: Fields = serde_json::from_str(&fields_json)?;
        let delivery_count = delivery_count_tx(tx, stream, group, *id)?;
        deliveries.push(Delivery {
            entry: Entry { id: *id, fields },
            delivery_count,
        });
    }
    Ok(deliveries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    const STREAM: &str = "events";

    fn fields(n: usize) -> Fields {
        vec![
            ("event_id".to_string(), format!("evt-{}", n)),
            ("type".to_string(), "message".to_string()),
        ]
    }

    fn ids(deliveries: &[Delivery]) -> Vec<EntryId> {
        deliveries.iter().map(|d| d.entry.id).collect()
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let mut store = Store::open_in_memory().unwrap();
        let mut last = EntryId::MIN;
        for n in 0..50 {
            let id = store.append(STREAM, &fields(n)).unwrap();
            assert!(id > last, "{} should be greater than {}", id, last);
            last = id;
        }
        assert_eq!(store.len(STREAM).unwrap(), 50);
        assert_eq!(store.last_id(STREAM).unwrap(), Some(last));
    }

    #[test]
    fn test_append_preserves_field_order() {
        let mut store = Store::open_in_memory().unwrap();
        let f = vec![
            ("z".to_string(), "1".to_string()),
            ("a".to_string(), "2".to_string()),
        ];
        store.append(STREAM, &f).unwrap();
        let entries = store.rev_range(STREAM, 1).unwrap();
        assert_eq!(entries[0].fields, f);
        assert_eq!(entries[0].get("a"), Some("2"));
        assert_eq!(entries[0].get("missing"), None);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut store = Store::open_in_memory().unwrap();
        store.append("a", &fields(1)).unwrap();
        store.append("a", &fields(2)).unwrap();
        store.append("b", &fields(3)).unwrap();
        assert_eq!(store.len("a").unwrap(), 2);
        assert_eq!(store.len("b").unwrap(), 1);
        assert!(store.is_empty("c").unwrap());
        assert_eq!(store.last_id("c").unwrap(), None);
    }

    #[test]
    fn test_create_group_twice_reports_exists() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "gateway", StartPosition::Latest).unwrap();
        let err = store
            .create_group(STREAM, "gateway", StartPosition::Latest)
            .unwrap_err();
        assert!(err.is_group_exists());
        assert_eq!(store.groups(STREAM).unwrap().len(), 1);
    }

    #[test]
    fn test_latest_group_skips_history() {
        let mut store = Store::open_in_memory().unwrap();
        store.append(STREAM, &fields(1)).unwrap();
        store.append(STREAM, &fields(2)).unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();

        let batch = store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap();
        assert!(batch.is_empty());

        let id = store.append(STREAM, &fields(3)).unwrap();
        let batch = store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap();
        assert_eq!(ids(&batch), vec![id]);
        assert_eq!(batch[0].delivery_count, 1);
    }

    #[test]
    fn test_beginning_group_sees_history() {
        let mut store = Store::open_in_memory().unwrap();
        let a = store.append(STREAM, &fields(1)).unwrap();
        let b = store.append(STREAM, &fields(2)).unwrap();
        store.create_group(STREAM, "g", StartPosition::Beginning).unwrap();
        let batch = store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap();
        assert_eq!(ids(&batch), vec![a, b]);
    }

    #[test]
    fn test_group_after_explicit_id() {
        let mut store = Store::open_in_memory().unwrap();
        let a = store.append(STREAM, &fields(1)).unwrap();
        let b = store.append(STREAM, &fields(2)).unwrap();
        store.create_group(STREAM, "g", StartPosition::After(a)).unwrap();
        let batch = store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap();
        assert_eq!(ids(&batch), vec![b]);
    }

    #[test]
    fn test_read_unknown_group_is_no_group() {
        let mut store = Store::open_in_memory().unwrap();
        let err = store
            .read_group(STREAM, "missing", "c1", 10, ReadFrom::New)
            .unwrap_err();
        assert!(err.is_no_group());
    }

    #[test]
    fn test_read_respects_count() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
        for n in 0..5 {
            store.append(STREAM, &fields(n)).unwrap();
        }
        assert_eq!(store.read_group(STREAM, "g", "c1", 2, ReadFrom::New).unwrap().len(), 2);
        assert_eq!(store.read_group(STREAM, "g", "c1", 2, ReadFrom::New).unwrap().len(), 2);
        assert_eq!(store.read_group(STREAM, "g", "c1", 2, ReadFrom::New).unwrap().len(), 1);
        assert!(store.read_group(STREAM, "g", "c1", 2, ReadFrom::New).unwrap().is_empty());
    }

    #[test]
    fn test_competing_consumers_get_disjoint_entries() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
        for n in 0..10 {
            store.append(STREAM, &fields(n)).unwrap();
        }
        let first = store.read_group(STREAM, "g", "c1", 4, ReadFrom::New).unwrap();
        let second = store.read_group(STREAM, "g", "c2", 100, ReadFrom::New).unwrap();
        assert_eq!(first.len() + second.len(), 10);
        for d in &first {
            assert!(!ids(&second).contains(&d.entry.id));
        }
        let summary = store.pending_summary(STREAM, "g").unwrap();
        assert_eq!(summary.count, 10);
        assert_eq!(
            summary.consumers,
            vec![("c1".to_string(), 4), ("c2".to_string(), 6)]
        );
    }

    #[test]
    fn test_separate_groups_each_see_every_entry() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "a", StartPosition::Latest).unwrap();
        store.create_group(STREAM, "b", StartPosition::Latest).unwrap();
        let x = store.append(STREAM, &fields(1)).unwrap();
        let y = store.append(STREAM, &fields(2)).unwrap();
        assert_eq!(ids(&store.read_group(STREAM, "a", "c", 10, ReadFrom::New).unwrap()), vec![x, y]);
        assert_eq!(ids(&store.read_group(STREAM, "b", "c", 10, ReadFrom::New).unwrap()), vec![x, y]);
    }

    #[test]
    fn test_ack_removes_pending() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
        let a = store.append(STREAM, &fields(1)).unwrap();
        let b = store.append(STREAM, &fields(2)).unwrap();
        store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap();

        assert_eq!(store.ack(STREAM, "g", &[a]).unwrap(), 1);
        // Acking twice is a no-op
        assert_eq!(store.ack(STREAM, "g", &[a]).unwrap(), 0);

        let pending = store
            .read_group(STREAM, "g", "c1", 10, ReadFrom::Pending(EntryId::MIN))
            .unwrap();
        assert_eq!(ids(&pending), vec![b]);
        assert!(store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap().is_empty());
    }

    #[test]
    fn test_pending_reread_bumps_delivery_count() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
        store.append(STREAM, &fields(1)).unwrap();
        store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap();

        let again = store
            .read_group(STREAM, "g", "c1", 10, ReadFrom::Pending(EntryId::MIN))
            .unwrap();
        assert_eq!(again[0].delivery_count, 2);
        let again = store
            .read_group(STREAM, "g", "c1", 10, ReadFrom::Pending(EntryId::MIN))
            .unwrap();
        assert_eq!(again[0].delivery_count, 3);

        // Another consumer does not see c1's pending entries
        let other = store
            .read_group(STREAM, "g", "c2", 10, ReadFrom::Pending(EntryId::MIN))
            .unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_history_does_not_disturb_groups() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
        let a = store.append(STREAM, &fields(1)).unwrap();
        let b = store.append(STREAM, &fields(2)).unwrap();

        let newest_first: Vec<EntryId> = store.rev_range(STREAM, 10).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(newest_first, vec![b, a]);
        let all: Vec<EntryId> = store
            .range(STREAM, EntryId::MIN, EntryId::MAX, 10)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(all, vec![a, b]);

        assert_eq!(store.pending_summary(STREAM, "g").unwrap().count, 0);
        let batch = store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap();
        assert_eq!(ids(&batch), vec![a, b]);
    }

    #[test]
    fn test_pending_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events.db");
        let id = {
            let mut store = Store::open(&path).unwrap();
            store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
            let id = store.append(STREAM, &fields(1)).unwrap();
            store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap();
            id
        };

        let mut store = Store::open(&path).unwrap();
        let pending = store
            .read_group(STREAM, "g", "c1", 10, ReadFrom::Pending(EntryId::MIN))
            .unwrap();
        assert_eq!(ids(&pending), vec![id]);
        assert_eq!(store.groups(STREAM).unwrap()[0].pending, 1);
    }

    #[test]
    fn test_ids_stay_monotonic_across_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("events.db");
        let first = Store::open(&path).unwrap().append(STREAM, &fields(1)).unwrap();
        let second = Store::open(&path).unwrap().append(STREAM, &fields(2)).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_pending_listing_and_idle_filter() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
        store.append(STREAM, &fields(1)).unwrap();
        store.append(STREAM, &fields(2)).unwrap();
        store.read_group(STREAM, "g", "c1", 1, ReadFrom::New).unwrap();
        store.read_group(STREAM, "g", "c2", 1, ReadFrom::New).unwrap();

        let all = store.pending(STREAM, "g", &PendingQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].consumer, "c1");

        let only_c2 = store
            .pending(
                STREAM,
                "g",
                &PendingQuery {
                    consumer: Some("c2".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(only_c2.len(), 1);
        assert_eq!(only_c2[0].consumer, "c2");

        let long_idle = store
            .pending(
                STREAM,
                "g",
                &PendingQuery {
                    min_idle: Duration::from_secs(3600),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(long_idle.is_empty());
    }

    #[test]
    fn test_claim_transfers_ownership() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
        let id = store.append(STREAM, &fields(1)).unwrap();
        store.read_group(STREAM, "g", "dead", 10, ReadFrom::New).unwrap();

        // Not idle long enough
        let claimed = store
            .claim(STREAM, "g", "alive", Duration::from_secs(3600), &[id])
            .unwrap();
        assert!(claimed.is_empty());

        let claimed = store.claim(STREAM, "g", "alive", Duration::ZERO, &[id]).unwrap();
        assert_eq!(ids(&claimed), vec![id]);
        assert_eq!(claimed[0].delivery_count, 2);
        let pending = store.pending(STREAM, "g", &PendingQuery::default()).unwrap();
        assert_eq!(pending[0].consumer, "alive");
    }

    #[test]
    fn test_auto_claim_pages_through_pending() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
        for n in 0..5 {
            store.append(STREAM, &fields(n)).unwrap();
        }
        store.read_group(STREAM, "g", "dead", 10, ReadFrom::New).unwrap();

        let (next, first) = store
            .auto_claim(STREAM, "g", "alive", Duration::ZERO, EntryId::MIN, 3)
            .unwrap();
        assert_eq!(first.len(), 3);
        assert_ne!(next, EntryId::MIN);

        let (next, rest) = store.auto_claim(STREAM, "g", "alive", Duration::ZERO, next, 3).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(next, EntryId::MIN);
    }

    #[test]
    fn test_destroy_group_removes_state() {
        let mut store = Store::open_in_memory().unwrap();
        store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
        store.append(STREAM, &fields(1)).unwrap();
        store.read_group(STREAM, "g", "c1", 10, ReadFrom::New).unwrap();

        assert!(store.destroy_group(STREAM, "g").unwrap());
        assert!(!store.destroy_group(STREAM, "g").unwrap());
        assert!(store.groups(STREAM).unwrap().is_empty());
        assert!(store.pending_summary(STREAM, "g").unwrap_err().is_no_group());
        // Entries are untouched
        assert_eq!(store.len(STREAM).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_connections_share_one_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");
        Store::open(&path).unwrap().create_group(STREAM, "g", StartPosition::Beginning).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut store = Store::open(&path).unwrap();
                    for n in 0..100 {
                        store.append(STREAM, &fields(w * 1000 + n)).unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..2)
            .map(|r| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut store = Store::open(&path).unwrap();
                    let consumer = format!("c{}", r);
                    let mut acked = 0;
                    for _ in 0..50 {
                        let batch = store.read_group(STREAM, "g", &consumer, 10, ReadFrom::New).unwrap();
                        acked += store.ack(STREAM, "g", &ids(&batch)).unwrap();
                    }
                    acked
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        let acked: usize = readers.into_iter().map(|r| r.join().unwrap()).sum();

        let mut store = Store::open(&path).unwrap();
        assert_eq!(store.len(STREAM).unwrap(), 400);
        let rest = store.read_group(STREAM, "g", "c9", 1000, ReadFrom::New).unwrap();
        assert_eq!(acked + rest.len(), 400);

        let all = store.range(STREAM, EntryId::MIN, EntryId::MAX, 1000).unwrap();
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    proptest! {
        #[test]
        fn prop_group_sees_every_entry_once_in_order(
            total in 1usize..60,
            batch_sizes in proptest::collection::vec(1usize..8, 1..20),
        ) {
            let mut store = Store::open_in_memory().unwrap();
            store.create_group(STREAM, "g", StartPosition::Latest).unwrap();
            let mut appended = Vec::new();
            for n in 0..total {
                appended.push(store.append(STREAM, &fields(n)).unwrap());
            }

            let mut seen = Vec::new();
            let mut sizes = batch_sizes.iter().cycle();
            loop {
                let size = *sizes.next().unwrap();
                let batch = store.read_group(STREAM, "g", "c1", size, ReadFrom::New).unwrap();
                if batch.is_empty() {
                    break;
                }
                let batch_ids = ids(&batch);
                store.ack(STREAM, "g", &batch_ids).unwrap();
                seen.extend(batch_ids);
            }

            prop_assert_eq!(seen, appended);
            prop_assert_eq!(store.pending_summary(STREAM, "g").unwrap().count, 0);
        }
    }
}
