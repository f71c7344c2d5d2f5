//! Entry identifiers
//!
//! An [`EntryId`] is `{ms}-{seq}`: the append time in unix milliseconds plus a
//! per-millisecond sequence number. IDs are strictly increasing within a stream
//! even when the wall clock stalls or steps backwards.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Store-assigned identifier of a stream entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// The smallest possible id, `0-0`. No entry is ever assigned it.
    pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

    /// The largest possible id
    pub const MAX: EntryId = EntryId {
        ms: i64::MAX as u64,
        seq: i64::MAX as u64,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Compute the id that follows `last` given the current clock reading
    pub fn next_after(last: EntryId, now_ms: u64) -> EntryId {
        if now_ms > last.ms {
            EntryId { ms: now_ms, seq: 0 }
        } else {
            EntryId {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }

    pub(crate) fn to_sql(self) -> (i64, i64) {
        (self.ms as i64, self.seq as i64)
    }

    pub(crate) fn from_sql(ms: i64, seq: i64) -> Self {
        Self {
            ms: ms as u64,
            seq: seq as u64,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    /// Parse `ms-seq`, or a bare `ms` meaning `ms-0`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        let ms: u64 = ms.parse().map_err(|_| invalid())?;
        let seq: u64 = seq.parse().map_err(|_| invalid())?;
        if ms > i64::MAX as u64 || seq > i64::MAX as u64 {
            return Err(invalid());
        }
        Ok(EntryId { ms, seq })
    }
}
