//! The autosens snapshot table.
//!
//! An ordered cache of derived records keyed by rounded bucket time. A run
//! works on a private clone and hands it back through [`SharedTable::commit`],
//! so readers only ever see fully committed versions.

use crate::AutosensRecord;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock};

/// Time-indexed cache of computed records
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotTable {
    resolution: Duration,
    records: BTreeMap<DateTime<Utc>, AutosensRecord>,
}

impl SnapshotTable {
    /// Create an empty table whose keys are rounded up to `resolution`
    pub fn new(resolution: Duration) -> Self {
        Self {
            resolution,
            records: BTreeMap::new(),
        }
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Normalize a timestamp onto the key grid
    pub fn round_up_time(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        round_up(time, self.resolution)
    }

    pub fn get(&self, time: DateTime<Utc>) -> Option<&AutosensRecord> {
        self.records.get(&self.round_up_time(time))
    }

    pub(crate) fn get_mut(&mut self, time: DateTime<Utc>) -> Option<&mut AutosensRecord> {
        let key = self.round_up_time(time);
        self.records.get_mut(&key)
    }

    /// Store a record under the rounded form of `time`
    pub fn put(&mut self, time: DateTime<Utc>, record: AutosensRecord) {
        let key = self.round_up_time(time);
        self.records.insert(key, record);
    }

    /// Records with `start <= key <= end`, oldest first
    pub fn range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = &AutosensRecord> + '_ {
        let start = self.round_up_time(start);
        let end = self.round_up_time(end);
        let bounds = if start <= end {
            (Bound::Included(start), Bound::Included(end))
        } else {
            // empty range; BTreeMap::range panics on inverted bounds
            (Bound::Included(start), Bound::Excluded(start))
        };
        self.records.range(bounds).map(|(_, r)| r)
    }

    /// Records strictly after `after` and strictly before `before`
    pub fn between(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> impl Iterator<Item = &AutosensRecord> + '_ {
        let after = self.round_up_time(after);
        let before = self.round_up_time(before);
        let bounds = if after < before {
            (Bound::Excluded(after), Bound::Excluded(before))
        } else {
            (Bound::Included(after), Bound::Excluded(after))
        };
        self.records.range(bounds).map(|(_, r)| r)
    }

    /// Record at `time`, or the newest one less than a bucket older
    pub fn record_at(&self, time: DateTime<Utc>, bucket: Duration) -> Option<&AutosensRecord> {
        let key = self.round_up_time(time);
        if let Some(record) = self.records.get(&key) {
            return Some(record);
        }
        self.records
            .range(..=key)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| key - r.time < bucket)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AutosensRecord> + '_ {
        self.records.values()
    }

    pub fn newest(&self) -> Option<&AutosensRecord> {
        self.records.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Round `time` up to the next multiple of `resolution` since the epoch
pub fn round_up(time: DateTime<Utc>, resolution: Duration) -> DateTime<Utc> {
    let step = resolution.num_milliseconds();
    if step <= 0 {
        return time;
    }
    let rem = time.timestamp_millis().rem_euclid(step);
    // sub-millisecond precision is dropped before rounding
    let sub_millis = i64::from(time.timestamp_subsec_nanos() % 1_000_000);
    let truncated = time - Duration::nanoseconds(sub_millis);
    if rem == 0 {
        truncated
    } else {
        truncated + Duration::milliseconds(step - rem)
    }
}

/// The authoritative table for one patient context
///
/// Runs take a snapshot, clone it, and commit a replacement. A commit is a
/// single `Arc` swap under the write lock.
#[derive(Debug)]
pub struct SharedTable {
    current: RwLock<Arc<SnapshotTable>>,
}

impl SharedTable {
    pub fn new(table: SnapshotTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Last committed version
    pub fn snapshot(&self) -> Arc<SnapshotTable> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replace the committed version
    pub fn commit(&self, table: SnapshotTable) -> Arc<SnapshotTable> {
        let table = Arc::new(table);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::clone(&table);
        table
    }
}
