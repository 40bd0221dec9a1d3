//! Deduplicating merge of fetched points into an ordered series.
//!
//! The series is keyed by timestamp. On collision the incoming record wins,
//! so re-applying the same batch is a no-op:
//! `merge(merge(s, a), a) == merge(s, a)`.

use crate::domain::{SeriesRecord, Timestamped};
use std::collections::btree_map::{self, Entry};
use std::collections::BTreeMap;

/// Ordered, deduplicated in-memory series.
#[derive(Debug, Clone, PartialEq)]
pub struct Series<T> {
    points: BTreeMap<i64, T>,
}

/// What a merge did to the series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
}

impl MergeStats {
    /// True when the series did not change at all.
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.replaced == 0
    }
}

impl<T> Default for Series<T> {
    fn default() -> Self {
        Self {
            points: BTreeMap::new(),
        }
    }
}

impl<T: SeriesRecord> Series<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.points.contains_key(&timestamp)
    }

    pub fn get(&self, timestamp: i64) -> Option<&T> {
        self.points.get(&timestamp)
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.points.keys().next().copied()
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.points.keys().next_back().copied()
    }

    /// Records in ascending timestamp order.
    pub fn iter(&self) -> btree_map::Values<'_, i64, T> {
        self.points.values()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.points.values().cloned().collect()
    }

    /// Merge `incoming` in place. Later duplicates inside `incoming` win too.
    pub fn merge_in<I>(&mut self, incoming: I) -> MergeStats
    where
        I: IntoIterator<Item = T>,
    {
        let mut stats = MergeStats::default();
        for record in incoming {
            match self.points.entry(record.timestamp()) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    stats.inserted += 1;
                }
                Entry::Occupied(mut slot) => {
                    if *slot.get() == record {
                        stats.unchanged += 1;
                    } else {
                        slot.insert(record);
                        stats.replaced += 1;
                    }
                }
            }
        }
        stats
    }
}

impl<T: SeriesRecord> FromIterator<T> for Series<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut series = Series::new();
        series.merge_in(iter);
        series
    }
}

impl<'a, T> IntoIterator for &'a Series<T> {
    type Item = &'a T;
    type IntoIter = btree_map::Values<'a, i64, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.values()
    }
}

/// Pure merge: a new series with `incoming` laid over `existing`.
pub fn merge<T: SeriesRecord>(existing: &Series<T>, incoming: &[T]) -> Series<T> {
    let mut out = existing.clone();
    out.merge_in(incoming.iter().cloned());
    out
}

/// True when every timestamp in `batch` is strictly newer than `after`.
///
/// Sinks use this to choose between appending and rewriting.
pub fn strictly_after<T: Timestamped>(batch: &[T], after: Option<i64>) -> bool {
    match after {
        None => true,
        Some(last) => batch.iter().all(|r| r.timestamp() > last),
    }
}
