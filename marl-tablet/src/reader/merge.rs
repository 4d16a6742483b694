//! Row mergers: combine partial rows for one key from several stores
//! into the single visible row (schemaful) or the retained version set
//! (versioned).

use marl_data::{
    Key, TableSchema, Timestamp, UnversionedRow, UnversionedValue, Value, VersionedRow,
    VersionedValue, ALL_COMMITTED_TIMESTAMP,
};
use smallvec::SmallVec;

use crate::config::RetentionConfig;

/// Restricts a fully versioned row to what a snapshot reader at
/// `timestamp` may see: per column the newest value at or below the
/// timestamp, plus the latest write and delete timestamps at or below
/// it. Returns `None` when the row has no visible history.
pub fn restrict_to_timestamp(row: &VersionedRow, timestamp: Timestamp) -> Option<VersionedRow> {
    if timestamp == ALL_COMMITTED_TIMESTAMP {
        return Some(row.clone());
    }

    let mut values: Vec<VersionedValue> = Vec::new();
    let mut seen: SmallVec<[u16; 8]> = SmallVec::new();
    for value in &row.values {
        if value.timestamp > timestamp || seen.contains(&value.id) {
            continue;
        }
        seen.push(value.id);
        values.push(value.clone());
    }

    let write_timestamps: Vec<Timestamp> = row
        .write_timestamps
        .iter()
        .copied()
        .filter(|ts| *ts <= timestamp)
        .take(1)
        .collect();
    let delete_timestamps: Vec<Timestamp> = row
        .delete_timestamps
        .iter()
        .copied()
        .filter(|ts| *ts <= timestamp)
        .take(1)
        .collect();

    if write_timestamps.is_empty() && delete_timestamps.is_empty() {
        return None;
    }
    Some(VersionedRow {
        key: row.key.clone(),
        values,
        write_timestamps,
        delete_timestamps,
    })
}

/// Merges partial rows into the row visible at one timestamp.
///
/// Feed every store's partial row for one key with
/// [`add_partial_row`](Self::add_partial_row), then take the result with
/// [`build_merged_row`](Self::build_merged_row); the merger resets
/// itself for the next key.
#[derive(Debug)]
pub struct SchemafulRowMerger {
    key_column_count: usize,
    column_count: usize,
    column_filter: Option<Vec<u16>>,

    key: Option<Key>,
    // Newest visible value and its timestamp, per value column.
    merged: Vec<Option<(Timestamp, Value)>>,
    latest_write: Timestamp,
    latest_delete: Timestamp,
    started: bool,
}

impl SchemafulRowMerger {
    /// Creates a merger for the given schema and column filter (`None`
    /// keeps all columns).
    pub fn new(schema: &TableSchema, column_filter: Option<Vec<u16>>) -> SchemafulRowMerger {
        SchemafulRowMerger {
            key_column_count: schema.key_column_count(),
            column_count: schema.columns().len(),
            column_filter,
            key: None,
            merged: vec![None; schema.value_column_count()],
            latest_write: Timestamp(0),
            latest_delete: Timestamp(0),
            started: false,
        }
    }

    /// Adds one store's partial row (already restricted to the read
    /// timestamp).
    pub fn add_partial_row(&mut self, row: &VersionedRow) {
        self.started = true;
        if self.key.is_none() {
            self.key = Some(row.key.clone());
        }
        if let Some(ts) = row.latest_write_timestamp() {
            self.latest_write = self.latest_write.max(ts);
        }
        if let Some(ts) = row.latest_delete_timestamp() {
            self.latest_delete = self.latest_delete.max(ts);
        }
        for value in &row.values {
            let index = value.id as usize - self.key_column_count;
            let newer = match &self.merged[index] {
                None => true,
                Some((existing, _)) => value.timestamp > *existing,
            };
            if newer {
                self.merged[index] = Some((value.timestamp, value.value.clone()));
            }
        }
    }

    /// Builds the merged row and resets the merger. `None` means the key
    /// has no visible row (never written, or deleted).
    pub fn build_merged_row(&mut self) -> Option<UnversionedRow> {
        let started = std::mem::replace(&mut self.started, false);
        let key = self.key.take();
        let latest_write = std::mem::replace(&mut self.latest_write, Timestamp(0));
        let latest_delete = std::mem::replace(&mut self.latest_delete, Timestamp(0));
        let merged = std::mem::replace(&mut self.merged, vec![None; self.column_count - self.key_column_count]);

        if !started {
            return None;
        }
        let key = key?;
        if latest_write == Timestamp(0) || latest_delete >= latest_write {
            return None;
        }

        let wanted = |id: u16| -> bool {
            match &self.column_filter {
                None => true,
                Some(filter) => filter.contains(&id) || (id as usize) < self.key_column_count,
            }
        };

        let mut values: SmallVec<[UnversionedValue; 8]> = SmallVec::new();
        for (index, value) in key.iter().enumerate() {
            let id = index as u16;
            if wanted(id) {
                values.push(UnversionedValue {
                    id,
                    value: value.clone(),
                });
            }
        }
        for (offset, merged_value) in merged.into_iter().enumerate() {
            let id = (offset + self.key_column_count) as u16;
            if !wanted(id) {
                continue;
            }
            let value = match merged_value {
                // A value written before the shadowing delete is not
                // visible.
                Some((ts, value)) if ts > latest_delete => value,
                _ => Value::Null,
            };
            values.push(UnversionedValue { id, value });
        }
        Some(UnversionedRow { values })
    }
}

/// Merges partial rows into the version set a compaction output must
/// retain.
///
/// Versions above `major_timestamp` are kept verbatim: a consumer could
/// still need any of them. At or below the major timestamp only the
/// latest state matters; it is kept subject to the retention config, and
/// deletes there are dropped entirely (nothing older than the major
/// timestamp survives outside this merge set).
#[derive(Debug)]
pub struct VersionedRowMerger {
    retention: RetentionConfig,
    current_timestamp: Timestamp,
    major_timestamp: Timestamp,

    key: Option<Key>,
    values: Vec<VersionedValue>,
    write_timestamps: Vec<Timestamp>,
    delete_timestamps: Vec<Timestamp>,
    started: bool,
}

impl VersionedRowMerger {
    /// Creates a merger for one compaction or partitioning pass.
    pub fn new(
        retention: RetentionConfig,
        current_timestamp: Timestamp,
        major_timestamp: Timestamp,
    ) -> VersionedRowMerger {
        VersionedRowMerger {
            retention,
            current_timestamp,
            major_timestamp,
            key: None,
            values: Vec::new(),
            write_timestamps: Vec::new(),
            delete_timestamps: Vec::new(),
            started: false,
        }
    }

    /// Adds one store's partial row (with all its versions).
    pub fn add_partial_row(&mut self, row: &VersionedRow) {
        self.started = true;
        if self.key.is_none() {
            self.key = Some(row.key.clone());
        }
        self.values.extend(row.values.iter().cloned());
        self.write_timestamps.extend(&row.write_timestamps);
        self.delete_timestamps.extend(&row.delete_timestamps);
    }

    /// Builds the retained version set and resets the merger. `None`
    /// means the row vanishes from the output entirely.
    pub fn build_merged_row(&mut self) -> Option<VersionedRow> {
        if !std::mem::replace(&mut self.started, false) {
            return None;
        }
        let key = self.key.take()?;
        let mut values = std::mem::take(&mut self.values);
        let mut write_timestamps = std::mem::take(&mut self.write_timestamps);
        let mut delete_timestamps = std::mem::take(&mut self.delete_timestamps);

        write_timestamps.sort_unstable_by(|a, b| b.cmp(a));
        write_timestamps.dedup();
        delete_timestamps.sort_unstable_by(|a, b| b.cmp(a));
        delete_timestamps.dedup();

        let latest_delete = delete_timestamps.first().copied().unwrap_or(Timestamp(0));
        let min_ttl_bound = self
            .current_timestamp
            .saturating_sub(self.retention.min_data_ttl);
        let max_ttl_bound = self
            .current_timestamp
            .saturating_sub(self.retention.max_data_ttl);

        // Group versions by column, newest first within each.
        values.sort_by(|a, b| (a.id, std::cmp::Reverse(a.timestamp)).cmp(&(b.id, std::cmp::Reverse(b.timestamp))));
        values.dedup_by(|a, b| a.id == b.id && a.timestamp == b.timestamp);

        let mut kept_values: Vec<VersionedValue> = Vec::new();
        let mut current_column: Option<u16> = None;
        let mut kept_below_major = 0usize;
        for value in values {
            if current_column != Some(value.id) {
                current_column = Some(value.id);
                kept_below_major = 0;
            }
            if value.timestamp > self.major_timestamp {
                kept_values.push(value);
                continue;
            }
            // At or below the major timestamp.
            if latest_delete >= value.timestamp {
                // Shadowed: the latest state of this cell below the
                // major timestamp is "deleted".
                continue;
            }
            let keep = kept_below_major < self.retention.min_data_versions
                || value.timestamp >= min_ttl_bound
                || (kept_below_major < self.retention.max_data_versions
                    && value.timestamp >= max_ttl_bound);
            if keep {
                kept_below_major += 1;
                kept_values.push(value);
            }
        }

        let kept_writes: Vec<Timestamp> = write_timestamps
            .into_iter()
            .filter(|ts| {
                *ts > self.major_timestamp
                    || kept_values.iter().any(|value| value.timestamp == *ts)
            })
            .collect();
        let kept_deletes: Vec<Timestamp> = delete_timestamps
            .into_iter()
            .filter(|ts| *ts > self.major_timestamp)
            .collect();

        if kept_writes.is_empty() && kept_deletes.is_empty() {
            return None;
        }
        Some(VersionedRow {
            key,
            values: kept_values,
            write_timestamps: kept_writes,
            delete_timestamps: kept_deletes,
        })
    }
}
