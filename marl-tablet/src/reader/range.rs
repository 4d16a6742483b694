//! Range readers over sorted tablets: a k-way merge across every store
//! whose key range intersects the request.

use std::collections::VecDeque;

use marl_data::{
    Key, KeyBound, Timestamp, UnversionedRow, VersionedRow, ALL_COMMITTED_TIMESTAMP,
};
use marl_errors::{MarlError, MarlResult};

use crate::config::RetentionConfig;
use crate::store::Store;
use crate::tablet::TabletSnapshot;

use super::merge::{restrict_to_timestamp, SchemafulRowMerger, VersionedRowMerger};

const CURSOR_BATCH: usize = 1024;

/// A pull cursor over one store's rows within a range, at a timestamp.
struct StoreCursor {
    store: Store,
    lower: Key,
    upper: Option<Key>,
    timestamp: Timestamp,

    buffered: VecDeque<VersionedRow>,
    // Sorted dynamic stores resume after the last delivered key; chunk
    // stores walk their block list.
    resume_after: Option<Key>,
    next_block: usize,
    exhausted: bool,
}

impl StoreCursor {
    fn new(store: Store, lower: Key, upper: Option<Key>, timestamp: Timestamp) -> StoreCursor {
        StoreCursor {
            store,
            lower,
            upper,
            timestamp,
            buffered: VecDeque::new(),
            resume_after: None,
            next_block: 0,
            exhausted: false,
        }
    }

    /// The key of the next undelivered row, refilling the buffer as
    /// needed.
    async fn peek_key(&mut self) -> MarlResult<Option<Key>> {
        self.fill().await?;
        Ok(self.buffered.front().map(|row| row.key.clone()))
    }

    fn pop(&mut self) -> Option<VersionedRow> {
        self.buffered.pop_front()
    }

    async fn fill(&mut self) -> MarlResult<()> {
        while self.buffered.is_empty() && !self.exhausted {
            match &self.store {
                Store::SortedDynamic(store) => {
                    let rows = store.read_range(
                        &self.lower,
                        self.upper.as_ref(),
                        self.resume_after.as_ref(),
                        self.timestamp,
                        CURSOR_BATCH,
                    );
                    match rows.last() {
                        Some(last) => self.resume_after = Some(last.key.clone()),
                        None => self.exhausted = true,
                    }
                    self.buffered.extend(rows);
                }
                Store::SortedChunk(store) => {
                    let blocks = store.blocks_for_range(&self.lower, self.upper.as_ref());
                    let Some(block_index) = blocks.get(self.next_block).copied() else {
                        self.exhausted = true;
                        break;
                    };
                    self.next_block += 1;
                    let rows = store.read_block_rows(block_index).await?;
                    for row in rows {
                        if row.key < self.lower {
                            continue;
                        }
                        if let Some(upper) = &self.upper {
                            if &row.key >= upper {
                                continue;
                            }
                        }
                        if let Some(restricted) = restrict_to_timestamp(&row, self.timestamp) {
                            self.buffered.push_back(restricted);
                        }
                    }
                }
                _ => {
                    self.exhausted = true;
                }
            }
        }
        Ok(())
    }
}

/// Collects the stores a sorted range read must visit: Eden (including
/// the dynamic stores) plus every partition intersecting the range,
/// filtered down to stores whose own key range intersects it.
pub fn collect_range_stores(
    snapshot: &TabletSnapshot,
    lower: &Key,
    upper: Option<&Key>,
) -> Vec<Store> {
    let mut stores = Vec::new();
    let mut take_store = |store: &Store| {
        let min_key = store.min_key();
        let max_key = store.max_key();
        let below_upper = match (upper, &min_key) {
            (Some(upper), Some(min)) => min < upper,
            _ => true,
        };
        let above_lower = match &max_key {
            Some(max) => max >= lower,
            None => true,
        };
        if below_upper && above_lower {
            stores.push(store.clone());
        }
    };

    for store in &snapshot.eden.stores {
        take_store(store);
    }
    for partition in &snapshot.partitions {
        let intersects = {
            let above_lower = match &partition.next_pivot_key {
                KeyBound::Unbounded => true,
                KeyBound::Key(next) => next > lower,
            };
            let below_upper = match upper {
                None => true,
                Some(upper) => &partition.pivot_key < upper,
            };
            above_lower && below_upper
        };
        if intersects {
            for store in &partition.stores {
                take_store(store);
            }
        }
    }
    stores
}

fn check_fan_in(snapshot: &TabletSnapshot, store_count: usize) -> MarlResult<()> {
    if store_count > snapshot.config.max_read_fan_in {
        return Err(MarlError::ReadFanInExceeded {
            tablet_id: snapshot.tablet_id.to_string(),
            fan_in: store_count,
            fan_in_limit: snapshot.config.max_read_fan_in,
        });
    }
    Ok(())
}

/// K-way merging core shared by the schemaful and versioned range
/// readers: yields, per distinct key, the list of partial rows across
/// stores.
struct MergingCursor {
    cursors: Vec<StoreCursor>,
}

impl MergingCursor {
    async fn next_key_group(&mut self) -> MarlResult<Option<Vec<VersionedRow>>> {
        let mut min_key: Option<Key> = None;
        for cursor in &mut self.cursors {
            if let Some(key) = cursor.peek_key().await? {
                min_key = match min_key {
                    None => Some(key),
                    Some(existing) if key < existing => Some(key),
                    Some(existing) => Some(existing),
                };
            }
        }
        let Some(min_key) = min_key else {
            return Ok(None);
        };

        let mut group = Vec::new();
        for cursor in &mut self.cursors {
            if cursor.buffered.front().is_some_and(|row| row.key == min_key) {
                group.push(cursor.pop().expect("peeked above"));
            }
        }
        Ok(Some(group))
    }
}

/// A schemaful range reader: merges everything down to the rows visible
/// at the read timestamp.
pub struct SchemafulRangeReader {
    merging: MergingCursor,
    merger: SchemafulRowMerger,
}

impl SchemafulRangeReader {
    /// Builds a reader over `[lower, upper)` at `timestamp`. Fails with
    /// `ReadFanInExceeded` when compaction has fallen too far behind.
    pub fn new(
        snapshot: &TabletSnapshot,
        lower: Key,
        upper: Option<Key>,
        timestamp: Timestamp,
        column_filter: Option<Vec<u16>>,
    ) -> MarlResult<SchemafulRangeReader> {
        let stores = collect_range_stores(snapshot, &lower, upper.as_ref());
        check_fan_in(snapshot, stores.len())?;
        tracing::debug!(
            tablet_id = %snapshot.tablet_id,
            store_count = stores.len(),
            %timestamp,
            "creating schemaful range reader"
        );

        let cursors = stores
            .into_iter()
            .map(|store| StoreCursor::new(store, lower.clone(), upper.clone(), timestamp))
            .collect();
        Ok(SchemafulRangeReader {
            merging: MergingCursor { cursors },
            merger: SchemafulRowMerger::new(&snapshot.schema, column_filter),
        })
    }

    /// Reads up to `limit` merged rows; `None` when exhausted.
    pub async fn next_batch(&mut self, limit: usize) -> MarlResult<Option<Vec<UnversionedRow>>> {
        let mut rows = Vec::new();
        while rows.len() < limit {
            match self.merging.next_key_group().await? {
                None => break,
                Some(group) => {
                    for partial in &group {
                        self.merger.add_partial_row(partial);
                    }
                    if let Some(row) = self.merger.build_merged_row() {
                        rows.push(row);
                    }
                }
            }
        }
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows))
        }
    }
}

/// A versioned range reader over an explicit store set: the read side of
/// compactions and partitionings.
pub struct VersionedRangeReader {
    merging: MergingCursor,
    merger: VersionedRowMerger,
}

impl VersionedRangeReader {
    /// Builds a reader over all versions in the stores, merging with the
    /// given current and major timestamps.
    pub fn new(
        stores: Vec<Store>,
        lower: Key,
        upper: Option<Key>,
        retention: RetentionConfig,
        current_timestamp: Timestamp,
        major_timestamp: Timestamp,
    ) -> VersionedRangeReader {
        let cursors = stores
            .into_iter()
            .map(|store| {
                StoreCursor::new(store, lower.clone(), upper.clone(), ALL_COMMITTED_TIMESTAMP)
            })
            .collect();
        VersionedRangeReader {
            merging: MergingCursor { cursors },
            merger: VersionedRowMerger::new(retention, current_timestamp, major_timestamp),
        }
    }

    /// Reads up to `limit` merged versioned rows; `None` when exhausted.
    pub async fn next_batch(&mut self, limit: usize) -> MarlResult<Option<Vec<VersionedRow>>> {
        let mut rows = Vec::new();
        while rows.len() < limit {
            match self.merging.next_key_group().await? {
                None => break,
                Some(group) => {
                    for partial in &group {
                        self.merger.add_partial_row(partial);
                    }
                    if let Some(row) = self.merger.build_merged_row() {
                        rows.push(row);
                    }
                }
            }
        }
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows))
        }
    }
}
