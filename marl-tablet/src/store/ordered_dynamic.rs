//! The ordered dynamic store: an append-only log segment.
//!
//! Ordered tablets expose no MVCC and no locks; atomic transactions
//! buffer their rows in the transaction write log and apply them here at
//! commit, in signature-sorted order, so replaying the log yields
//! identical row indexes on every replica.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use marl_client::StoreId;
use marl_data::{TableSchema, Timestamp, UnversionedRow, MAX_TIMESTAMP, MIN_TIMESTAMP};
use parking_lot::RwLock;

use super::{FlushState, StoreState};

/// The ordered dynamic store.
pub struct OrderedDynamicStore {
    id: StoreId,
    schema: Arc<TableSchema>,
    state: RwLock<StoreState>,
    flush_state: RwLock<FlushState>,

    starting_row_index: u64,
    rows: RwLock<Vec<UnversionedRow>>,

    pool_size: AtomicU64,
    min_timestamp: AtomicU64,
    max_timestamp: AtomicU64,
}

impl fmt::Debug for OrderedDynamicStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedDynamicStore")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("starting_row_index", &self.starting_row_index)
            .field("rows", &self.rows.read().len())
            .finish()
    }
}

impl OrderedDynamicStore {
    /// Creates an empty active store whose first row will land at
    /// `starting_row_index`.
    pub fn new(
        id: StoreId,
        schema: Arc<TableSchema>,
        starting_row_index: u64,
    ) -> OrderedDynamicStore {
        OrderedDynamicStore {
            id,
            schema,
            state: RwLock::new(StoreState::ActiveDynamic),
            flush_state: RwLock::new(FlushState::None),
            starting_row_index,
            rows: RwLock::new(Vec::new()),
            pool_size: AtomicU64::new(0),
            min_timestamp: AtomicU64::new(MAX_TIMESTAMP.0),
            max_timestamp: AtomicU64::new(MIN_TIMESTAMP.0),
        }
    }

    /// The store id.
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// The table schema.
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StoreState {
        *self.state.read()
    }

    /// Sets the lifecycle state. Ordered stores take no flush watermark:
    /// rows are appended at commit time only, so a rotated store can
    /// never grow.
    pub fn set_state(&self, state: StoreState) {
        let mut guard = self.state.write();
        debug_assert!(
            !(*guard == StoreState::PassiveDynamic && state == StoreState::PassiveDynamic),
            "double rotation"
        );
        *guard = state;
    }

    /// Flush progress.
    pub fn flush_state(&self) -> FlushState {
        *self.flush_state.read()
    }

    /// Sets flush progress.
    pub fn set_flush_state(&self, state: FlushState) {
        *self.flush_state.write() = state;
    }

    /// Global row index of the store's first row.
    pub fn starting_row_index(&self) -> u64 {
        self.starting_row_index
    }

    /// Number of rows appended so far.
    pub fn row_count(&self) -> u64 {
        self.rows.read().len() as u64
    }

    /// Approximate memory footprint in bytes.
    pub fn pool_size(&self) -> u64 {
        self.pool_size.load(Ordering::Relaxed)
    }

    /// Smallest commit timestamp, [`MAX_TIMESTAMP`] when empty.
    pub fn min_timestamp(&self) -> Timestamp {
        Timestamp(self.min_timestamp.load(Ordering::Relaxed))
    }

    /// Largest commit timestamp, [`MIN_TIMESTAMP`] when empty.
    pub fn max_timestamp(&self) -> Timestamp {
        Timestamp(self.max_timestamp.load(Ordering::Relaxed))
    }

    /// Appends a committed row; returns its global row index.
    ///
    /// Only the commit path calls this, so rotation can never race an
    /// append.
    pub fn write_row(&self, row: UnversionedRow, commit_timestamp: Timestamp) -> u64 {
        debug_assert_eq!(self.state(), StoreState::ActiveDynamic);
        let weight: usize = row.values.iter().map(|value| value.value.data_weight()).sum();
        self.pool_size.fetch_add(weight as u64, Ordering::Relaxed);
        self.min_timestamp
            .fetch_min(commit_timestamp.0, Ordering::Relaxed);
        self.max_timestamp
            .fetch_max(commit_timestamp.0, Ordering::Relaxed);

        let mut rows = self.rows.write();
        rows.push(row);
        self.starting_row_index + rows.len() as u64 - 1
    }

    /// Reads rows whose global indexes fall in
    /// `[lower_row_index, upper_row_index)`.
    pub fn read_rows(&self, lower_row_index: u64, upper_row_index: u64) -> Vec<UnversionedRow> {
        let rows = self.rows.read();
        let end = self.starting_row_index + rows.len() as u64;
        let from = lower_row_index.clamp(self.starting_row_index, end);
        let to = upper_row_index.clamp(self.starting_row_index, end).max(from);
        rows[(from - self.starting_row_index) as usize..(to - self.starting_row_index) as usize]
            .to_vec()
    }

    /// All rows, in order, for flushing and serialization.
    pub fn snapshot_rows(&self) -> Vec<UnversionedRow> {
        self.rows.read().clone()
    }

    /// Restores rows from a snapshot.
    pub fn load_rows(&self, rows: Vec<UnversionedRow>, min: Timestamp, max: Timestamp) {
        let weight: usize = rows
            .iter()
            .flat_map(|row| row.values.iter())
            .map(|value| value.value.data_weight())
            .sum();
        self.pool_size.store(weight as u64, Ordering::Relaxed);
        self.min_timestamp.store(min.0, Ordering::Relaxed);
        self.max_timestamp.store(max.0, Ordering::Relaxed);
        *self.rows.write() = rows;
    }
}

#[cfg(test)]
mod tests {
    use marl_data::{ColumnSchema, Value, ValueType};

    use super::*;

    fn store(starting_row_index: u64) -> OrderedDynamicStore {
        let schema = Arc::new(
            TableSchema::new(vec![ColumnSchema::value("payload", ValueType::String)]).unwrap(),
        );
        OrderedDynamicStore::new(StoreId::generate(), schema, starting_row_index)
    }

    fn row(payload: &str) -> UnversionedRow {
        UnversionedRow::from_pairs([(0, Value::from(payload))])
    }

    #[test]
    fn appends_are_indexed_from_starting_row_index() {
        let store = store(7);
        assert_eq!(store.write_row(row("a"), Timestamp(100)), 7);
        assert_eq!(store.write_row(row("b"), Timestamp(101)), 8);
        assert_eq!(store.row_count(), 2);
        assert_eq!(store.min_timestamp(), Timestamp(100));
        assert_eq!(store.max_timestamp(), Timestamp(101));
    }

    #[test]
    fn read_window_is_clamped_to_store_extent() {
        let store = store(10);
        store.write_row(row("a"), Timestamp(100));
        store.write_row(row("b"), Timestamp(100));
        store.write_row(row("c"), Timestamp(100));

        assert_eq!(store.read_rows(0, 11).len(), 1);
        assert_eq!(store.read_rows(11, 13).len(), 2);
        assert_eq!(store.read_rows(13, 100).len(), 0);
        assert_eq!(store.read_rows(12, 11).len(), 0);
    }
}
