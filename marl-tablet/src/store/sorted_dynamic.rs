//! The sorted dynamic store: an in-memory, MVCC, row-locked buffer of
//! recent writes.
//!
//! Rows are indexed by a lock-free skiplist. Each row carries one lock
//! descriptor per lock group and one edit list per value column. Edit
//! lists are append-only and read newest→oldest; an entry's *revision* is
//! an index into the store's revision→timestamp table, with revision 0
//! reserved for uncommitted entries. Commit publishes a transaction's
//! entries by registering a revision for the commit timestamp and
//! stamping it over the uncommitted entries.
//!
//! All mutations run on the tablet's automaton thread; readers are
//! concurrent and only take per-row read locks.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use marl_client::{StoreId, TransactionId};
use marl_data::{
    Key, LockMask, TableSchema, Timestamp, UnversionedRow, Value, VersionedRow, VersionedValue,
    ALL_COMMITTED_TIMESTAMP, MAX_TIMESTAMP, MIN_TIMESTAMP, NULL_TIMESTAMP, PRIMARY_LOCK_INDEX,
};
use marl_errors::{invariant, MarlError, MarlResult};
use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::watch;

use super::{FlushState, StoreState};

/// Revision of an edit-list entry: an index into the store's
/// revision→timestamp table.
pub type Revision = u32;

/// Revision of entries whose transaction has not committed yet.
pub const UNCOMMITTED_REVISION: Revision = 0;

/// Largest registrable revision.
pub const MAX_REVISION: Revision = u32::MAX - 1;

/// "No revision" sentinel (the flush revision before rotation).
pub const INVALID_REVISION: Revision = u32::MAX;

/// Hard cap on revisions per store. Exceeding it is a bug; the soft
/// limit below forces rotation long before.
pub const HARD_REVISION_LIMIT: u64 = 1 << 26;

/// Revision count that makes the store demand rotation.
pub const SOFT_REVISION_LIMIT: u64 = 1 << 25;

/// Prepare timestamp of a lock that is held but not prepared. High
/// sentinel so unprepared holders never block snapshot readers.
pub const NOT_PREPARED_TIMESTAMP: Timestamp = Timestamp(0x3fff_ffff_ffff_ff02);

#[derive(Clone, Debug)]
struct EditList<T> {
    // Tail is newest; readers walk in reverse.
    entries: Vec<(Revision, T)>,
}

impl<T> Default for EditList<T> {
    fn default() -> Self {
        EditList { entries: Vec::new() }
    }
}

impl<T> EditList<T> {
    fn push(&mut self, revision: Revision, value: T) {
        self.entries.push((revision, value));
    }

    fn newest_first(&self) -> impl Iterator<Item = &(Revision, T)> {
        self.entries.iter().rev()
    }

    fn head(&self) -> Option<&(Revision, T)> {
        self.entries.last()
    }

    fn pop_head(&mut self) -> Option<(Revision, T)> {
        self.entries.pop()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-lock-group state of a row.
#[derive(Clone, Debug)]
struct LockDescriptor {
    holder: Option<TransactionId>,
    prepare_timestamp: Timestamp,
    last_commit_timestamp: Timestamp,
    write_revisions: EditList<()>,
    pending_delete: bool,
}

impl Default for LockDescriptor {
    fn default() -> Self {
        LockDescriptor {
            holder: None,
            prepare_timestamp: NOT_PREPARED_TIMESTAMP,
            last_commit_timestamp: NULL_TIMESTAMP,
            write_revisions: EditList::default(),
            pending_delete: false,
        }
    }
}

#[derive(Debug)]
struct DynamicRow {
    locks: SmallVec<[LockDescriptor; 2]>,
    // One edit list per value column, in schema order.
    columns: Vec<EditList<Value>>,
    delete_revisions: EditList<()>,
}

impl DynamicRow {
    fn new(lock_count: usize, value_column_count: usize) -> DynamicRow {
        DynamicRow {
            locks: (0..lock_count).map(|_| LockDescriptor::default()).collect(),
            columns: (0..value_column_count)
                .map(|_| EditList::default())
                .collect(),
            delete_revisions: EditList::default(),
        }
    }
}

/// Outcome of an atomic write or delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The row was written and its locks acquired.
    Written,
    /// A conflicting holder is prepared with a timestamp above the
    /// writer's start timestamp; the caller should wait on the store's
    /// blocked-row signal and retry.
    Blocked {
        /// Key of the blocked row.
        key: Key,
        /// Lock mask of the attempted write.
        lock_mask: LockMask,
        /// The blocking lock's prepare timestamp.
        timestamp: Timestamp,
    },
}

enum LockCheck {
    Clear,
    Blocked(Timestamp),
}

/// Committed state of one row, used by snapshots and tests.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DynamicRowSnapshot {
    /// Row key.
    pub key: Key,
    /// The row as a versioned row over all committed revisions.
    pub row: VersionedRow,
}

/// The sorted dynamic store.
pub struct SortedDynamicStore {
    id: StoreId,
    schema: Arc<TableSchema>,
    state: RwLock<StoreState>,
    flush_state: RwLock<FlushState>,

    rows: SkipMap<Key, RwLock<DynamicRow>>,
    // Index 0 is reserved so committed revisions start at 1.
    revisions: RwLock<Vec<Timestamp>>,
    flush_revision: AtomicU32,

    lock_count: AtomicI64,
    key_count: AtomicU64,
    value_count: AtomicU64,
    pool_size: AtomicU64,

    min_timestamp: AtomicU64,
    max_timestamp: AtomicU64,

    row_unblocked: watch::Sender<u64>,
}

impl fmt::Debug for SortedDynamicStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedDynamicStore")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("rows", &self.key_count.load(Ordering::Relaxed))
            .field("values", &self.value_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl SortedDynamicStore {
    /// Creates an empty active store.
    pub fn new(id: StoreId, schema: Arc<TableSchema>) -> SortedDynamicStore {
        let (row_unblocked, _) = watch::channel(0);
        SortedDynamicStore {
            id,
            schema,
            state: RwLock::new(StoreState::ActiveDynamic),
            flush_state: RwLock::new(FlushState::None),
            rows: SkipMap::new(),
            revisions: RwLock::new(vec![NULL_TIMESTAMP]),
            flush_revision: AtomicU32::new(INVALID_REVISION),
            lock_count: AtomicI64::new(0),
            key_count: AtomicU64::new(0),
            value_count: AtomicU64::new(0),
            pool_size: AtomicU64::new(0),
            min_timestamp: AtomicU64::new(MAX_TIMESTAMP.0),
            max_timestamp: AtomicU64::new(MIN_TIMESTAMP.0),
            row_unblocked,
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

    /// Sets the lifecycle state. On the Active→Passive transition the
    /// current latest revision is captured as the flush watermark, so
    /// transactions that commit later (in the active store, via row
    /// migration) never leak into the flushed output.
    pub fn set_state(&self, state: StoreState) {
        let mut guard = self.state.write();
        if *guard == StoreState::ActiveDynamic && state == StoreState::PassiveDynamic {
            let latest = (self.revisions.read().len() - 1) as Revision;
            self.flush_revision.store(latest, Ordering::Release);
        }
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

    /// The revision captured at rotation, [`INVALID_REVISION`] while the
    /// store is still active.
    pub fn flush_revision(&self) -> Revision {
        self.flush_revision.load(Ordering::Acquire)
    }

    /// Number of rows.
    pub fn row_count(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Number of edit-list entries.
    pub fn value_count(&self) -> u64 {
        self.value_count.load(Ordering::Relaxed)
    }

    /// Approximate memory footprint in bytes.
    pub fn pool_size(&self) -> u64 {
        self.pool_size.load(Ordering::Relaxed)
    }

    /// Number of revisions registered so far.
    pub fn revision_count(&self) -> u64 {
        self.revisions.read().len() as u64 - 1
    }

    /// Number of row locks currently held by transactions.
    pub fn lock_count(&self) -> i64 {
        self.lock_count.load(Ordering::Relaxed)
    }

    /// Smallest committed timestamp, [`MAX_TIMESTAMP`] when empty.
    pub fn min_timestamp(&self) -> Timestamp {
        Timestamp(self.min_timestamp.load(Ordering::Relaxed))
    }

    /// Largest committed timestamp, [`MIN_TIMESTAMP`] when empty.
    pub fn max_timestamp(&self) -> Timestamp {
        Timestamp(self.max_timestamp.load(Ordering::Relaxed))
    }

    /// Smallest key present.
    pub fn min_key(&self) -> Option<Key> {
        self.rows.front().map(|entry| entry.key().clone())
    }

    /// Largest key present.
    pub fn max_key(&self) -> Option<Key> {
        self.rows.back().map(|entry| entry.key().clone())
    }

    /// A receiver that ticks whenever row locks are released, waking
    /// writers parked on blocked rows.
    pub fn subscribe_row_unblocked(&self) -> watch::Receiver<u64> {
        self.row_unblocked.subscribe()
    }

    /// Writes a row under an atomic transaction, acquiring the locks in
    /// `lock_mask`.
    ///
    /// The row must contain all key columns and at least one value
    /// column (validated by the store manager).
    pub fn write_row_atomic(
        &self,
        holder: TransactionId,
        start_timestamp: Timestamp,
        row: &UnversionedRow,
        lock_mask: LockMask,
    ) -> MarlResult<WriteOutcome> {
        let key = row
            .key(self.schema.key_column_count())
            .ok_or_else(|| MarlError::InvalidRow("row is missing key columns".into()))?;

        let entry = self.get_or_insert_row(&key);
        let mut state = entry.value().write();

        match self.check_locks(&key, &state, holder, start_timestamp, lock_mask)? {
            LockCheck::Blocked(timestamp) => {
                return Ok(WriteOutcome::Blocked {
                    key,
                    lock_mask,
                    timestamp,
                });
            }
            LockCheck::Clear => {}
        }

        self.acquire_locks(&mut state, holder, lock_mask, false);

        let key_column_count = self.schema.key_column_count();
        for value in row.values.iter().skip(key_column_count) {
            let column_index = value.id as usize - key_column_count;
            if !lock_mask.has_group(self.schema.lock_index(value.id as usize))
                && !lock_mask.has_group(PRIMARY_LOCK_INDEX)
            {
                continue;
            }
            state.columns[column_index].push(UNCOMMITTED_REVISION, value.value.clone());
            self.value_count.fetch_add(1, Ordering::Relaxed);
            self.pool_size
                .fetch_add(value.value.data_weight() as u64, Ordering::Relaxed);
        }

        Ok(WriteOutcome::Written)
    }

    /// Deletes a row under an atomic transaction: takes the primary lock
    /// and marks the pending delete.
    pub fn delete_row_atomic(
        &self,
        holder: TransactionId,
        start_timestamp: Timestamp,
        key: &Key,
    ) -> MarlResult<WriteOutcome> {
        let entry = self.get_or_insert_row(key);
        let mut state = entry.value().write();

        match self.check_locks(key, &state, holder, start_timestamp, LockMask::PRIMARY)? {
            LockCheck::Blocked(timestamp) => {
                return Ok(WriteOutcome::Blocked {
                    key: key.clone(),
                    lock_mask: LockMask::PRIMARY,
                    timestamp,
                });
            }
            LockCheck::Clear => {}
        }

        self.acquire_locks(&mut state, holder, LockMask::PRIMARY, true);
        Ok(WriteOutcome::Written)
    }

    /// Writes and immediately commits a row; non-atomic transactions
    /// only. No locks are checked or taken.
    pub fn write_row_non_atomic(
        &self,
        row: &UnversionedRow,
        commit_timestamp: Timestamp,
    ) -> MarlResult<()> {
        let key = row
            .key(self.schema.key_column_count())
            .ok_or_else(|| MarlError::InvalidRow("row is missing key columns".into()))?;
        let revision = self.register_revision(commit_timestamp)?;

        let entry = self.get_or_insert_row(&key);
        let mut state = entry.value().write();

        let key_column_count = self.schema.key_column_count();
        for value in row.values.iter().skip(key_column_count) {
            let column_index = value.id as usize - key_column_count;
            state.columns[column_index].push(revision, value.value.clone());
            self.value_count.fetch_add(1, Ordering::Relaxed);
            self.pool_size
                .fetch_add(value.value.data_weight() as u64, Ordering::Relaxed);
        }
        state.locks[PRIMARY_LOCK_INDEX]
            .write_revisions
            .push(revision, ());
        state.locks[PRIMARY_LOCK_INDEX].last_commit_timestamp = commit_timestamp;
        drop(state);

        self.update_timestamp_range(commit_timestamp);
        Ok(())
    }

    /// Deletes and immediately commits a row; non-atomic transactions
    /// only.
    pub fn delete_row_non_atomic(&self, key: &Key, commit_timestamp: Timestamp) -> MarlResult<()> {
        let revision = self.register_revision(commit_timestamp)?;
        let entry = self.get_or_insert_row(key);
        let mut state = entry.value().write();
        state.delete_revisions.push(revision, ());
        state.locks[PRIMARY_LOCK_INDEX].last_commit_timestamp = commit_timestamp;
        drop(state);
        self.update_timestamp_range(commit_timestamp);
        Ok(())
    }

    /// Checks whether a write with `lock_mask` by `holder` would conflict
    /// with locks in this store. Used against passive stores before a
    /// prelocked write is dispatched to the active one.
    pub fn check_row_locks(
        &self,
        key: &Key,
        holder: TransactionId,
        start_timestamp: Timestamp,
        lock_mask: LockMask,
    ) -> MarlResult<Option<WriteOutcome>> {
        let Some(entry) = self.rows.get(key) else {
            return Ok(None);
        };
        let state = entry.value().read();
        match self.check_locks(key, &state, holder, start_timestamp, lock_mask)? {
            LockCheck::Clear => Ok(None),
            LockCheck::Blocked(timestamp) => Ok(Some(WriteOutcome::Blocked {
                key: key.clone(),
                lock_mask,
                timestamp,
            })),
        }
    }

    /// Stamps the transaction's prepare timestamp onto every lock it
    /// holds on the row. Publishes nothing.
    pub fn prepare_row(&self, holder: TransactionId, prepare_timestamp: Timestamp, key: &Key) {
        if let Some(entry) = self.rows.get(key) {
            let mut state = entry.value().write();
            for lock in state.locks.iter_mut() {
                if lock.holder == Some(holder) {
                    lock.prepare_timestamp = prepare_timestamp;
                }
            }
        }
    }

    /// Publishes the transaction's edits on the row at `commit_timestamp`
    /// and releases its locks.
    pub fn commit_row(
        &self,
        holder: TransactionId,
        commit_timestamp: Timestamp,
        key: &Key,
    ) -> MarlResult<()> {
        let entry = self
            .rows
            .get(key)
            .ok_or_else(|| marl_errors::internal_err!("committing transaction holds no row {key}"))?;
        let revision = self.register_revision(commit_timestamp)?;
        let mut state = entry.value().write();

        let held: SmallVec<[usize; 2]> = state
            .locks
            .iter()
            .enumerate()
            .filter(|(_, lock)| lock.holder == Some(holder))
            .map(|(index, _)| index)
            .collect();

        let key_column_count = self.schema.key_column_count();
        let mut wrote_values = false;
        for (column_offset, column) in state.columns.iter_mut().enumerate() {
            let lock_index = self.schema.lock_index(column_offset + key_column_count);
            if !held.contains(&lock_index) && !held.contains(&PRIMARY_LOCK_INDEX) {
                continue;
            }
            // Stamp every uncommitted entry of this transaction, newest
            // inward.
            for entry in column.entries.iter_mut().rev() {
                if entry.0 != UNCOMMITTED_REVISION {
                    break;
                }
                entry.0 = revision;
                wrote_values = true;
            }
        }

        for index in &held {
            let pending_delete = state.locks[*index].pending_delete;
            if pending_delete && *index == PRIMARY_LOCK_INDEX {
                state.delete_revisions.push(revision, ());
            }
            let lock = &mut state.locks[*index];
            lock.pending_delete = false;
            if wrote_values && !pending_delete {
                lock.write_revisions.push(revision, ());
            }
            lock.last_commit_timestamp = commit_timestamp;
        }

        self.release_locks(&mut state, holder);
        drop(state);

        self.update_timestamp_range(commit_timestamp);
        self.notify_row_unblocked();
        Ok(())
    }

    /// Discards the transaction's uncommitted edits on the row and
    /// releases its locks.
    pub fn abort_row(&self, holder: TransactionId, key: &Key) {
        let Some(entry) = self.rows.get(key) else {
            return;
        };
        let mut state = entry.value().write();

        let held: SmallVec<[usize; 2]> = state
            .locks
            .iter()
            .enumerate()
            .filter(|(_, lock)| lock.holder == Some(holder))
            .map(|(index, _)| index)
            .collect();

        let key_column_count = self.schema.key_column_count();
        for (column_offset, column) in state.columns.iter_mut().enumerate() {
            let lock_index = self.schema.lock_index(column_offset + key_column_count);
            if !held.contains(&lock_index) && !held.contains(&PRIMARY_LOCK_INDEX) {
                continue;
            }
            while column
                .head()
                .is_some_and(|(revision, _)| *revision == UNCOMMITTED_REVISION)
            {
                let (_, value) = column.pop_head().expect("head checked above");
                self.value_count.fetch_sub(1, Ordering::Relaxed);
                self.pool_size
                    .fetch_sub(value.data_weight() as u64, Ordering::Relaxed);
            }
        }
        for index in &held {
            state.locks[*index].pending_delete = false;
        }

        self.release_locks(&mut state, holder);
        drop(state);
        self.notify_row_unblocked();
    }

    /// Extracts the transaction's uncommitted state from this (passive)
    /// store's row so it can be grafted onto the active store. The locks
    /// stay held here until commit or abort releases them.
    pub fn extract_migration(&self, holder: TransactionId, key: &Key) -> Option<RowMigration> {
        let entry = self.rows.get(key)?;
        let mut state = entry.value().write();

        let held: SmallVec<[usize; 2]> = state
            .locks
            .iter()
            .enumerate()
            .filter(|(_, lock)| lock.holder == Some(holder))
            .map(|(index, _)| index)
            .collect();
        if held.is_empty() {
            return None;
        }

        let key_column_count = self.schema.key_column_count();
        let mut values = Vec::new();
        for (column_offset, column) in state.columns.iter_mut().enumerate() {
            let lock_index = self.schema.lock_index(column_offset + key_column_count);
            if !held.contains(&lock_index) && !held.contains(&PRIMARY_LOCK_INDEX) {
                continue;
            }
            let mut migrated: Vec<Value> = Vec::new();
            while column
                .head()
                .is_some_and(|(revision, _)| *revision == UNCOMMITTED_REVISION)
            {
                let (_, value) = column.pop_head().expect("head checked above");
                self.value_count.fetch_sub(1, Ordering::Relaxed);
                self.pool_size
                    .fetch_sub(value.data_weight() as u64, Ordering::Relaxed);
                migrated.push(value);
            }
            // Restore write order: oldest first.
            migrated.reverse();
            if !migrated.is_empty() {
                values.push((column_offset, migrated));
            }
        }

        let mut locks = SmallVec::new();
        for index in &held {
            let lock = &mut state.locks[*index];
            locks.push(MigratedLock {
                lock_index: *index,
                prepare_timestamp: lock.prepare_timestamp,
                pending_delete: lock.pending_delete,
            });
            lock.pending_delete = false;
        }

        Some(RowMigration {
            key: key.clone(),
            locks,
            values,
        })
    }

    /// Grafts a migrated row (locks plus uncommitted values) onto this
    /// (active) store.
    pub fn migrate_row(&self, holder: TransactionId, migration: RowMigration) -> MarlResult<()> {
        let entry = self.get_or_insert_row(&migration.key);
        let mut state = entry.value().write();

        for migrated in &migration.locks {
            let lock = &mut state.locks[migrated.lock_index];
            invariant!(
                lock.holder.is_none() || lock.holder == Some(holder),
                "migration target lock already held on row {}",
                migration.key
            );
            if lock.holder.is_none() {
                lock.holder = Some(holder);
                self.lock_count.fetch_add(1, Ordering::Relaxed);
            }
            lock.prepare_timestamp = migrated.prepare_timestamp;
            lock.pending_delete = migrated.pending_delete;
        }

        for (column_offset, values) in migration.values {
            for value in values {
                self.value_count.fetch_add(1, Ordering::Relaxed);
                self.pool_size
                    .fetch_add(value.data_weight() as u64, Ordering::Relaxed);
                state.columns[column_offset].push(UNCOMMITTED_REVISION, value);
            }
        }
        Ok(())
    }

    /// Looks up one row at a timestamp.
    pub fn lookup(&self, key: &Key, timestamp: Timestamp) -> Option<VersionedRow> {
        let entry = self.rows.get(key)?;
        let state = entry.value().read();
        self.capture_row(key, &state, timestamp, self.effective_max_revision())
    }

    /// Reads rows with keys in `[lower, upper)` at a timestamp,
    /// starting strictly after `resume_after` when given. Returns at
    /// most `limit` rows; an empty result means the range is exhausted.
    pub fn read_range(
        &self,
        lower: &Key,
        upper: Option<&Key>,
        resume_after: Option<&Key>,
        timestamp: Timestamp,
        limit: usize,
    ) -> Vec<VersionedRow> {
        self.read_range_at_revision(
            lower,
            upper,
            resume_after,
            timestamp,
            self.effective_max_revision(),
            limit,
        )
    }

    /// Like [`read_range`](Self::read_range) but bounded by the flush
    /// watermark: the reader used to flush this (passive) store.
    pub fn read_flush_range(
        &self,
        resume_after: Option<&Key>,
        limit: usize,
    ) -> Vec<VersionedRow> {
        let watermark = self.flush_revision();
        debug_assert_ne!(watermark, INVALID_REVISION, "flush before rotation");
        self.read_range_at_revision(
            &Key::empty(),
            None,
            resume_after,
            ALL_COMMITTED_TIMESTAMP,
            watermark,
            limit,
        )
    }

    fn read_range_at_revision(
        &self,
        lower: &Key,
        upper: Option<&Key>,
        resume_after: Option<&Key>,
        timestamp: Timestamp,
        max_revision: Revision,
        limit: usize,
    ) -> Vec<VersionedRow> {
        let mut result = Vec::new();
        let start = resume_after.unwrap_or(lower);
        for entry in self.rows.range(start.clone()..) {
            if resume_after.is_some() && entry.key() == start {
                continue;
            }
            if let Some(upper) = upper {
                if entry.key() >= upper {
                    break;
                }
            }
            if result.len() >= limit {
                break;
            }
            let state = entry.value().read();
            if let Some(row) = self.capture_row(entry.key(), &state, timestamp, max_revision) {
                result.push(row);
            }
        }
        result
    }

    /// All committed rows, for store serialization.
    pub fn snapshot_rows(&self) -> Vec<DynamicRowSnapshot> {
        let mut rows = Vec::new();
        for entry in self.rows.iter() {
            let state = entry.value().read();
            if let Some(row) = self.capture_row(
                entry.key(),
                &state,
                ALL_COMMITTED_TIMESTAMP,
                self.effective_max_revision(),
            ) {
                rows.push(DynamicRowSnapshot {
                    key: entry.key().clone(),
                    row,
                });
            }
        }
        rows
    }

    /// Rebuilds a row from a serialized snapshot. Timestamps are mapped
    /// back onto fresh revisions in commit order.
    pub fn load_row(&self, snapshot: &DynamicRowSnapshot) -> MarlResult<()> {
        let mut timestamps: Vec<Timestamp> = snapshot
            .row
            .write_timestamps
            .iter()
            .chain(snapshot.row.delete_timestamps.iter())
            .chain(snapshot.row.values.iter().map(|value| &value.timestamp))
            .copied()
            .collect();
        timestamps.sort_unstable();
        timestamps.dedup();

        let mut revision_of = std::collections::HashMap::new();
        for timestamp in timestamps {
            revision_of.insert(timestamp, self.register_revision(timestamp)?);
            self.update_timestamp_range(timestamp);
        }

        let entry = self.get_or_insert_row(&snapshot.key);
        let mut state = entry.value().write();

        let key_column_count = self.schema.key_column_count();
        // Values arrive newest first; push oldest first to keep edit
        // lists monotone.
        for value in snapshot.row.values.iter().rev() {
            let column_index = value.id as usize - key_column_count;
            let revision = revision_of[&value.timestamp];
            state.columns[column_index].push(revision, value.value.clone());
            self.value_count.fetch_add(1, Ordering::Relaxed);
            self.pool_size
                .fetch_add(value.value.data_weight() as u64, Ordering::Relaxed);
        }
        for timestamp in snapshot.row.write_timestamps.iter().rev() {
            state.locks[PRIMARY_LOCK_INDEX]
                .write_revisions
                .push(revision_of[timestamp], ());
            state.locks[PRIMARY_LOCK_INDEX].last_commit_timestamp = *timestamp;
        }
        for timestamp in snapshot.row.delete_timestamps.iter().rev() {
            state.delete_revisions.push(revision_of[timestamp], ());
        }
        Ok(())
    }

    /// Timestamp a revision was committed at. Test hook.
    pub fn timestamp_from_revision(&self, revision: Revision) -> Timestamp {
        self.revisions.read()[revision as usize]
    }

    fn effective_max_revision(&self) -> Revision {
        (self.revisions.read().len() - 1) as Revision
    }

    fn get_or_insert_row(
        &self,
        key: &Key,
    ) -> crossbeam_skiplist::map::Entry<'_, Key, RwLock<DynamicRow>> {
        let existing = self.rows.get(key);
        if let Some(entry) = existing {
            return entry;
        }
        self.key_count.fetch_add(1, Ordering::Relaxed);
        self.pool_size
            .fetch_add(key.data_weight() as u64, Ordering::Relaxed);
        self.rows.get_or_insert_with(key.clone(), || {
            RwLock::new(DynamicRow::new(
                self.schema.lock_count(),
                self.schema.value_column_count(),
            ))
        })
    }

    fn check_locks(
        &self,
        key: &Key,
        state: &DynamicRow,
        holder: TransactionId,
        start_timestamp: Timestamp,
        lock_mask: LockMask,
    ) -> MarlResult<LockCheck> {
        // The primary lock is exclusive against every group: a row-mode
        // write may touch any column, so it must not coexist with any
        // column-mode holder (and vice versa).
        let check_all = lock_mask.has_group(PRIMARY_LOCK_INDEX);
        for (index, lock) in state.locks.iter().enumerate() {
            if !check_all && !lock_mask.has_group(index) && index != PRIMARY_LOCK_INDEX {
                continue;
            }
            match lock.holder {
                Some(existing) if existing == holder => continue,
                Some(existing) => {
                    if lock.prepare_timestamp != NOT_PREPARED_TIMESTAMP
                        && lock.prepare_timestamp <= start_timestamp
                    {
                        // Prepared at or below our start timestamp: the
                        // commit may still land on either side of it, so
                        // wait for the holder to resolve and re-check.
                        return Ok(LockCheck::Blocked(lock.prepare_timestamp));
                    }
                    // Either an active unprepared holder, or one prepared
                    // above our start timestamp, whose commit is then
                    // certain to conflict.
                    return Err(MarlError::TransactionLockConflict {
                        key: key.to_string(),
                        holder_id: Some(existing.to_string()),
                        last_commit_timestamp: lock.last_commit_timestamp.0,
                    });
                }
                None => {
                    if lock.last_commit_timestamp > start_timestamp {
                        return Err(MarlError::TransactionLockConflict {
                            key: key.to_string(),
                            holder_id: None,
                            last_commit_timestamp: lock.last_commit_timestamp.0,
                        });
                    }
                }
            }
        }
        Ok(LockCheck::Clear)
    }

    fn acquire_locks(
        &self,
        state: &mut DynamicRow,
        holder: TransactionId,
        lock_mask: LockMask,
        pending_delete: bool,
    ) {
        for index in lock_mask.groups() {
            if index >= state.locks.len() {
                break;
            }
            let lock = &mut state.locks[index];
            if lock.holder.is_none() {
                lock.holder = Some(holder);
                lock.prepare_timestamp = NOT_PREPARED_TIMESTAMP;
                self.lock_count.fetch_add(1, Ordering::Relaxed);
            }
            if pending_delete && index == PRIMARY_LOCK_INDEX {
                lock.pending_delete = true;
            }
        }
    }

    fn release_locks(&self, state: &mut DynamicRow, holder: TransactionId) {
        for lock in state.locks.iter_mut() {
            if lock.holder == Some(holder) {
                lock.holder = None;
                lock.prepare_timestamp = NOT_PREPARED_TIMESTAMP;
                self.lock_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn register_revision(&self, timestamp: Timestamp) -> MarlResult<Revision> {
        let mut revisions = self.revisions.write();
        // Non-atomic batches reuse the revision of a repeated timestamp.
        if let Some(last) = revisions.last() {
            if *last == timestamp && revisions.len() > 1 {
                return Ok((revisions.len() - 1) as Revision);
            }
        }
        invariant!(
            (revisions.len() as u64) < HARD_REVISION_LIMIT,
            "hard revision limit exceeded in store {}",
            self.id
        );
        revisions.push(timestamp);
        Ok((revisions.len() - 1) as Revision)
    }

    fn update_timestamp_range(&self, timestamp: Timestamp) {
        self.min_timestamp
            .fetch_min(timestamp.0, Ordering::Relaxed);
        self.max_timestamp
            .fetch_max(timestamp.0, Ordering::Relaxed);
    }

    fn notify_row_unblocked(&self) {
        self.row_unblocked.send_modify(|ticks| *ticks += 1);
    }

    fn capture_row(
        &self,
        key: &Key,
        state: &DynamicRow,
        timestamp: Timestamp,
        max_revision: Revision,
    ) -> Option<VersionedRow> {
        let revisions = self.revisions.read();
        let all_versions = timestamp == ALL_COMMITTED_TIMESTAMP;
        let visible = |revision: Revision| -> Option<Timestamp> {
            if revision == UNCOMMITTED_REVISION || revision > max_revision {
                return None;
            }
            let committed_at = revisions[revision as usize];
            (all_versions || committed_at <= timestamp).then_some(committed_at)
        };

        let key_column_count = self.schema.key_column_count();
        let mut values = Vec::new();
        for (column_offset, column) in state.columns.iter().enumerate() {
            for (revision, value) in column.newest_first() {
                let Some(committed_at) = visible(*revision) else {
                    continue;
                };
                values.push(VersionedValue {
                    id: (column_offset + key_column_count) as u16,
                    value: value.clone(),
                    timestamp: committed_at,
                });
                if !all_versions {
                    break;
                }
            }
        }

        let mut write_timestamps: Vec<Timestamp> = Vec::new();
        for lock in &state.locks {
            for (revision, ()) in lock.write_revisions.newest_first() {
                if let Some(committed_at) = visible(*revision) {
                    write_timestamps.push(committed_at);
                    if !all_versions {
                        break;
                    }
                }
            }
        }
        write_timestamps.sort_unstable_by(|a, b| b.cmp(a));
        write_timestamps.dedup();

        let mut delete_timestamps: Vec<Timestamp> = state
            .delete_revisions
            .newest_first()
            .filter_map(|(revision, ())| visible(*revision))
            .collect();
        delete_timestamps.sort_unstable_by(|a, b| b.cmp(a));
        if !all_versions {
            delete_timestamps.truncate(1);
        }

        if write_timestamps.is_empty() && delete_timestamps.is_empty() {
            return None;
        }

        Some(VersionedRow {
            key: key.clone(),
            values,
            write_timestamps,
            delete_timestamps,
        })
    }
}

/// Lock state carried from a passive store's row to the active store.
#[derive(Clone, Debug)]
pub struct MigratedLock {
    lock_index: usize,
    prepare_timestamp: Timestamp,
    pending_delete: bool,
}

/// A row's uncommitted state in transit between stores during rotation.
#[derive(Clone, Debug)]
pub struct RowMigration {
    key: Key,
    locks: SmallVec<[MigratedLock; 2]>,
    values: Vec<(usize, Vec<Value>)>,
}

impl RowMigration {
    /// Key of the migrating row.
    pub fn key(&self) -> &Key {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use marl_data::{ColumnSchema, ValueType};
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> SortedDynamicStore {
        let schema = Arc::new(
            TableSchema::new(vec![
                ColumnSchema::key("k", ValueType::Int64),
                ColumnSchema::value("v", ValueType::Int64),
            ])
            .unwrap(),
        );
        SortedDynamicStore::new(StoreId::generate(), schema)
    }

    fn row(k: i64, v: i64) -> UnversionedRow {
        UnversionedRow::from_pairs([(0, Value::Int64(k)), (1, Value::Int64(v))])
    }

    fn key(k: i64) -> Key {
        Key::from([Value::Int64(k)])
    }

    #[test]
    fn write_commit_read() {
        let store = store();
        let tx = TransactionId::generate();

        let outcome = store
            .write_row_atomic(tx, Timestamp(100), &row(1, 10), LockMask::PRIMARY)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);

        // Uncommitted data is invisible.
        assert!(store.lookup(&key(1), Timestamp(200)).is_none());

        store.prepare_row(tx, Timestamp(101), &key(1));
        store.commit_row(tx, Timestamp(101), &key(1)).unwrap();

        let visible = store.lookup(&key(1), Timestamp(101)).unwrap();
        assert_eq!(visible.values.len(), 1);
        assert_eq!(visible.values[0].value, Value::Int64(10));
        assert_eq!(visible.values[0].timestamp, Timestamp(101));

        // Reads below the commit timestamp see nothing.
        assert!(store.lookup(&key(1), Timestamp(99)).is_none());
        assert_eq!(store.lock_count(), 0);
        assert_eq!(store.max_timestamp(), Timestamp(101));
    }

    #[test]
    fn conflicting_writer_fails_immediately() {
        let store = store();
        let tx1 = TransactionId::generate();
        let tx2 = TransactionId::generate();

        store
            .write_row_atomic(tx1, Timestamp(100), &row(1, 10), LockMask::PRIMARY)
            .unwrap();

        let error = store
            .write_row_atomic(tx2, Timestamp(101), &row(1, 20), LockMask::PRIMARY)
            .unwrap_err();
        match error {
            MarlError::TransactionLockConflict { holder_id, .. } => {
                assert_eq!(holder_id, Some(tx1.to_string()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn commit_after_start_conflicts_via_last_commit_timestamp() {
        let store = store();
        let tx1 = TransactionId::generate();
        let tx2 = TransactionId::generate();

        store
            .write_row_atomic(tx1, Timestamp(100), &row(1, 10), LockMask::PRIMARY)
            .unwrap();
        store.prepare_row(tx1, Timestamp(150), &key(1));
        store.commit_row(tx1, Timestamp(160), &key(1)).unwrap();

        // tx2 started at 120 < 160; its write must conflict.
        let error = store
            .write_row_atomic(tx2, Timestamp(120), &row(1, 20), LockMask::PRIMARY)
            .unwrap_err();
        assert!(matches!(error, MarlError::TransactionLockConflict { .. }));

        // A writer that started after the commit proceeds.
        let tx3 = TransactionId::generate();
        let outcome = store
            .write_row_atomic(tx3, Timestamp(200), &row(1, 30), LockMask::PRIMARY)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
    }

    #[test]
    fn prepared_holder_blocks_writer_started_above_prepare() {
        let store = store();
        let tx1 = TransactionId::generate();
        let tx2 = TransactionId::generate();

        store
            .write_row_atomic(tx1, Timestamp(100), &row(1, 10), LockMask::PRIMARY)
            .unwrap();
        store.prepare_row(tx1, Timestamp(150), &key(1));

        // Started above the prepare timestamp: the holder's commit could
        // land on either side, so the writer parks.
        let outcome = store
            .write_row_atomic(tx2, Timestamp(200), &row(1, 20), LockMask::PRIMARY)
            .unwrap();
        match outcome {
            WriteOutcome::Blocked { timestamp, .. } => assert_eq!(timestamp, Timestamp(150)),
            other => panic!("expected blocked, got {other:?}"),
        }

        // Started below the prepare timestamp: the commit is certain to
        // land above the writer's start, so it conflicts at once.
        let tx3 = TransactionId::generate();
        let error = store
            .write_row_atomic(tx3, Timestamp(140), &row(1, 20), LockMask::PRIMARY)
            .unwrap_err();
        assert!(matches!(error, MarlError::TransactionLockConflict { .. }));
    }

    #[test]
    fn blocked_writer_succeeds_after_abort() {
        let store = store();
        let tx1 = TransactionId::generate();
        let tx2 = TransactionId::generate();

        store
            .write_row_atomic(tx1, Timestamp(100), &row(1, 10), LockMask::PRIMARY)
            .unwrap();
        store.prepare_row(tx1, Timestamp(150), &key(1));

        assert!(matches!(
            store
                .write_row_atomic(tx2, Timestamp(200), &row(1, 20), LockMask::PRIMARY)
                .unwrap(),
            WriteOutcome::Blocked { .. }
        ));

        store.abort_row(tx1, &key(1));

        let outcome = store
            .write_row_atomic(tx2, Timestamp(200), &row(1, 20), LockMask::PRIMARY)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
    }

    #[test]
    fn abort_discards_uncommitted_values() {
        let store = store();
        let tx = TransactionId::generate();

        store
            .write_row_atomic(tx, Timestamp(100), &row(1, 10), LockMask::PRIMARY)
            .unwrap();
        assert_eq!(store.value_count(), 1);

        store.abort_row(tx, &key(1));
        assert_eq!(store.value_count(), 0);
        assert_eq!(store.lock_count(), 0);

        // The row is writable again.
        let tx2 = TransactionId::generate();
        let outcome = store
            .write_row_atomic(tx2, Timestamp(100), &row(1, 20), LockMask::PRIMARY)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
    }

    #[test]
    fn delete_shadows_earlier_write() {
        let store = store();
        store.write_row_non_atomic(&row(1, 10), Timestamp(110)).unwrap();
        store.delete_row_non_atomic(&key(1), Timestamp(120)).unwrap();

        let at_115 = store.lookup(&key(1), Timestamp(115)).unwrap();
        assert_eq!(at_115.latest_write_timestamp(), Some(Timestamp(110)));
        assert!(at_115.delete_timestamps.is_empty());

        let at_125 = store.lookup(&key(1), Timestamp(125)).unwrap();
        assert_eq!(at_125.latest_delete_timestamp(), Some(Timestamp(120)));
    }

    #[test]
    fn flush_reader_ignores_post_rotation_commits() {
        let store = store();
        let tx = TransactionId::generate();

        store.write_row_non_atomic(&row(1, 10), Timestamp(110)).unwrap();

        // An in-flight transaction straddles the rotation.
        store
            .write_row_atomic(tx, Timestamp(120), &row(2, 20), LockMask::PRIMARY)
            .unwrap();
        store.set_state(StoreState::PassiveDynamic);
        store.prepare_row(tx, Timestamp(130), &key(2));
        store.commit_row(tx, Timestamp(130), &key(2)).unwrap();

        let flushed = store.read_flush_range(None, 100);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].key, key(1));

        // A plain read still sees both rows.
        let all = store.read_range(&Key::empty(), None, None, Timestamp(200), 100);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn migration_moves_uncommitted_values() {
        let passive = store();
        let active = store();
        let tx = TransactionId::generate();

        passive
            .write_row_atomic(tx, Timestamp(100), &row(1, 10), LockMask::PRIMARY)
            .unwrap();
        passive.set_state(StoreState::PassiveDynamic);

        let migration = passive.extract_migration(tx, &key(1)).unwrap();
        active.migrate_row(tx, migration).unwrap();

        // Commit on the passive store releases its locks without
        // publishing anything; commit on the active store publishes the
        // migrated value.
        passive.commit_row(tx, Timestamp(140), &key(1)).unwrap();
        active.commit_row(tx, Timestamp(140), &key(1)).unwrap();

        assert_eq!(passive.lock_count(), 0);
        assert!(passive.read_flush_range(None, 100).is_empty());
        let visible = active.lookup(&key(1), Timestamp(140)).unwrap();
        assert_eq!(visible.values[0].value, Value::Int64(10));
    }

    #[test]
    fn versioned_read_returns_all_versions_newest_first() {
        let store = store();
        store.write_row_non_atomic(&row(1, 10), Timestamp(110)).unwrap();
        store.write_row_non_atomic(&row(1, 11), Timestamp(120)).unwrap();
        store.write_row_non_atomic(&row(1, 12), Timestamp(130)).unwrap();

        let versioned = store.lookup(&key(1), ALL_COMMITTED_TIMESTAMP).unwrap();
        let versions: Vec<_> = versioned
            .values
            .iter()
            .map(|value| (value.timestamp, value.value.clone()))
            .collect();
        assert_eq!(
            versions,
            vec![
                (Timestamp(130), Value::Int64(12)),
                (Timestamp(120), Value::Int64(11)),
                (Timestamp(110), Value::Int64(10)),
            ]
        );
        assert_eq!(
            versioned.write_timestamps,
            vec![Timestamp(130), Timestamp(120), Timestamp(110)]
        );
    }

    #[test]
    fn range_read_respects_bounds_and_resume() {
        let store = store();
        for k in 1..=5 {
            store.write_row_non_atomic(&row(k, k * 10), Timestamp(110)).unwrap();
        }

        let first = store.read_range(&key(2), Some(&key(5)), None, Timestamp(200), 2);
        assert_eq!(
            first.iter().map(|r| r.key.clone()).collect::<Vec<_>>(),
            vec![key(2), key(3)]
        );

        let rest = store.read_range(&key(2), Some(&key(5)), Some(&key(3)), Timestamp(200), 10);
        assert_eq!(
            rest.iter().map(|r| r.key.clone()).collect::<Vec<_>>(),
            vec![key(4)]
        );
    }

    #[test]
    fn snapshot_round_trips_through_load() {
        let store = store();
        store.write_row_non_atomic(&row(1, 10), Timestamp(110)).unwrap();
        store.write_row_non_atomic(&row(1, 11), Timestamp(120)).unwrap();
        store.delete_row_non_atomic(&key(2), Timestamp(130)).unwrap();

        let restored = {
            let target = self::store();
            for snapshot in store.snapshot_rows() {
                target.load_row(&snapshot).unwrap();
            }
            target
        };

        assert_eq!(restored.snapshot_rows(), store.snapshot_rows());
        assert_eq!(restored.min_timestamp(), store.min_timestamp());
        assert_eq!(restored.max_timestamp(), store.max_timestamp());
    }
}
