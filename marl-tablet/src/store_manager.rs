//! The store manager: a facade for modifying data within one tablet.
//!
//! Owns no state of its own — everything lives in the tablet's
//! [`StoreManagerState`](crate::tablet::StoreManagerState) — but
//! concentrates the rules: how writes are dispatched and checked against
//! inactive stores, when the active store rotates, and how the
//! flush/compaction/preload state machines advance and back off.

use std::sync::Arc;
use std::time::{Duration, Instant};

use marl_client::{wire::WireCommand, wire::WireReader, StoreId, TransactionId};
use marl_data::{Key, LockMask, Timestamp, UnversionedRow};
use marl_errors::{invariant, MarlError, MarlResult};
use tracing::{debug, info};

use crate::config::{InMemoryMode, TableMountConfig, TabletManagerConfig};
use crate::store::{
    CompactionState, FlushState, OrderedDynamicStore, PreloadState, PreloadedBlocks,
    SortedDynamicStore, Store, StoreState, WriteOutcome,
};
use crate::tablet::{Tablet, TabletState};
use crate::transaction::{RowRef, Transaction, WriteLogRecord};

/// Granularity of locking requested by a write batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Take the primary lock, covering the whole row.
    Row,
    /// Take only the lock groups of the touched columns.
    Column,
}

/// A decoded command pending execution; kept by the caller across
/// blocked-row retries so the wire stream is consumed exactly once.
#[derive(Clone, Debug)]
pub enum PendingCommand {
    /// A `WriteRow`.
    Write(UnversionedRow),
    /// A `DeleteRow`.
    Delete(Key),
}

/// Result of one attempt at executing a write batch.
#[derive(Debug)]
pub enum WriteExecution {
    /// The whole batch was applied.
    Done,
    /// Execution stopped on a blocked row; the caller should wait on the
    /// store's blocked-row signal and retry with the same reader and
    /// pending command.
    Blocked {
        /// The store holding the blocking lock.
        store_id: StoreId,
        /// The blocked row's key.
        key: Key,
        /// The prepare timestamp of the blocking lock.
        timestamp: Timestamp,
    },
}

/// Computes the lock mask of a write per the requested mode.
pub fn compute_lock_mask(tablet: &Tablet, row: &UnversionedRow, mode: LockMode) -> LockMask {
    match mode {
        LockMode::Row => LockMask::PRIMARY,
        LockMode::Column => {
            let mask = tablet.schema().column_lock_mask(row);
            debug_assert!(!mask.is_empty());
            mask
        }
    }
}

/// Decodes and executes a batch of atomic write commands against the
/// tablet's active store.
///
/// With `prelock`, each row is checked against inactive stores and
/// locked before the mutation is sequenced; the acquired refs go to the
/// transaction's prelocked list, to be confirmed when the mutation
/// applies.
pub fn execute_atomic_write(
    tablet: &mut Tablet,
    transaction: &mut Transaction,
    reader: &mut WireReader,
    pending: &mut Option<PendingCommand>,
    lock_mode: LockMode,
    prelock: bool,
) -> MarlResult<WriteExecution> {
    tablet.validate_mounted()?;

    loop {
        let command = match pending.take() {
            Some(command) => command,
            None => {
                if reader.is_finished() {
                    return Ok(WriteExecution::Done);
                }
                match reader.read_command()? {
                    WireCommand::WriteRow => {
                        reader.read_message()?;
                        let row = reader.read_row()?;
                        PendingCommand::Write(row)
                    }
                    WireCommand::DeleteRow => {
                        reader.read_message()?;
                        let row = reader.read_row()?;
                        let key = row.key(tablet.schema().key_column_count()).ok_or_else(|| {
                            MarlError::InvalidRow("delete command carries a malformed key".into())
                        })?;
                        PendingCommand::Delete(key)
                    }
                    other => {
                        return Err(MarlError::InvalidWireCommand(format!(
                            "unsupported command {other:?} in an atomic write batch"
                        )));
                    }
                }
            }
        };

        let outcome = match &command {
            PendingCommand::Write(row) => {
                tablet.schema().validate_row(row)?;
                if row.len() == tablet.schema().key_column_count() {
                    return Err(MarlError::InvalidRow("empty writes are not allowed".into()));
                }
                let lock_mask = compute_lock_mask(tablet, row, lock_mode);
                let key = row
                    .key(tablet.schema().key_column_count())
                    .expect("validated above");
                if prelock {
                    check_inactive_stores_locks(tablet, transaction, &key, lock_mask)?;
                }
                write_to_active_store(tablet, transaction, row, lock_mask)?
            }
            PendingCommand::Delete(key) => {
                tablet.schema().validate_key(key)?;
                if prelock {
                    check_inactive_stores_locks(tablet, transaction, key, LockMask::PRIMARY)?;
                }
                delete_in_active_store(tablet, transaction, key)?
            }
        };

        match outcome {
            WriteOutcome::Written => {
                let record = match command {
                    PendingCommand::Write(row) => WriteLogRecord::Write {
                        tablet_id: tablet.id(),
                        row,
                    },
                    PendingCommand::Delete(key) => WriteLogRecord::Delete {
                        tablet_id: tablet.id(),
                        key,
                    },
                };
                transaction.immediate_locked_write_log.push(record);
            }
            WriteOutcome::Blocked {
                key,
                lock_mask: _,
                timestamp,
            } => {
                *pending = Some(command);
                let store_id = tablet
                    .active_store_id()
                    .expect("write dispatched to a tablet without an active store");
                return Ok(WriteExecution::Blocked {
                    store_id,
                    key,
                    timestamp,
                });
            }
        }
    }
}

fn active_sorted_store(tablet: &Tablet) -> MarlResult<Arc<SortedDynamicStore>> {
    let store = tablet
        .active_store()
        .ok_or_else(|| marl_errors::internal_err!("tablet {} has no active store", tablet.id()))?;
    store
        .as_sorted_dynamic()
        .cloned()
        .ok_or_else(|| marl_errors::internal_err!("active store of {} is not sorted", tablet.id()))
}

fn active_ordered_store(tablet: &Tablet) -> MarlResult<Arc<OrderedDynamicStore>> {
    let store = tablet
        .active_store()
        .ok_or_else(|| marl_errors::internal_err!("tablet {} has no active store", tablet.id()))?;
    store
        .as_ordered_dynamic()
        .cloned()
        .ok_or_else(|| marl_errors::internal_err!("active store of {} is not ordered", tablet.id()))
}

fn write_to_active_store(
    tablet: &mut Tablet,
    transaction: &mut Transaction,
    row: &UnversionedRow,
    lock_mask: LockMask,
) -> MarlResult<WriteOutcome> {
    let store = active_sorted_store(tablet)?;
    let outcome =
        store.write_row_atomic(transaction.id, transaction.start_timestamp, row, lock_mask)?;
    if let WriteOutcome::Written = outcome {
        let key = row
            .key(tablet.schema().key_column_count())
            .expect("validated by the caller");
        push_row_ref(tablet, transaction, store.id(), key);
    }
    Ok(outcome)
}

fn delete_in_active_store(
    tablet: &mut Tablet,
    transaction: &mut Transaction,
    key: &Key,
) -> MarlResult<WriteOutcome> {
    let store = active_sorted_store(tablet)?;
    let outcome = store.delete_row_atomic(transaction.id, transaction.start_timestamp, key)?;
    if let WriteOutcome::Written = outcome {
        push_row_ref(tablet, transaction, store.id(), key.clone());
    }
    Ok(outcome)
}

fn push_row_ref(tablet: &Tablet, transaction: &mut Transaction, store_id: StoreId, key: Key) {
    let row_ref = RowRef {
        tablet_id: tablet.id(),
        store_id,
        key,
    };
    if transaction.prelocked_rows.contains(&row_ref) || transaction.locked_rows.contains(&row_ref) {
        return;
    }
    transaction.prelocked_rows.push_back(row_ref);
}

/// Checks a row against locks and recent commits in every store other
/// than the active one: the locked passive stores, plus any store whose
/// maximum timestamp exceeds the transaction's start timestamp.
fn check_inactive_stores_locks(
    tablet: &Tablet,
    transaction: &Transaction,
    key: &Key,
    lock_mask: LockMask,
) -> MarlResult<()> {
    for store_id in &tablet.manager.locked_store_ids {
        let Some(store) = tablet.find_store(*store_id) else {
            continue;
        };
        if let Some(dynamic) = store.as_sorted_dynamic() {
            if let Some(WriteOutcome::Blocked { key, timestamp, .. }) = dynamic.check_row_locks(
                key,
                transaction.id,
                transaction.start_timestamp,
                lock_mask,
            )? {
                // A blocked row in a passive store resolves exactly like
                // one in the active store: surface it as a conflict with
                // the prepared holder.
                return Err(MarlError::TransactionLockConflict {
                    key: key.to_string(),
                    holder_id: None,
                    last_commit_timestamp: timestamp.0,
                });
            }
        }
    }

    for ((max_timestamp, store_id), ()) in tablet.manager.max_timestamp_index.iter().rev() {
        if *max_timestamp <= transaction.start_timestamp {
            break;
        }
        let Some(store) = tablet.find_store(*store_id) else {
            continue;
        };
        match store {
            Store::SortedDynamic(dynamic) => {
                // Locked stores were checked above.
                if dynamic.lock_count() > 0 {
                    continue;
                }
                dynamic.check_row_locks(
                    key,
                    transaction.id,
                    transaction.start_timestamp,
                    lock_mask,
                )?;
            }
            Store::SortedChunk(chunk) => {
                // A chunk store cannot be consulted row by row here;
                // conflict conservatively when the key falls in its
                // range.
                let meta = chunk.meta();
                let in_range = !meta.min_key.as_ref().is_some_and(|min| key < min)
                    && !meta.max_key.as_ref().is_some_and(|max| key > max);
                if in_range {
                    return Err(MarlError::TransactionLockConflict {
                        key: key.to_string(),
                        holder_id: None,
                        last_commit_timestamp: max_timestamp.0,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Decodes and executes a non-atomic write batch: every row commits
/// immediately at its supplied timestamp.
pub fn execute_non_atomic_write(tablet: &mut Tablet, reader: &mut WireReader) -> MarlResult<()> {
    tablet.validate_mounted()?;
    while !reader.is_finished() {
        match reader.read_command()? {
            WireCommand::VersionedWriteRow => {
                let commit_timestamp = Timestamp(reader.read_versioned_write_message()?);
                let row = reader.read_row()?;
                tablet.schema().validate_row(&row)?;
                let store = active_sorted_store(tablet)?;
                store.write_row_non_atomic(&row, commit_timestamp)?;
            }
            other => {
                return Err(MarlError::InvalidWireCommand(format!(
                    "unsupported command {other:?} in a non-atomic write batch"
                )));
            }
        }
    }
    Ok(())
}

/// Applies an ordered tablet's delayed write log at commit time.
pub fn apply_ordered_commit(
    tablet: &mut Tablet,
    records: &[WriteLogRecord],
    commit_timestamp: Timestamp,
) -> MarlResult<()> {
    if records.is_empty() {
        return Ok(());
    }
    let store = active_ordered_store(tablet)?;
    let mut appended = 0u64;
    for record in records {
        match record {
            WriteLogRecord::Write { tablet_id, row } if *tablet_id == tablet.id() => {
                store.write_row(row.clone(), commit_timestamp);
                appended += 1;
            }
            _ => {}
        }
    }
    tablet.set_total_row_count(tablet.total_row_count() + appended);
    Ok(())
}

/// Visits a committed transaction's row in its store, migrating it to
/// the active store first when the owning store has been rotated out.
pub fn commit_row(
    tablet: &mut Tablet,
    transaction_id: TransactionId,
    commit_timestamp: Timestamp,
    row_ref: &RowRef,
) -> MarlResult<()> {
    let Some(store) = tablet.find_store(row_ref.store_id) else {
        marl_errors::internal!(
            "committing transaction {transaction_id} references unknown store {}",
            row_ref.store_id
        );
    };
    let store = store
        .as_sorted_dynamic()
        .cloned()
        .ok_or_else(|| marl_errors::internal_err!("row ref into a non-dynamic store"))?;

    if tablet.active_store_id() == Some(store.id()) {
        store.commit_row(transaction_id, commit_timestamp, &row_ref.key)?;
        return Ok(());
    }

    // The store was rotated mid-transaction: graft the uncommitted state
    // onto the active store, release here, publish there.
    let active = active_sorted_store(tablet)?;
    if let Some(migration) = store.extract_migration(transaction_id, &row_ref.key) {
        active.migrate_row(transaction_id, migration)?;
        store.commit_row(transaction_id, commit_timestamp, &row_ref.key)?;
        active.commit_row(transaction_id, commit_timestamp, &row_ref.key)?;
    } else {
        store.commit_row(transaction_id, commit_timestamp, &row_ref.key)?;
    }
    check_for_unlocked_store(tablet, store.id());
    Ok(())
}

/// Rolls back an aborted transaction's row.
pub fn abort_row(tablet: &mut Tablet, transaction_id: TransactionId, row_ref: &RowRef) {
    if let Some(store) = tablet.find_store(row_ref.store_id) {
        if let Some(dynamic) = store.as_sorted_dynamic().cloned() {
            dynamic.abort_row(transaction_id, &row_ref.key);
            check_for_unlocked_store(tablet, dynamic.id());
        }
    }
}

/// Stamps a prepared transaction's prepare timestamp onto its row.
pub fn prepare_row(tablet: &Tablet, transaction_id: TransactionId, prepare_timestamp: Timestamp, row_ref: &RowRef) {
    if let Some(store) = tablet.find_store(row_ref.store_id) {
        if let Some(dynamic) = store.as_sorted_dynamic() {
            dynamic.prepare_row(transaction_id, prepare_timestamp, &row_ref.key);
        }
    }
}

fn check_for_unlocked_store(tablet: &mut Tablet, store_id: StoreId) {
    if tablet.active_store_id() == Some(store_id) {
        return;
    }
    let Some(dynamic) = tablet
        .find_store(store_id)
        .and_then(|store| store.as_sorted_dynamic().cloned())
    else {
        return;
    };
    if dynamic.lock_count() > 0 {
        return;
    }
    info!(store_id = %store_id, "store unlocked");
    tablet.manager.locked_store_ids.remove(&store_id);
    if dynamic.state() == StoreState::Removed {
        // Flushed and now unlocked: nothing references the store.
        let _ = tablet.remove_store(store_id);
    }
}

/// True iff there are outstanding locks in the active or any passive
/// store; unmount waits for this to clear.
pub fn has_active_locks(tablet: &Tablet) -> bool {
    if let Some(Store::SortedDynamic(active)) = tablet.active_store() {
        if active.lock_count() > 0 {
            return true;
        }
    }
    !tablet.manager.locked_store_ids.is_empty()
}

/// True iff some dynamic store has not been flushed yet.
pub fn has_unflushed_stores(tablet: &Tablet) -> bool {
    tablet
        .stores()
        .values()
        .any(|store| store.state() != StoreState::Persistent)
}

/// Overflow gating: the active store hit a row, value or memory
/// threshold.
pub fn is_overflow_rotation_needed(tablet: &Tablet, config: &TableMountConfig) -> bool {
    if !is_rotation_possible(tablet) {
        return false;
    }
    let Some(store) = tablet.active_store() else {
        return false;
    };
    match store {
        Store::SortedDynamic(store) => {
            store.row_count() >= config.max_dynamic_store_row_count as u64
                || store.value_count() >= config.max_dynamic_store_value_count as u64
                || store.pool_size() >= config.max_dynamic_store_pool_size as u64
                || store.revision_count() >= crate::store::SOFT_REVISION_LIMIT
        }
        Store::OrderedDynamic(store) => {
            store.row_count() >= config.max_dynamic_store_row_count as u64
                || store.pool_size() >= config.max_dynamic_store_pool_size as u64
        }
        _ => false,
    }
}

/// Periodic gating: the active store is old enough and non-empty.
pub fn is_periodic_rotation_needed(tablet: &Tablet, config: &TableMountConfig, now: Instant) -> bool {
    if !is_rotation_possible(tablet) {
        return false;
    }
    let due = match tablet.manager.last_rotated {
        Some(last) => now >= last + config.dynamic_store_auto_flush_period,
        None => true,
    };
    due && tablet.active_store().is_some_and(|store| store.row_count() > 0)
}

/// Whether rotation can run at all: an active store exists, it is
/// non-empty (ordered tablets must never rotate an empty store, or row
/// indexes would collide; the check is kept for sorted tablets too), and
/// no rotation is already scheduled.
pub fn is_rotation_possible(tablet: &Tablet) -> bool {
    if tablet.manager.rotation_scheduled {
        return false;
    }
    match tablet.active_store() {
        None => false,
        Some(store) => store.row_count() > 0,
    }
}

/// Whether a memory-pressure rotation makes sense: the store has grown
/// past its initial allocation.
pub fn is_forced_rotation_possible(tablet: &Tablet, config: &TabletManagerConfig) -> bool {
    if !is_rotation_possible(tablet) {
        return false;
    }
    tablet
        .active_store()
        .is_some_and(|store| store.uncompressed_data_size() > 2 * config.pool_chunk_size as u64)
}

/// Marks a rotation as pending; the next mutation executes it.
pub fn schedule_rotation(tablet: &mut Tablet) {
    if tablet.manager.rotation_scheduled {
        return;
    }
    tablet.manager.rotation_scheduled = true;
    info!(tablet_id = %tablet.id(), "tablet store rotation scheduled");
}

/// Rotates the active store out and optionally creates a fresh one.
pub fn rotate(tablet: &mut Tablet, create_new: bool, now: Instant) -> MarlResult<()> {
    tablet.manager.rotation_scheduled = false;
    tablet.manager.last_rotated = Some(now);

    let store = tablet
        .active_store()
        .ok_or_else(|| marl_errors::internal_err!("rotating tablet {} without an active store", tablet.id()))?
        .clone();
    store.set_state(StoreState::PassiveDynamic);

    let lock_count = match &store {
        Store::SortedDynamic(dynamic) => dynamic.lock_count(),
        _ => 0,
    };
    if lock_count > 0 {
        info!(
            store_id = %store.id(),
            lock_count,
            "active store is locked and will be kept"
        );
        invariant!(
            tablet.manager.locked_store_ids.insert(store.id()),
            "rotated store {} already tracked as locked",
            store.id()
        );
    } else {
        debug!(store_id = %store.id(), "active store is not locked");
    }

    tablet
        .manager
        .max_timestamp_index
        .insert((store.max_timestamp(), store.id()), ());

    if create_new {
        create_active_store(tablet)?;
    } else {
        tablet.set_active_store(None);
    }

    info!(tablet_id = %tablet.id(), "tablet stores rotated");
    Ok(())
}

/// Creates and installs a fresh active dynamic store.
pub fn create_active_store(tablet: &mut Tablet) -> MarlResult<StoreId> {
    let store_id = StoreId::generate();
    let store = if tablet.is_sorted() {
        Store::SortedDynamic(Arc::new(SortedDynamicStore::new(
            store_id,
            Arc::clone(tablet.schema()),
        )))
    } else {
        let starting_row_index = compute_starting_row_index(tablet)?;
        Store::OrderedDynamic(Arc::new(OrderedDynamicStore::new(
            store_id,
            Arc::clone(tablet.schema()),
            starting_row_index,
        )))
    };
    tablet.add_store(store)?;
    tablet.set_active_store(Some(store_id));
    info!(tablet_id = %tablet.id(), store_id = %store_id, "active store created");
    Ok(store_id)
}

fn compute_starting_row_index(tablet: &Tablet) -> MarlResult<u64> {
    let Some((start, store_id)) = tablet
        .store_row_index()
        .iter()
        .next_back()
        .map(|(start, id)| (*start, *id))
    else {
        return Ok(tablet.trimmed_row_count());
    };
    let store = tablet
        .find_store(store_id)
        .ok_or_else(|| marl_errors::internal_err!("row index map references unknown store"))?;
    let row_count = store.row_count();
    invariant!(
        row_count > 0,
        "ordered store {store_id} in the row index map is empty"
    );
    Ok(start + row_count)
}

/// Adds a store produced by mount, flush, compaction or partitioning.
/// For in-memory tablets the chunk is preloaded from intercepted data
/// when available, otherwise queued for background preload.
pub fn add_store(
    tablet: &mut Tablet,
    store: Store,
    on_mount: bool,
    intercepted: Option<PreloadedBlocks>,
) -> MarlResult<()> {
    let store_id = store.id();
    let is_chunk = store.is_chunk();
    tablet.add_store(store)?;

    if is_chunk {
        let store = tablet.find_store(store_id).expect("just added").clone();
        tablet
            .manager
            .max_timestamp_index
            .insert((store.max_timestamp(), store_id), ());

        if tablet.config().in_memory_mode != InMemoryMode::None && !on_mount {
            match intercepted {
                Some(blocks) if blocks.mode == tablet.config().in_memory_mode => {
                    set_preload_state(&store, PreloadState::Complete);
                    match &store {
                        Store::SortedChunk(chunk) => chunk.preload(blocks),
                        Store::OrderedChunk(chunk) => chunk.preload(blocks),
                        _ => unreachable!("chunk checked above"),
                    }
                    info!(store_id = %store_id, "store preloaded from intercepted chunk data");
                }
                other => {
                    if other.is_some() {
                        tracing::warn!(
                            store_id = %store_id,
                            "intercepted chunk data has mismatching mode; falling back to preload"
                        );
                    }
                    schedule_store_preload(tablet, store_id);
                }
            }
        }
    }
    Ok(())
}

/// Removes a store after a successful store-set update. Dynamic stores
/// still holding transaction locks stay behind in the `Removed` state
/// until the last lock is released.
pub fn remove_store(tablet: &mut Tablet, store_id: StoreId) -> MarlResult<()> {
    let Some(store) = tablet.find_store(store_id) else {
        marl_errors::internal!("removing unknown store {store_id}");
    };
    invariant!(
        store.state() != StoreState::ActiveDynamic,
        "removing the active store {store_id}"
    );
    let keep_for_locks = match store {
        Store::SortedDynamic(dynamic) => dynamic.lock_count() > 0,
        _ => false,
    };
    if keep_for_locks {
        store.set_state(StoreState::Removed);
        info!(store_id = %store_id, "store removed but kept for outstanding locks");
        return Ok(());
    }
    store.set_state(StoreState::Removed);
    tablet.manager.locked_store_ids.remove(&store_id);
    tablet.remove_store(store_id)?;
    Ok(())
}

/// Whether the flusher may pick this store up.
pub fn is_store_flushable(tablet: &Tablet, store: &Store) -> bool {
    if store.state() != StoreState::PassiveDynamic {
        return false;
    }
    if store.flush_state() != FlushState::None {
        return false;
    }
    // Ordered stores must flush in row-index order.
    if let Store::OrderedDynamic(ordered) = store {
        let mut earlier = tablet
            .store_row_index()
            .range(..ordered.starting_row_index())
            .rev();
        if let Some((_, previous_id)) = earlier.next() {
            let previous = tablet.find_store(*previous_id);
            if previous.is_some_and(|store| store.state() != StoreState::Persistent) {
                return false;
            }
        }
    }
    true
}

/// Whether the compactor may pick this store up: persistent, with no
/// flush, compaction or preload in flight.
pub fn is_store_compactable(store: &Store) -> bool {
    if !store.is_chunk() || store.state() != StoreState::Persistent {
        return false;
    }
    if store.compaction_state() != CompactionState::None {
        return false;
    }
    let preload_state = match store {
        Store::SortedChunk(chunk) => chunk.preload_state(),
        Store::OrderedChunk(chunk) => chunk.preload_state(),
        _ => return false,
    };
    !matches!(preload_state, PreloadState::Scheduled | PreloadState::Running)
}

fn set_flush_state(store: &Store, state: FlushState) {
    match store {
        Store::SortedDynamic(dynamic) => dynamic.set_flush_state(state),
        Store::OrderedDynamic(dynamic) => dynamic.set_flush_state(state),
        _ => {}
    }
}

fn set_compaction_state(store: &Store, state: CompactionState) {
    match store {
        Store::SortedChunk(chunk) => chunk.set_compaction_state(state),
        Store::OrderedChunk(chunk) => chunk.set_compaction_state(state),
        _ => {}
    }
}

fn set_preload_state(store: &Store, state: PreloadState) {
    match store {
        Store::SortedChunk(chunk) => chunk.set_preload_state(state),
        Store::OrderedChunk(chunk) => chunk.set_preload_state(state),
        _ => {}
    }
}

/// Claims a store for a flush task.
pub fn begin_store_flush(store: &Store) -> MarlResult<()> {
    invariant!(
        store.flush_state() == FlushState::None,
        "store {} is already being flushed",
        store.id()
    );
    set_flush_state(store, FlushState::Running);
    Ok(())
}

/// Marks a flush as completed; the store awaits removal.
pub fn end_store_flush(store: &Store) {
    set_flush_state(store, FlushState::Complete);
}

/// Marks a flush as failed and schedules the timed reset back to idle.
pub fn backoff_store_flush(store: &Store, backoff: Duration) {
    set_flush_state(store, FlushState::Failed);
    let store = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        if store.flush_state() == FlushState::Failed {
            set_flush_state(&store, FlushState::None);
        }
    });
}

/// Claims a store for a compaction or partitioning task.
pub fn begin_store_compaction(store: &Store) -> MarlResult<()> {
    invariant!(
        store.compaction_state() == CompactionState::None,
        "store {} is already being compacted",
        store.id()
    );
    set_compaction_state(store, CompactionState::Running);
    Ok(())
}

/// Marks a compaction as completed.
pub fn end_store_compaction(store: &Store) {
    set_compaction_state(store, CompactionState::Complete);
}

/// Marks a compaction as failed and schedules the timed reset.
pub fn backoff_store_compaction(store: &Store, backoff: Duration) {
    set_compaction_state(store, CompactionState::Failed);
    let store = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        if store.compaction_state() == CompactionState::Failed {
            set_compaction_state(&store, CompactionState::None);
        }
    });
}

/// Queues a chunk store for background preload.
pub fn schedule_store_preload(tablet: &mut Tablet, store_id: StoreId) {
    let Some(store) = tablet.find_store(store_id) else {
        return;
    };
    let state = match store {
        Store::SortedChunk(chunk) => chunk.preload_state(),
        Store::OrderedChunk(chunk) => chunk.preload_state(),
        _ => return,
    };
    if !matches!(state, PreloadState::None | PreloadState::Failed) {
        return;
    }
    set_preload_state(store, PreloadState::Scheduled);
    tablet.manager.preload_store_ids.push_back(store_id);
    info!(store_id = %store_id, "scheduled preload of in-memory store");
}

/// The next store queued for preload, skipping stale entries.
pub fn peek_store_for_preload(tablet: &mut Tablet) -> Option<Store> {
    while let Some(store_id) = tablet.manager.preload_store_ids.front().copied() {
        if let Some(store) = tablet.find_store(store_id) {
            let scheduled = match store {
                Store::SortedChunk(chunk) => chunk.preload_state() == PreloadState::Scheduled,
                Store::OrderedChunk(chunk) => chunk.preload_state() == PreloadState::Scheduled,
                _ => false,
            };
            if scheduled {
                return Some(store.clone());
            }
        }
        tablet.manager.preload_store_ids.pop_front();
    }
    None
}

/// Claims the head of the preload queue for a running preload task.
pub fn begin_store_preload(tablet: &mut Tablet, store: &Store) {
    debug_assert_eq!(
        tablet.manager.preload_store_ids.front(),
        Some(&store.id())
    );
    tablet.manager.preload_store_ids.pop_front();
    set_preload_state(store, PreloadState::Running);
}

/// Marks a preload as completed.
pub fn end_store_preload(store: &Store) {
    set_preload_state(store, PreloadState::Complete);
}

/// Marks a preload as failed; it will be rescheduled by the next scan
/// after the backoff.
pub fn backoff_store_preload(store: &Store, backoff: Duration) {
    if match store {
        Store::SortedChunk(chunk) => chunk.preload_state(),
        Store::OrderedChunk(chunk) => chunk.preload_state(),
        _ => return,
    } != PreloadState::Running
    {
        return;
    }
    set_preload_state(store, PreloadState::Failed);
    let store = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        if match &store {
            Store::SortedChunk(chunk) => chunk.preload_state(),
            Store::OrderedChunk(chunk) => chunk.preload_state(),
            _ => return,
        } == PreloadState::Failed
        {
            set_preload_state(&store, PreloadState::None);
        }
    });
}

/// Remount: swaps the mount config and reconciles preload scheduling
/// with the new in-memory mode.
pub fn remount(tablet: &mut Tablet, config: Arc<TableMountConfig>) {
    tablet.set_config(config);
    update_in_memory_mode(tablet);
}

/// Re-derives every chunk store's preload state from the tablet's
/// in-memory mode, rescheduling or disabling preloads as needed.
pub fn update_in_memory_mode(tablet: &mut Tablet) {
    // Unschedule everything first; surviving entries are re-added below.
    let scheduled: Vec<StoreId> = tablet.manager.preload_store_ids.drain(..).collect();
    for store_id in scheduled {
        if let Some(store) = tablet.find_store(store_id) {
            set_preload_state(store, PreloadState::None);
        }
    }

    let mode = tablet.config().in_memory_mode;
    let chunk_ids: Vec<StoreId> = tablet
        .stores()
        .values()
        .filter(|store| store.is_chunk())
        .map(Store::id)
        .collect();
    for store_id in chunk_ids {
        if mode == InMemoryMode::None {
            if let Some(store) = tablet.find_store(store_id) {
                set_preload_state(store, PreloadState::Disabled);
            }
        } else {
            if let Some(store) = tablet.find_store(store_id) {
                if store.compaction_state() == CompactionState::None {
                    set_preload_state(store, PreloadState::None);
                }
            }
            schedule_store_preload(tablet, store_id);
        }
    }
}

/// Mounts the tablet: installs the given chunk stores, then creates the
/// active store (in that order, so ordered tablets compute the right
/// starting row index), and flips the state to `Mounted`.
pub fn mount(tablet: &mut Tablet, stores: Vec<Store>) -> MarlResult<()> {
    for store in stores {
        add_store(tablet, store, true, None)?;
    }
    if !tablet.is_sorted() {
        let total = tablet
            .store_row_index()
            .iter()
            .next_back()
            .and_then(|(start, id)| {
                tablet
                    .find_store(*id)
                    .map(|store| *start + store.row_count())
            })
            .unwrap_or(0);
        tablet.set_total_row_count(total);
    }
    create_active_store(tablet)?;
    tablet.set_state(TabletState::Mounted);
    if tablet.config().in_memory_mode != InMemoryMode::None {
        update_in_memory_mode(tablet);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use marl_client::wire::WireWriter;
    use marl_data::{ColumnSchema, KeyBound, Value, ValueType};
    use marl_data::TableSchema;

    use super::*;
    use crate::config::TableMountConfig;
    use marl_client::TabletId;

    fn mounted_tablet() -> Tablet {
        let schema = Arc::new(
            TableSchema::new(vec![
                ColumnSchema::key("k", ValueType::Int64),
                ColumnSchema::value("v", ValueType::Int64),
            ])
            .unwrap(),
        );
        let mut tablet = Tablet::new(
            TabletId::generate(),
            schema,
            Arc::new(TableMountConfig::default()),
            1,
            Key::empty(),
            KeyBound::Unbounded,
            0,
        );
        mount(&mut tablet, Vec::new()).unwrap();
        tablet
    }

    fn transaction(start: u64) -> Transaction {
        Transaction::new(
            TransactionId::generate(),
            Timestamp(start),
            Duration::from_secs(10),
            false,
        )
    }

    fn write_batch(rows: &[(i64, i64)]) -> WireReader {
        let mut writer = WireWriter::new();
        for (k, v) in rows {
            writer.write_row(&UnversionedRow::from_pairs([
                (0, Value::Int64(*k)),
                (1, Value::Int64(*v)),
            ]));
        }
        WireReader::new(writer.finish())
    }

    #[test]
    fn batch_write_locks_rows_in_active_store() {
        let mut tablet = mounted_tablet();
        let mut tx = transaction(100);
        let mut reader = write_batch(&[(1, 10), (2, 20)]);
        let mut pending = None;

        let result = execute_atomic_write(
            &mut tablet,
            &mut tx,
            &mut reader,
            &mut pending,
            LockMode::Row,
            true,
        )
        .unwrap();
        assert!(matches!(result, WriteExecution::Done));
        assert_eq!(tx.prelocked_rows.len(), 2);
        assert_eq!(tx.immediate_locked_write_log.len(), 2);

        let active = active_sorted_store(&tablet).unwrap();
        assert_eq!(active.lock_count(), 2);
    }

    #[test]
    fn empty_write_is_rejected() {
        let mut tablet = mounted_tablet();
        let mut tx = transaction(100);
        let mut writer = WireWriter::new();
        writer.write_row(&UnversionedRow::from_pairs([(0, Value::Int64(1))]));
        let mut reader = WireReader::new(writer.finish());
        let mut pending = None;

        let error = execute_atomic_write(
            &mut tablet,
            &mut tx,
            &mut reader,
            &mut pending,
            LockMode::Row,
            true,
        )
        .unwrap_err();
        assert!(matches!(error, MarlError::InvalidRow(_)));
    }

    #[test]
    fn rotation_gating() {
        let mut tablet = mounted_tablet();
        let config = TableMountConfig::default();

        // Empty active store: no rotation of any kind.
        assert!(!is_rotation_possible(&tablet));
        assert!(!is_overflow_rotation_needed(&tablet, &config));

        let mut tx = transaction(100);
        let mut reader = write_batch(&[(1, 10)]);
        let mut pending = None;
        execute_atomic_write(
            &mut tablet,
            &mut tx,
            &mut reader,
            &mut pending,
            LockMode::Row,
            true,
        )
        .unwrap();
        let store = active_sorted_store(&tablet).unwrap();
        store.commit_row(tx.id, Timestamp(110), &Key::from([Value::Int64(1)])).unwrap();

        assert!(is_rotation_possible(&tablet));
        schedule_rotation(&mut tablet);
        assert!(!is_rotation_possible(&tablet));

        rotate(&mut tablet, true, Instant::now()).unwrap();
        assert_eq!(tablet.stores().len(), 2);
        assert!(tablet.manager.locked_store_ids.is_empty());
        assert_eq!(tablet.manager.max_timestamp_index.len(), 1);
    }

    #[test]
    fn rotation_keeps_locked_store() {
        let mut tablet = mounted_tablet();
        let mut tx = transaction(100);
        let mut reader = write_batch(&[(1, 10)]);
        let mut pending = None;
        execute_atomic_write(
            &mut tablet,
            &mut tx,
            &mut reader,
            &mut pending,
            LockMode::Row,
            true,
        )
        .unwrap();

        let passive_id = tablet.active_store_id().unwrap();
        rotate(&mut tablet, true, Instant::now()).unwrap();
        assert!(tablet.manager.locked_store_ids.contains(&passive_id));

        // Committing the straddling transaction migrates the row and
        // releases the passive store.
        let row_ref = tx.prelocked_rows[0].clone();
        commit_row(&mut tablet, tx.id, Timestamp(120), &row_ref).unwrap();
        assert!(!tablet.manager.locked_store_ids.contains(&passive_id));

        let active = active_sorted_store(&tablet).unwrap();
        let row = active
            .lookup(&Key::from([Value::Int64(1)]), Timestamp(120))
            .unwrap();
        assert_eq!(row.values[0].value, Value::Int64(10));
    }

    #[test]
    fn conflicting_write_against_rotated_store() {
        let mut tablet = mounted_tablet();

        // Commit a row at timestamp 150, then rotate it away.
        let mut tx1 = transaction(100);
        let mut reader = write_batch(&[(1, 10)]);
        let mut pending = None;
        execute_atomic_write(
            &mut tablet,
            &mut tx1,
            &mut reader,
            &mut pending,
            LockMode::Row,
            true,
        )
        .unwrap();
        let row_ref = tx1.prelocked_rows[0].clone();
        commit_row(&mut tablet, tx1.id, Timestamp(150), &row_ref).unwrap();
        rotate(&mut tablet, true, Instant::now()).unwrap();

        // A transaction that started before that commit must conflict,
        // even though the row now lives in a passive store.
        let mut tx2 = transaction(120);
        let mut reader = write_batch(&[(1, 11)]);
        let mut pending = None;
        let error = execute_atomic_write(
            &mut tablet,
            &mut tx2,
            &mut reader,
            &mut pending,
            LockMode::Row,
            true,
        )
        .unwrap_err();
        assert!(matches!(error, MarlError::TransactionLockConflict { .. }));
    }
}
