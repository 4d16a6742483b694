//! The tablet cell's automaton surface.
//!
//! All tablet and transaction state lives behind one async mutex, the
//! Rust rendition of the single-writer automaton thread: every mutation
//! and every state transition happens under it, and background tasks
//! take it only for short, non-blocking sections. Persistent changes are
//! committed through the [`MutationLog`] and applied by
//! [`TabletCell::apply_mutation`] on every replica.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use indexmap::IndexMap;
use marl_client::{wire::WireReader, Signature, StoreId, TabletId, TransactionId};
use marl_data::{Key, KeyBound, TableSchema, Timestamp, UnversionedRow};
use marl_errors::{MarlError, MarlResult};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TabletNodeConfig;
use crate::in_memory::InMemoryManager;
use crate::interfaces::{
    ChunkStorage, MasterClient, Mutation, MutationLog, TimestampProvider, TransactionSupervisor,
};
use crate::reader::{lookup_rows, read_ordered_rows, SchemafulRangeReader};
use crate::store::{
    AddStoreDescriptor, OrderedChunkStore, SortedChunkStore, Store, StoreType,
};
use crate::store_manager::{self, LockMode, PendingCommand, WriteExecution};
use crate::tablet::{Tablet, TabletSnapshot, TabletState};
use crate::transaction::WriteLogRecord;
use crate::transaction_manager::{TransactionEvent, TransactionManager};

/// Everything the automaton guards.
pub struct TabletCellState {
    /// Tablets by id.
    pub tablets: IndexMap<TabletId, Tablet>,
    /// The cell's transaction manager.
    pub transactions: TransactionManager,
}

impl TabletCellState {
    /// A tablet or `TabletNotMounted`.
    pub fn tablet(&self, tablet_id: TabletId) -> MarlResult<&Tablet> {
        self.tablets.get(&tablet_id).ok_or_else(|| MarlError::TabletNotMounted {
            tablet_id: tablet_id.to_string(),
            state: "missing".to_string(),
        })
    }

    /// A tablet, mutable.
    pub fn tablet_mut(&mut self, tablet_id: TabletId) -> MarlResult<&mut Tablet> {
        self.tablets
            .get_mut(&tablet_id)
            .ok_or_else(|| MarlError::TabletNotMounted {
                tablet_id: tablet_id.to_string(),
                state: "missing".to_string(),
            })
    }
}

/// One tablet cell: the tablets it hosts plus the services they share.
pub struct TabletCell {
    config: Arc<TabletNodeConfig>,
    state: Mutex<TabletCellState>,

    mutation_log: Arc<dyn MutationLog>,
    master: Arc<dyn MasterClient>,
    storage: Arc<dyn ChunkStorage>,
    timestamps: Arc<dyn TimestampProvider>,
    in_memory: Arc<InMemoryManager>,

    epoch: Mutex<Option<CancellationToken>>,
}

impl TabletCell {
    /// Wires up a cell.
    pub fn new(
        config: Arc<TabletNodeConfig>,
        mutation_log: Arc<dyn MutationLog>,
        master: Arc<dyn MasterClient>,
        storage: Arc<dyn ChunkStorage>,
        timestamps: Arc<dyn TimestampProvider>,
        in_memory: Arc<InMemoryManager>,
    ) -> Arc<TabletCell> {
        let transactions = TransactionManager::new(
            config.transaction_manager.clone(),
            Arc::clone(&timestamps),
        );
        Arc::new(TabletCell {
            config,
            state: Mutex::new(TabletCellState {
                tablets: IndexMap::new(),
                transactions,
            }),
            mutation_log,
            master,
            storage,
            timestamps,
            in_memory,
            epoch: Mutex::new(None),
        })
    }

    /// The node config.
    pub fn config(&self) -> &Arc<TabletNodeConfig> {
        &self.config
    }

    /// The replicated log.
    pub fn mutation_log(&self) -> &Arc<dyn MutationLog> {
        &self.mutation_log
    }

    /// The master client.
    pub fn master(&self) -> &Arc<dyn MasterClient> {
        &self.master
    }

    /// Cluster chunk storage.
    pub fn storage(&self) -> &Arc<dyn ChunkStorage> {
        &self.storage
    }

    /// The cluster timestamp provider.
    pub fn timestamps(&self) -> &Arc<dyn TimestampProvider> {
        &self.timestamps
    }

    /// The in-memory manager.
    pub fn in_memory(&self) -> &Arc<InMemoryManager> {
        &self.in_memory
    }

    /// Takes the automaton lock.
    pub async fn lock(&self) -> MutexGuard<'_, TabletCellState> {
        self.state.lock().await
    }

    /// Mounts a tablet with the given chunk stores.
    pub async fn mount_tablet(
        &self,
        tablet_id: TabletId,
        schema: Arc<TableSchema>,
        config: Arc<crate::config::TableMountConfig>,
        mount_revision: u64,
        pivot_key: Key,
        next_pivot_key: KeyBound,
        tablet_index: u32,
        store_descriptors: Vec<AddStoreDescriptor>,
    ) -> MarlResult<()> {
        config.validate()?;
        let mut stores = Vec::with_capacity(store_descriptors.len());
        for descriptor in &store_descriptors {
            stores.push(self.materialize_store(descriptor).await?);
        }

        let mut state = self.lock().await;
        let mut tablet = Tablet::new(
            tablet_id,
            schema,
            config,
            mount_revision,
            pivot_key,
            next_pivot_key,
            tablet_index,
        );
        store_manager::mount(&mut tablet, stores)?;
        info!(tablet_id = %tablet_id, mount_revision, "tablet mounted");
        state.tablets.insert(tablet_id, tablet);
        Ok(())
    }

    /// Builds a store object from an add descriptor.
    pub async fn materialize_store(&self, descriptor: &AddStoreDescriptor) -> MarlResult<Store> {
        let reader = self.storage.open_reader(descriptor.store_id.into()).await?;
        let store = match descriptor.store_type {
            StoreType::SortedChunk => Store::SortedChunk(Arc::new(SortedChunkStore::new(
                descriptor.store_id,
                descriptor.chunk_meta.clone(),
                reader,
            ))),
            StoreType::OrderedChunk => {
                let starting_row_index = descriptor.starting_row_index.ok_or_else(|| {
                    MarlError::InvalidConfig(
                        "ordered chunk descriptor is missing its starting row index".into(),
                    )
                })?;
                Store::OrderedChunk(Arc::new(OrderedChunkStore::new(
                    descriptor.store_id,
                    descriptor.chunk_meta.clone(),
                    reader,
                    starting_row_index,
                )))
            }
            other => {
                return Err(MarlError::InvalidConfig(format!(
                    "cannot materialize a {other} store from a descriptor"
                )));
            }
        };
        Ok(store)
    }

    /// Begins unmounting a tablet and advances the unmount state machine
    /// as far as current activity allows. Returns the state reached.
    ///
    /// `Mounted → UnmountWaitingForLocks` while transactions still hold
    /// row locks, then `UnmountFlushing` while dynamic stores await
    /// flush, then `Unmounted`. Callers re-invoke as locks drain and
    /// flushes land.
    pub async fn unmount_tablet(&self, tablet_id: TabletId) -> MarlResult<TabletState> {
        let mut state = self.lock().await;
        let tablet = state.tablet_mut(tablet_id)?;

        if tablet.state() == TabletState::Mounted {
            tablet.set_state(TabletState::UnmountWaitingForLocks);
        }
        if tablet.state() == TabletState::UnmountWaitingForLocks
            && !store_manager::has_active_locks(tablet)
        {
            tablet.set_state(TabletState::UnmountFlushing);
            if store_manager::is_rotation_possible(tablet) {
                store_manager::rotate(tablet, false, Instant::now())?;
            } else if let Some(active_id) = tablet.active_store_id() {
                // The active store is empty; discard it outright.
                tablet.set_active_store(None);
                let _ = tablet.remove_store(active_id);
            }
        }
        if tablet.state() == TabletState::UnmountFlushing
            && !store_manager::has_unflushed_stores(tablet)
        {
            tablet.set_state(TabletState::Unmounted);
            info!(tablet_id = %tablet_id, "tablet unmounted");
        }
        Ok(tablet.state())
    }

    /// Remounts a tablet with a fresh mount config.
    pub async fn remount_tablet(
        &self,
        tablet_id: TabletId,
        config: Arc<crate::config::TableMountConfig>,
    ) -> MarlResult<()> {
        config.validate()?;
        let mut state = self.lock().await;
        let tablet = state.tablet_mut(tablet_id)?;
        store_manager::remount(tablet, config);
        info!(tablet_id = %tablet_id, "tablet remounted");
        Ok(())
    }

    /// Builds a read snapshot of a tablet.
    pub async fn build_snapshot(&self, tablet_id: TabletId) -> MarlResult<Arc<TabletSnapshot>> {
        let state = self.lock().await;
        let tablet = state.tablet(tablet_id)?;
        tablet.validate_mounted()?;
        Ok(tablet.build_snapshot())
    }

    /// Executes an atomic write batch in a transaction, waiting out
    /// blocked rows up to `max_blocked_row_wait`.
    #[allow(clippy::too_many_arguments)]
    pub async fn write(
        &self,
        tablet_id: TabletId,
        transaction_id: TransactionId,
        start_timestamp: Timestamp,
        timeout: Duration,
        signature: Signature,
        lock_mode: LockMode,
        data: Bytes,
    ) -> MarlResult<()> {
        let mut reader = WireReader::new(data);
        let mut pending: Option<PendingCommand> = None;
        let wait_budget = self.config.tablet_manager.max_blocked_row_wait;
        let deadline = Instant::now() + wait_budget;

        loop {
            let mut unblocked = {
                let mut state = self.lock().await;
                let state = &mut *state;
                let transaction = state.transactions.get_or_create_transaction(
                    transaction_id,
                    start_timestamp,
                    timeout,
                    self.mutation_log.is_leader(),
                )?;
                if !transaction.is_active() {
                    return Err(transaction.invalid_state_error());
                }
                let mut transaction = transaction.clone();
                let tablet = state.tablets.get_mut(&tablet_id).ok_or_else(|| {
                    MarlError::TabletNotMounted {
                        tablet_id: tablet_id.to_string(),
                        state: "missing".to_string(),
                    }
                })?;

                let execution = store_manager::execute_atomic_write(
                    tablet,
                    &mut transaction,
                    &mut reader,
                    &mut pending,
                    lock_mode,
                    true,
                );

                match execution {
                    Ok(WriteExecution::Done) => {
                        // The batch is in: confirm the prelocked rows and
                        // account the signature share.
                        state.transactions.make_transaction_persistent(transaction_id)?;
                        let stored = state
                            .transactions
                            .find_transaction_mut(transaction_id)
                            .expect("persistent above");
                        while let Some(row_ref) = transaction.prelocked_rows.pop_front() {
                            stored.locked_rows.push(row_ref);
                        }
                        stored
                            .immediate_locked_write_log
                            .append(&mut transaction.immediate_locked_write_log);
                        state.transactions.add_signature(transaction_id, signature, true);
                        return Ok(());
                    }
                    Ok(WriteExecution::Blocked {
                        store_id,
                        key,
                        timestamp,
                    }) => {
                        // Keep the locks taken so far; park on the
                        // store's signal and retry the pending command.
                        let stored = state
                            .transactions
                            .find_transaction_mut(transaction_id)
                            .expect("created above");
                        while let Some(row_ref) = transaction.prelocked_rows.pop_front() {
                            if !stored.prelocked_rows.contains(&row_ref) {
                                stored.prelocked_rows.push_back(row_ref);
                            }
                        }
                        if Instant::now() >= deadline {
                            return Err(MarlError::TransactionLockConflict {
                                key: key.to_string(),
                                holder_id: None,
                                last_commit_timestamp: timestamp.0,
                            });
                        }
                        let tablet = state.tablet(tablet_id)?;
                        let store = tablet
                            .find_store(store_id)
                            .and_then(|store| store.as_sorted_dynamic().cloned())
                            .ok_or_else(|| {
                                marl_errors::internal_err!("blocked row in unknown store")
                            })?;
                        debug!(key = %key, %timestamp, "row blocked; waiting");
                        store.subscribe_row_unblocked()
                    }
                    Err(error) => {
                        // A failed batch poisons only this transaction.
                        let stored = state
                            .transactions
                            .find_transaction_mut(transaction_id)
                            .expect("created above");
                        while let Some(row_ref) = transaction.prelocked_rows.pop_front() {
                            if !stored.prelocked_rows.contains(&row_ref) {
                                stored.prelocked_rows.push_back(row_ref);
                            }
                        }
                        return Err(error);
                    }
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, unblocked.changed())
                .await
                .is_err()
            {
                // Timed out; the next loop iteration reports the conflict.
            }
        }
    }

    /// Buffers ordered-tablet writes into the transaction's delayed
    /// write log; they apply at commit.
    pub async fn write_ordered(
        &self,
        tablet_id: TabletId,
        transaction_id: TransactionId,
        start_timestamp: Timestamp,
        timeout: Duration,
        signature: Signature,
        data: Bytes,
    ) -> MarlResult<()> {
        let mut reader = WireReader::new(data);
        let mut state = self.lock().await;
        let state = &mut *state;
        {
            let tablet = state.tablet(tablet_id)?;
            tablet.validate_mounted()?;
        }

        let mut records = Vec::new();
        while !reader.is_finished() {
            match reader.read_command()? {
                marl_client::wire::WireCommand::WriteRow => {
                    reader.read_message()?;
                    let row = reader.read_row()?;
                    state.tablet(tablet_id)?.schema().validate_row(&row)?;
                    records.push(WriteLogRecord::Write { tablet_id, row });
                }
                other => {
                    return Err(MarlError::InvalidWireCommand(format!(
                        "unsupported command {other:?} for an ordered tablet"
                    )));
                }
            }
        }

        let transaction = state.transactions.get_or_create_transaction(
            transaction_id,
            start_timestamp,
            timeout,
            self.mutation_log.is_leader(),
        )?;
        if !transaction.is_active() {
            return Err(transaction.invalid_state_error());
        }
        transaction.delayed_write_log.extend(records);
        state.transactions.make_transaction_persistent(transaction_id)?;
        state.transactions.add_signature(transaction_id, signature, true);
        Ok(())
    }

    /// Writes a non-atomic batch: rows commit immediately at their
    /// caller-supplied timestamps.
    pub async fn write_non_atomic(&self, tablet_id: TabletId, data: Bytes) -> MarlResult<()> {
        let mut reader = WireReader::new(data);
        let mut state = self.lock().await;
        let tablet = state.tablet_mut(tablet_id)?;
        store_manager::execute_non_atomic_write(tablet, &mut reader)
    }

    /// Prepares a transaction commit (invoked by the transaction
    /// supervisor).
    pub async fn prepare_transaction_commit(
        &self,
        transaction_id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
    ) -> MarlResult<()> {
        let mut state = self.lock().await;
        let event = state
            .transactions
            .prepare_commit(transaction_id, persistent, prepare_timestamp)?;
        Self::apply_transaction_event(&mut state, event)
    }

    /// Commits a transaction (invoked by the transaction supervisor).
    pub async fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
    ) -> MarlResult<()> {
        let mut state = self.lock().await;
        let delayed: Vec<(TabletId, WriteLogRecord)> = state
            .transactions
            .find_transaction(transaction_id)
            .map(|transaction| {
                transaction
                    .delayed_write_log
                    .iter()
                    .map(|record| {
                        let tablet_id = match record {
                            WriteLogRecord::Write { tablet_id, .. } => *tablet_id,
                            WriteLogRecord::Delete { tablet_id, .. } => *tablet_id,
                        };
                        (tablet_id, record.clone())
                    })
                    .collect()
            })
            .unwrap_or_default();

        let event = state
            .transactions
            .commit_transaction(transaction_id, commit_timestamp)?;
        Self::apply_transaction_event(&mut state, event)?;

        // Ordered writes apply at commit, in the log's arrival order.
        let mut by_tablet: IndexMap<TabletId, Vec<WriteLogRecord>> = IndexMap::new();
        for (tablet_id, record) in delayed {
            by_tablet.entry(tablet_id).or_default().push(record);
        }
        for (tablet_id, records) in by_tablet {
            let tablet = state.tablet_mut(tablet_id)?;
            store_manager::apply_ordered_commit(tablet, &records, commit_timestamp)?;
        }
        Ok(())
    }

    /// Aborts a transaction (invoked by the transaction supervisor).
    pub async fn abort_transaction(
        &self,
        transaction_id: TransactionId,
        force: bool,
    ) -> MarlResult<()> {
        let mut state = self.lock().await;
        let event = state.transactions.abort_transaction(transaction_id, force)?;
        Self::apply_transaction_event(&mut state, event)
    }

    fn apply_transaction_event(
        state: &mut TabletCellState,
        event: TransactionEvent,
    ) -> MarlResult<()> {
        match event {
            TransactionEvent::Prepared {
                id,
                prepare_timestamp,
                locked_rows,
            } => {
                for row_ref in &locked_rows {
                    if let Ok(tablet) = state.tablet(row_ref.tablet_id) {
                        store_manager::prepare_row(tablet, id, prepare_timestamp, row_ref);
                    }
                }
            }
            TransactionEvent::Committed {
                id,
                commit_timestamp,
                locked_rows,
            } => {
                for row_ref in &locked_rows {
                    let tablet = state.tablet_mut(row_ref.tablet_id)?;
                    store_manager::commit_row(tablet, id, commit_timestamp, row_ref)?;
                }
            }
            TransactionEvent::Aborted { id, locked_rows } => {
                for row_ref in &locked_rows {
                    if let Ok(tablet) = state.tablet_mut(row_ref.tablet_id) {
                        store_manager::abort_row(tablet, id, row_ref);
                    }
                }
            }
            TransactionEvent::Serialized { .. } => {}
        }
        Ok(())
    }

    /// Schedules a store rotation and commits the mutation that executes
    /// it.
    pub async fn schedule_store_rotation(&self, tablet_id: TabletId) -> MarlResult<()> {
        {
            let mut state = self.lock().await;
            let tablet = state.tablet_mut(tablet_id)?;
            if !store_manager::is_rotation_possible(tablet) {
                return Ok(());
            }
            store_manager::schedule_rotation(tablet);
        }
        self.mutation_log
            .commit(Mutation::RotateStore { tablet_id })
            .await
    }

    /// Applies a replicated mutation. The mutation log calls this on
    /// every replica, in sequence order.
    pub async fn apply_mutation(self: &Arc<Self>, mutation: Mutation) -> MarlResult<()> {
        match mutation {
            Mutation::RotateStore { tablet_id } => {
                let mut state = self.lock().await;
                let tablet = state.tablet_mut(tablet_id)?;
                store_manager::rotate(tablet, true, Instant::now())
            }
            Mutation::UpdateTabletStores {
                tablet_id,
                mount_revision,
                stores_to_add,
                stores_to_remove,
            } => {
                self.apply_update_tablet_stores(
                    tablet_id,
                    mount_revision,
                    stores_to_add,
                    stores_to_remove,
                )
                .await
            }
            Mutation::HandleTransactionBarrier { timestamp } => {
                let mut state = self.lock().await;
                let events = state.transactions.handle_transaction_barrier(timestamp)?;
                for event in events {
                    Self::apply_transaction_event(&mut state, event)?;
                }
                Ok(())
            }
            Mutation::SplitPartition {
                tablet_id,
                partition_index,
                pivot_keys,
            } => {
                let mut state = self.lock().await;
                let tablet = state.tablet_mut(tablet_id)?;
                tablet.split_partition(partition_index, &pivot_keys)
            }
            Mutation::MergePartitions {
                tablet_id,
                first_partition_index,
                partition_count,
            } => {
                let mut state = self.lock().await;
                let tablet = state.tablet_mut(tablet_id)?;
                tablet.merge_partitions(first_partition_index, partition_count)
            }
            Mutation::UpdatePartitionSampleKeys {
                tablet_id,
                partition_index,
                sample_keys,
            } => {
                let mut state = self.lock().await;
                let tablet = state.tablet_mut(tablet_id)?;
                let partition = tablet
                    .partitions_mut()
                    .get_mut(partition_index)
                    .ok_or_else(|| marl_errors::internal_err!("sample keys for unknown partition"))?;
                partition.sample_keys = sample_keys;
                partition.sampling_time = Some(Instant::now());
                Ok(())
            }
            Mutation::TrimRows {
                tablet_id,
                trimmed_row_count,
            } => {
                let mut state = self.lock().await;
                let tablet = state.tablet_mut(tablet_id)?;
                tablet.set_trimmed_row_count(trimmed_row_count)
            }
        }
    }

    async fn apply_update_tablet_stores(
        self: &Arc<Self>,
        tablet_id: TabletId,
        mount_revision: u64,
        stores_to_add: Vec<AddStoreDescriptor>,
        stores_to_remove: Vec<StoreId>,
    ) -> MarlResult<()> {
        // Materialize outside the automaton lock; opening chunk readers
        // may touch the network.
        let mut added = Vec::with_capacity(stores_to_add.len());
        for descriptor in &stores_to_add {
            let store = self.materialize_store(descriptor).await?;
            let intercepted = self.in_memory.evict_intercepted(descriptor.store_id.into());
            added.push((store, intercepted));
        }

        let mut state = self.lock().await;
        let tablet = state.tablet_mut(tablet_id)?;
        tablet.validate_mount_revision(mount_revision)?;

        for (store, intercepted) in added {
            store_manager::add_store(tablet, store, false, intercepted)?;
        }
        for store_id in &stores_to_remove {
            store_manager::remove_store(tablet, *store_id)?;
        }
        info!(
            tablet_id = %tablet_id,
            added = stores_to_add.len(),
            removed = stores_to_remove.len(),
            "tablet stores updated"
        );
        Ok(())
    }

    /// Reads `[lower, upper)` of a sorted tablet at a timestamp.
    pub async fn read_range(
        &self,
        tablet_id: TabletId,
        lower: Key,
        upper: Option<Key>,
        timestamp: Timestamp,
        column_filter: Option<Vec<u16>>,
    ) -> MarlResult<Vec<UnversionedRow>> {
        let snapshot = self.build_snapshot(tablet_id).await?;
        let mut reader =
            SchemafulRangeReader::new(&snapshot, lower, upper, timestamp, column_filter)?;
        let mut rows = Vec::new();
        while let Some(batch) = reader.next_batch(1024).await? {
            rows.extend(batch);
        }
        Ok(rows)
    }

    /// Looks up keys of a sorted tablet at a timestamp.
    pub async fn lookup(
        &self,
        tablet_id: TabletId,
        keys: &[Key],
        timestamp: Timestamp,
        column_filter: Option<Vec<u16>>,
        keep_missing_rows: bool,
    ) -> MarlResult<Vec<Option<UnversionedRow>>> {
        let snapshot = self.build_snapshot(tablet_id).await?;
        lookup_rows(&snapshot, keys, timestamp, column_filter, keep_missing_rows).await
    }

    /// Reads a row-index window of an ordered tablet.
    pub async fn read_ordered(
        &self,
        tablet_id: TabletId,
        lower_row_index: u64,
        upper_row_index: u64,
    ) -> MarlResult<Vec<UnversionedRow>> {
        let snapshot = self.build_snapshot(tablet_id).await?;
        read_ordered_rows(&snapshot, lower_row_index, upper_row_index).await
    }

    /// Trims the head of an ordered tablet.
    pub async fn trim_rows(&self, tablet_id: TabletId, trimmed_row_count: u64) -> MarlResult<()> {
        {
            let mut state = self.lock().await;
            let tablet = state.tablet_mut(tablet_id)?;
            tablet.validate_mounted()?;
            if trimmed_row_count < tablet.trimmed_row_count() {
                return Ok(());
            }
        }
        self.mutation_log
            .commit(Mutation::TrimRows {
                tablet_id,
                trimmed_row_count,
            })
            .await
    }

    /// Starts the leader epoch: leases revive and the barrier check
    /// loop begins.
    pub async fn start_leader_epoch(
        self: &Arc<Self>,
        supervisor: Arc<dyn TransactionSupervisor>,
    ) -> MarlResult<()> {
        {
            let mut state = self.lock().await;
            state.transactions.start_leader_epoch(supervisor);
        }

        let token = CancellationToken::new();
        *self.epoch.lock().await = Some(token.clone());

        let cell = Arc::clone(self);
        let period = self.config.transaction_manager.barrier_check_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = cell.run_barrier_check().await {
                            error!(%err, "transaction barrier check failed");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Stops the leader epoch: cancels the barrier loop, drops transient
    /// transactions, rolls back transient prepares.
    pub async fn stop_leader_epoch(self: &Arc<Self>) -> MarlResult<()> {
        if let Some(token) = self.epoch.lock().await.take() {
            token.cancel();
        }
        let mut state = self.lock().await;
        let events = state.transactions.stop_leader_epoch();
        for event in events {
            Self::apply_transaction_event(&mut state, event)?;
        }
        Ok(())
    }

    /// One barrier check: if the minimum prepare timestamp advanced,
    /// commit a barrier mutation.
    pub async fn run_barrier_check(self: &Arc<Self>) -> MarlResult<()> {
        if !self.mutation_log.is_leader() {
            return Ok(());
        }
        let barrier = {
            let mut state = self.lock().await;
            state.transactions.check_barrier()
        };
        if let Some(timestamp) = barrier {
            self.mutation_log
                .commit(Mutation::HandleTransactionBarrier { timestamp })
                .await?;
        }
        Ok(())
    }
}
