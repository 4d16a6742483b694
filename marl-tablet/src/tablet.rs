//! The tablet model: partitions, the store set, and the read snapshots
//! taken over both.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use marl_client::{PartitionId, StoreId, TabletId};
use marl_data::{Key, KeyBound, TableSchema, Timestamp};
use marl_errors::{invariant, MarlError, MarlResult};
use strum::Display;
use vec1::Vec1;

use crate::config::TableMountConfig;
use crate::store::{Store, StoreState};

/// Lifecycle state of a tablet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
pub enum TabletState {
    /// Serving reads and writes.
    Mounted,
    /// Unmounting; waiting for transactions to release row locks.
    UnmountWaitingForLocks,
    /// Unmounting; flushing the remaining dynamic stores.
    UnmountFlushing,
    /// Unmounted.
    Unmounted,
    /// Frozen: reads only, dynamic stores flushed.
    Frozen,
}

/// State of a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
pub enum PartitionState {
    /// Nothing special is happening.
    Normal,
    /// A split mutation is submitted.
    Splitting,
    /// A merge mutation is submitted.
    Merging,
    /// A compaction is in progress.
    Compacting,
    /// An Eden partitioning is in progress.
    Partitioning,
    /// Sampling is in progress.
    Sampling,
}

/// A partition of a sorted tablet: a pivot-key range owning a set of
/// chunk stores. The Eden is the distinguished key-unbounded partition
/// that also hosts the dynamic stores' overlap.
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    pivot_key: Key,
    next_pivot_key: KeyBound,
    state: PartitionState,
    store_ids: HashSet<StoreId>,

    /// When this partition was last sampled.
    pub sampling_time: Option<Instant>,
    /// When a resampling was last requested.
    pub sampling_request_time: Option<Instant>,
    /// Current sample keys, sorted.
    pub sample_keys: Vec<Key>,
    /// When this partition was last compacted or partitioned.
    pub compaction_time: Option<Instant>,
}

impl Partition {
    fn new(pivot_key: Key, next_pivot_key: KeyBound) -> Partition {
        Partition {
            id: PartitionId::generate(),
            pivot_key,
            next_pivot_key,
            state: PartitionState::Normal,
            store_ids: HashSet::new(),
            sampling_time: None,
            sampling_request_time: None,
            sample_keys: Vec::new(),
            compaction_time: None,
        }
    }

    /// The partition id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Lower bound of the owned key range.
    pub fn pivot_key(&self) -> &Key {
        &self.pivot_key
    }

    /// Upper bound of the owned key range.
    pub fn next_pivot_key(&self) -> &KeyBound {
        &self.next_pivot_key
    }

    /// Current state.
    pub fn state(&self) -> PartitionState {
        self.state
    }

    /// Ids of the chunk stores living here.
    pub fn store_ids(&self) -> &HashSet<StoreId> {
        &self.store_ids
    }

    /// Transitions `expected → new`, failing if the partition is in any
    /// other state. Background tasks use this to guard against races;
    /// a failure returns the partition to the scan pool untouched.
    pub fn checked_set_state(
        &mut self,
        expected: PartitionState,
        new: PartitionState,
    ) -> MarlResult<()> {
        if self.state != expected {
            return Err(MarlError::InvalidState {
                entity: format!("partition {}", self.id),
                expected: expected.to_string(),
                actual: self.state.to_string(),
            });
        }
        self.state = new;
        Ok(())
    }

    /// Returns true iff `key` falls in the owned range.
    pub fn contains(&self, key: &Key) -> bool {
        key >= &self.pivot_key
            && match &self.next_pivot_key {
                KeyBound::Unbounded => true,
                KeyBound::Key(upper) => key < upper,
            }
    }
}

/// Per-tablet state of the store manager.
#[derive(Debug, Default)]
pub struct StoreManagerState {
    /// A rotation has been scheduled but not yet executed.
    pub rotation_scheduled: bool,
    /// When the last rotation ran.
    pub last_rotated: Option<Instant>,
    /// Passive dynamic stores still holding transaction locks.
    pub locked_store_ids: HashSet<StoreId>,
    /// `(max_timestamp, store)` index over inactive stores, used to
    /// find stores whose data a new transaction could conflict with.
    pub max_timestamp_index: BTreeMap<(Timestamp, StoreId), ()>,
    /// Chunk stores queued for preload, in schedule order.
    pub preload_store_ids: VecDeque<StoreId>,
}

/// One tablet: a shard of a sorted or ordered table.
#[derive(Debug)]
pub struct Tablet {
    id: TabletId,
    schema: Arc<TableSchema>,
    config: Arc<TableMountConfig>,
    state: TabletState,
    mount_revision: u64,

    pivot_key: Key,
    next_pivot_key: KeyBound,

    eden: Partition,
    partitions: Vec<Partition>,

    stores: IndexMap<StoreId, Store>,
    active_store_id: Option<StoreId>,

    // Ordered tablets.
    tablet_index: u32,
    total_row_count: u64,
    trimmed_row_count: u64,
    store_row_index: BTreeMap<u64, StoreId>,

    /// Store manager bookkeeping.
    pub manager: StoreManagerState,
}

impl Tablet {
    /// Creates an unmounted tablet shell.
    pub fn new(
        id: TabletId,
        schema: Arc<TableSchema>,
        config: Arc<TableMountConfig>,
        mount_revision: u64,
        pivot_key: Key,
        next_pivot_key: KeyBound,
        tablet_index: u32,
    ) -> Tablet {
        let eden = Partition::new(Key::empty(), KeyBound::Unbounded);
        let first_partition = Partition::new(pivot_key.clone(), next_pivot_key.clone());
        Tablet {
            id,
            schema,
            config,
            state: TabletState::Unmounted,
            mount_revision,
            pivot_key,
            next_pivot_key,
            eden,
            partitions: vec![first_partition],
            stores: IndexMap::new(),
            active_store_id: None,
            tablet_index,
            total_row_count: 0,
            trimmed_row_count: 0,
            store_row_index: BTreeMap::new(),
            manager: StoreManagerState::default(),
        }
    }

    /// The tablet id.
    pub fn id(&self) -> TabletId {
        self.id
    }

    /// The table schema.
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// The mount config.
    pub fn config(&self) -> &Arc<TableMountConfig> {
        &self.config
    }

    /// Replaces the mount config (remount).
    pub fn set_config(&mut self, config: Arc<TableMountConfig>) {
        self.config = config;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TabletState {
        self.state
    }

    /// Sets the lifecycle state.
    pub fn set_state(&mut self, state: TabletState) {
        self.state = state;
    }

    /// True for sorted tablets.
    pub fn is_sorted(&self) -> bool {
        self.schema.is_sorted()
    }

    /// The mount revision: a generation counter bumped on every mount.
    pub fn mount_revision(&self) -> u64 {
        self.mount_revision
    }

    /// Rejects requests built against a stale mount generation.
    pub fn validate_mount_revision(&self, revision: u64) -> MarlResult<()> {
        if revision != self.mount_revision {
            return Err(MarlError::InvalidMountRevision {
                tablet_id: self.id.to_string(),
                expected: self.mount_revision,
                actual: revision,
            });
        }
        Ok(())
    }

    /// Fails unless the tablet is mounted.
    pub fn validate_mounted(&self) -> MarlResult<()> {
        if self.state != TabletState::Mounted {
            return Err(MarlError::TabletNotMounted {
                tablet_id: self.id.to_string(),
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// The tablet's pivot key.
    pub fn pivot_key(&self) -> &Key {
        &self.pivot_key
    }

    /// The next tablet's pivot key.
    pub fn next_pivot_key(&self) -> &KeyBound {
        &self.next_pivot_key
    }

    /// Position of this tablet in its ordered table.
    pub fn tablet_index(&self) -> u32 {
        self.tablet_index
    }

    /// Total rows ever committed to this (ordered) tablet.
    pub fn total_row_count(&self) -> u64 {
        self.total_row_count
    }

    /// Sets the total row count.
    pub fn set_total_row_count(&mut self, count: u64) {
        self.total_row_count = count;
    }

    /// Rows trimmed from the head of this (ordered) tablet.
    pub fn trimmed_row_count(&self) -> u64 {
        self.trimmed_row_count
    }

    /// Trims the head of the tablet up to `count`.
    pub fn set_trimmed_row_count(&mut self, count: u64) -> MarlResult<()> {
        invariant!(
            count >= self.trimmed_row_count && count <= self.total_row_count,
            "trimmed row count {count} out of range [{}, {}]",
            self.trimmed_row_count,
            self.total_row_count
        );
        self.trimmed_row_count = count;
        Ok(())
    }

    /// The Eden partition.
    pub fn eden(&self) -> &Partition {
        &self.eden
    }

    /// The Eden partition, mutable.
    pub fn eden_mut(&mut self) -> &mut Partition {
        &mut self.eden
    }

    /// The non-Eden partitions, ordered by pivot key.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// The non-Eden partitions, mutable.
    pub fn partitions_mut(&mut self) -> &mut [Partition] {
        &mut self.partitions
    }

    /// The store set.
    pub fn stores(&self) -> &IndexMap<StoreId, Store> {
        &self.stores
    }

    /// Looks up a store by id.
    pub fn find_store(&self, store_id: StoreId) -> Option<&Store> {
        self.stores.get(&store_id)
    }

    /// The active dynamic store's id.
    pub fn active_store_id(&self) -> Option<StoreId> {
        self.active_store_id
    }

    /// The active dynamic store.
    pub fn active_store(&self) -> Option<&Store> {
        self.active_store_id.and_then(|id| self.stores.get(&id))
    }

    /// Sets (or clears) the active store pointer.
    pub fn set_active_store(&mut self, store_id: Option<StoreId>) {
        self.active_store_id = store_id;
    }

    /// The map `starting_row_index → store` of an ordered tablet.
    pub fn store_row_index(&self) -> &BTreeMap<u64, StoreId> {
        &self.store_row_index
    }

    /// Inserts a store into the store set, placing chunk stores into
    /// their partition (sorted) or the row index map (ordered).
    pub fn add_store(&mut self, store: Store) -> MarlResult<()> {
        let store_id = store.id();
        invariant!(
            !self.stores.contains_key(&store_id),
            "store {store_id} added twice to tablet {}",
            self.id
        );

        if self.is_sorted() {
            match &store {
                Store::SortedChunk(chunk) => {
                    let min_key = chunk.meta().min_key.clone().unwrap_or_default();
                    let max_key = chunk.meta().max_key.clone().unwrap_or_default();
                    let partition_index = if chunk.meta().eden {
                        // Fresh flush output: Eden until partitioned.
                        None
                    } else {
                        self.partition_for_range(&min_key, &max_key)
                    };
                    match partition_index {
                        Some(index) => {
                            let partition = &mut self.partitions[index];
                            partition.store_ids.insert(store_id);
                            // New data shifts the key distribution; ask
                            // for fresh samples.
                            partition.sampling_request_time = Some(Instant::now());
                        }
                        None => {
                            self.eden.store_ids.insert(store_id);
                        }
                    }
                }
                Store::SortedDynamic(_) => {
                    // Dynamic stores are key-unbounded; their overlap is
                    // accounted against Eden.
                }
                _ => marl_errors::internal!("ordered store added to a sorted tablet"),
            }
        } else {
            match &store {
                Store::OrderedChunk(chunk) => {
                    self.store_row_index
                        .insert(chunk.starting_row_index(), store_id);
                }
                Store::OrderedDynamic(dynamic) => {
                    self.store_row_index
                        .insert(dynamic.starting_row_index(), store_id);
                }
                _ => marl_errors::internal!("sorted store added to an ordered tablet"),
            }
        }

        self.stores.insert(store_id, store);
        Ok(())
    }

    /// Removes a store from the store set and from its partition or the
    /// row index map. The store object itself may outlive this through
    /// reader snapshots.
    pub fn remove_store(&mut self, store_id: StoreId) -> MarlResult<Store> {
        let store = self
            .stores
            .shift_remove(&store_id)
            .ok_or_else(|| marl_errors::internal_err!("removing unknown store {store_id}"))?;

        self.eden.store_ids.remove(&store_id);
        for partition in &mut self.partitions {
            partition.store_ids.remove(&store_id);
        }
        self.store_row_index.retain(|_, id| *id != store_id);
        // The indexed timestamp may predate later commits (row
        // migration), so match by store id.
        self.manager
            .max_timestamp_index
            .retain(|(_, id), ()| *id != store_id);
        Ok(store)
    }

    /// The partition fully containing `[min_key, max_key]`, if any.
    /// Chunks spanning a pivot stay in Eden.
    fn partition_for_range(&self, min_key: &Key, max_key: &Key) -> Option<usize> {
        self.partitions
            .iter()
            .position(|partition| partition.contains(min_key) && partition.contains(max_key))
    }

    /// The partition containing `key`.
    pub fn find_containing_partition(&self, key: &Key) -> Option<&Partition> {
        let index = self
            .partitions
            .partition_point(|partition| partition.pivot_key() <= key);
        index.checked_sub(1).map(|index| &self.partitions[index])
    }

    /// Indexes of the partitions intersecting `[lower, upper)`.
    pub fn intersecting_partitions(&self, lower: &Key, upper: Option<&Key>) -> Vec<usize> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(_, partition)| {
                let above_lower = match partition.next_pivot_key() {
                    KeyBound::Unbounded => true,
                    KeyBound::Key(next) => next > lower,
                };
                let below_upper = match upper {
                    None => true,
                    Some(upper) => partition.pivot_key() < upper,
                };
                above_lower && below_upper
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Number of stores whose key ranges can contain a single key in
    /// Eden's overlap: the dynamic stores plus Eden's chunks.
    pub fn eden_overlap_store_count(&self) -> usize {
        let dynamic = self
            .stores
            .values()
            .filter(|store| {
                store.is_dynamic()
                    && matches!(
                        store.state(),
                        StoreState::ActiveDynamic | StoreState::PassiveDynamic
                    )
            })
            .count();
        dynamic + self.eden.store_ids.len()
    }

    /// The overlapping store count: the worst-case read fan-in over all
    /// keys.
    pub fn overlapping_store_count(&self) -> usize {
        let eden = self.eden_overlap_store_count();
        let widest_partition = self
            .partitions
            .iter()
            .map(|partition| partition.store_ids.len())
            .max()
            .unwrap_or(0);
        eden + widest_partition
    }

    /// Number of partitions currently sitting at the overlapping store
    /// count.
    pub fn critical_partition_count(&self) -> usize {
        let osc = self.overlapping_store_count();
        let eden = self.eden_overlap_store_count();
        self.partitions
            .iter()
            .filter(|partition| eden + partition.store_ids.len() == osc)
            .count()
    }

    /// Splits partition `partition_index` at `pivot_keys` (the first of
    /// which must equal the partition's pivot). Stores of the split
    /// partition are reassigned by their boundary keys; stores spanning
    /// a new pivot move to Eden.
    pub fn split_partition(
        &mut self,
        partition_index: usize,
        pivot_keys: &Vec1<Key>,
    ) -> MarlResult<()> {
        invariant!(
            partition_index < self.partitions.len(),
            "split of unknown partition index {partition_index}"
        );
        invariant!(pivot_keys.len() >= 2, "split needs at least two pivots");
        let old = self.partitions.remove(partition_index);
        invariant!(
            *pivot_keys.first() == *old.pivot_key(),
            "first split pivot must equal the partition pivot"
        );
        invariant!(
            pivot_keys.as_slice().windows(2).all(|pair| pair[0] < pair[1]),
            "split pivots must be strictly increasing"
        );

        let mut new_partitions = Vec::with_capacity(pivot_keys.len());
        for (offset, pivot) in pivot_keys.iter().enumerate() {
            let next = match pivot_keys.as_slice().get(offset + 1) {
                Some(next) => KeyBound::Key(next.clone()),
                None => old.next_pivot_key().clone(),
            };
            new_partitions.push(Partition::new(pivot.clone(), next));
        }

        for store_id in &old.store_ids {
            let store = &self.stores[store_id];
            let min_key = store.min_key().unwrap_or_default();
            let max_key = store.max_key().unwrap_or_default();
            let target = new_partitions
                .iter_mut()
                .find(|partition| partition.contains(&min_key) && partition.contains(&max_key));
            match target {
                Some(partition) => {
                    partition.store_ids.insert(*store_id);
                }
                None => {
                    self.eden.store_ids.insert(*store_id);
                }
            }
        }

        for (offset, partition) in new_partitions.into_iter().enumerate() {
            self.partitions.insert(partition_index + offset, partition);
        }
        Ok(())
    }

    /// Merges `partition_count` adjacent partitions starting at
    /// `first_partition_index` into one.
    pub fn merge_partitions(
        &mut self,
        first_partition_index: usize,
        partition_count: usize,
    ) -> MarlResult<()> {
        invariant!(partition_count >= 2, "merge needs at least two partitions");
        invariant!(
            first_partition_index + partition_count <= self.partitions.len(),
            "merge range out of bounds"
        );

        let merged_tail: Vec<Partition> = self
            .partitions
            .drain(first_partition_index..first_partition_index + partition_count)
            .collect();
        let mut merged = Partition::new(
            merged_tail[0].pivot_key().clone(),
            merged_tail.last().expect("non-empty").next_pivot_key().clone(),
        );
        for partition in merged_tail {
            merged.store_ids.extend(partition.store_ids);
        }
        self.partitions.insert(first_partition_index, merged);
        Ok(())
    }

    /// Builds an immutable snapshot for readers. Stores added afterwards
    /// are not visible; stores removed afterwards stay readable until
    /// the snapshot is dropped.
    pub fn build_snapshot(&self) -> Arc<TabletSnapshot> {
        let capture = |ids: &HashSet<StoreId>| -> Vec<Store> {
            let mut stores: Vec<Store> =
                ids.iter().filter_map(|id| self.stores.get(id)).cloned().collect();
            stores.sort_by_key(Store::id);
            stores
        };

        let mut eden_stores = capture(&self.eden.store_ids);
        for store in self.stores.values() {
            if store.is_dynamic()
                && matches!(
                    store.state(),
                    StoreState::ActiveDynamic | StoreState::PassiveDynamic
                )
            {
                eden_stores.push(store.clone());
            }
        }

        let ordered_stores: Vec<Store> = self
            .store_row_index
            .values()
            .filter_map(|id| self.stores.get(id))
            .cloned()
            .collect();

        Arc::new(TabletSnapshot {
            tablet_id: self.id,
            mount_revision: self.mount_revision,
            schema: Arc::clone(&self.schema),
            config: Arc::clone(&self.config),
            eden: PartitionSnapshot {
                id: self.eden.id,
                pivot_key: self.eden.pivot_key.clone(),
                next_pivot_key: self.eden.next_pivot_key.clone(),
                stores: eden_stores,
            },
            partitions: self
                .partitions
                .iter()
                .map(|partition| PartitionSnapshot {
                    id: partition.id,
                    pivot_key: partition.pivot_key.clone(),
                    next_pivot_key: partition.next_pivot_key.clone(),
                    stores: capture(&partition.store_ids),
                })
                .collect(),
            ordered_stores,
            tablet_index: self.tablet_index,
            total_row_count: self.total_row_count,
            trimmed_row_count: self.trimmed_row_count,
        })
    }
}

/// Immutable view of a partition used by readers.
#[derive(Clone, Debug)]
pub struct PartitionSnapshot {
    /// Partition id.
    pub id: PartitionId,
    /// Lower bound.
    pub pivot_key: Key,
    /// Upper bound.
    pub next_pivot_key: KeyBound,
    /// Stores, sorted by id.
    pub stores: Vec<Store>,
}

/// Immutable view of a tablet used by readers.
#[derive(Clone, Debug)]
pub struct TabletSnapshot {
    /// Tablet id.
    pub tablet_id: TabletId,
    /// Mount revision the snapshot was taken at.
    pub mount_revision: u64,
    /// Table schema.
    pub schema: Arc<TableSchema>,
    /// Mount config.
    pub config: Arc<TableMountConfig>,
    /// Eden, including the dynamic stores.
    pub eden: PartitionSnapshot,
    /// Non-Eden partitions in pivot order.
    pub partitions: Vec<PartitionSnapshot>,
    /// Ordered tablets: stores in row-index order.
    pub ordered_stores: Vec<Store>,
    /// Position in the ordered table.
    pub tablet_index: u32,
    /// Total committed rows (ordered).
    pub total_row_count: u64,
    /// Trimmed rows (ordered).
    pub trimmed_row_count: u64,
}

impl TabletSnapshot {
    /// The partition snapshot containing `key`.
    pub fn find_containing_partition(&self, key: &Key) -> Option<&PartitionSnapshot> {
        let index = self
            .partitions
            .partition_point(|partition| &partition.pivot_key <= key);
        index.checked_sub(1).map(|index| &self.partitions[index])
    }
}

#[cfg(test)]
mod tests {
    use marl_data::{ColumnSchema, Value, ValueType};

    use vec1::vec1;

    use super::*;
    use crate::store::SortedDynamicStore;

    fn sorted_tablet() -> Tablet {
        let schema = Arc::new(
            TableSchema::new(vec![
                ColumnSchema::key("k", ValueType::Int64),
                ColumnSchema::value("v", ValueType::Int64),
            ])
            .unwrap(),
        );
        Tablet::new(
            TabletId::generate(),
            schema,
            Arc::new(TableMountConfig::default()),
            1,
            Key::empty(),
            KeyBound::Unbounded,
            0,
        )
    }

    fn key(k: i64) -> Key {
        Key::from([Value::Int64(k)])
    }

    #[test]
    fn split_and_merge_keep_pivots_consistent() {
        let mut tablet = sorted_tablet();
        tablet
            .split_partition(0, &vec1![Key::empty(), key(10), key(20)])
            .unwrap();
        assert_eq!(tablet.partitions().len(), 3);
        assert_eq!(tablet.partitions()[1].pivot_key(), &key(10));
        assert_eq!(
            tablet.partitions()[1].next_pivot_key(),
            &KeyBound::Key(key(20))
        );

        assert_eq!(
            tablet.find_containing_partition(&key(15)).unwrap().pivot_key(),
            &key(10)
        );
        assert_eq!(
            tablet.find_containing_partition(&key(5)).unwrap().pivot_key(),
            &Key::empty()
        );

        tablet.merge_partitions(1, 2).unwrap();
        assert_eq!(tablet.partitions().len(), 2);
        assert_eq!(
            tablet.partitions()[1].next_pivot_key(),
            &KeyBound::Unbounded
        );
    }

    #[test]
    fn intersecting_partitions_respects_bounds() {
        let mut tablet = sorted_tablet();
        tablet
            .split_partition(0, &vec1![Key::empty(), key(10), key(20)])
            .unwrap();

        assert_eq!(tablet.intersecting_partitions(&key(0), Some(&key(10))), vec![0]);
        assert_eq!(
            tablet.intersecting_partitions(&key(5), Some(&key(15))),
            vec![0, 1]
        );
        assert_eq!(tablet.intersecting_partitions(&key(25), None), vec![2]);
    }

    #[test]
    fn dynamic_stores_count_against_eden_overlap() {
        let mut tablet = sorted_tablet();
        let store = SortedDynamicStore::new(StoreId::generate(), Arc::clone(tablet.schema()));
        tablet
            .add_store(Store::SortedDynamic(Arc::new(store)))
            .unwrap();
        assert_eq!(tablet.eden_overlap_store_count(), 1);
        assert_eq!(tablet.overlapping_store_count(), 1);
    }

    #[test]
    fn checked_set_state_guards_partition_transitions() {
        let mut tablet = sorted_tablet();
        let partition = &mut tablet.partitions_mut()[0];
        partition
            .checked_set_state(PartitionState::Normal, PartitionState::Sampling)
            .unwrap();
        let error = partition
            .checked_set_state(PartitionState::Normal, PartitionState::Splitting)
            .unwrap_err();
        assert!(matches!(error, MarlError::InvalidState { .. }));
    }

    #[test]
    fn stale_mount_revision_is_rejected() {
        let tablet = sorted_tablet();
        assert!(tablet.validate_mount_revision(1).is_ok());
        assert!(matches!(
            tablet.validate_mount_revision(0),
            Err(MarlError::InvalidMountRevision { .. })
        ));
    }
}
