//! Snapshot save/load of a tablet cell's persistent state.
//!
//! Saving captures tablets (with their dynamic stores' committed rows
//! and the chunk stores' metas) and the persistent transaction map;
//! loading reconstructs everything, reopening chunk readers through the
//! injected storage. Transient fields — leases, rotation scheduling,
//! preload queues, partition activity states — are deliberately not
//! carried: they are leader-epoch state.

use std::sync::Arc;

use marl_client::{StoreId, TabletId};
use marl_data::{Key, KeyBound, TableSchema, Timestamp};
use marl_errors::MarlResult;
use serde::{Deserialize, Serialize};

use crate::config::TableMountConfig;
use crate::interfaces::ChunkStorage;
use crate::store::{
    ChunkMeta, DynamicRowSnapshot, OrderedChunkStore, OrderedDynamicStore, SortedChunkStore,
    SortedDynamicStore, Store, StoreState,
};
use crate::tablet::{Tablet, TabletState};
use crate::tablet_manager::TabletCellState;
use crate::transaction::Transaction;

/// Serialized form of one store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StoreData {
    /// A sorted dynamic store with its committed rows.
    SortedDynamic {
        /// Store id.
        id: StoreId,
        /// Lifecycle state at save time.
        state: StoreState,
        /// Committed rows.
        rows: Vec<DynamicRowSnapshot>,
    },
    /// An ordered dynamic store with its rows.
    OrderedDynamic {
        /// Store id.
        id: StoreId,
        /// Lifecycle state at save time.
        state: StoreState,
        /// First row's global index.
        starting_row_index: u64,
        /// The rows.
        rows: Vec<marl_data::UnversionedRow>,
        /// Smallest commit timestamp.
        min_timestamp: Timestamp,
        /// Largest commit timestamp.
        max_timestamp: Timestamp,
    },
    /// A sorted chunk store (meta only; data lives in the chunk).
    SortedChunk {
        /// Store id.
        id: StoreId,
        /// Cached meta.
        meta: ChunkMeta,
    },
    /// An ordered chunk store.
    OrderedChunk {
        /// Store id.
        id: StoreId,
        /// Cached meta.
        meta: ChunkMeta,
        /// First row's global index.
        starting_row_index: u64,
    },
}

/// Serialized form of one tablet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletData {
    /// Tablet id.
    pub tablet_id: TabletId,
    /// Table schema.
    pub schema: TableSchema,
    /// Mount config.
    pub config: TableMountConfig,
    /// Mount revision.
    pub mount_revision: u64,
    /// Lifecycle state.
    pub state: TabletState,
    /// Tablet pivot.
    pub pivot_key: Key,
    /// Next tablet's pivot.
    pub next_pivot_key: KeyBound,
    /// Position in the ordered table.
    pub tablet_index: u32,
    /// Pivots of the non-Eden partitions, in order.
    pub partition_pivots: Vec<Key>,
    /// Sample keys per partition, parallel to `partition_pivots`.
    pub partition_sample_keys: Vec<Vec<Key>>,
    /// All stores.
    pub stores: Vec<StoreData>,
    /// The active store.
    pub active_store_id: Option<StoreId>,
    /// Total committed rows (ordered).
    pub total_row_count: u64,
    /// Trimmed rows (ordered).
    pub trimmed_row_count: u64,
}

/// Serialized form of a whole cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CellSnapshot {
    /// All tablets.
    pub tablets: Vec<TabletData>,
    /// The persistent transaction map.
    pub transactions: Vec<Transaction>,
    /// The last serialized commit timestamp.
    pub last_serialized_commit_timestamp: Timestamp,
}

impl CellSnapshot {
    /// Binary encoding used for the snapshot stream.
    pub fn to_bytes(&self) -> MarlResult<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|error| marl_errors::internal_err!("snapshot encoding failed: {error}"))
    }

    /// Decodes a snapshot stream.
    pub fn from_bytes(bytes: &[u8]) -> MarlResult<CellSnapshot> {
        bincode::deserialize(bytes)
            .map_err(|error| marl_errors::internal_err!("snapshot decoding failed: {error}"))
    }
}

/// Captures the cell's persistent state.
pub fn save(state: &TabletCellState) -> CellSnapshot {
    let mut tablets = Vec::with_capacity(state.tablets.len());
    for tablet in state.tablets.values() {
        tablets.push(save_tablet(tablet));
    }
    let (transactions, last_serialized_commit_timestamp) = state.transactions.save();
    CellSnapshot {
        tablets,
        transactions,
        last_serialized_commit_timestamp,
    }
}

fn save_tablet(tablet: &Tablet) -> TabletData {
    let mut stores = Vec::with_capacity(tablet.stores().len());
    for store in tablet.stores().values() {
        let data = match store {
            Store::SortedDynamic(dynamic) => StoreData::SortedDynamic {
                id: dynamic.id(),
                state: dynamic.state(),
                rows: dynamic.snapshot_rows(),
            },
            Store::OrderedDynamic(dynamic) => StoreData::OrderedDynamic {
                id: dynamic.id(),
                state: dynamic.state(),
                starting_row_index: dynamic.starting_row_index(),
                rows: dynamic.snapshot_rows(),
                min_timestamp: dynamic.min_timestamp(),
                max_timestamp: dynamic.max_timestamp(),
            },
            Store::SortedChunk(chunk) => StoreData::SortedChunk {
                id: chunk.id(),
                meta: chunk.meta().clone(),
            },
            Store::OrderedChunk(chunk) => StoreData::OrderedChunk {
                id: chunk.id(),
                meta: chunk.meta().clone(),
                starting_row_index: chunk.starting_row_index(),
            },
        };
        stores.push(data);
    }

    TabletData {
        tablet_id: tablet.id(),
        schema: (**tablet.schema()).clone(),
        config: (**tablet.config()).clone(),
        mount_revision: tablet.mount_revision(),
        state: tablet.state(),
        pivot_key: tablet.pivot_key().clone(),
        next_pivot_key: tablet.next_pivot_key().clone(),
        tablet_index: tablet.tablet_index(),
        partition_pivots: tablet
            .partitions()
            .iter()
            .map(|partition| partition.pivot_key().clone())
            .collect(),
        partition_sample_keys: tablet
            .partitions()
            .iter()
            .map(|partition| partition.sample_keys.clone())
            .collect(),
        stores,
        active_store_id: tablet.active_store_id(),
        total_row_count: tablet.total_row_count(),
        trimmed_row_count: tablet.trimmed_row_count(),
    }
}

/// Reconstructs the cell's state from a snapshot, reopening chunk
/// readers through `storage`.
pub async fn load(
    state: &mut TabletCellState,
    snapshot: CellSnapshot,
    storage: &Arc<dyn ChunkStorage>,
) -> MarlResult<()> {
    state.tablets.clear();
    for data in snapshot.tablets {
        let tablet = load_tablet(data, storage).await?;
        state.tablets.insert(tablet.id(), tablet);
    }
    state
        .transactions
        .load(snapshot.transactions, snapshot.last_serialized_commit_timestamp);
    Ok(())
}

async fn load_tablet(data: TabletData, storage: &Arc<dyn ChunkStorage>) -> MarlResult<Tablet> {
    let schema = Arc::new(data.schema);
    let mut tablet = Tablet::new(
        data.tablet_id,
        Arc::clone(&schema),
        Arc::new(data.config),
        data.mount_revision,
        data.pivot_key,
        data.next_pivot_key,
        data.tablet_index,
    );
    tablet.set_state(data.state);
    tablet.set_total_row_count(data.total_row_count);
    tablet.set_trimmed_row_count(data.trimmed_row_count)?;

    if data.partition_pivots.len() > 1 {
        let pivots = vec1::Vec1::try_from_vec(data.partition_pivots.clone())
            .map_err(|_| marl_errors::internal_err!("tablet snapshot carries no partition pivots"))?;
        tablet.split_partition(0, &pivots)?;
    }
    for (index, sample_keys) in data.partition_sample_keys.into_iter().enumerate() {
        if let Some(partition) = tablet.partitions_mut().get_mut(index) {
            partition.sample_keys = sample_keys;
        }
    }

    // Store-to-partition assignment is re-derived from boundary keys;
    // the placement rule is deterministic and matches the one used when
    // the stores were added.
    for store_data in data.stores {
        let store = match store_data {
            StoreData::SortedDynamic { id, state, rows } => {
                let store = SortedDynamicStore::new(id, Arc::clone(&schema));
                for row in &rows {
                    store.load_row(row)?;
                }
                store.set_state(state);
                Store::SortedDynamic(Arc::new(store))
            }
            StoreData::OrderedDynamic {
                id,
                state,
                starting_row_index,
                rows,
                min_timestamp,
                max_timestamp,
            } => {
                let store = OrderedDynamicStore::new(id, Arc::clone(&schema), starting_row_index);
                store.load_rows(rows, min_timestamp, max_timestamp);
                store.set_state(state);
                Store::OrderedDynamic(Arc::new(store))
            }
            StoreData::SortedChunk { id, meta } => {
                let reader = storage.open_reader(id.into()).await?;
                Store::SortedChunk(Arc::new(SortedChunkStore::new(id, meta, reader)))
            }
            StoreData::OrderedChunk {
                id,
                meta,
                starting_row_index,
            } => {
                let reader = storage.open_reader(id.into()).await?;
                Store::OrderedChunk(Arc::new(OrderedChunkStore::new(
                    id,
                    meta,
                    reader,
                    starting_row_index,
                )))
            }
        };

        let store_id = store.id();
        let max_timestamp = store.max_timestamp();
        let state = store.state();
        tablet.add_store(store)?;
        if state != StoreState::ActiveDynamic {
            tablet
                .manager
                .max_timestamp_index
                .insert((max_timestamp, store_id), ());
        }
        // Lock ownership is transient: a loaded passive store has no
        // holders, so it never joins the locked set.
    }

    tablet.set_active_store(data.active_store_id);
    Ok(tablet)
}

#[cfg(test)]
mod tests {
    use marl_data::{ColumnSchema, UnversionedRow, Value, ValueType};

    use super::*;
    use crate::config::TransactionManagerConfig;
    use crate::store_manager;
    use crate::transaction_manager::TransactionManager;
    use crate::interfaces::TimestampProvider;
    use indexmap::IndexMap;

    struct FixedTimestamps;

    #[async_trait::async_trait]
    impl TimestampProvider for FixedTimestamps {
        async fn generate(&self) -> MarlResult<Timestamp> {
            Ok(Timestamp(1000))
        }
        fn latest(&self) -> Timestamp {
            Timestamp(1000)
        }
    }

    fn cell_state() -> TabletCellState {
        TabletCellState {
            tablets: IndexMap::new(),
            transactions: TransactionManager::new(
                TransactionManagerConfig::default(),
                Arc::new(FixedTimestamps),
            ),
        }
    }

    struct NoStorage;

    #[async_trait::async_trait]
    impl ChunkStorage for NoStorage {
        async fn open_reader(
            &self,
            chunk_id: marl_client::ChunkId,
        ) -> MarlResult<Arc<dyn crate::interfaces::ChunkReader>> {
            Err(marl_errors::internal_err!("no chunk {chunk_id} in this test"))
        }
        async fn create_writer(
            &self,
            _transaction_id: marl_client::TransactionId,
        ) -> MarlResult<Box<dyn crate::interfaces::ChunkWriter>> {
            Err(marl_errors::internal_err!("no writers in this test"))
        }
    }

    #[tokio::test]
    async fn cell_state_round_trips() {
        let mut state = cell_state();

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
            3,
            Key::empty(),
            KeyBound::Unbounded,
            0,
        );
        store_manager::mount(&mut tablet, Vec::new()).unwrap();
        tablet
            .split_partition(0, &vec1::vec1![Key::empty(), Key::from([Value::Int64(10)])])
            .unwrap();

        let active = tablet.active_store().unwrap().as_sorted_dynamic().unwrap().clone();
        active
            .write_row_non_atomic(
                &UnversionedRow::from_pairs([(0, Value::Int64(1)), (1, Value::Int64(10))]),
                Timestamp(110),
            )
            .unwrap();
        let tablet_id = tablet.id();
        state.tablets.insert(tablet_id, tablet);

        let snapshot = save(&state);
        let bytes = snapshot.to_bytes().unwrap();
        let decoded = CellSnapshot::from_bytes(&bytes).unwrap();

        let mut restored = cell_state();
        let storage: Arc<dyn ChunkStorage> = Arc::new(NoStorage);
        load(&mut restored, decoded, &storage).await.unwrap();

        let tablet = restored.tablets.get(&tablet_id).unwrap();
        assert_eq!(tablet.mount_revision(), 3);
        assert_eq!(tablet.state(), TabletState::Mounted);
        assert_eq!(tablet.partitions().len(), 2);

        let active = tablet.active_store().unwrap().as_sorted_dynamic().unwrap();
        let row = active
            .lookup(&Key::from([Value::Int64(1)]), Timestamp(200))
            .unwrap();
        assert_eq!(row.values[0].value, Value::Int64(10));
        assert_eq!(row.values[0].timestamp, Timestamp(110));
    }
}
