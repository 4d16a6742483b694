//! Stores: the places rows live.
//!
//! Every row of a tablet is in exactly one store. Dynamic stores buffer
//! recent writes in memory; chunk stores are immutable and backed by a
//! chunk in cluster storage. The [`Store`] enum is the tagged variant the
//! rest of the node dispatches on.

mod chunk;
mod ordered_dynamic;
mod sorted_dynamic;

pub use chunk::{
    decode_block, decode_payload, encode_block, BlockMeta, ChunkMeta, ChunkWriterPipeline,
    OrderedChunkStore, PreloadedBlocks, SortedChunkStore,
};
pub use ordered_dynamic::OrderedDynamicStore;
pub use sorted_dynamic::{
    DynamicRowSnapshot, MigratedLock, RowMigration, SortedDynamicStore, WriteOutcome,
    HARD_REVISION_LIMIT, NOT_PREPARED_TIMESTAMP, SOFT_REVISION_LIMIT, UNCOMMITTED_REVISION,
};

use std::sync::Arc;

use marl_client::StoreId;
use marl_data::{Key, Timestamp};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Lifecycle state of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum StoreState {
    /// Dynamic, receiving new writes.
    ActiveDynamic,
    /// Dynamic, rotated out, awaiting flush.
    PassiveDynamic,
    /// Backed by a chunk.
    Persistent,
    /// An `UpdateTabletStores` removing this store is in flight.
    RemoveCommitting,
    /// Removed from the store set; kept only while transactions still
    /// hold row locks in it.
    Removed,
    /// Belonged to a forcefully removed tablet.
    Orphaned,
}

/// What kind of store this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum StoreType {
    /// Sorted in-memory store.
    SortedDynamic,
    /// Ordered in-memory store.
    OrderedDynamic,
    /// Sorted chunk.
    SortedChunk,
    /// Ordered chunk.
    OrderedChunk,
}

/// Flush progress of a dynamic store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum FlushState {
    /// Not being flushed.
    #[default]
    None,
    /// A flush task owns the store.
    Running,
    /// Flushed; waiting for the store-set update to land.
    Complete,
    /// The last flush failed; a timed reset back to `None` is pending.
    Failed,
}

/// Compaction progress of a chunk store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum CompactionState {
    /// Not being compacted.
    #[default]
    None,
    /// A compaction or partitioning task owns the store.
    Running,
    /// Compacted; waiting for the store-set update to land.
    Complete,
    /// The last compaction failed; a timed reset is pending.
    Failed,
}

/// Preload progress of a chunk store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum PreloadState {
    /// The tablet is not in-memory.
    Disabled,
    /// Not preloaded.
    #[default]
    None,
    /// Queued for preload.
    Scheduled,
    /// A preload task is running.
    Running,
    /// Blocks are attached.
    Complete,
    /// The last preload failed; a timed retry is pending.
    Failed,
}

/// Descriptor of a store added by a flush, compaction or partitioning,
/// as carried inside `UpdateTabletStores` mutations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddStoreDescriptor {
    /// Kind of store to add.
    pub store_type: StoreType,
    /// Id (equal to the chunk id for chunk stores).
    pub store_id: StoreId,
    /// The chunk's meta.
    pub chunk_meta: ChunkMeta,
    /// Row index the chunk starts at; ordered stores only.
    pub starting_row_index: Option<u64>,
}

/// A store of any kind.
///
/// Cloning is cheap: concrete stores are behind `Arc` so reader
/// snapshots can outlive removal from the store set.
#[derive(Clone, Debug)]
pub enum Store {
    /// Sorted dynamic store.
    SortedDynamic(Arc<SortedDynamicStore>),
    /// Ordered dynamic store.
    OrderedDynamic(Arc<OrderedDynamicStore>),
    /// Sorted chunk store.
    SortedChunk(Arc<SortedChunkStore>),
    /// Ordered chunk store.
    OrderedChunk(Arc<OrderedChunkStore>),
}

impl Store {
    /// The store's id.
    pub fn id(&self) -> StoreId {
        match self {
            Store::SortedDynamic(store) => store.id(),
            Store::OrderedDynamic(store) => store.id(),
            Store::SortedChunk(store) => store.id(),
            Store::OrderedChunk(store) => store.id(),
        }
    }

    /// The store's kind.
    pub fn store_type(&self) -> StoreType {
        match self {
            Store::SortedDynamic(_) => StoreType::SortedDynamic,
            Store::OrderedDynamic(_) => StoreType::OrderedDynamic,
            Store::SortedChunk(_) => StoreType::SortedChunk,
            Store::OrderedChunk(_) => StoreType::OrderedChunk,
        }
    }

    /// The store's lifecycle state.
    pub fn state(&self) -> StoreState {
        match self {
            Store::SortedDynamic(store) => store.state(),
            Store::OrderedDynamic(store) => store.state(),
            Store::SortedChunk(store) => store.state(),
            Store::OrderedChunk(store) => store.state(),
        }
    }

    /// Sets the store's lifecycle state.
    pub fn set_state(&self, state: StoreState) {
        match self {
            Store::SortedDynamic(store) => store.set_state(state),
            Store::OrderedDynamic(store) => store.set_state(state),
            Store::SortedChunk(store) => store.set_state(state),
            Store::OrderedChunk(store) => store.set_state(state),
        }
    }

    /// True for dynamic stores.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Store::SortedDynamic(_) | Store::OrderedDynamic(_))
    }

    /// True for chunk stores.
    pub fn is_chunk(&self) -> bool {
        matches!(self, Store::SortedChunk(_) | Store::OrderedChunk(_))
    }

    /// True for stores of sorted tablets.
    pub fn is_sorted(&self) -> bool {
        matches!(self, Store::SortedDynamic(_) | Store::SortedChunk(_))
    }

    /// Number of rows.
    pub fn row_count(&self) -> u64 {
        match self {
            Store::SortedDynamic(store) => store.row_count(),
            Store::OrderedDynamic(store) => store.row_count(),
            Store::SortedChunk(store) => store.meta().row_count,
            Store::OrderedChunk(store) => store.meta().row_count,
        }
    }

    /// Uncompressed data size in bytes.
    pub fn uncompressed_data_size(&self) -> u64 {
        match self {
            Store::SortedDynamic(store) => store.pool_size(),
            Store::OrderedDynamic(store) => store.pool_size(),
            Store::SortedChunk(store) => store.meta().uncompressed_data_size,
            Store::OrderedChunk(store) => store.meta().uncompressed_data_size,
        }
    }

    /// Compressed data size; equals the uncompressed size for dynamic
    /// stores.
    pub fn compressed_data_size(&self) -> u64 {
        match self {
            Store::SortedChunk(store) => store.meta().compressed_data_size,
            Store::OrderedChunk(store) => store.meta().compressed_data_size,
            _ => self.uncompressed_data_size(),
        }
    }

    /// Smallest key in the store; sorted stores only.
    pub fn min_key(&self) -> Option<Key> {
        match self {
            Store::SortedDynamic(store) => store.min_key(),
            Store::SortedChunk(store) => store.meta().min_key.clone(),
            _ => None,
        }
    }

    /// Largest key in the store; sorted stores only.
    pub fn max_key(&self) -> Option<Key> {
        match self {
            Store::SortedDynamic(store) => store.max_key(),
            Store::SortedChunk(store) => store.meta().max_key.clone(),
            _ => None,
        }
    }

    /// Smallest timestamp mentioned in the store.
    pub fn min_timestamp(&self) -> Timestamp {
        match self {
            Store::SortedDynamic(store) => store.min_timestamp(),
            Store::OrderedDynamic(store) => store.min_timestamp(),
            Store::SortedChunk(store) => store.meta().min_timestamp,
            Store::OrderedChunk(store) => store.meta().min_timestamp,
        }
    }

    /// Largest timestamp mentioned in the store.
    pub fn max_timestamp(&self) -> Timestamp {
        match self {
            Store::SortedDynamic(store) => store.max_timestamp(),
            Store::OrderedDynamic(store) => store.max_timestamp(),
            Store::SortedChunk(store) => store.meta().max_timestamp,
            Store::OrderedChunk(store) => store.meta().max_timestamp,
        }
    }

    /// Downcast to a sorted dynamic store.
    pub fn as_sorted_dynamic(&self) -> Option<&Arc<SortedDynamicStore>> {
        match self {
            Store::SortedDynamic(store) => Some(store),
            _ => None,
        }
    }

    /// Downcast to an ordered dynamic store.
    pub fn as_ordered_dynamic(&self) -> Option<&Arc<OrderedDynamicStore>> {
        match self {
            Store::OrderedDynamic(store) => Some(store),
            _ => None,
        }
    }

    /// Downcast to a sorted chunk store.
    pub fn as_sorted_chunk(&self) -> Option<&Arc<SortedChunkStore>> {
        match self {
            Store::SortedChunk(store) => Some(store),
            _ => None,
        }
    }

    /// Downcast to an ordered chunk store.
    pub fn as_ordered_chunk(&self) -> Option<&Arc<OrderedChunkStore>> {
        match self {
            Store::OrderedChunk(store) => Some(store),
            _ => None,
        }
    }

    /// Flush state; dynamic stores only, `None` otherwise.
    pub fn flush_state(&self) -> FlushState {
        match self {
            Store::SortedDynamic(store) => store.flush_state(),
            Store::OrderedDynamic(store) => store.flush_state(),
            _ => FlushState::None,
        }
    }

    /// Compaction state; chunk stores only, `None` otherwise.
    pub fn compaction_state(&self) -> CompactionState {
        match self {
            Store::SortedChunk(store) => store.compaction_state(),
            Store::OrderedChunk(store) => store.compaction_state(),
            _ => CompactionState::None,
        }
    }
}
