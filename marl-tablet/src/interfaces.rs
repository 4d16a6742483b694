//! Contracts of the tablet node's external collaborators.
//!
//! Nothing in this module is implemented here: the replicated log, the
//! master, chunk storage, the transaction supervisor and the timestamp
//! provider are services the hosting process injects. Tests use the
//! in-memory doubles under `tests/common`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use marl_client::{ChunkId, StoreId, TabletId, TransactionId};
use marl_data::{Key, Timestamp};
use marl_errors::MarlResult;
use serde::{Deserialize, Serialize};
use vec1::Vec1;

use crate::store::{AddStoreDescriptor, ChunkMeta};

/// A mutation to be sequenced through the replicated log.
///
/// Every persistent state change of the tablet cell goes through one of
/// these; the log replays them in order on every replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Rotate the active store of a tablet.
    RotateStore {
        /// Target tablet.
        tablet_id: TabletId,
    },
    /// Atomically add and remove stores of a tablet.
    UpdateTabletStores {
        /// Target tablet.
        tablet_id: TabletId,
        /// Mount revision the request was built against.
        mount_revision: u64,
        /// Stores to add.
        stores_to_add: Vec<AddStoreDescriptor>,
        /// Stores to remove.
        stores_to_remove: Vec<StoreId>,
    },
    /// Serialize all transactions committed at or before the timestamp.
    HandleTransactionBarrier {
        /// The barrier timestamp.
        timestamp: Timestamp,
    },
    /// Split a partition at the given pivot keys.
    SplitPartition {
        /// Target tablet.
        tablet_id: TabletId,
        /// Index of the partition to split.
        partition_index: usize,
        /// Pivots of the resulting partitions; the first equals the
        /// partition's current pivot.
        pivot_keys: Vec1<Key>,
    },
    /// Merge a run of adjacent partitions.
    MergePartitions {
        /// Target tablet.
        tablet_id: TabletId,
        /// Index of the first partition of the run.
        first_partition_index: usize,
        /// Number of partitions to merge.
        partition_count: usize,
    },
    /// Install fresh sample keys into a partition.
    UpdatePartitionSampleKeys {
        /// Target tablet.
        tablet_id: TabletId,
        /// Index of the sampled partition.
        partition_index: usize,
        /// Deduplicated, sorted sample keys.
        sample_keys: Vec<Key>,
    },
    /// Trim the head of an ordered tablet.
    TrimRows {
        /// Target tablet.
        tablet_id: TabletId,
        /// New trimmed row count.
        trimmed_row_count: u64,
    },
}

/// The replicated log the automaton commits mutations through.
#[async_trait]
pub trait MutationLog: Send + Sync {
    /// Commits a mutation; resolves once it is applied on this replica.
    async fn commit(&self, mutation: Mutation) -> MarlResult<()>;

    /// True on the replica currently leading the cell.
    fn is_leader(&self) -> bool;

    /// True while replaying the log during recovery.
    fn is_recovery(&self) -> bool;
}

/// Handle to a master-side transaction wrapping a store-set update.
#[async_trait]
pub trait MasterTransaction: Send + Sync {
    /// The transaction id.
    fn id(&self) -> TransactionId;

    /// Commits the transaction together with its attached store update.
    async fn commit(self: Box<Self>) -> MarlResult<()>;
}

/// The master: object creation, chunk confirmation, store-set updates.
///
/// All calls are idempotent under a caller-supplied mutation id.
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Starts a master transaction titled `title`.
    async fn start_transaction(&self, title: String) -> MarlResult<Box<dyn MasterTransaction>>;
}

/// Yields cluster-wide hybrid timestamps. The tablet never mints its own.
#[async_trait]
pub trait TimestampProvider: Send + Sync {
    /// Generates a fresh timestamp, greater than every previously
    /// generated one.
    async fn generate(&self) -> MarlResult<Timestamp>;

    /// The latest timestamp this provider has issued.
    fn latest(&self) -> Timestamp;
}

/// Reads a chunk's meta and blocks.
#[async_trait]
pub trait ChunkReader: Send + Sync {
    /// The chunk's id.
    fn chunk_id(&self) -> ChunkId;

    /// Reads the chunk meta.
    async fn read_meta(&self) -> MarlResult<ChunkMeta>;

    /// Reads a contiguous run of blocks by index.
    async fn read_blocks(&self, first_block: usize, block_count: usize)
        -> MarlResult<Vec<Bytes>>;
}

/// Writes a chunk block by block; `close` confirms it with the master.
#[async_trait]
pub trait ChunkWriter: Send + Sync {
    /// The id the chunk will confirm under.
    fn chunk_id(&self) -> ChunkId;

    /// Appends one compressed block.
    async fn write_block(&mut self, block: Bytes) -> MarlResult<()>;

    /// Seals the chunk with its meta.
    async fn close(self: Box<Self>, meta: ChunkMeta) -> MarlResult<()>;
}

/// Opens chunk readers and writers against cluster storage.
#[async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Opens a reader for an existing chunk.
    async fn open_reader(&self, chunk_id: ChunkId) -> MarlResult<Arc<dyn ChunkReader>>;

    /// Creates a writer for a new chunk under the given master
    /// transaction.
    async fn create_writer(
        &self,
        transaction_id: TransactionId,
    ) -> MarlResult<Box<dyn ChunkWriter>>;
}

/// Kind of block a cache entry holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// Compressed on-disk representation.
    Compressed,
    /// Decompressed rows.
    Uncompressed,
}

/// A block cache chunk writers publish into.
pub trait BlockCache: Send + Sync {
    /// Stores a block.
    fn put_block(&self, chunk_id: ChunkId, block_index: usize, block_type: BlockType, block: Bytes);

    /// Fetches a block if cached.
    fn find_block(&self, chunk_id: ChunkId, block_index: usize, block_type: BlockType)
        -> Option<Bytes>;
}

/// The distributed-transaction coordinator.
///
/// The tablet node never aborts a transaction locally; it asks the
/// supervisor, which broadcasts the abort to every participant through
/// the replicated log.
#[async_trait]
pub trait TransactionSupervisor: Send + Sync {
    /// Requests a cluster-wide abort of the transaction.
    async fn abort_transaction(&self, transaction_id: TransactionId) -> MarlResult<()>;
}

/// Fetches key samples from the chunks overlapping a partition.
#[async_trait]
pub trait SamplesFetcher: Send + Sync {
    /// Returns up to `max_sample_count` keys sampled from the given
    /// chunks, restricted to `[lower, upper)`.
    async fn fetch_samples(
        &self,
        chunk_ids: Vec<ChunkId>,
        lower: Key,
        upper: Key,
        max_sample_count: usize,
    ) -> MarlResult<Vec<Key>>;
}

/// A bandwidth throttler applied to flush and compaction traffic.
#[async_trait]
pub trait Throttler: Send + Sync {
    /// Waits until `bytes` of traffic may proceed.
    async fn throttle(&self, bytes: u64) -> MarlResult<()>;
}

/// A throttler that never waits; the default when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullThrottler;

#[async_trait]
impl Throttler for NullThrottler {
    async fn throttle(&self, _bytes: u64) -> MarlResult<()> {
        Ok(())
    }
}
