//! Chunk stores: immutable stores backed by a chunk in cluster storage.
//!
//! A chunk is a sequence of lz4-compressed blocks of bincode-encoded
//! rows plus a [`ChunkMeta`] carrying the block index, boundary keys and
//! timestamp range. Sorted chunks hold versioned rows; ordered chunks
//! hold unversioned rows addressed by global row index.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use marl_client::{ChunkId, StoreId};
use marl_data::{Key, Timestamp, UnversionedRow, VersionedRow, MAX_TIMESTAMP, MIN_TIMESTAMP};
use marl_errors::{MarlError, MarlResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::InMemoryMode;
use crate::interfaces::{BlockCache, BlockType, ChunkReader, ChunkWriter, Throttler};

use super::{AddStoreDescriptor, CompactionState, PreloadState, StoreState, StoreType};

/// Per-block entry of the chunk meta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Rows in the block.
    pub row_count: u64,
    /// Byte size of the encoded rows before compression.
    pub uncompressed_size: u64,
    /// Byte size of the stored block.
    pub compressed_size: u64,
    /// Key of the block's first row; sorted chunks only.
    pub first_key: Option<Key>,
}

/// Meta of a chunk, cached by its store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// True for sorted chunks.
    pub sorted: bool,
    /// True for chunks that belong in Eden (fresh flush output and Eden
    /// compactions); partitioned chunks carry false.
    #[serde(default)]
    pub eden: bool,
    /// Total rows.
    pub row_count: u64,
    /// Total uncompressed bytes.
    pub uncompressed_data_size: u64,
    /// Total stored bytes.
    pub compressed_data_size: u64,
    /// Smallest key; sorted chunks only.
    pub min_key: Option<Key>,
    /// Largest key; sorted chunks only.
    pub max_key: Option<Key>,
    /// Smallest timestamp mentioned in any row.
    pub min_timestamp: Timestamp,
    /// Largest timestamp mentioned in any row.
    pub max_timestamp: Timestamp,
    /// Block index.
    pub blocks: Vec<BlockMeta>,
}

/// Encodes rows into a compressed block.
pub fn encode_block<T: Serialize>(rows: &[T]) -> MarlResult<(Bytes, usize)> {
    let payload = bincode::serialize(rows)
        .map_err(|error| marl_errors::internal_err!("block encoding failed: {error}"))?;
    let uncompressed_size = payload.len();
    let compressed = lz4_flex::compress_prepend_size(&payload);
    Ok((Bytes::from(compressed), uncompressed_size))
}

/// Decodes a compressed block back into rows.
pub fn decode_block<T: DeserializeOwned>(block: &[u8]) -> MarlResult<Vec<T>> {
    let payload = lz4_flex::decompress_size_prepended(block)
        .map_err(|error| MarlError::ChunkUnavailable(format!("block decompression failed: {error}")))?;
    decode_payload(&payload)
}

/// Decodes an already-decompressed block payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> MarlResult<Vec<T>> {
    bincode::deserialize(payload)
        .map_err(|error| MarlError::ChunkUnavailable(format!("block decoding failed: {error}")))
}

/// Blocks of a chunk pinned in RAM by the in-memory manager.
#[derive(Clone)]
pub struct PreloadedBlocks {
    /// Form the blocks are kept in.
    pub mode: InMemoryMode,
    /// One entry per block: compressed bytes in `Compressed` mode,
    /// decompressed payloads in `Uncompressed` mode.
    pub blocks: Vec<Bytes>,
    /// Key → (block index, row index) over the whole chunk; built when
    /// the tablet configures a lookup hash table.
    pub lookup_hash_table: Option<Arc<std::collections::HashMap<Key, (usize, usize)>>>,
}

impl fmt::Debug for PreloadedBlocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadedBlocks")
            .field("mode", &self.mode)
            .field("blocks", &self.blocks.len())
            .field("lookup_hash_table", &self.lookup_hash_table.is_some())
            .finish()
    }
}

macro_rules! chunk_store_common {
    () => {
        /// The store id (equal to the chunk id).
        pub fn id(&self) -> StoreId {
            self.id
        }

        /// Current lifecycle state.
        pub fn state(&self) -> StoreState {
            *self.state.read()
        }

        /// Sets the lifecycle state.
        pub fn set_state(&self, state: StoreState) {
            *self.state.write() = state;
        }

        /// The cached chunk meta.
        pub fn meta(&self) -> &ChunkMeta {
            &self.meta
        }

        /// The backing chunk reader.
        pub fn chunk_reader(&self) -> &Arc<dyn ChunkReader> {
            &self.reader
        }

        /// Compaction progress.
        pub fn compaction_state(&self) -> CompactionState {
            *self.compaction_state.read()
        }

        /// Sets compaction progress.
        pub fn set_compaction_state(&self, state: CompactionState) {
            *self.compaction_state.write() = state;
        }

        /// Preload progress.
        pub fn preload_state(&self) -> PreloadState {
            *self.preload_state.read()
        }

        /// Sets preload progress.
        pub fn set_preload_state(&self, state: PreloadState) {
            *self.preload_state.write() = state;
        }

        /// When the store object was created; drives periodic compaction.
        pub fn creation_time(&self) -> Instant {
            self.creation_time
        }

        /// Attaches preloaded blocks.
        pub fn preload(&self, blocks: PreloadedBlocks) {
            *self.preloaded.write() = Some(Arc::new(blocks));
        }

        /// The preloaded blocks, if any.
        pub fn preloaded(&self) -> Option<Arc<PreloadedBlocks>> {
            self.preloaded.read().clone()
        }

        /// Reads one block, preferring preloaded data, and decodes it.
        async fn read_block_rows_inner<T: DeserializeOwned>(
            &self,
            block_index: usize,
        ) -> MarlResult<Vec<T>> {
            if let Some(preloaded) = self.preloaded() {
                let block = preloaded.blocks.get(block_index).cloned();
                if let Some(block) = block {
                    return match preloaded.mode {
                        InMemoryMode::Uncompressed => decode_payload(&block),
                        _ => decode_block(&block),
                    };
                }
            }
            let blocks = self.reader.read_blocks(block_index, 1).await?;
            let block = blocks.first().ok_or_else(|| {
                MarlError::ChunkUnavailable(format!(
                    "chunk {} is missing block {block_index}",
                    self.id
                ))
            })?;
            decode_block(block)
        }
    };
}

/// A sorted chunk store.
pub struct SortedChunkStore {
    id: StoreId,
    state: RwLock<StoreState>,
    compaction_state: RwLock<CompactionState>,
    preload_state: RwLock<PreloadState>,
    meta: ChunkMeta,
    reader: Arc<dyn ChunkReader>,
    preloaded: RwLock<Option<Arc<PreloadedBlocks>>>,
    creation_time: Instant,
}

impl fmt::Debug for SortedChunkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedChunkStore")
            .field("id", &self.id)
            .field("rows", &self.meta.row_count)
            .field("min_key", &self.meta.min_key)
            .field("max_key", &self.meta.max_key)
            .finish()
    }
}

impl SortedChunkStore {
    /// Binds a store to a chunk and its meta.
    pub fn new(id: StoreId, meta: ChunkMeta, reader: Arc<dyn ChunkReader>) -> SortedChunkStore {
        debug_assert!(meta.sorted);
        SortedChunkStore {
            id,
            state: RwLock::new(StoreState::Persistent),
            compaction_state: RwLock::new(CompactionState::None),
            preload_state: RwLock::new(PreloadState::None),
            meta,
            reader,
            preloaded: RwLock::new(None),
            creation_time: Instant::now(),
        }
    }

    chunk_store_common!();

    /// Indexes of the blocks whose key ranges intersect
    /// `[lower, upper)`; `upper = None` means unbounded.
    pub fn blocks_for_range(&self, lower: &Key, upper: Option<&Key>) -> Vec<usize> {
        let mut result = Vec::new();
        for (index, block) in self.meta.blocks.iter().enumerate() {
            let block_first = block.first_key.as_ref();
            let next_first = self
                .meta
                .blocks
                .get(index + 1)
                .and_then(|next| next.first_key.as_ref());

            // A block covers [first_key, next block's first key); the
            // last block extends through max_key.
            if let Some(upper) = upper {
                if block_first.is_some_and(|first| first >= upper) {
                    break;
                }
            }
            if let Some(next_first) = next_first {
                if next_first <= lower {
                    continue;
                }
            }
            result.push(index);
        }
        result
    }

    /// Reads and decodes one block of versioned rows.
    pub async fn read_block_rows(&self, block_index: usize) -> MarlResult<Vec<VersionedRow>> {
        self.read_block_rows_inner(block_index).await
    }

    /// Looks up one key, using the lookup hash table when present.
    pub async fn lookup(&self, key: &Key) -> MarlResult<Option<VersionedRow>> {
        if let Some(preloaded) = self.preloaded() {
            if let Some(table) = &preloaded.lookup_hash_table {
                let Some((block_index, row_index)) = table.get(key) else {
                    return Ok(None);
                };
                let rows = self.read_block_rows(*block_index).await?;
                return Ok(rows.get(*row_index).cloned());
            }
        }

        if self.meta.min_key.as_ref().is_some_and(|min| key < min)
            || self.meta.max_key.as_ref().is_some_and(|max| key > max)
        {
            return Ok(None);
        }
        for block_index in self.blocks_for_range(key, None) {
            let rows = self.read_block_rows(block_index).await?;
            if let Some(row) = rows.iter().find(|row| &row.key == key) {
                return Ok(Some(row.clone()));
            }
            if rows.last().is_some_and(|row| &row.key > key) {
                break;
            }
        }
        Ok(None)
    }
}

/// An ordered chunk store.
pub struct OrderedChunkStore {
    id: StoreId,
    state: RwLock<StoreState>,
    compaction_state: RwLock<CompactionState>,
    preload_state: RwLock<PreloadState>,
    meta: ChunkMeta,
    reader: Arc<dyn ChunkReader>,
    preloaded: RwLock<Option<Arc<PreloadedBlocks>>>,
    creation_time: Instant,
    starting_row_index: u64,
}

impl fmt::Debug for OrderedChunkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedChunkStore")
            .field("id", &self.id)
            .field("rows", &self.meta.row_count)
            .field("starting_row_index", &self.starting_row_index)
            .finish()
    }
}

impl OrderedChunkStore {
    /// Binds a store to a chunk, its meta and its position in the
    /// tablet's row index space.
    pub fn new(
        id: StoreId,
        meta: ChunkMeta,
        reader: Arc<dyn ChunkReader>,
        starting_row_index: u64,
    ) -> OrderedChunkStore {
        debug_assert!(!meta.sorted);
        OrderedChunkStore {
            id,
            state: RwLock::new(StoreState::Persistent),
            compaction_state: RwLock::new(CompactionState::None),
            preload_state: RwLock::new(PreloadState::None),
            meta,
            reader,
            preloaded: RwLock::new(None),
            creation_time: Instant::now(),
            starting_row_index,
        }
    }

    chunk_store_common!();

    /// Global row index of the chunk's first row.
    pub fn starting_row_index(&self) -> u64 {
        self.starting_row_index
    }

    /// Reads rows whose global indexes fall in
    /// `[lower_row_index, upper_row_index)`.
    pub async fn read_rows(
        &self,
        lower_row_index: u64,
        upper_row_index: u64,
    ) -> MarlResult<Vec<UnversionedRow>> {
        let mut result = Vec::new();
        let mut block_start = self.starting_row_index;
        for (block_index, block) in self.meta.blocks.iter().enumerate() {
            let block_end = block_start + block.row_count;
            if block_start >= upper_row_index {
                break;
            }
            if block_end > lower_row_index {
                let rows: Vec<UnversionedRow> = self.read_block_rows_inner(block_index).await?;
                for (offset, row) in rows.into_iter().enumerate() {
                    let global = block_start + offset as u64;
                    if global >= lower_row_index && global < upper_row_index {
                        result.push(row);
                    }
                }
            }
            block_start = block_end;
        }
        Ok(result)
    }
}

const DEFAULT_BLOCK_SIZE: usize = 256 << 10;

enum BufferedRows {
    Sorted(Vec<VersionedRow>),
    Ordered(Vec<UnversionedRow>),
}

/// Buffers rows, cuts compressed blocks, and seals the chunk with its
/// meta. The write side of every flush, compaction and partitioning.
pub struct ChunkWriterPipeline {
    writer: Box<dyn ChunkWriter>,
    block_cache: Option<Arc<dyn BlockCache>>,
    throttler: Arc<dyn Throttler>,
    block_size_limit: usize,

    buffered: BufferedRows,
    buffered_weight: usize,
    meta: ChunkMeta,
    starting_row_index: Option<u64>,
}

impl ChunkWriterPipeline {
    /// A pipeline producing a sorted chunk. `eden` marks the output as
    /// Eden-bound (fresh flushes and Eden compactions) rather than
    /// partition-bound.
    pub fn sorted(
        writer: Box<dyn ChunkWriter>,
        block_cache: Option<Arc<dyn BlockCache>>,
        throttler: Arc<dyn Throttler>,
        eden: bool,
    ) -> ChunkWriterPipeline {
        ChunkWriterPipeline {
            writer,
            block_cache,
            throttler,
            block_size_limit: DEFAULT_BLOCK_SIZE,
            buffered: BufferedRows::Sorted(Vec::new()),
            buffered_weight: 0,
            meta: ChunkMeta {
                sorted: true,
                eden,
                min_timestamp: MAX_TIMESTAMP,
                max_timestamp: MIN_TIMESTAMP,
                ..ChunkMeta::default()
            },
            starting_row_index: None,
        }
    }

    /// A pipeline producing an ordered chunk starting at
    /// `starting_row_index`.
    pub fn ordered(
        writer: Box<dyn ChunkWriter>,
        block_cache: Option<Arc<dyn BlockCache>>,
        throttler: Arc<dyn Throttler>,
        starting_row_index: u64,
    ) -> ChunkWriterPipeline {
        ChunkWriterPipeline {
            writer,
            block_cache,
            throttler,
            block_size_limit: DEFAULT_BLOCK_SIZE,
            buffered: BufferedRows::Ordered(Vec::new()),
            buffered_weight: 0,
            meta: ChunkMeta {
                sorted: false,
                min_timestamp: MAX_TIMESTAMP,
                max_timestamp: MIN_TIMESTAMP,
                ..ChunkMeta::default()
            },
            starting_row_index: Some(starting_row_index),
        }
    }

    /// The id of the chunk being written.
    pub fn chunk_id(&self) -> ChunkId {
        self.writer.chunk_id()
    }

    /// Appends versioned rows; sorted pipelines only.
    pub async fn write_versioned(&mut self, rows: &[VersionedRow]) -> MarlResult<()> {
        for row in rows {
            if row.is_empty() {
                continue;
            }
            if self.meta.min_key.is_none() {
                self.meta.min_key = Some(row.key.clone());
            }
            self.meta.max_key = Some(row.key.clone());
            if let Some(min) = row.min_timestamp() {
                self.meta.min_timestamp = self.meta.min_timestamp.min(min);
            }
            if let Some(max) = row.max_timestamp() {
                self.meta.max_timestamp = self.meta.max_timestamp.max(max);
            }
            self.buffered_weight += row.key.data_weight()
                + row
                    .values
                    .iter()
                    .map(|value| value.value.data_weight() + 8)
                    .sum::<usize>();
            match &mut self.buffered {
                BufferedRows::Sorted(buffer) => buffer.push(row.clone()),
                BufferedRows::Ordered(_) => {
                    marl_errors::internal!("versioned rows written into an ordered chunk")
                }
            }
            if self.buffered_weight >= self.block_size_limit {
                self.flush_block().await?;
            }
        }
        Ok(())
    }

    /// Appends unversioned rows; ordered pipelines only.
    pub async fn write_unversioned(
        &mut self,
        rows: &[UnversionedRow],
        commit_range: (Timestamp, Timestamp),
    ) -> MarlResult<()> {
        self.meta.min_timestamp = self.meta.min_timestamp.min(commit_range.0);
        self.meta.max_timestamp = self.meta.max_timestamp.max(commit_range.1);
        for row in rows {
            self.buffered_weight += row
                .values
                .iter()
                .map(|value| value.value.data_weight())
                .sum::<usize>();
            match &mut self.buffered {
                BufferedRows::Ordered(buffer) => buffer.push(row.clone()),
                BufferedRows::Sorted(_) => {
                    marl_errors::internal!("unversioned rows written into a sorted chunk")
                }
            }
            if self.buffered_weight >= self.block_size_limit {
                self.flush_block().await?;
            }
        }
        Ok(())
    }

    /// Seals the chunk. Returns `None` if no rows were written (no chunk
    /// is confirmed in that case).
    pub async fn finish(mut self) -> MarlResult<Option<AddStoreDescriptor>> {
        self.flush_block().await?;
        if self.meta.row_count == 0 {
            return Ok(None);
        }
        let store_type = if self.meta.sorted {
            StoreType::SortedChunk
        } else {
            StoreType::OrderedChunk
        };
        let chunk_id = self.writer.chunk_id();
        let meta = self.meta.clone();
        self.writer.close(meta.clone()).await?;
        Ok(Some(AddStoreDescriptor {
            store_type,
            store_id: chunk_id.into(),
            chunk_meta: meta,
            starting_row_index: self.starting_row_index,
        }))
    }

    async fn flush_block(&mut self) -> MarlResult<()> {
        let (block, payload, row_count, first_key) = match &mut self.buffered {
            BufferedRows::Sorted(buffer) => {
                if buffer.is_empty() {
                    return Ok(());
                }
                let rows = std::mem::take(buffer);
                let first_key = Some(rows[0].key.clone());
                let (block, uncompressed) = encode_block(&rows)?;
                (block, uncompressed, rows.len() as u64, first_key)
            }
            BufferedRows::Ordered(buffer) => {
                if buffer.is_empty() {
                    return Ok(());
                }
                let rows = std::mem::take(buffer);
                let (block, uncompressed) = encode_block(&rows)?;
                (block, uncompressed, rows.len() as u64, None)
            }
        };
        self.buffered_weight = 0;

        self.throttler.throttle(block.len() as u64).await?;

        let block_index = self.meta.blocks.len();
        if let Some(cache) = &self.block_cache {
            cache.put_block(
                self.writer.chunk_id(),
                block_index,
                BlockType::Compressed,
                block.clone(),
            );
        }

        self.meta.blocks.push(BlockMeta {
            row_count,
            uncompressed_size: payload as u64,
            compressed_size: block.len() as u64,
            first_key,
        });
        self.meta.row_count += row_count;
        self.meta.uncompressed_data_size += payload as u64;
        self.meta.compressed_data_size += block.len() as u64;

        self.writer.write_block(block).await
    }
}

#[cfg(test)]
mod tests {
    use marl_data::Value;

    use super::*;

    #[test]
    fn block_codec_round_trips() {
        let rows = vec![VersionedRow {
            key: Key::from([Value::Int64(1)]),
            values: vec![],
            write_timestamps: vec![Timestamp(100)],
            delete_timestamps: vec![],
        }];
        let (block, uncompressed) = encode_block(&rows).unwrap();
        assert!(uncompressed > 0);
        let decoded: Vec<VersionedRow> = decode_block(&block).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn blocks_for_range_uses_first_keys() {
        let meta = ChunkMeta {
            sorted: true,
            blocks: vec![
                BlockMeta {
                    row_count: 1,
                    uncompressed_size: 1,
                    compressed_size: 1,
                    first_key: Some(Key::from([Value::Int64(0)])),
                },
                BlockMeta {
                    row_count: 1,
                    uncompressed_size: 1,
                    compressed_size: 1,
                    first_key: Some(Key::from([Value::Int64(10)])),
                },
                BlockMeta {
                    row_count: 1,
                    uncompressed_size: 1,
                    compressed_size: 1,
                    first_key: Some(Key::from([Value::Int64(20)])),
                },
            ],
            min_key: Some(Key::from([Value::Int64(0)])),
            max_key: Some(Key::from([Value::Int64(25)])),
            ..ChunkMeta::default()
        };

        struct NullReader;
        #[async_trait::async_trait]
        impl ChunkReader for NullReader {
            fn chunk_id(&self) -> ChunkId {
                ChunkId::NULL
            }
            async fn read_meta(&self) -> MarlResult<ChunkMeta> {
                unreachable!()
            }
            async fn read_blocks(&self, _: usize, _: usize) -> MarlResult<Vec<Bytes>> {
                unreachable!()
            }
        }

        let store = SortedChunkStore::new(StoreId::generate(), meta, Arc::new(NullReader));

        assert_eq!(
            store.blocks_for_range(&Key::from([Value::Int64(12)]), None),
            vec![1, 2]
        );
        assert_eq!(
            store.blocks_for_range(
                &Key::from([Value::Int64(0)]),
                Some(&Key::from([Value::Int64(10)]))
            ),
            vec![0]
        );
        assert_eq!(
            store.blocks_for_range(&Key::empty(), None),
            vec![0, 1, 2]
        );
    }
}
