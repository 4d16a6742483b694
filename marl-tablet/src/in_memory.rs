//! The in-memory manager: preloads chunk blocks into RAM for tablets
//! mounted in an in-memory mode, and intercepts freshly written chunks
//! so they are born preloaded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use marl_client::ChunkId;
use marl_data::Key;
use marl_errors::MarlResult;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{InMemoryMode, StorePreloaderConfig};
use crate::interfaces::{BlockCache, BlockType};
use crate::store::{decode_block, ChunkMeta, PreloadedBlocks, Store};

/// Tracks the memory spent on preloaded and intercepted blocks against
/// a budget; preloads abort gracefully when it is exhausted.
#[derive(Debug)]
pub struct MemoryTracker {
    used: AtomicU64,
    limit: u64,
}

impl MemoryTracker {
    /// A tracker with the given byte budget.
    pub fn new(limit: u64) -> MemoryTracker {
        MemoryTracker {
            used: AtomicU64::new(0),
            limit,
        }
    }

    /// Current usage in bytes.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// True once the budget is spent.
    pub fn is_exceeded(&self) -> bool {
        self.used() >= self.limit
    }

    fn charge(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct InterceptedChunkData {
    mode: InMemoryMode,
    blocks: Vec<Option<Bytes>>,
    bytes: u64,
}

/// The in-memory manager of one node.
pub struct InMemoryManager {
    config: StorePreloaderConfig,
    memory: Arc<MemoryTracker>,
    preload_semaphore: Arc<Semaphore>,
    intercepted: RwLock<HashMap<ChunkId, InterceptedChunkData>>,
}

impl InMemoryManager {
    /// Creates the manager.
    pub fn new(config: StorePreloaderConfig, memory: Arc<MemoryTracker>) -> Arc<InMemoryManager> {
        let preload_semaphore = Arc::new(Semaphore::new(config.max_concurrent_preloads));
        Arc::new(InMemoryManager {
            config,
            memory,
            preload_semaphore,
            intercepted: RwLock::new(HashMap::new()),
        })
    }

    /// The preloader config.
    pub fn config(&self) -> &StorePreloaderConfig {
        &self.config
    }

    /// The preload concurrency gate.
    pub fn preload_semaphore(&self) -> &Arc<Semaphore> {
        &self.preload_semaphore
    }

    /// Wraps chunk writes so every block lands in the intercepted set.
    pub fn create_intercepting_block_cache(
        self: &Arc<Self>,
        mode: InMemoryMode,
    ) -> Arc<InterceptingBlockCache> {
        Arc::new(InterceptingBlockCache {
            owner: Arc::clone(self),
            mode,
            chunk_ids: Mutex::new(Vec::new()),
            dropped: Mutex::new(false),
        })
    }

    /// Claims the intercepted data of a chunk, if the writer's blocks
    /// all arrived. Consumed by `add_store` so freshly written chunks
    /// skip the read-back.
    pub fn evict_intercepted(&self, chunk_id: ChunkId) -> Option<PreloadedBlocks> {
        let mut intercepted = self.intercepted.write();
        let data = intercepted.remove(&chunk_id)?;
        self.memory.release(data.bytes);
        if data.blocks.iter().any(Option::is_none) {
            warn!(chunk_id = %chunk_id, "intercepted chunk data has holes; discarding");
            return None;
        }
        info!(chunk_id = %chunk_id, mode = ?data.mode, "intercepted chunk data evicted");
        Some(PreloadedBlocks {
            mode: data.mode,
            blocks: data.blocks.into_iter().map(|block| block.expect("checked")).collect(),
            lookup_hash_table: None,
        })
    }

    /// Drops intercepted data that no store claimed within the retention
    /// window (the writer failed, or the store landed elsewhere).
    pub fn schedule_intercepted_eviction(self: &Arc<Self>, chunk_id: ChunkId) {
        let manager = Arc::clone(self);
        let retention = self.config.intercepted_data_retention_time;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if manager.evict_intercepted(chunk_id).is_some() {
                debug!(chunk_id = %chunk_id, "unclaimed intercepted chunk data dropped");
            }
        });
    }

    /// Preloads one chunk store: reads the meta, fetches blocks in
    /// windows, optionally decompresses, builds the lookup hash table,
    /// and attaches the result to the store.
    ///
    /// Aborts gracefully (leaving the store unloaded) when the memory
    /// budget is exhausted.
    pub async fn preload_store(
        &self,
        store: &Store,
        mode: InMemoryMode,
        lookup_hash_table_size: usize,
    ) -> MarlResult<bool> {
        if mode == InMemoryMode::None {
            return Ok(false);
        }
        if self.memory.is_exceeded() {
            warn!(store_id = %store.id(), "memory limit reached; preload skipped");
            return Ok(false);
        }

        let (reader, meta) = match store {
            Store::SortedChunk(chunk) => (chunk.chunk_reader().clone(), chunk.meta().clone()),
            Store::OrderedChunk(chunk) => (chunk.chunk_reader().clone(), chunk.meta().clone()),
            _ => return Ok(false),
        };

        info!(store_id = %store.id(), ?mode, "store preload started");

        let total_blocks = meta.blocks.len();
        let mut blocks: Vec<Bytes> = Vec::with_capacity(total_blocks);
        let mut start = 0usize;
        while start < total_blocks {
            // Cut the read at the window size.
            let mut window_bytes = 0u64;
            let mut end = start;
            while end < total_blocks && (end == start || window_bytes < self.config.window_size) {
                window_bytes += meta.blocks[end].compressed_size;
                end += 1;
            }
            debug!(
                store_id = %store.id(),
                first_block = start,
                block_count = end - start,
                "reading chunk blocks"
            );
            let compressed = reader.read_blocks(start, end - start).await?;

            for (offset, block) in compressed.into_iter().enumerate() {
                if self.memory.is_exceeded() {
                    warn!(store_id = %store.id(), "memory limit reached mid-preload; aborting");
                    self.memory
                        .release(blocks.iter().map(|block| block.len() as u64).sum::<u64>());
                    return Ok(false);
                }
                let cached = match mode {
                    InMemoryMode::Compressed => block,
                    InMemoryMode::Uncompressed => {
                        let payload = lz4_flex::decompress_size_prepended(&block).map_err(
                            |error| {
                                marl_errors::MarlError::ChunkUnavailable(format!(
                                    "block {} of chunk {} failed to decompress: {error}",
                                    start + offset,
                                    store.id()
                                ))
                            },
                        )?;
                        Bytes::from(payload)
                    }
                    InMemoryMode::None => unreachable!("checked above"),
                };
                self.memory.charge(cached.len() as u64);
                blocks.push(cached);
            }
            start = end;
        }

        let lookup_hash_table = if meta.sorted && lookup_hash_table_size > 0 {
            Some(Arc::new(build_lookup_hash_table(&meta, &blocks, mode)?))
        } else {
            None
        };

        let preloaded = PreloadedBlocks {
            mode,
            blocks,
            lookup_hash_table,
        };
        match store {
            Store::SortedChunk(chunk) => chunk.preload(preloaded),
            Store::OrderedChunk(chunk) => chunk.preload(preloaded),
            _ => unreachable!("checked above"),
        }

        info!(
            store_id = %store.id(),
            lookup_hash_table = lookup_hash_table_size > 0,
            "store preload completed"
        );
        Ok(true)
    }
}

fn build_lookup_hash_table(
    meta: &ChunkMeta,
    blocks: &[Bytes],
    mode: InMemoryMode,
) -> MarlResult<HashMap<Key, (usize, usize)>> {
    let mut table = HashMap::with_capacity(meta.row_count as usize);
    for (block_index, block) in blocks.iter().enumerate() {
        let rows: Vec<marl_data::VersionedRow> = match mode {
            InMemoryMode::Uncompressed => crate::store::decode_payload(block)?,
            _ => decode_block(block)?,
        };
        for (row_index, row) in rows.into_iter().enumerate() {
            table.insert(row.key, (block_index, row_index));
        }
    }
    Ok(table)
}

/// One preload scan pass: drains the preload queues of every mounted
/// in-memory tablet, dispatching preload tasks under the concurrency
/// cap.
pub async fn scan(cell: &Arc<crate::tablet_manager::TabletCell>) -> MarlResult<()> {
    if !cell.mutation_log().is_leader() {
        return Ok(());
    }
    let manager = Arc::clone(cell.in_memory());
    if manager.memory.is_exceeded() {
        return Ok(());
    }

    let mut claimed = Vec::new();
    {
        let mut state = cell.lock().await;
        let tablet_ids: Vec<marl_client::TabletId> = state.tablets.keys().copied().collect();
        for tablet_id in tablet_ids {
            let Some(tablet) = state.tablets.get_mut(&tablet_id) else {
                continue;
            };
            if tablet.state() != crate::tablet::TabletState::Mounted {
                continue;
            }
            let mode = tablet.config().in_memory_mode;
            if mode == InMemoryMode::None {
                continue;
            }
            let hash_table_size = tablet.config().lookup_hash_table_size;
            while let Some(store) = crate::store_manager::peek_store_for_preload(tablet) {
                let Ok(permit) = Arc::clone(manager.preload_semaphore()).try_acquire_owned()
                else {
                    break;
                };
                crate::store_manager::begin_store_preload(tablet, &store);
                claimed.push((permit, store, mode, hash_table_size));
            }
        }
    }

    for (permit, store, mode, hash_table_size) in claimed {
        let manager = Arc::clone(cell.in_memory());
        let backoff = cell.config().tablet_manager.error_backoff;
        tokio::spawn(async move {
            let _permit = permit;
            match manager.preload_store(&store, mode, hash_table_size).await {
                Ok(true) => crate::store_manager::end_store_preload(&store),
                Ok(false) => crate::store_manager::backoff_store_preload(&store, backoff),
                Err(error) => {
                    warn!(
                        store_id = %store.id(),
                        %error,
                        "error preloading tablet store, backing off"
                    );
                    crate::store_manager::backoff_store_preload(&store, backoff);
                }
            }
        });
    }
    Ok(())
}

/// A block cache wrapper that captures every written block into the
/// in-memory manager's intercepted set.
pub struct InterceptingBlockCache {
    owner: Arc<InMemoryManager>,
    mode: InMemoryMode,
    chunk_ids: Mutex<Vec<ChunkId>>,
    dropped: Mutex<bool>,
}

impl BlockCache for InterceptingBlockCache {
    fn put_block(
        &self,
        chunk_id: ChunkId,
        block_index: usize,
        block_type: BlockType,
        block: Bytes,
    ) {
        let wanted = match self.mode {
            InMemoryMode::Compressed => BlockType::Compressed,
            InMemoryMode::Uncompressed => BlockType::Compressed,
            InMemoryMode::None => return,
        };
        if block_type != wanted {
            return;
        }

        if self.owner.memory.is_exceeded() {
            let mut dropped = self.dropped.lock();
            if !*dropped {
                *dropped = true;
                warn!(chunk_id = %chunk_id, "memory limit reached; interception dropped");
            }
            let mut intercepted = self.owner.intercepted.write();
            if let Some(data) = intercepted.remove(&chunk_id) {
                self.owner.memory.release(data.bytes);
            }
            return;
        }
        if *self.dropped.lock() {
            return;
        }

        // Uncompressed-mode tablets decompress at claim time; the
        // intercept always stores what the writer produced.
        let block = match self.mode {
            InMemoryMode::Uncompressed => match lz4_flex::decompress_size_prepended(&block) {
                Ok(payload) => Bytes::from(payload),
                Err(error) => {
                    warn!(chunk_id = %chunk_id, %error, "intercepted block failed to decompress");
                    return;
                }
            },
            _ => block,
        };

        let mut intercepted = self.owner.intercepted.write();
        let data = intercepted.entry(chunk_id).or_insert_with(|| {
            self.chunk_ids.lock().push(chunk_id);
            InterceptedChunkData {
                mode: self.mode,
                ..InterceptedChunkData::default()
            }
        });
        if data.blocks.len() <= block_index {
            data.blocks.resize(block_index + 1, None);
        }
        self.owner.memory.charge(block.len() as u64);
        data.bytes += block.len() as u64;
        data.blocks[block_index] = Some(block);
    }

    fn find_block(
        &self,
        _chunk_id: ChunkId,
        _block_index: usize,
        _block_type: BlockType,
    ) -> Option<Bytes> {
        None
    }
}

impl Drop for InterceptingBlockCache {
    fn drop(&mut self) {
        // Whatever no store claimed is dropped after the retention
        // window.
        for chunk_id in self.chunk_ids.lock().drain(..) {
            self.owner.schedule_intercepted_eviction(chunk_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::encode_block;
    use marl_data::{Timestamp, Value, VersionedRow};

    fn manager() -> Arc<InMemoryManager> {
        InMemoryManager::new(
            StorePreloaderConfig::default(),
            Arc::new(MemoryTracker::new(1 << 20)),
        )
    }

    #[tokio::test]
    async fn interception_round_trips_blocks() {
        let manager = manager();
        let cache = manager.create_intercepting_block_cache(InMemoryMode::Compressed);
        let chunk_id = ChunkId::generate();

        let rows = vec![VersionedRow {
            key: Key::from([Value::Int64(1)]),
            values: vec![],
            write_timestamps: vec![Timestamp(100)],
            delete_timestamps: vec![],
        }];
        let (block, _) = encode_block(&rows).unwrap();
        cache.put_block(chunk_id, 0, BlockType::Compressed, block.clone());

        let preloaded = manager.evict_intercepted(chunk_id).unwrap();
        assert_eq!(preloaded.mode, InMemoryMode::Compressed);
        assert_eq!(preloaded.blocks, vec![block]);
        assert_eq!(manager.memory.used(), 0);

        // A second eviction finds nothing.
        assert!(manager.evict_intercepted(chunk_id).is_none());
    }

    #[tokio::test]
    async fn interception_with_holes_is_discarded() {
        let manager = manager();
        let cache = manager.create_intercepting_block_cache(InMemoryMode::Compressed);
        let chunk_id = ChunkId::generate();

        cache.put_block(chunk_id, 1, BlockType::Compressed, Bytes::from_static(b"x"));
        assert!(manager.evict_intercepted(chunk_id).is_none());
    }

    #[test]
    fn memory_pressure_drops_interception() {
        let manager = InMemoryManager::new(
            StorePreloaderConfig::default(),
            Arc::new(MemoryTracker::new(0)),
        );
        let cache = manager.create_intercepting_block_cache(InMemoryMode::Compressed);
        let chunk_id = ChunkId::generate();
        cache.put_block(chunk_id, 0, BlockType::Compressed, Bytes::from_static(b"x"));
        assert!(manager.evict_intercepted(chunk_id).is_none());
    }
}
