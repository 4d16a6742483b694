//! In-memory doubles for the tablet cell's external collaborators, plus
//! a harness wiring a cell together for end-to-end tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use marl_client::{wire::WireWriter, ChunkId, TabletId, TransactionId, FINAL_SIGNATURE};
use marl_data::{
    ColumnSchema, Key, KeyBound, TableSchema, Timestamp, UnversionedRow, Value, ValueType,
};
use marl_errors::{MarlError, MarlResult};
use marl_tablet::config::{StorePreloaderConfig, TableMountConfig, TabletNodeConfig};
use marl_tablet::in_memory::{InMemoryManager, MemoryTracker};
use marl_tablet::interfaces::{
    ChunkReader, ChunkStorage, ChunkWriter, MasterClient, MasterTransaction, Mutation,
    MutationLog, SamplesFetcher, TimestampProvider, TransactionSupervisor,
};
use marl_tablet::store::ChunkMeta;
use marl_tablet::store_manager::LockMode;
use marl_tablet::tablet_manager::TabletCell;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// A mutation log that applies every committed mutation synchronously to
/// the cell, like a single-replica consensus group.
pub struct MemoryMutationLog {
    cell: OnceCell<std::sync::Weak<TabletCell>>,
    leader: AtomicBool,
    recovery: AtomicBool,
    committed: Mutex<Vec<Mutation>>,
}

impl MemoryMutationLog {
    pub fn new() -> Arc<MemoryMutationLog> {
        Arc::new(MemoryMutationLog {
            cell: OnceCell::new(),
            leader: AtomicBool::new(true),
            recovery: AtomicBool::new(false),
            committed: Mutex::new(Vec::new()),
        })
    }

    /// Binds the log to its cell; call once after the cell is built.
    pub fn bind(&self, cell: &Arc<TabletCell>) {
        self.cell
            .set(Arc::downgrade(cell))
            .ok()
            .expect("log already bound");
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Mutations committed so far, for assertions.
    pub fn committed(&self) -> Vec<Mutation> {
        self.committed.lock().clone()
    }
}

#[async_trait]
impl MutationLog for MemoryMutationLog {
    async fn commit(&self, mutation: Mutation) -> MarlResult<()> {
        let cell = self
            .cell
            .get()
            .and_then(std::sync::Weak::upgrade)
            .ok_or_else(|| marl_errors::internal_err!("mutation log is not bound"))?;
        self.committed.lock().push(mutation.clone());
        cell.apply_mutation(mutation).await
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn is_recovery(&self) -> bool {
        self.recovery.load(Ordering::SeqCst)
    }
}

/// Chunk storage backed by a hash map.
#[derive(Default)]
pub struct MemoryChunkStorage {
    chunks: Arc<Mutex<HashMap<ChunkId, StoredChunk>>>,
}

#[derive(Clone)]
struct StoredChunk {
    meta: ChunkMeta,
    blocks: Vec<Bytes>,
}

impl MemoryChunkStorage {
    pub fn new() -> Arc<MemoryChunkStorage> {
        Arc::new(MemoryChunkStorage::default())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }
}

#[async_trait]
impl ChunkStorage for MemoryChunkStorage {
    async fn open_reader(&self, chunk_id: ChunkId) -> MarlResult<Arc<dyn ChunkReader>> {
        if !self.chunks.lock().contains_key(&chunk_id) {
            return Err(MarlError::ChunkUnavailable(chunk_id.to_string()));
        }
        Ok(Arc::new(MemoryChunkReader {
            chunks: Arc::clone(&self.chunks),
            chunk_id,
        }))
    }

    async fn create_writer(
        &self,
        _transaction_id: TransactionId,
    ) -> MarlResult<Box<dyn ChunkWriter>> {
        Ok(Box::new(MemoryChunkWriter {
            chunks: Arc::clone(&self.chunks),
            chunk_id: ChunkId::generate(),
            blocks: Vec::new(),
        }))
    }
}

pub struct MemoryChunkReader {
    chunks: Arc<Mutex<HashMap<ChunkId, StoredChunk>>>,
    chunk_id: ChunkId,
}

#[async_trait]
impl ChunkReader for MemoryChunkReader {
    fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    async fn read_meta(&self) -> MarlResult<ChunkMeta> {
        let chunks = self.chunks.lock();
        chunks
            .get(&self.chunk_id)
            .map(|chunk| chunk.meta.clone())
            .ok_or_else(|| MarlError::ChunkUnavailable(self.chunk_id.to_string()))
    }

    async fn read_blocks(&self, first_block: usize, block_count: usize) -> MarlResult<Vec<Bytes>> {
        let chunks = self.chunks.lock();
        let chunk = chunks
            .get(&self.chunk_id)
            .ok_or_else(|| MarlError::ChunkUnavailable(self.chunk_id.to_string()))?;
        Ok(chunk
            .blocks
            .iter()
            .skip(first_block)
            .take(block_count)
            .cloned()
            .collect())
    }
}

pub struct MemoryChunkWriter {
    chunks: Arc<Mutex<HashMap<ChunkId, StoredChunk>>>,
    chunk_id: ChunkId,
    blocks: Vec<Bytes>,
}

#[async_trait]
impl ChunkWriter for MemoryChunkWriter {
    fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    async fn write_block(&mut self, block: Bytes) -> MarlResult<()> {
        self.blocks.push(block);
        Ok(())
    }

    async fn close(self: Box<Self>, meta: ChunkMeta) -> MarlResult<()> {
        self.chunks.lock().insert(
            self.chunk_id,
            StoredChunk {
                meta,
                blocks: self.blocks,
            },
        );
        Ok(())
    }
}

/// A master whose transactions are pure bookkeeping.
pub struct MemoryMaster;

impl MemoryMaster {
    pub fn new() -> Arc<MemoryMaster> {
        Arc::new(MemoryMaster)
    }
}

pub struct MemoryMasterTransaction {
    id: TransactionId,
}

#[async_trait]
impl MasterTransaction for MemoryMasterTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    async fn commit(self: Box<Self>) -> MarlResult<()> {
        Ok(())
    }
}

#[async_trait]
impl MasterClient for MemoryMaster {
    async fn start_transaction(&self, _title: String) -> MarlResult<Box<dyn MasterTransaction>> {
        Ok(Box::new(MemoryMasterTransaction {
            id: TransactionId::generate(),
        }))
    }
}

/// A manually advanced timestamp provider.
pub struct ManualTimestamps {
    latest: AtomicU64,
}

impl ManualTimestamps {
    pub fn new(start: u64) -> Arc<ManualTimestamps> {
        Arc::new(ManualTimestamps {
            latest: AtomicU64::new(start),
        })
    }

    pub fn advance_to(&self, timestamp: u64) {
        self.latest.fetch_max(timestamp, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimestampProvider for ManualTimestamps {
    async fn generate(&self) -> MarlResult<Timestamp> {
        Ok(Timestamp(self.latest.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn latest(&self) -> Timestamp {
        Timestamp(self.latest.load(Ordering::SeqCst))
    }
}

/// A supervisor that drops abort requests; tests abort through the cell
/// directly.
pub struct NullSupervisor;

impl NullSupervisor {
    pub fn new() -> Arc<NullSupervisor> {
        Arc::new(NullSupervisor)
    }
}

#[async_trait]
impl TransactionSupervisor for NullSupervisor {
    async fn abort_transaction(&self, _transaction_id: TransactionId) -> MarlResult<()> {
        Ok(())
    }
}

/// A samples fetcher returning a pre-seeded key list.
pub struct FixedSamples {
    pub samples: Vec<Key>,
}

impl FixedSamples {
    pub fn evenly_spaced_int64(count: i64) -> Arc<FixedSamples> {
        Arc::new(FixedSamples {
            samples: (1..=count).map(|value| Key::from([Value::Int64(value)])).collect(),
        })
    }
}

#[async_trait]
impl SamplesFetcher for FixedSamples {
    async fn fetch_samples(
        &self,
        _chunk_ids: Vec<ChunkId>,
        lower: Key,
        upper: Key,
        max_sample_count: usize,
    ) -> MarlResult<Vec<Key>> {
        Ok(self
            .samples
            .iter()
            .filter(|sample| **sample >= lower && (upper.is_empty() || **sample < upper))
            .take(max_sample_count)
            .cloned()
            .collect())
    }
}

/// A fully wired cell plus handles to its doubles.
pub struct TestCell {
    pub cell: Arc<TabletCell>,
    pub log: Arc<MemoryMutationLog>,
    pub storage: Arc<MemoryChunkStorage>,
    pub timestamps: Arc<ManualTimestamps>,
    pub tablet_id: TabletId,
}

impl TestCell {
    /// Builds a cell and mounts one sorted `{k: int64 key, v: int64}`
    /// tablet with the given mount config.
    pub async fn sorted(config: TableMountConfig) -> TestCell {
        let schema = Arc::new(
            TableSchema::new(vec![
                ColumnSchema::key("k", ValueType::Int64),
                ColumnSchema::value("v", ValueType::Int64),
            ])
            .unwrap(),
        );
        Self::with_schema(schema, config, 0).await
    }

    /// Builds a cell and mounts one ordered `{payload: string}` tablet.
    pub async fn ordered(tablet_index: u32) -> TestCell {
        let schema = Arc::new(
            TableSchema::new(vec![ColumnSchema::value("payload", ValueType::String)]).unwrap(),
        );
        Self::with_schema(schema, TableMountConfig::default(), tablet_index).await
    }

    async fn with_schema(
        schema: Arc<TableSchema>,
        config: TableMountConfig,
        tablet_index: u32,
    ) -> TestCell {
        let log = MemoryMutationLog::new();
        let storage = MemoryChunkStorage::new();
        let timestamps = ManualTimestamps::new(1);
        let in_memory = InMemoryManager::new(
            StorePreloaderConfig::default(),
            Arc::new(MemoryTracker::new(1 << 30)),
        );

        let cell = TabletCell::new(
            Arc::new(TabletNodeConfig {
                slots: 1,
                memory_limit: 1 << 30,
                forced_rotation_memory_ratio: 0.8,
                ..TabletNodeConfig::default()
            }),
            log.clone(),
            MemoryMaster::new(),
            storage.clone(),
            timestamps.clone(),
            in_memory,
        );
        log.bind(&cell);

        let tablet_id = TabletId::generate();
        cell.mount_tablet(
            tablet_id,
            schema,
            Arc::new(config),
            1,
            Key::empty(),
            KeyBound::Unbounded,
            tablet_index,
            Vec::new(),
        )
        .await
        .unwrap();

        TestCell {
            cell,
            log,
            storage,
            timestamps,
            tablet_id,
        }
    }

    /// Writes rows in a transaction; the single batch carries the final
    /// signature.
    pub async fn write_rows(
        &self,
        transaction_id: TransactionId,
        start_timestamp: u64,
        rows: &[(i64, i64)],
    ) -> MarlResult<()> {
        self.timestamps.advance_to(start_timestamp);
        let mut writer = WireWriter::new();
        for (k, v) in rows {
            writer.write_row(&UnversionedRow::from_pairs([
                (0, Value::Int64(*k)),
                (1, Value::Int64(*v)),
            ]));
        }
        self.cell
            .write(
                self.tablet_id,
                transaction_id,
                Timestamp(start_timestamp),
                Duration::from_secs(60),
                FINAL_SIGNATURE,
                LockMode::Row,
                writer.finish(),
            )
            .await
    }

    /// Prepares and commits a transaction at the given timestamps.
    pub async fn commit(
        &self,
        transaction_id: TransactionId,
        prepare_timestamp: u64,
        commit_timestamp: u64,
    ) -> MarlResult<()> {
        self.timestamps.advance_to(prepare_timestamp);
        self.cell
            .prepare_transaction_commit(transaction_id, true, Timestamp(prepare_timestamp))
            .await?;
        self.timestamps.advance_to(commit_timestamp);
        self.cell
            .commit_transaction(transaction_id, Timestamp(commit_timestamp))
            .await
    }

    /// Reads the whole tablet at a timestamp, returning `(k, v)` pairs.
    pub async fn read_all(&self, timestamp: u64) -> MarlResult<Vec<(i64, i64)>> {
        let rows = self
            .cell
            .read_range(self.tablet_id, Key::empty(), None, Timestamp(timestamp), None)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let k = match row.get(0) {
                    Some(Value::Int64(k)) => *k,
                    other => panic!("bad key {other:?}"),
                };
                let v = match row.get(1) {
                    Some(Value::Int64(v)) => *v,
                    _ => i64::MIN,
                };
                (k, v)
            })
            .collect())
    }

    /// Rotates the active store through the replicated log.
    pub async fn rotate(&self) -> MarlResult<()> {
        self.cell.schedule_store_rotation(self.tablet_id).await
    }

    /// Polls until the tablet's store set satisfies `predicate` or the
    /// timeout passes.
    pub async fn wait_for_stores<F>(&self, predicate: F) -> bool
    where
        F: Fn(usize, usize) -> bool,
    {
        for _ in 0..200 {
            let (dynamic, chunk) = {
                let state = self.cell.lock().await;
                let tablet = state.tablet(self.tablet_id).unwrap();
                let dynamic = tablet.stores().values().filter(|store| store.is_dynamic()).count();
                let chunk = tablet.stores().values().filter(|store| store.is_chunk()).count();
                (dynamic, chunk)
            };
            if predicate(dynamic, chunk) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

/// A fresh transaction id.
pub fn tx() -> TransactionId {
    TransactionId::generate()
}
