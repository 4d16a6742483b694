//! The store flusher: turns passive dynamic stores into chunk stores.
//!
//! A periodic scan visits every tablet, scheduling rotations (overflow
//! or periodic), dispatching a flush task per flushable passive store
//! under a concurrency cap, and — when the node's dynamic memory runs
//! hot — forcing rotations of the heaviest tablets until the pressure
//! subsides.

use std::sync::Arc;
use std::time::Instant;

use marl_client::TabletId;
use marl_errors::{ErrorChain, MarlResult};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{InMemoryMode, StoreFlusherConfig, TableMountConfig};
use crate::interfaces::{Mutation, Throttler};
use crate::store::{ChunkWriterPipeline, Store};
use crate::store_manager;
use crate::tablet_manager::TabletCell;
use crate::tablet::TabletState;

const MAX_ROWS_PER_FLUSH_READ: usize = 1024;

struct FlushCandidate {
    tablet_id: TabletId,
    mount_revision: u64,
    store: Store,
    mount_config: Arc<TableMountConfig>,
}

struct ForcedRotationCandidate {
    tablet_id: TabletId,
    memory_usage: u64,
}

/// The flusher of one node.
pub struct StoreFlusher {
    cell: Arc<TabletCell>,
    config: StoreFlusherConfig,
    semaphore: Arc<Semaphore>,
    flush_out_throttler: Arc<dyn Throttler>,
}

impl StoreFlusher {
    /// Creates the flusher.
    pub fn new(
        cell: Arc<TabletCell>,
        config: StoreFlusherConfig,
        flush_out_throttler: Arc<dyn Throttler>,
    ) -> Arc<StoreFlusher> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_flushes));
        Arc::new(StoreFlusher {
            cell,
            config,
            semaphore,
            flush_out_throttler,
        })
    }

    /// One scan pass over every tablet of the cell.
    pub async fn scan(self: &Arc<Self>) -> MarlResult<()> {
        if !self.cell.mutation_log().is_leader() {
            return Ok(());
        }

        let mut rotations: Vec<TabletId> = Vec::new();
        let mut candidates: Vec<FlushCandidate> = Vec::new();
        let mut forced: Vec<ForcedRotationCandidate> = Vec::new();
        let mut total_dynamic_memory = 0u64;
        let mut passive_dynamic_memory = 0u64;

        {
            let mut state = self.cell.lock().await;
            let now = Instant::now();
            for tablet in state.tablets.values_mut() {
                let unmounting = tablet.state() == TabletState::UnmountFlushing;
                if tablet.state() != TabletState::Mounted && !unmounting {
                    continue;
                }
                let config = Arc::clone(tablet.config());

                if unmounting {
                    // No rotations while unmounting; only drain the
                    // passive stores.
                } else if store_manager::is_overflow_rotation_needed(tablet, &config) {
                    debug!(tablet_id = %tablet.id(), "scheduling store rotation due to overflow");
                    rotations.push(tablet.id());
                } else if store_manager::is_periodic_rotation_needed(tablet, &config, now) {
                    info!(tablet_id = %tablet.id(), "scheduling periodic store rotation");
                    rotations.push(tablet.id());
                }

                let mut tablet_dynamic_memory = 0u64;
                let stores: Vec<Store> = tablet.stores().values().cloned().collect();
                for store in stores {
                    if !store.is_dynamic() {
                        continue;
                    }
                    tablet_dynamic_memory += store.uncompressed_data_size();
                    if store.state() == crate::store::StoreState::PassiveDynamic {
                        passive_dynamic_memory += store.uncompressed_data_size();
                    }
                    if store_manager::is_store_flushable(tablet, &store) {
                        store_manager::begin_store_flush(&store)?;
                        candidates.push(FlushCandidate {
                            tablet_id: tablet.id(),
                            mount_revision: tablet.mount_revision(),
                            store,
                            mount_config: Arc::clone(&config),
                        });
                    }
                }
                total_dynamic_memory += tablet_dynamic_memory;

                let node_config = Arc::clone(self.cell.config());
                if !unmounting
                    && store_manager::is_forced_rotation_possible(tablet, &node_config.tablet_manager)
                    && !tablet.manager.rotation_scheduled
                {
                    let usage = tablet
                        .active_store()
                        .map(|store| store.uncompressed_data_size())
                        .unwrap_or(0);
                    if usage >= self.config.min_forced_flush_data_size {
                        forced.push(ForcedRotationCandidate {
                            tablet_id: tablet.id(),
                            memory_usage: usage,
                        });
                    }
                }
            }
        }

        // Memory pressure: force rotations of the heaviest tablets until
        // the active (non-passive) usage fits the budget again.
        let node_config = self.cell.config();
        let threshold = (node_config.memory_limit as f64
            * node_config.forced_rotation_memory_ratio) as u64;
        if threshold > 0 {
            forced.sort_by_key(|candidate| candidate.memory_usage);
            while total_dynamic_memory.saturating_sub(passive_dynamic_memory) > threshold {
                let Some(candidate) = forced.pop() else {
                    break;
                };
                info!(
                    tablet_id = %candidate.tablet_id,
                    tablet_memory_usage = candidate.memory_usage,
                    memory_limit = node_config.memory_limit,
                    "scheduling store rotation due to memory pressure"
                );
                passive_dynamic_memory += candidate.memory_usage;
                rotations.push(candidate.tablet_id);
            }
        }

        for tablet_id in rotations {
            if let Err(error) = self.cell.schedule_store_rotation(tablet_id).await {
                warn!(tablet_id = %tablet_id, %error, "store rotation failed to schedule");
            }
        }

        for candidate in candidates {
            let permit = Arc::clone(&self.semaphore).acquire_owned().await.expect("never closed");
            let flusher = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                flusher.flush_store(candidate).await;
            });
        }
        Ok(())
    }

    async fn flush_store(&self, candidate: FlushCandidate) {
        let store_id = candidate.store.id();
        info!(
            tablet_id = %candidate.tablet_id,
            store_id = %store_id,
            "store flush started"
        );
        match self.do_flush_store(&candidate).await {
            Ok(()) => {
                metrics::counter!("marl_store_flushes_completed").increment(1);
            }
            Err(error) => {
                metrics::counter!("marl_store_flushes_failed").increment(1);
                warn!(
                    tablet_id = %candidate.tablet_id,
                    store_id = %store_id,
                    error = %ErrorChain::new(error),
                    "error flushing tablet store, backing off"
                );
                store_manager::backoff_store_flush(
                    &candidate.store,
                    self.cell.config().tablet_manager.error_backoff,
                );
            }
        }
    }

    async fn do_flush_store(&self, candidate: &FlushCandidate) -> MarlResult<()> {
        let store_id = candidate.store.id();

        let transaction = self
            .cell
            .master()
            .start_transaction(format!(
                "Flushing store {store_id}, tablet {}",
                candidate.tablet_id
            ))
            .await?;
        debug!(
            transaction_id = %transaction.id(),
            "store flush transaction created"
        );

        let in_memory_mode = candidate.mount_config.in_memory_mode;
        let block_cache: Option<Arc<dyn crate::interfaces::BlockCache>> =
            (in_memory_mode != InMemoryMode::None).then(|| {
                let cache: Arc<dyn crate::interfaces::BlockCache> = self
                    .cell
                    .in_memory()
                    .create_intercepting_block_cache(in_memory_mode);
                cache
            });

        let writer = self
            .cell
            .storage()
            .create_writer(transaction.id())
            .await?;

        let descriptor = match &candidate.store {
            Store::SortedDynamic(store) => {
                let mut pipeline = ChunkWriterPipeline::sorted(
                    writer,
                    block_cache,
                    Arc::clone(&self.flush_out_throttler),
                    true,
                );
                let mut resume_after = None;
                loop {
                    let rows = store.read_flush_range(resume_after.as_ref(), MAX_ROWS_PER_FLUSH_READ);
                    match rows.last() {
                        Some(last) => resume_after = Some(last.key.clone()),
                        None => break,
                    }
                    pipeline.write_versioned(&rows).await?;
                }
                pipeline.finish().await?
            }
            Store::OrderedDynamic(store) => {
                let mut pipeline = ChunkWriterPipeline::ordered(
                    writer,
                    block_cache,
                    Arc::clone(&self.flush_out_throttler),
                    store.starting_row_index(),
                );
                let rows = store.snapshot_rows();
                let range = (store.min_timestamp(), store.max_timestamp());
                for chunk in rows.chunks(MAX_ROWS_PER_FLUSH_READ) {
                    pipeline.write_unversioned(chunk, range).await?;
                }
                pipeline.finish().await?
            }
            _ => marl_errors::internal!("flushing a non-dynamic store {store_id}"),
        };

        transaction.commit().await?;

        let stores_to_add: Vec<_> = descriptor.into_iter().collect();
        let chunk_ids: Vec<String> = stores_to_add
            .iter()
            .map(|descriptor| descriptor.store_id.to_string())
            .collect();

        store_manager::end_store_flush(&candidate.store);

        self.cell
            .mutation_log()
            .commit(Mutation::UpdateTabletStores {
                tablet_id: candidate.tablet_id,
                mount_revision: candidate.mount_revision,
                stores_to_add,
                stores_to_remove: vec![store_id],
            })
            .await?;

        info!(
            tablet_id = %candidate.tablet_id,
            store_id = %store_id,
            chunk_ids = ?chunk_ids,
            "store flush completed"
        );
        Ok(())
    }
}
