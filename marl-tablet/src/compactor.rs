//! The store compactor and Eden partitioner.
//!
//! Both exist to bound the overlapping store count: a compaction
//! rewrites several chunk stores of one partition as one, lowering the
//! OSC whenever that partition contributes to it; a partitioning takes
//! Eden stores and splits their rows across the partitions, always
//! lowering the OSC by one less than the number of stores consumed.
//!
//! Each scan picks candidates, turns them into tasks carrying a *slack*
//! (stores left until the OSC limit) and an *effect* (guaranteed OSC
//! drop), and schedules tasks from a heap ordered by
//! `(slack, −effect, −store_count, random)` under two independent
//! concurrency caps.

use std::sync::Arc;
use std::time::Instant;

use marl_client::{PartitionId, StoreId, TabletId};
use marl_data::{Key, KeyBound, Timestamp, MAX_TIMESTAMP, MIN_TIMESTAMP};
use marl_errors::{ErrorChain, MarlResult};
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{StoreCompactorConfig, TableMountConfig};
use crate::interfaces::{BlockCache, Mutation, Throttler};
use crate::reader::VersionedRangeReader;
use crate::store::{ChunkWriterPipeline, SortedChunkStore, Store};
use crate::store_manager;
use crate::tablet::{PartitionState, Tablet, TabletState};
use crate::tablet_manager::TabletCell;
use crate::config::InMemoryMode;

const MAX_ROWS_PER_READ: usize = 1024;

/// One candidate compaction or partitioning.
#[derive(Debug)]
struct Task {
    tablet_id: TabletId,
    partition_id: PartitionId,
    store_ids: Vec<StoreId>,

    /// Stores left until the tablet hits its overlapping store limit;
    /// zero means the tablet is critical.
    slack: u64,
    /// Guaranteed lower bound on the OSC drop.
    effect: u64,
    random: u64,
}

impl Task {
    fn order_key(&self) -> (u64, i64, i64, u64) {
        (
            self.slack,
            -(self.effect as i64),
            -(self.store_ids.len() as i64),
            self.random,
        )
    }
}

/// The compactor of one node.
pub struct StoreCompactor {
    cell: Arc<TabletCell>,
    config: StoreCompactorConfig,
    partitioning_semaphore: Arc<Semaphore>,
    compaction_semaphore: Arc<Semaphore>,
    compaction_in_throttler: Arc<dyn Throttler>,
    compaction_out_throttler: Arc<dyn Throttler>,
}

impl StoreCompactor {
    /// Creates the compactor.
    pub fn new(
        cell: Arc<TabletCell>,
        config: StoreCompactorConfig,
        compaction_in_throttler: Arc<dyn Throttler>,
        compaction_out_throttler: Arc<dyn Throttler>,
    ) -> Arc<StoreCompactor> {
        let partitioning_semaphore = Arc::new(Semaphore::new(config.max_concurrent_partitionings));
        let compaction_semaphore = Arc::new(Semaphore::new(config.max_concurrent_compactions));
        Arc::new(StoreCompactor {
            cell,
            config,
            partitioning_semaphore,
            compaction_semaphore,
            compaction_in_throttler,
            compaction_out_throttler,
        })
    }

    /// One scan pass: pick candidates across all tablets, then schedule
    /// as many as the semaphores admit.
    pub async fn scan(self: &Arc<Self>) -> MarlResult<()> {
        if !self.cell.mutation_log().is_leader() {
            return Ok(());
        }

        let scan_partitionings = self.partitioning_semaphore.available_permits() > 0;
        let scan_compactions = self.compaction_semaphore.available_permits() > 0;
        if !scan_partitionings && !scan_compactions {
            return Ok(());
        }

        let mut partitionings: Vec<Task> = Vec::new();
        let mut compactions: Vec<Task> = Vec::new();
        {
            let state = self.cell.lock().await;
            for tablet in state.tablets.values() {
                if tablet.state() != TabletState::Mounted || !tablet.is_sorted() {
                    continue;
                }
                if !tablet.config().enable_compaction_and_partitioning {
                    continue;
                }
                if scan_partitionings {
                    if let Some(task) = scan_eden_for_partitioning(tablet) {
                        partitionings.push(task);
                    }
                }
                if scan_compactions {
                    compactions.extend(scan_tablet_for_compactions(tablet));
                }
            }
        }

        metrics::gauge!("marl_feasible_partitionings").set(partitionings.len() as f64);
        metrics::gauge!("marl_feasible_compactions").set(compactions.len() as f64);

        partitionings.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        compactions.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        for task in partitionings {
            let Ok(permit) = Arc::clone(&self.partitioning_semaphore).try_acquire_owned() else {
                break;
            };
            metrics::counter!("marl_scheduled_partitionings").increment(1);
            let compactor = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                compactor.partition_eden(task).await;
            });
        }
        for task in compactions {
            let Ok(permit) = Arc::clone(&self.compaction_semaphore).try_acquire_owned() else {
                break;
            };
            metrics::counter!("marl_scheduled_compactions").increment(1);
            let compactor = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                compactor.compact_partition(task).await;
            });
        }
        Ok(())
    }

    /// Runs one Eden partitioning task to completion.
    async fn partition_eden(&self, task: Task) {
        if let Err(error) = self.do_partition_eden(&task).await {
            warn!(
                tablet_id = %task.tablet_id,
                error = %ErrorChain::new(error),
                "error partitioning Eden, backing off"
            );
        }
    }

    async fn do_partition_eden(&self, task: &Task) -> MarlResult<()> {
        // Claim the Eden and the stores under the lock; bail silently if
        // anything moved since the scan.
        let (stores, pivot_keys, tablet_pivot, next_tablet_pivot, mount_revision, mount_config) = {
            let mut state = self.cell.lock().await;
            let Ok(tablet) = state.tablet_mut(task.tablet_id) else {
                debug!("tablet is missing, aborting partitioning");
                return Ok(());
            };
            let Some(stores) = claim_stores(tablet, &task.store_ids) else {
                debug!("Eden store is missing or busy, aborting partitioning");
                return Ok(());
            };
            let pivot_keys: Vec<Key> = tablet
                .partitions()
                .iter()
                .map(|partition| partition.pivot_key().clone())
                .collect();
            let eden = tablet.eden_mut();
            if eden.id() != task.partition_id {
                debug!("Eden is missing, aborting partitioning");
                return Ok(());
            }
            eden.checked_set_state(PartitionState::Normal, PartitionState::Partitioning)?;
            eden.compaction_time = Some(Instant::now());
            for store in &stores {
                store_manager::begin_store_compaction(&Store::SortedChunk(Arc::clone(store)))?;
            }
            (
                stores,
                pivot_keys,
                tablet.pivot_key().clone(),
                tablet.next_pivot_key().clone(),
                tablet.mount_revision(),
                Arc::clone(tablet.config()),
            )
        };

        let result = self
            .run_partitioning(
                task,
                &stores,
                &pivot_keys,
                tablet_pivot,
                next_tablet_pivot,
                mount_revision,
                &mount_config,
            )
            .await;

        let mut state = self.cell.lock().await;
        if let Ok(tablet) = state.tablet_mut(task.tablet_id) {
            for store in &stores {
                let store = Store::SortedChunk(Arc::clone(store));
                match &result {
                    Ok(()) => store_manager::end_store_compaction(&store),
                    Err(_) => store_manager::backoff_store_compaction(
                        &store,
                        self.cell.config().tablet_manager.error_backoff,
                    ),
                }
            }
            let _ = tablet
                .eden_mut()
                .checked_set_state(PartitionState::Partitioning, PartitionState::Normal);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_partitioning(
        &self,
        task: &Task,
        stores: &[Arc<SortedChunkStore>],
        pivot_keys: &[Key],
        tablet_pivot: Key,
        next_tablet_pivot: KeyBound,
        mount_revision: u64,
        mount_config: &TableMountConfig,
    ) -> MarlResult<()> {
        let data_size: u64 = stores
            .iter()
            .map(|store| store.meta().compressed_data_size)
            .sum();
        let current_timestamp = self.cell.timestamps().generate().await?;
        info!(
            tablet_id = %task.tablet_id,
            slack = task.slack,
            effect = task.effect,
            partition_count = pivot_keys.len(),
            data_size,
            chunk_count = stores.len(),
            %current_timestamp,
            "Eden partitioning started"
        );

        let transaction = self
            .cell
            .master()
            .start_transaction(format!("Eden partitioning: tablet {}", task.tablet_id))
            .await?;

        // No major compaction during Eden partitioning: every version is
        // preserved.
        let mut reader = VersionedRangeReader::new(
            stores
                .iter()
                .map(|store| Store::SortedChunk(Arc::clone(store)))
                .collect(),
            tablet_pivot,
            match next_tablet_pivot {
                KeyBound::Unbounded => None,
                KeyBound::Key(key) => Some(key),
            },
            mount_config.retention.clone(),
            current_timestamp,
            MIN_TIMESTAMP,
        );

        let block_cache = self.block_cache(mount_config);
        let mut descriptors = Vec::new();
        let mut current_writer: Option<ChunkWriterPipeline> = None;
        let mut partition_index = 0usize;
        let mut read_rows = 0u64;

        let mut pending = reader.next_batch(MAX_ROWS_PER_READ).await?;
        while let Some(batch) = pending {
            for row in &batch {
                read_rows += 1;
                // Advance to the partition owning this key.
                while partition_index + 1 < pivot_keys.len()
                    && &pivot_keys[partition_index + 1] <= &row.key
                {
                    if let Some(writer) = current_writer.take() {
                        descriptors.extend(writer.finish().await?);
                    }
                    partition_index += 1;
                }
                if current_writer.is_none() {
                    debug!(partition_index, "started writing partition");
                    let chunk_writer =
                        self.cell.storage().create_writer(transaction.id()).await?;
                    current_writer = Some(ChunkWriterPipeline::sorted(
                        chunk_writer,
                        block_cache.clone(),
                        Arc::clone(&self.compaction_out_throttler),
                        false,
                    ));
                }
                let writer = current_writer.as_mut().expect("installed above");
                self.compaction_in_throttler
                    .throttle(row.key.data_weight() as u64)
                    .await?;
                writer.write_versioned(std::slice::from_ref(row)).await?;
            }
            pending = reader.next_batch(MAX_ROWS_PER_READ).await?;
        }
        if let Some(writer) = current_writer.take() {
            descriptors.extend(writer.finish().await?);
        }

        transaction.commit().await?;

        info!(
            tablet_id = %task.tablet_id,
            row_count = read_rows,
            stores_to_add = descriptors.len(),
            stores_to_remove = task.store_ids.len(),
            "Eden partitioning completed"
        );

        self.cell
            .mutation_log()
            .commit(Mutation::UpdateTabletStores {
                tablet_id: task.tablet_id,
                mount_revision,
                stores_to_add: descriptors,
                stores_to_remove: task.store_ids.clone(),
            })
            .await
    }

    /// Runs one compaction task to completion.
    async fn compact_partition(&self, task: Task) {
        if let Err(error) = self.do_compact_partition(&task).await {
            warn!(
                tablet_id = %task.tablet_id,
                error = %ErrorChain::new(error),
                "error compacting partition, backing off"
            );
        }
    }

    async fn do_compact_partition(&self, task: &Task) -> MarlResult<()> {
        let (stores, lower, upper, major_timestamp, mount_revision, mount_config, is_eden) = {
            let mut state = self.cell.lock().await;
            let Ok(tablet) = state.tablet_mut(task.tablet_id) else {
                debug!("tablet is missing, aborting compaction");
                return Ok(());
            };
            let Some(stores) = claim_stores(tablet, &task.store_ids) else {
                debug!("partition store is missing or busy, aborting compaction");
                return Ok(());
            };
            let major_timestamp = compute_major_timestamp(tablet, &task.store_ids);

            let is_eden = tablet.eden().id() == task.partition_id;
            let (lower, upper) = if is_eden {
                (
                    tablet.pivot_key().clone(),
                    tablet.next_pivot_key().clone(),
                )
            } else {
                let Some(partition) = tablet
                    .partitions()
                    .iter()
                    .position(|partition| partition.id() == task.partition_id)
                else {
                    debug!("partition is missing, aborting compaction");
                    return Ok(());
                };
                let partition = &tablet.partitions()[partition];
                (partition.pivot_key().clone(), partition.next_pivot_key().clone())
            };

            let partition = if is_eden {
                tablet.eden_mut()
            } else {
                tablet
                    .partitions_mut()
                    .iter_mut()
                    .find(|partition| partition.id() == task.partition_id)
                    .expect("position found above")
            };
            partition.checked_set_state(PartitionState::Normal, PartitionState::Compacting)?;
            partition.compaction_time = Some(Instant::now());
            for store in &stores {
                store_manager::begin_store_compaction(&Store::SortedChunk(Arc::clone(store)))?;
            }
            (
                stores,
                lower,
                upper,
                major_timestamp,
                tablet.mount_revision(),
                Arc::clone(tablet.config()),
                is_eden,
            )
        };

        let result = self
            .run_compaction(
                task,
                &stores,
                lower,
                upper,
                major_timestamp,
                mount_revision,
                &mount_config,
                is_eden,
            )
            .await;

        let mut state = self.cell.lock().await;
        if let Ok(tablet) = state.tablet_mut(task.tablet_id) {
            for store in &stores {
                let store = Store::SortedChunk(Arc::clone(store));
                match &result {
                    Ok(()) => store_manager::end_store_compaction(&store),
                    Err(_) => store_manager::backoff_store_compaction(
                        &store,
                        self.cell.config().tablet_manager.error_backoff,
                    ),
                }
            }
            let partition = if is_eden {
                Some(tablet.eden_mut())
            } else {
                tablet
                    .partitions_mut()
                    .iter_mut()
                    .find(|partition| partition.id() == task.partition_id)
            };
            if let Some(partition) = partition {
                let _ = partition
                    .checked_set_state(PartitionState::Compacting, PartitionState::Normal);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_compaction(
        &self,
        task: &Task,
        stores: &[Arc<SortedChunkStore>],
        lower: Key,
        upper: KeyBound,
        major_timestamp: Timestamp,
        mount_revision: u64,
        mount_config: &TableMountConfig,
        is_eden: bool,
    ) -> MarlResult<()> {
        let data_size: u64 = stores
            .iter()
            .map(|store| store.meta().compressed_data_size)
            .sum();
        let current_timestamp = self.cell.timestamps().generate().await?;

        // The major timestamp never exceeds the retained horizon: data
        // younger than min_data_ttl keeps its versions.
        let retained_timestamp = current_timestamp.saturating_sub(mount_config.retention.min_data_ttl);
        let major_timestamp = major_timestamp.min(retained_timestamp);

        info!(
            tablet_id = %task.tablet_id,
            slack = task.slack,
            effect = task.effect,
            data_size,
            chunk_count = stores.len(),
            %current_timestamp,
            %major_timestamp,
            "partition compaction started"
        );

        let transaction = self
            .cell
            .master()
            .start_transaction(format!("Partition compaction: tablet {}", task.tablet_id))
            .await?;

        let mut reader = VersionedRangeReader::new(
            stores
                .iter()
                .map(|store| Store::SortedChunk(Arc::clone(store)))
                .collect(),
            lower,
            match upper {
                KeyBound::Unbounded => None,
                KeyBound::Key(key) => Some(key),
            },
            mount_config.retention.clone(),
            current_timestamp,
            major_timestamp,
        );

        let chunk_writer = self.cell.storage().create_writer(transaction.id()).await?;
        let mut writer = ChunkWriterPipeline::sorted(
            chunk_writer,
            self.block_cache(mount_config),
            Arc::clone(&self.compaction_out_throttler),
            is_eden,
        );

        let mut read_rows = 0u64;
        while let Some(batch) = reader.next_batch(MAX_ROWS_PER_READ).await? {
            read_rows += batch.len() as u64;
            self.compaction_in_throttler
                .throttle(batch.len() as u64)
                .await?;
            writer.write_versioned(&batch).await?;
        }
        let descriptors: Vec<_> = writer.finish().await?.into_iter().collect();

        transaction.commit().await?;

        info!(
            tablet_id = %task.tablet_id,
            row_count = read_rows,
            stores_to_add = descriptors.len(),
            stores_to_remove = task.store_ids.len(),
            "partition compaction completed"
        );

        self.cell
            .mutation_log()
            .commit(Mutation::UpdateTabletStores {
                tablet_id: task.tablet_id,
                mount_revision,
                stores_to_add: descriptors,
                stores_to_remove: task.store_ids.clone(),
            })
            .await
    }

    fn block_cache(&self, mount_config: &TableMountConfig) -> Option<Arc<dyn BlockCache>> {
        (mount_config.in_memory_mode != InMemoryMode::None).then(|| {
            let cache: Arc<dyn BlockCache> = self
                .cell
                .in_memory()
                .create_intercepting_block_cache(mount_config.in_memory_mode);
            cache
        })
    }
}

fn claim_stores(tablet: &Tablet, store_ids: &[StoreId]) -> Option<Vec<Arc<SortedChunkStore>>> {
    let mut stores = Vec::with_capacity(store_ids.len());
    for store_id in store_ids {
        let store = tablet.find_store(*store_id)?;
        if !store_manager::is_store_compactable(store) {
            return None;
        }
        stores.push(Arc::clone(store.as_sorted_chunk()?));
    }
    Some(stores)
}

/// The minimum timestamp any *other* store of the partition or Eden may
/// still need: versions above it must be preserved verbatim.
fn compute_major_timestamp(tablet: &Tablet, excluded: &[StoreId]) -> Timestamp {
    let mut result = MAX_TIMESTAMP;
    for store in tablet.stores().values() {
        if excluded.contains(&store.id()) {
            continue;
        }
        result = result.min(store.min_timestamp());
    }
    result
}

fn scan_eden_for_partitioning(tablet: &Tablet) -> Option<Task> {
    if tablet.eden().state() != PartitionState::Normal {
        return None;
    }
    let store_ids = pick_stores_for_partitioning(tablet);
    if store_ids.is_empty() {
        return None;
    }

    let config = tablet.config();
    let limit = config.max_overlapping_store_count;
    let osc = tablet.overlapping_store_count();
    Some(Task {
        tablet_id: tablet.id(),
        partition_id: tablet.eden().id(),
        slack: limit.saturating_sub(osc) as u64,
        // Partitioning unconditionally improves the OSC given two or
        // more stores.
        effect: (store_ids.len() - 1) as u64,
        store_ids,
        random: rand::rng().random(),
    })
}

fn scan_tablet_for_compactions(tablet: &Tablet) -> Vec<Task> {
    let config = tablet.config();
    let limit = config.max_overlapping_store_count;
    let osc = tablet.overlapping_store_count();
    let eden_overlap = tablet.eden_overlap_store_count();

    let mut tasks = Vec::new();

    // Eden itself compacts like a partition.
    if tablet.eden().state() == PartitionState::Normal {
        let store_ids =
            pick_stores_for_compaction(tablet, tablet.eden().store_ids(), true, osc >= limit);
        if !store_ids.is_empty() {
            tasks.push(Task {
                tablet_id: tablet.id(),
                partition_id: tablet.eden().id(),
                slack: limit.saturating_sub(osc) as u64,
                effect: (store_ids.len() - 1) as u64,
                store_ids,
                random: rand::rng().random(),
            });
        }
    }

    let critical_partition_count = tablet.critical_partition_count();
    for partition in tablet.partitions() {
        if partition.state() != PartitionState::Normal {
            continue;
        }
        let partition_overlap = eden_overlap + partition.store_ids().len();
        let critical = partition_overlap >= limit;
        let store_ids = pick_stores_for_compaction(tablet, partition.store_ids(), false, critical);
        if store_ids.is_empty() {
            continue;
        }
        // For critical partitions this equals the distance to the OSC
        // limit; for unconstrained ones it includes extra slack.
        let slack = limit.saturating_sub(partition_overlap) as u64;
        let effect = if critical_partition_count == 1 && partition_overlap == osc {
            (store_ids.len() - 1) as u64
        } else {
            0
        };
        tasks.push(Task {
            tablet_id: tablet.id(),
            partition_id: partition.id(),
            slack,
            effect,
            store_ids,
            random: rand::rng().random(),
        });
    }
    tasks
}

fn compactable_chunk(tablet: &Tablet, store_id: StoreId) -> Option<Arc<SortedChunkStore>> {
    let store = tablet.find_store(store_id)?;
    if !store_manager::is_store_compactable(store) {
        return None;
    }
    store.as_sorted_chunk().cloned()
}

fn is_compaction_forced(config: &TableMountConfig, store: &SortedChunkStore) -> bool {
    match config.forced_compaction_revision {
        None => false,
        Some(revision) => store.id().0.counter() <= revision,
    }
}

fn is_periodic_compaction_needed(config: &TableMountConfig, store: &SortedChunkStore) -> bool {
    match config.auto_compaction_period {
        None => false,
        Some(period) => store.creation_time().elapsed() >= period,
    }
}

fn is_store_out_of_tablet_range(tablet: &Tablet, store: &SortedChunkStore) -> bool {
    let min_key = store.meta().min_key.clone().unwrap_or_default();
    let max_key = store.meta().max_key.clone().unwrap_or_default();
    if &min_key < tablet.pivot_key() {
        return true;
    }
    match tablet.next_pivot_key() {
        KeyBound::Unbounded => false,
        KeyBound::Key(next) => &max_key >= next,
    }
}

fn pick_stores_for_partitioning(tablet: &Tablet) -> Vec<StoreId> {
    let config = tablet.config();
    let mut candidates: Vec<Arc<SortedChunkStore>> = Vec::new();
    let mut forced: Vec<StoreId> = Vec::new();

    for store_id in tablet.eden().store_ids() {
        let Some(store) = compactable_chunk(tablet, *store_id) else {
            continue;
        };
        if is_compaction_forced(config, &store)
            || is_periodic_compaction_needed(config, &store)
            || is_store_out_of_tablet_range(tablet, &store)
        {
            forced.push(*store_id);
        }
        candidates.push(store);
        if forced.len() >= config.max_partitioning_store_count {
            break;
        }
    }
    if !forced.is_empty() {
        return forced;
    }

    // Sort by decreasing data size and take the best admissible prefix,
    // preferring to move more data per pass.
    candidates.sort_by_key(|store| std::cmp::Reverse(store.meta().compressed_data_size));
    let mut data_size_sum = 0u64;
    let mut best_store_count = None;
    for (index, store) in candidates.iter().enumerate() {
        data_size_sum += store.meta().compressed_data_size;
        let store_count = index + 1;
        if store_count >= config.min_partitioning_store_count
            && store_count <= config.max_partitioning_store_count
            && data_size_sum >= config.min_partitioning_data_size
            // The size cap is waived for a minimal store set.
            && (data_size_sum <= config.max_partitioning_data_size
                || store_count == config.min_partitioning_store_count)
        {
            best_store_count = Some(store_count);
        }
    }

    match best_store_count {
        Some(count) => candidates
            .iter()
            .take(count)
            .map(|store| store.id())
            .collect(),
        None => Vec::new(),
    }
}

fn pick_stores_for_compaction(
    tablet: &Tablet,
    store_ids: &std::collections::HashSet<StoreId>,
    is_eden: bool,
    critical: bool,
) -> Vec<StoreId> {
    let config = tablet.config();
    let mut candidates: Vec<Arc<SortedChunkStore>> = Vec::new();
    let mut forced: Vec<StoreId> = Vec::new();

    for store_id in store_ids {
        let Some(store) = compactable_chunk(tablet, *store_id) else {
            continue;
        };
        // Large Eden stores are the partitioner's business.
        if is_eden && store.meta().compressed_data_size >= config.min_partitioning_data_size {
            continue;
        }
        if is_compaction_forced(config, &store)
            || is_periodic_compaction_needed(config, &store)
            || is_store_out_of_tablet_range(tablet, &store)
        {
            forced.push(*store_id);
        }
        candidates.push(store);
        if forced.len() >= config.max_compaction_store_count {
            break;
        }
    }
    if !forced.is_empty() {
        return forced;
    }

    // Sort by increasing size and take the first window admitted by the
    // geometric-progression check (waived for critical partitions).
    candidates.sort_by_key(|store| store.meta().compressed_data_size);
    let mut start = 0usize;
    while start < candidates.len() {
        let mut data_size_sum = 0u64;
        let mut end = start;
        while end < candidates.len() {
            let store_count = end - start;
            if store_count > config.max_compaction_store_count {
                break;
            }
            let data_size = candidates[end].meta().compressed_data_size;
            if !critical
                && data_size > config.compaction_data_size_base
                && data_size_sum > 0
                && data_size as f64 > data_size_sum as f64 * config.compaction_data_size_ratio
            {
                break;
            }
            data_size_sum += data_size;
            end += 1;
        }

        let store_count = end - start;
        if store_count >= config.min_compaction_store_count {
            return candidates[start..end.min(start + config.max_compaction_store_count)]
                .iter()
                .map(|store| store.id())
                .collect();
        }
        start += 1;
    }
    Vec::new()
}
