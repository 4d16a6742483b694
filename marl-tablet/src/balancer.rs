//! The partition balancer: keeps partition geometry healthy by
//! splitting oversized partitions at sampled keys, merging undersized
//! neighbours, and refreshing sample keys on request.

use std::sync::Arc;
use std::time::Instant;

use marl_client::{ChunkId, PartitionId, TabletId};
use marl_data::Key;
use marl_errors::{ErrorChain, MarlResult};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use vec1::Vec1;

use crate::config::PartitionBalancerConfig;
use crate::interfaces::{Mutation, SamplesFetcher};
use crate::store::{Store, StoreState};
use crate::tablet::{PartitionState, Tablet, TabletState};
use crate::tablet_manager::TabletCell;

struct SplitCandidate {
    tablet_id: TabletId,
    partition_id: PartitionId,
    partition_index: usize,
    split_factor: usize,
}

struct MergeCandidate {
    tablet_id: TabletId,
    first_partition_index: usize,
    partition_count: usize,
}

struct SampleCandidate {
    tablet_id: TabletId,
    partition_id: PartitionId,
    partition_index: usize,
}

/// The balancer of one node.
pub struct PartitionBalancer {
    cell: Arc<TabletCell>,
    config: PartitionBalancerConfig,
    samples_fetcher: Arc<dyn SamplesFetcher>,
    sampling_semaphore: Arc<Semaphore>,
}

impl PartitionBalancer {
    /// Creates the balancer.
    pub fn new(
        cell: Arc<TabletCell>,
        config: PartitionBalancerConfig,
        samples_fetcher: Arc<dyn SamplesFetcher>,
    ) -> Arc<PartitionBalancer> {
        let sampling_semaphore = Arc::new(Semaphore::new(config.max_concurrent_samplings));
        Arc::new(PartitionBalancer {
            cell,
            config,
            samples_fetcher,
            sampling_semaphore,
        })
    }

    /// One scan pass over every partition of every tablet.
    pub async fn scan(self: &Arc<Self>) -> MarlResult<()> {
        if !self.cell.mutation_log().is_leader() {
            return Ok(());
        }

        let mut splits: Vec<SplitCandidate> = Vec::new();
        let mut merges: Vec<MergeCandidate> = Vec::new();
        let mut samplings: Vec<SampleCandidate> = Vec::new();

        {
            let mut state = self.cell.lock().await;
            let now = Instant::now();
            for tablet in state.tablets.values_mut() {
                if tablet.state() != TabletState::Mounted || !tablet.is_sorted() {
                    continue;
                }
                scan_tablet(
                    tablet,
                    &self.config,
                    now,
                    &mut splits,
                    &mut merges,
                    &mut samplings,
                )?;
            }
        }

        for candidate in splits {
            let balancer = Arc::clone(self);
            tokio::spawn(async move {
                balancer.run_split(candidate).await;
            });
        }
        for candidate in merges {
            let balancer = Arc::clone(self);
            tokio::spawn(async move {
                balancer.run_merge(candidate).await;
            });
        }
        for candidate in samplings {
            let Ok(permit) = Arc::clone(&self.sampling_semaphore).try_acquire_owned() else {
                break;
            };
            let balancer = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                balancer.run_sample(candidate).await;
            });
        }
        Ok(())
    }

    async fn run_split(&self, candidate: SplitCandidate) {
        let tablet_id = candidate.tablet_id;
        if let Err(error) = self.do_run_split(candidate).await {
            warn!(
                tablet_id = %tablet_id,
                error = %ErrorChain::new(error),
                "partitioning aborted"
            );
        }
    }

    async fn do_run_split(&self, candidate: SplitCandidate) -> MarlResult<()> {
        info!(
            tablet_id = %candidate.tablet_id,
            partition_id = %candidate.partition_id,
            split_factor = candidate.split_factor,
            "partition is eligible for split"
        );

        let result = self.split_pivots(&candidate).await;
        match result {
            Ok(pivot_keys) => {
                self.cell
                    .mutation_log()
                    .commit(Mutation::SplitPartition {
                        tablet_id: candidate.tablet_id,
                        partition_index: candidate.partition_index,
                        pivot_keys,
                    })
                    .await
            }
            Err(error) => {
                // Return the partition to Normal so later scans retry.
                let mut state = self.cell.lock().await;
                if let Ok(tablet) = state.tablet_mut(candidate.tablet_id) {
                    if let Some(partition) = tablet
                        .partitions_mut()
                        .iter_mut()
                        .find(|partition| partition.id() == candidate.partition_id)
                    {
                        let _ = partition
                            .checked_set_state(PartitionState::Splitting, PartitionState::Normal);
                    }
                }
                Err(error)
            }
        }
    }

    async fn split_pivots(&self, candidate: &SplitCandidate) -> MarlResult<Vec1<Key>> {
        let (chunk_ids, lower, upper, pivot_key) = {
            let state = self.cell.lock().await;
            let tablet = state.tablet(candidate.tablet_id)?;
            let partition = tablet
                .partitions()
                .get(candidate.partition_index)
                .ok_or_else(|| marl_errors::internal_err!("split of vanished partition"))?;
            (
                partition_chunk_ids(tablet, candidate.partition_index),
                partition.pivot_key().clone(),
                match partition.next_pivot_key() {
                    marl_data::KeyBound::Unbounded => Key::empty(),
                    marl_data::KeyBound::Key(key) => key.clone(),
                },
                partition.pivot_key().clone(),
            )
        };

        let samples = self
            .samples_fetcher
            .fetch_samples(
                chunk_ids,
                lower,
                upper,
                self.config.max_partitioning_sample_count,
            )
            .await?;
        let mut samples: Vec<Key> = samples
            .into_iter()
            .filter(|sample| sample > &pivot_key)
            .collect();
        samples.sort();
        samples.dedup();

        let sample_count = samples.len();
        let min_sample_count = self
            .config
            .min_partitioning_sample_count
            .max(candidate.split_factor);
        if sample_count < min_sample_count {
            marl_errors::internal!(
                "too few samples fetched: need {min_sample_count}, got {sample_count}"
            );
        }

        // The partition's own pivot plus (split_factor − 1) evenly
        // spaced sample keys.
        let mut pivot_keys = Vec1::new(pivot_key);
        for index in 0..candidate.split_factor - 1 {
            let position = (index + 1) * sample_count / candidate.split_factor - 1;
            let key = &samples[position];
            if key > pivot_keys.last() {
                pivot_keys.push(key.clone());
            }
        }
        if pivot_keys.len() < 2 {
            marl_errors::internal!("no valid pivot keys can be obtained from samples");
        }
        Ok(pivot_keys)
    }

    async fn run_merge(&self, candidate: MergeCandidate) {
        info!(
            tablet_id = %candidate.tablet_id,
            first_partition_index = candidate.first_partition_index,
            partition_count = candidate.partition_count,
            "partition is eligible for merge"
        );
        if let Err(error) = self
            .cell
            .mutation_log()
            .commit(Mutation::MergePartitions {
                tablet_id: candidate.tablet_id,
                first_partition_index: candidate.first_partition_index,
                partition_count: candidate.partition_count,
            })
            .await
        {
            warn!(
                tablet_id = %candidate.tablet_id,
                error = %ErrorChain::new(error),
                "error committing partition merge mutation"
            );
        }
    }

    async fn run_sample(&self, candidate: SampleCandidate) {
        let result = self.do_run_sample(&candidate).await;

        // Update the sampling time even on failure, so unsuccessful
        // samplings are not repeated too rapidly.
        let mut state = self.cell.lock().await;
        if let Ok(tablet) = state.tablet_mut(candidate.tablet_id) {
            if let Some(partition) = tablet
                .partitions_mut()
                .iter_mut()
                .find(|partition| partition.id() == candidate.partition_id)
            {
                let _ =
                    partition.checked_set_state(PartitionState::Sampling, PartitionState::Normal);
                partition.sampling_time = Some(Instant::now());
            }
        }
        if let Err(error) = result {
            warn!(
                tablet_id = %candidate.tablet_id,
                error = %ErrorChain::new(error),
                "partition sampling aborted"
            );
        }
    }

    async fn do_run_sample(&self, candidate: &SampleCandidate) -> MarlResult<()> {
        let (chunk_ids, lower, upper, samples_per_partition) = {
            let state = self.cell.lock().await;
            let tablet = state.tablet(candidate.tablet_id)?;
            let partition = tablet
                .partitions()
                .get(candidate.partition_index)
                .ok_or_else(|| marl_errors::internal_err!("sampling of vanished partition"))?;
            (
                partition_chunk_ids(tablet, candidate.partition_index),
                partition.pivot_key().clone(),
                match partition.next_pivot_key() {
                    marl_data::KeyBound::Unbounded => Key::empty(),
                    marl_data::KeyBound::Key(key) => key.clone(),
                },
                tablet.config().samples_per_partition,
            )
        };

        debug!(
            partition_id = %candidate.partition_id,
            desired_sample_count = samples_per_partition,
            "sampling partition"
        );

        let mut samples = self
            .samples_fetcher
            .fetch_samples(chunk_ids, lower, upper, samples_per_partition)
            .await?;
        samples.sort();
        samples.dedup();

        self.cell
            .mutation_log()
            .commit(Mutation::UpdatePartitionSampleKeys {
                tablet_id: candidate.tablet_id,
                partition_index: candidate.partition_index,
                sample_keys: samples,
            })
            .await
    }
}

/// Chunks overlapping a partition: its own stores plus the Eden chunks
/// whose ranges intersect it.
fn partition_chunk_ids(tablet: &Tablet, partition_index: usize) -> Vec<ChunkId> {
    let partition = &tablet.partitions()[partition_index];
    let mut chunk_ids: Vec<ChunkId> = Vec::new();
    for store_id in partition.store_ids() {
        chunk_ids.push((*store_id).into());
    }
    for store_id in tablet.eden().store_ids() {
        let Some(store) = tablet.find_store(*store_id) else {
            continue;
        };
        let overlaps = store.min_key().is_none_or(|min| {
            match partition.next_pivot_key() {
                marl_data::KeyBound::Unbounded => true,
                marl_data::KeyBound::Key(next) => &min < next,
            }
        }) && store
            .max_key()
            .is_none_or(|max| &max >= partition.pivot_key());
        if overlaps {
            chunk_ids.push((*store_id).into());
        }
    }
    chunk_ids
}

fn scan_tablet(
    tablet: &mut Tablet,
    config: &PartitionBalancerConfig,
    now: Instant,
    splits: &mut Vec<SplitCandidate>,
    merges: &mut Vec<MergeCandidate>,
    samplings: &mut Vec<SampleCandidate>,
) -> MarlResult<()> {
    let mount_config = Arc::clone(tablet.config());
    let partition_count = tablet.partitions().len();

    // Eden chunk data that could land in any partition.
    let eden_chunk_data_size: u64 = tablet
        .eden()
        .store_ids()
        .iter()
        .filter_map(|store_id| tablet.find_store(*store_id))
        .filter(|store| store.is_chunk())
        .map(Store::uncompressed_data_size)
        .sum();

    for partition_index in 0..partition_count {
        let (partition_id, actual_data_size, state, sampling_due) = {
            let partition = &tablet.partitions()[partition_index];
            let actual: u64 = partition
                .store_ids()
                .iter()
                .filter_map(|store_id| tablet.find_store(*store_id))
                .map(Store::uncompressed_data_size)
                .sum();
            let sampling_due = match (partition.sampling_request_time, partition.sampling_time) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(requested), Some(sampled)) => {
                    requested > sampled && sampled + config.resampling_period <= now
                }
            };
            (partition.id(), actual, partition.state(), sampling_due)
        };
        if state != PartitionState::Normal {
            continue;
        }

        let max_potential_data_size = actual_data_size + eden_chunk_data_size;

        if actual_data_size > mount_config.max_partition_data_size {
            let split_factor = (actual_data_size
                .div_ceil(mount_config.desired_partition_data_size)
                + 1)
                .min(actual_data_size / mount_config.min_partitioning_data_size)
                .min((mount_config.max_partition_count - partition_count) as u64)
                as usize;
            if split_factor > 1 && partition_stores_persistent(tablet, partition_index) {
                tablet.partitions_mut()[partition_index]
                    .checked_set_state(PartitionState::Normal, PartitionState::Splitting)?;
                splits.push(SplitCandidate {
                    tablet_id: tablet.id(),
                    partition_id,
                    partition_index,
                    split_factor,
                });
                continue;
            }
        }

        if max_potential_data_size < mount_config.min_partition_data_size && partition_count > 1 {
            let first = if partition_index + 1 == partition_count {
                partition_index - 1
            } else {
                partition_index
            };
            let both_normal = tablet.partitions()[first].state() == PartitionState::Normal
                && tablet.partitions()[first + 1].state() == PartitionState::Normal;
            if both_normal {
                tablet.partitions_mut()[first]
                    .checked_set_state(PartitionState::Normal, PartitionState::Merging)?;
                tablet.partitions_mut()[first + 1]
                    .checked_set_state(PartitionState::Normal, PartitionState::Merging)?;
                merges.push(MergeCandidate {
                    tablet_id: tablet.id(),
                    first_partition_index: first,
                    partition_count: 2,
                });
                continue;
            }
        }

        if sampling_due {
            tablet.partitions_mut()[partition_index]
                .checked_set_state(PartitionState::Normal, PartitionState::Sampling)?;
            samplings.push(SampleCandidate {
                tablet_id: tablet.id(),
                partition_id,
                partition_index,
            });
        }
    }
    Ok(())
}

fn partition_stores_persistent(tablet: &Tablet, partition_index: usize) -> bool {
    tablet.partitions()[partition_index]
        .store_ids()
        .iter()
        .filter_map(|store_id| tablet.find_store(*store_id))
        .all(|store| store.state() == StoreState::Persistent)
}
