//! Partition geometry scenarios: balancer splits, Eden partitioning,
//! and the overlapping-store-count bound.

mod common;

use std::sync::Arc;

use common::{tx, FixedSamples, TestCell};
use marl_data::{Key, Value};
use marl_tablet::balancer::PartitionBalancer;
use marl_tablet::compactor::StoreCompactor;
use marl_tablet::config::{PartitionBalancerConfig, TableMountConfig};
use marl_tablet::flusher::StoreFlusher;
use marl_tablet::interfaces::{Mutation, NullThrottler};
use vec1::{vec1, Vec1};

fn small_store_config() -> TableMountConfig {
    TableMountConfig {
        // Tiny thresholds so test-sized data triggers the machinery.
        min_partitioning_data_size: 1,
        max_partitioning_data_size: 1 << 30,
        min_partitioning_store_count: 1,
        ..TableMountConfig::default()
    }
}

fn flusher(cell: &TestCell) -> Arc<StoreFlusher> {
    StoreFlusher::new(
        Arc::clone(&cell.cell),
        cell.cell.config().store_flusher.clone(),
        Arc::new(NullThrottler),
    )
}

fn compactor(cell: &TestCell) -> Arc<StoreCompactor> {
    StoreCompactor::new(
        Arc::clone(&cell.cell),
        cell.cell.config().store_compactor.clone(),
        Arc::new(NullThrottler),
        Arc::new(NullThrottler),
    )
}

async fn flush_rows(cell: &TestCell, rows: &[(i64, i64)], base_ts: u64) {
    let t = tx();
    cell.write_rows(t, base_ts, rows).await.unwrap();
    cell.commit(t, base_ts + 5, base_ts + 5).await.unwrap();
    cell.rotate().await.unwrap();
    let flusher = flusher(cell);
    flusher.scan().await.unwrap();
    assert!(
        cell.wait_for_stores(|dynamic, _| dynamic == 1).await,
        "flush did not finish"
    );
}

#[tokio::test]
async fn balancer_splits_oversized_partition_at_sample_percentiles() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    // Drive the pivot computation exactly as the balancer does for a
    // 300 MiB partition against a 192 MiB desired size (split factor 3)
    // over 1000 samples, then apply the mutation it would send.
    let samples: Vec<Key> = (1..=1000).map(|v| Key::from([Value::Int64(v)])).collect();
    let split_factor = 3usize;
    let mut pivots = Vec1::new(Key::empty());
    for index in 0..split_factor - 1 {
        let position = (index + 1) * samples.len() / split_factor - 1;
        if &samples[position] > pivots.last() {
            pivots.push(samples[position].clone());
        }
    }
    assert_eq!(
        pivots,
        vec1![
            Key::empty(),
            Key::from([Value::Int64(333)]),
            Key::from([Value::Int64(666)]),
        ]
    );

    cell.cell
        .mutation_log()
        .commit(Mutation::SplitPartition {
            tablet_id: cell.tablet_id,
            partition_index: 0,
            pivot_keys: pivots,
        })
        .await
        .unwrap();

    let state = cell.cell.lock().await;
    let tablet = state.tablet(cell.tablet_id).unwrap();
    assert_eq!(tablet.partitions().len(), 3);
    assert_eq!(
        tablet.partitions()[1].pivot_key(),
        &Key::from([Value::Int64(333)])
    );
    assert_eq!(
        tablet.partitions()[2].pivot_key(),
        &Key::from([Value::Int64(666)])
    );
}

#[tokio::test]
async fn eden_partitioning_moves_chunks_into_partitions() {
    let cell = TestCell::sorted(small_store_config()).await;

    // Two Eden chunks spanning both future partitions.
    flush_rows(&cell, &[(1, 10), (25, 250)], 100).await;
    flush_rows(&cell, &[(5, 50), (30, 300)], 200).await;

    // Shape the tablet into two partitions at pivot 20.
    cell.cell
        .mutation_log()
        .commit(Mutation::SplitPartition {
            tablet_id: cell.tablet_id,
            partition_index: 0,
            pivot_keys: vec1![Key::empty(), Key::from([Value::Int64(20)])],
        })
        .await
        .unwrap();

    {
        let state = cell.cell.lock().await;
        let tablet = state.tablet(cell.tablet_id).unwrap();
        assert_eq!(tablet.eden().store_ids().len(), 2);
        let osc_before = tablet.overlapping_store_count();
        assert!(osc_before >= 3, "two Eden chunks plus the dynamic store");
    }

    let before = cell.read_all(300).await.unwrap();

    compactor(&cell).scan().await.unwrap();
    let mut drained = false;
    for _ in 0..200 {
        {
            let state = cell.cell.lock().await;
            let tablet = state.tablet(cell.tablet_id).unwrap();
            if tablet.eden().store_ids().is_empty() {
                drained = true;
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(drained, "partitioning did not finish");

    {
        let state = cell.cell.lock().await;
        let tablet = state.tablet(cell.tablet_id).unwrap();

        // Eden drained; every chunk store obeys the partition invariant.
        assert!(tablet.eden().store_ids().is_empty());
        for partition in tablet.partitions() {
            for store_id in partition.store_ids() {
                let store = tablet.find_store(*store_id).unwrap();
                let min_key = store.min_key().unwrap();
                let max_key = store.max_key().unwrap();
                assert!(partition.contains(&min_key), "{min_key} outside partition");
                assert!(partition.contains(&max_key), "{max_key} outside partition");
            }
        }

        // The OSC dropped: each partition now holds one chunk.
        assert_eq!(tablet.overlapping_store_count(), 2);
    }

    // Data is unchanged.
    assert_eq!(cell.read_all(300).await.unwrap(), before);
}

#[tokio::test]
async fn balancer_merges_undersized_partitions() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    cell.cell
        .mutation_log()
        .commit(Mutation::SplitPartition {
            tablet_id: cell.tablet_id,
            partition_index: 0,
            pivot_keys: vec1![Key::empty(), Key::from([Value::Int64(10)])],
        })
        .await
        .unwrap();

    // Both partitions are far below min_partition_data_size even with
    // all of Eden, so the balancer folds them back together.
    let balancer = PartitionBalancer::new(
        Arc::clone(&cell.cell),
        PartitionBalancerConfig::default(),
        FixedSamples::evenly_spaced_int64(1000),
    );
    balancer.scan().await.unwrap();

    let mut merged = false;
    for _ in 0..200 {
        {
            let state = cell.cell.lock().await;
            let tablet = state.tablet(cell.tablet_id).unwrap();
            if tablet.partitions().len() == 1 {
                merged = true;
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(merged, "undersized partitions were not merged");
}

#[tokio::test]
async fn partition_merge_folds_neighbours() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    cell.cell
        .mutation_log()
        .commit(Mutation::SplitPartition {
            tablet_id: cell.tablet_id,
            partition_index: 0,
            pivot_keys: vec1![
                Key::empty(),
                Key::from([Value::Int64(10)]),
                Key::from([Value::Int64(20)]),
            ],
        })
        .await
        .unwrap();

    cell.cell
        .mutation_log()
        .commit(Mutation::MergePartitions {
            tablet_id: cell.tablet_id,
            first_partition_index: 0,
            partition_count: 2,
        })
        .await
        .unwrap();

    let state = cell.cell.lock().await;
    let tablet = state.tablet(cell.tablet_id).unwrap();
    assert_eq!(tablet.partitions().len(), 2);
    assert_eq!(tablet.partitions()[0].pivot_key(), &Key::empty());
    assert_eq!(
        tablet.partitions()[1].pivot_key(),
        &Key::from([Value::Int64(20)])
    );
}

#[tokio::test]
async fn sample_keys_update_lands_in_partition() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    cell.cell
        .mutation_log()
        .commit(Mutation::UpdatePartitionSampleKeys {
            tablet_id: cell.tablet_id,
            partition_index: 0,
            sample_keys: vec![
                Key::from([Value::Int64(3)]),
                Key::from([Value::Int64(7)]),
            ],
        })
        .await
        .unwrap();

    let state = cell.cell.lock().await;
    let tablet = state.tablet(cell.tablet_id).unwrap();
    assert_eq!(tablet.partitions()[0].sample_keys.len(), 2);
}
