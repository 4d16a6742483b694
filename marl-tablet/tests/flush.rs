//! Flush pipeline scenarios: rotation, flush, and read equivalence
//! across the dynamic/chunk boundary.

mod common;

use common::{tx, TestCell};
use marl_data::Timestamp;
use marl_tablet::config::TableMountConfig;
use marl_tablet::flusher::StoreFlusher;
use marl_tablet::interfaces::NullThrottler;
use std::sync::Arc;

fn flusher(cell: &TestCell) -> Arc<StoreFlusher> {
    StoreFlusher::new(
        Arc::clone(&cell.cell),
        cell.cell.config().store_flusher.clone(),
        Arc::new(NullThrottler),
    )
}

#[tokio::test]
async fn flush_round_trip() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    for (k, v, ts) in [(1, 100, 110u64), (2, 200, 120), (3, 300, 130)] {
        let t = tx();
        cell.write_rows(t, ts - 10, &[(k, v)]).await.unwrap();
        cell.commit(t, ts, ts).await.unwrap();
    }

    cell.rotate().await.unwrap();
    flusher(&cell).scan().await.unwrap();

    // One chunk store replaces the passive dynamic store.
    assert!(
        cell.wait_for_stores(|dynamic, chunk| dynamic == 1 && chunk == 1)
            .await,
        "flush did not complete"
    );

    {
        let state = cell.cell.lock().await;
        let tablet = state.tablet(cell.tablet_id).unwrap();
        let chunk = tablet
            .stores()
            .values()
            .find_map(|store| store.as_sorted_chunk())
            .expect("chunk store present");
        let meta = chunk.meta();
        assert_eq!(meta.row_count, 3);
        assert!(meta.eden);
        assert_eq!(
            meta.min_key.as_ref().unwrap(),
            &marl_data::Key::from([marl_data::Value::Int64(1)])
        );
        assert_eq!(
            meta.max_key.as_ref().unwrap(),
            &marl_data::Key::from([marl_data::Value::Int64(3)])
        );
        assert_eq!(meta.min_timestamp, Timestamp(110));
        assert_eq!(meta.max_timestamp, Timestamp(130));

        // The flushed chunk landed in Eden.
        assert!(tablet.eden().store_ids().contains(&chunk.id()));
    }

    // Reads after the flush see exactly what they saw before.
    assert_eq!(
        cell.read_all(130).await.unwrap(),
        vec![(1, 100), (2, 200), (3, 300)]
    );
    assert_eq!(cell.read_all(115).await.unwrap(), vec![(1, 100)]);
}

#[tokio::test]
async fn flush_equivalence_across_versions() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    // Two versions of one row plus a deleted row.
    for (k, v, ts) in [(1, 10, 110u64), (1, 11, 120), (2, 20, 115)] {
        let t = tx();
        cell.write_rows(t, ts - 5, &[(k, v)]).await.unwrap();
        cell.commit(t, ts, ts).await.unwrap();
    }

    let before_125 = cell.read_all(125).await.unwrap();
    let before_112 = cell.read_all(112).await.unwrap();

    cell.rotate().await.unwrap();
    flusher(&cell).scan().await.unwrap();
    assert!(
        cell.wait_for_stores(|dynamic, chunk| dynamic == 1 && chunk == 1)
            .await
    );

    assert_eq!(cell.read_all(125).await.unwrap(), before_125);
    assert_eq!(cell.read_all(112).await.unwrap(), before_112);
}

#[tokio::test]
async fn empty_active_store_does_not_rotate() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;
    cell.rotate().await.unwrap();

    let state = cell.cell.lock().await;
    let tablet = state.tablet(cell.tablet_id).unwrap();
    assert_eq!(tablet.stores().len(), 1, "empty store must not rotate");
}

#[tokio::test]
async fn lookup_reads_flushed_and_dynamic_rows_together() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t1 = tx();
    cell.write_rows(t1, 100, &[(1, 10)]).await.unwrap();
    cell.commit(t1, 110, 110).await.unwrap();

    cell.rotate().await.unwrap();
    flusher(&cell).scan().await.unwrap();
    assert!(
        cell.wait_for_stores(|dynamic, chunk| dynamic == 1 && chunk == 1)
            .await
    );

    // A newer version lands in the fresh dynamic store.
    let t2 = tx();
    cell.write_rows(t2, 150, &[(1, 11)]).await.unwrap();
    cell.commit(t2, 160, 160).await.unwrap();

    let rows = cell
        .cell
        .lookup(
            cell.tablet_id,
            &[marl_data::Key::from([marl_data::Value::Int64(1)])],
            Timestamp(200),
            None,
            true,
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let row = rows[0].as_ref().expect("row visible");
    assert_eq!(row.get(1), Some(&marl_data::Value::Int64(11)));

    // At a timestamp between the versions the chunk's value wins.
    let rows = cell
        .cell
        .lookup(
            cell.tablet_id,
            &[marl_data::Key::from([marl_data::Value::Int64(1)])],
            Timestamp(120),
            None,
            true,
        )
        .await
        .unwrap();
    let row = rows[0].as_ref().expect("row visible");
    assert_eq!(row.get(1), Some(&marl_data::Value::Int64(10)));

    // Missing keys produce positional empties only when requested.
    let rows = cell
        .cell
        .lookup(
            cell.tablet_id,
            &[marl_data::Key::from([marl_data::Value::Int64(9)])],
            Timestamp(200),
            None,
            false,
        )
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn unmount_drains_passive_stores_through_the_flusher() {
    use marl_tablet::tablet::TabletState;

    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t = tx();
    cell.write_rows(t, 100, &[(1, 10)]).await.unwrap();
    cell.commit(t, 110, 110).await.unwrap();

    let state = cell.cell.unmount_tablet(cell.tablet_id).await.unwrap();
    assert_eq!(state, TabletState::UnmountFlushing);

    flusher(&cell).scan().await.unwrap();
    assert!(
        cell.wait_for_stores(|dynamic, chunk| dynamic == 0 && chunk == 1)
            .await,
        "unmount flush did not finish"
    );

    let state = cell.cell.unmount_tablet(cell.tablet_id).await.unwrap();
    assert_eq!(state, TabletState::Unmounted);
}
