//! End-to-end write-path scenarios over a single-replica cell.

mod common;

use std::time::Duration;

use common::{tx, TestCell};
use marl_errors::MarlError;
use marl_tablet::config::TableMountConfig;

#[tokio::test]
async fn single_atomic_write_is_visible_at_commit_timestamp() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t1 = tx();
    cell.write_rows(t1, 100, &[(1, 10)]).await.unwrap();
    cell.commit(t1, 101, 101).await.unwrap();

    assert_eq!(cell.read_all(101).await.unwrap(), vec![(1, 10)]);
    assert_eq!(cell.read_all(99).await.unwrap(), vec![]);
}

#[tokio::test]
async fn conflicting_write_fails_with_lock_conflict() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t1 = tx();
    cell.write_rows(t1, 100, &[(1, 10)]).await.unwrap();

    let t2 = tx();
    let error = cell.write_rows(t2, 101, &[(1, 20)]).await.unwrap_err();
    match error {
        MarlError::TransactionLockConflict { holder_id, .. } => {
            assert_eq!(holder_id, Some(t1.to_string()));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn reads_below_prepare_timestamp_are_served_without_blocking() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t1 = tx();
    cell.write_rows(t1, 100, &[(1, 10)]).await.unwrap();
    cell.timestamps.advance_to(150);
    cell.cell
        .prepare_transaction_commit(t1, true, marl_data::Timestamp(150))
        .await
        .unwrap();

    // The read timestamp is below the prepare timestamp: the prepared
    // write cannot become visible at 140, so the read returns at once.
    assert_eq!(cell.read_all(140).await.unwrap(), vec![]);
}

#[tokio::test]
async fn blocked_writer_proceeds_when_holder_aborts() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t1 = tx();
    cell.write_rows(t1, 100, &[(1, 10)]).await.unwrap();
    cell.timestamps.advance_to(150);
    cell.cell
        .prepare_transaction_commit(t1, true, marl_data::Timestamp(150))
        .await
        .unwrap();

    // A writer started above the prepare timestamp parks on the blocked
    // row...
    let t2 = tx();
    let writer = {
        let target = std::sync::Arc::clone(&cell.cell);
        let tablet_id = cell.tablet_id;
        tokio::spawn(async move {
            let mut writer = marl_client::wire::WireWriter::new();
            writer.write_row(&marl_data::UnversionedRow::from_pairs([
                (0, marl_data::Value::Int64(1)),
                (1, marl_data::Value::Int64(20)),
            ]));
            target
                .write(
                    tablet_id,
                    t2,
                    marl_data::Timestamp(200),
                    Duration::from_secs(60),
                    marl_client::FINAL_SIGNATURE,
                    marl_tablet::store_manager::LockMode::Row,
                    writer.finish(),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished(), "writer should be parked on the lock");

    // ...and proceeds the moment the holder aborts.
    cell.cell.abort_transaction(t1, true).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .expect("writer should unblock")
        .unwrap()
        .unwrap();

    cell.commit(t2, 210, 210).await.unwrap();
    assert_eq!(cell.read_all(210).await.unwrap(), vec![(1, 20)]);
}

#[tokio::test]
async fn write_after_commit_conflicts_for_older_start() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t1 = tx();
    cell.write_rows(t1, 100, &[(1, 10)]).await.unwrap();
    cell.commit(t1, 150, 160).await.unwrap();

    // Started before the commit landed: conflict.
    let t2 = tx();
    let error = cell.write_rows(t2, 120, &[(1, 20)]).await.unwrap_err();
    assert!(matches!(error, MarlError::TransactionLockConflict { .. }));

    // Started after: proceeds.
    let t3 = tx();
    cell.write_rows(t3, 200, &[(1, 30)]).await.unwrap();
    cell.commit(t3, 210, 210).await.unwrap();
    assert_eq!(cell.read_all(210).await.unwrap(), vec![(1, 30)]);
}

#[tokio::test]
async fn aborted_transaction_leaves_no_trace() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t1 = tx();
    cell.write_rows(t1, 100, &[(1, 10), (2, 20)]).await.unwrap();
    cell.cell.abort_transaction(t1, true).await.unwrap();

    assert_eq!(cell.read_all(200).await.unwrap(), vec![]);

    let t2 = tx();
    cell.write_rows(t2, 100, &[(1, 11)]).await.unwrap();
    cell.commit(t2, 110, 110).await.unwrap();
    assert_eq!(cell.read_all(110).await.unwrap(), vec![(1, 11)]);
}

#[tokio::test]
async fn unmount_waits_for_locks_then_flushes() {
    use marl_tablet::tablet::TabletState;

    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t1 = tx();
    cell.write_rows(t1, 100, &[(1, 10)]).await.unwrap();

    // Outstanding locks park the unmount.
    let state = cell.cell.unmount_tablet(cell.tablet_id).await.unwrap();
    assert_eq!(state, TabletState::UnmountWaitingForLocks);

    // Once the transaction resolves, the unmount rotates the store out
    // and waits for the flusher to drain it.
    cell.cell.abort_transaction(t1, true).await.unwrap();
    let state = cell.cell.unmount_tablet(cell.tablet_id).await.unwrap();
    assert_eq!(state, TabletState::UnmountFlushing);

    // An unmounting tablet rejects writes.
    let t2 = tx();
    let error = cell.write_rows(t2, 200, &[(2, 20)]).await.unwrap_err();
    assert!(matches!(error, MarlError::TabletNotMounted { .. }));
}

#[tokio::test]
async fn barrier_serializes_committed_transactions() {
    let cell = TestCell::sorted(TableMountConfig::default()).await;

    let t1 = tx();
    cell.write_rows(t1, 100, &[(1, 10)]).await.unwrap();
    cell.commit(t1, 110, 115).await.unwrap();

    cell.cell.run_barrier_check().await.unwrap();

    // After the barrier the transaction is gone from the manager.
    let state = cell.cell.lock().await;
    assert!(state.transactions.find_transaction(t1).is_none());
}
