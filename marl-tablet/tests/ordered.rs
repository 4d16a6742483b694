//! Ordered-tablet scenarios: append, addressing, trim.

mod common;

use std::time::Duration;

use common::{tx, TestCell};
use marl_client::wire::WireWriter;
use marl_client::FINAL_SIGNATURE;
use marl_data::{Timestamp, UnversionedRow, Value};

async fn append(cell: &TestCell, payloads: &[&str], start: u64, commit: u64) {
    let t = tx();
    let mut writer = WireWriter::new();
    for payload in payloads {
        writer.write_row(&UnversionedRow::from_pairs([(0, Value::from(*payload))]));
    }
    cell.timestamps.advance_to(start);
    cell.cell
        .write_ordered(
            cell.tablet_id,
            t,
            Timestamp(start),
            Duration::from_secs(60),
            FINAL_SIGNATURE,
            writer.finish(),
        )
        .await
        .unwrap();
    cell.commit(t, commit, commit).await.unwrap();
}

#[tokio::test]
async fn appends_are_assigned_consecutive_row_indexes() {
    let cell = TestCell::ordered(7).await;

    append(&cell, &["a"], 100, 110).await;
    append(&cell, &["b", "c"], 120, 130).await;

    {
        let state = cell.cell.lock().await;
        let tablet = state.tablet(cell.tablet_id).unwrap();
        assert_eq!(tablet.total_row_count(), 3);
        assert_eq!(tablet.tablet_index(), 7);
    }

    let rows = cell.cell.read_ordered(cell.tablet_id, 0, 3).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].get(0), Some(&Value::from("c")));

    let tail = cell.cell.read_ordered(cell.tablet_id, 2, 100).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].get(0), Some(&Value::from("c")));
}

#[tokio::test]
async fn trim_hides_head_rows() {
    let cell = TestCell::ordered(7).await;

    append(&cell, &["a"], 100, 110).await;
    append(&cell, &["b"], 120, 125).await;
    append(&cell, &["c"], 130, 135).await;

    cell.cell.trim_rows(cell.tablet_id, 2).await.unwrap();

    // The trimmed prefix reads as empty; the tail survives.
    assert!(cell.cell.read_ordered(cell.tablet_id, 0, 2).await.unwrap().is_empty());
    let tail = cell.cell.read_ordered(cell.tablet_id, 2, 3).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].get(0), Some(&Value::from("c")));

    {
        let state = cell.cell.lock().await;
        let tablet = state.tablet(cell.tablet_id).unwrap();
        assert_eq!(tablet.trimmed_row_count(), 2);
    }

    // Trims never move backwards.
    cell.cell.trim_rows(cell.tablet_id, 1).await.unwrap();
    let state = cell.cell.lock().await;
    assert_eq!(state.tablet(cell.tablet_id).unwrap().trimmed_row_count(), 2);
}

#[tokio::test]
async fn uncommitted_ordered_writes_are_invisible() {
    let cell = TestCell::ordered(0).await;

    let t = tx();
    let mut writer = WireWriter::new();
    writer.write_row(&UnversionedRow::from_pairs([(0, Value::from("pending"))]));
    cell.cell
        .write_ordered(
            cell.tablet_id,
            t,
            Timestamp(100),
            Duration::from_secs(60),
            FINAL_SIGNATURE,
            writer.finish(),
        )
        .await
        .unwrap();

    // Buffered in the delayed write log; not yet in any store.
    assert!(cell.cell.read_ordered(cell.tablet_id, 0, 10).await.unwrap().is_empty());

    cell.commit(t, 110, 110).await.unwrap();
    assert_eq!(cell.cell.read_ordered(cell.tablet_id, 0, 10).await.unwrap().len(), 1);
}
