//! Point lookups: keys are grouped by containing partition, each key is
//! read from Eden plus that partition, and the merger yields one row per
//! key.

use marl_data::{Key, Timestamp, UnversionedRow};
use marl_errors::MarlResult;

use crate::store::Store;
use crate::tablet::{PartitionSnapshot, TabletSnapshot};

use super::merge::{restrict_to_timestamp, SchemafulRowMerger};

/// Looks up `keys` (sorted, deduplicated by the caller) at `timestamp`.
///
/// With `keep_missing_rows`, keys without a visible row produce an empty
/// row, keeping the response positionally aligned with the request;
/// otherwise they are dropped.
pub async fn lookup_rows(
    snapshot: &TabletSnapshot,
    keys: &[Key],
    timestamp: Timestamp,
    column_filter: Option<Vec<u16>>,
    keep_missing_rows: bool,
) -> MarlResult<Vec<Option<UnversionedRow>>> {
    tracing::debug!(
        tablet_id = %snapshot.tablet_id,
        key_count = keys.len(),
        %timestamp,
        "performing tablet lookup"
    );

    let mut merger = SchemafulRowMerger::new(&snapshot.schema, column_filter);
    let mut result = Vec::with_capacity(keys.len());

    let mut current_partition: Option<&PartitionSnapshot> = None;
    for key in keys {
        snapshot.schema.validate_key(key)?;
        let partition = snapshot.find_containing_partition(key);
        if partition.map(|partition| partition.id) != current_partition.map(|partition| partition.id)
        {
            current_partition = partition;
        }

        lookup_in_stores(&snapshot.eden.stores, key, timestamp, &mut merger).await?;
        if let Some(partition) = current_partition {
            lookup_in_stores(&partition.stores, key, timestamp, &mut merger).await?;
        }

        let merged = merger.build_merged_row();
        if merged.is_some() || keep_missing_rows {
            result.push(merged);
        }
    }
    Ok(result)
}

async fn lookup_in_stores(
    stores: &[Store],
    key: &Key,
    timestamp: Timestamp,
    merger: &mut SchemafulRowMerger,
) -> MarlResult<()> {
    for store in stores {
        match store {
            Store::SortedDynamic(store) => {
                if let Some(row) = store.lookup(key, timestamp) {
                    merger.add_partial_row(&row);
                }
            }
            Store::SortedChunk(store) => {
                if store.meta().min_key.as_ref().is_some_and(|min| key < min)
                    || store.meta().max_key.as_ref().is_some_and(|max| key > max)
                {
                    continue;
                }
                if let Some(row) = store.lookup(key).await? {
                    if let Some(restricted) = restrict_to_timestamp(&row, timestamp) {
                        merger.add_partial_row(&restricted);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}
