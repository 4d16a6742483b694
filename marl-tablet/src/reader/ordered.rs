//! The ordered reader: concatenates stores selected by row index.

use marl_data::UnversionedRow;
use marl_errors::MarlResult;

use crate::store::Store;
use crate::tablet::TabletSnapshot;

/// Reads rows of an ordered tablet with global indexes in
/// `[lower_row_index, upper_row_index)`.
///
/// The window is clamped to `[trimmed_row_count, total_row_count)`;
/// trimmed rows are simply gone.
pub async fn read_ordered_rows(
    snapshot: &TabletSnapshot,
    lower_row_index: u64,
    upper_row_index: u64,
) -> MarlResult<Vec<UnversionedRow>> {
    let lower = lower_row_index.max(snapshot.trimmed_row_count);
    let upper = upper_row_index.min(snapshot.total_row_count);
    if lower >= upper {
        return Ok(Vec::new());
    }

    let mut result = Vec::new();
    for store in &snapshot.ordered_stores {
        let (start, count) = match store {
            Store::OrderedDynamic(store) => (store.starting_row_index(), store.row_count()),
            Store::OrderedChunk(store) => (store.starting_row_index(), store.meta().row_count),
            _ => continue,
        };
        if start >= upper {
            break;
        }
        if start + count <= lower {
            continue;
        }
        match store {
            Store::OrderedDynamic(store) => {
                result.extend(store.read_rows(lower, upper));
            }
            Store::OrderedChunk(store) => {
                result.extend(store.read_rows(lower, upper).await?);
            }
            _ => unreachable!("filtered above"),
        }
    }
    Ok(result)
}
