//! Merging readers: the unified, MVCC-consistent view over dynamic and
//! chunk stores.

mod lookup;
mod merge;
mod ordered;
mod range;

pub use lookup::lookup_rows;
pub use merge::{restrict_to_timestamp, SchemafulRowMerger, VersionedRowMerger};
pub use ordered::read_ordered_rows;
pub use range::{collect_range_stores, SchemafulRangeReader, VersionedRangeReader};
