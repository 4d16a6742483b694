//! Data model shared by the Marl client and tablet node: scalar values,
//! unversioned and versioned rows, table schemas, row keys and hybrid
//! timestamps.

mod key;
mod row;
mod schema;
mod timestamp;
mod value;

pub use key::{compare_key_bounds, Key, KeyBound};
pub use row::{UnversionedRow, UnversionedValue, VersionedRow, VersionedValue};
pub use schema::{ColumnSchema, LockMask, SortOrder, TableSchema, PRIMARY_LOCK_INDEX};
pub use timestamp::{
    Timestamp, ALL_COMMITTED_TIMESTAMP, MAX_TIMESTAMP, MIN_TIMESTAMP, NULL_TIMESTAMP,
};
pub use value::{Value, ValueType};
