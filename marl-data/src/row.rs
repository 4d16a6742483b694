use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::key::Key;
use crate::timestamp::Timestamp;
use crate::value::Value;

/// A value tagged with the schema column it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnversionedValue {
    /// Index of the column in the table schema.
    pub id: u16,
    /// The value itself.
    pub value: Value,
}

/// A row without version information, as it arrives in write requests and
/// leaves in schemaful read responses.
///
/// Values are ordered by column id; key columns always come first and are
/// always present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnversionedRow {
    /// The row's values.
    pub values: SmallVec<[UnversionedValue; 8]>,
}

impl UnversionedRow {
    /// Builds a row from `(column_id, value)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u16, Value)>) -> UnversionedRow {
        UnversionedRow {
            values: pairs
                .into_iter()
                .map(|(id, value)| UnversionedValue { id, value })
                .collect(),
        }
    }

    /// Extracts the key formed by the first `key_column_count` columns.
    ///
    /// Callers must have validated the row first; missing key columns make
    /// this return `None`.
    pub fn key(&self, key_column_count: usize) -> Option<Key> {
        if self.values.len() < key_column_count {
            return None;
        }
        let prefix = &self.values[..key_column_count];
        if prefix
            .iter()
            .enumerate()
            .any(|(index, value)| value.id as usize != index)
        {
            return None;
        }
        Some(Key::from_values(
            prefix.iter().map(|value| value.value.clone()),
        ))
    }

    /// The value of column `id`, if present.
    pub fn get(&self, id: u16) -> Option<&Value> {
        self.values
            .iter()
            .find(|value| value.id == id)
            .map(|value| &value.value)
    }

    /// Number of values in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true iff the row carries no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for UnversionedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, value) in self.values.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", value.id, value.value)?;
        }
        write!(f, "}}")
    }
}

/// A value plus the timestamp of the write that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Index of the column in the table schema.
    pub id: u16,
    /// The value.
    pub value: Value,
    /// Commit timestamp of the producing write.
    pub timestamp: Timestamp,
}

/// A fully versioned row: the unit of data moving between stores.
///
/// `values` holds every retained version of every value column, newest
/// first within a column. `write_timestamps` and `delete_timestamps` are
/// sorted newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRow {
    /// Key column values.
    pub key: Key,
    /// Versioned values, grouped by column, newest first within a column.
    pub values: Vec<VersionedValue>,
    /// Timestamps of writes touching this row, newest first.
    pub write_timestamps: Vec<Timestamp>,
    /// Timestamps of deletes of this row, newest first.
    pub delete_timestamps: Vec<Timestamp>,
}

impl VersionedRow {
    /// The latest write timestamp, if the row has ever been written.
    pub fn latest_write_timestamp(&self) -> Option<Timestamp> {
        self.write_timestamps.first().copied()
    }

    /// The latest delete timestamp, if the row has ever been deleted.
    pub fn latest_delete_timestamp(&self) -> Option<Timestamp> {
        self.delete_timestamps.first().copied()
    }

    /// Smallest timestamp mentioned anywhere in the row.
    pub fn min_timestamp(&self) -> Option<Timestamp> {
        self.write_timestamps
            .iter()
            .chain(self.delete_timestamps.iter())
            .min()
            .copied()
    }

    /// Largest timestamp mentioned anywhere in the row.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.write_timestamps
            .iter()
            .chain(self.delete_timestamps.iter())
            .max()
            .copied()
    }

    /// Returns true iff the row carries no versions at all.
    pub fn is_empty(&self) -> bool {
        self.write_timestamps.is_empty() && self.delete_timestamps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_extraction_requires_leading_key_columns() {
        let row = UnversionedRow::from_pairs([(0, Value::Int64(1)), (2, Value::Int64(10))]);
        assert_eq!(row.key(1), Some(Key::from([Value::Int64(1)])));
        assert_eq!(row.key(2), None);

        let out_of_order = UnversionedRow::from_pairs([(1, Value::Int64(1))]);
        assert_eq!(out_of_order.key(1), None);
    }

    #[test]
    fn versioned_row_timestamp_range() {
        let row = VersionedRow {
            key: Key::from([Value::Int64(1)]),
            values: vec![],
            write_timestamps: vec![Timestamp(130), Timestamp(110)],
            delete_timestamps: vec![Timestamp(120)],
        };
        assert_eq!(row.min_timestamp(), Some(Timestamp(110)));
        assert_eq!(row.max_timestamp(), Some(Timestamp(130)));
        assert_eq!(row.latest_write_timestamp(), Some(Timestamp(130)));
        assert_eq!(row.latest_delete_timestamp(), Some(Timestamp(120)));
    }
}
