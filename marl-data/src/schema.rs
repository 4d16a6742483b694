use std::fmt;

use marl_errors::{MarlError, MarlResult};
use serde::{Deserialize, Serialize};

use crate::row::UnversionedRow;
use crate::value::{Value, ValueType};

/// Sort order of a key column.
///
/// Only ascending order is supported; the field exists because its
/// presence is what marks a column as a key column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending.
    Ascending,
}

/// Schema of a single column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Value type.
    pub value_type: ValueType,
    /// Present iff the column is a key column.
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
    /// Name of the lock group the column belongs to. Columns without one
    /// are covered by the primary lock.
    #[serde(default)]
    pub lock: Option<String>,
    /// Computed-column expression, if any. Carried through untouched; the
    /// core does not evaluate expressions.
    #[serde(default)]
    pub expression: Option<String>,
}

impl ColumnSchema {
    /// A plain key column.
    pub fn key(name: impl Into<String>, value_type: ValueType) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            value_type,
            sort_order: Some(SortOrder::Ascending),
            lock: None,
            expression: None,
        }
    }

    /// A plain value column in the primary lock group.
    pub fn value(name: impl Into<String>, value_type: ValueType) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            value_type,
            sort_order: None,
            lock: None,
            expression: None,
        }
    }

    /// A value column bound to a named lock group.
    pub fn value_with_lock(
        name: impl Into<String>,
        value_type: ValueType,
        lock: impl Into<String>,
    ) -> ColumnSchema {
        ColumnSchema {
            lock: Some(lock.into()),
            ..ColumnSchema::value(name, value_type)
        }
    }
}

/// Index of the primary lock group, covering keys and unlocked columns.
pub const PRIMARY_LOCK_INDEX: usize = 0;

bitflags::bitflags! {
    /// A bitset over the lock groups of a row.
    ///
    /// Only the primary group has a name; the column groups a schema
    /// defines map to the remaining bits by index.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LockMask: u32 {
        /// The primary lock: what row-mode writes and deletes take.
        const PRIMARY = 1 << PRIMARY_LOCK_INDEX;
    }
}

impl LockMask {
    /// The mask bit of lock group `index`.
    pub fn group(index: usize) -> LockMask {
        LockMask::from_bits_retain(1 << index)
    }

    /// Returns true iff group `index` is in the mask.
    pub fn has_group(self, index: usize) -> bool {
        self.contains(Self::group(index))
    }

    /// Adds group `index` to the mask.
    pub fn add_group(&mut self, index: usize) {
        self.insert(Self::group(index));
    }

    /// Iterates over the set group indexes, ascending.
    pub fn groups(self) -> impl Iterator<Item = usize> {
        (0..u32::BITS as usize).filter(move |index| self.has_group(*index))
    }
}

/// Schema of a table: an ordered list of columns, key columns first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnSchema>,
    key_column_count: usize,
    /// Maps each column index to its lock group index. Key columns map to
    /// the primary group.
    column_to_lock: Vec<usize>,
    lock_count: usize,
}

impl TableSchema {
    /// Builds a schema, validating that key columns form a prefix and lock
    /// groups stay within the mask width.
    pub fn new(columns: Vec<ColumnSchema>) -> MarlResult<TableSchema> {
        let key_column_count = columns
            .iter()
            .take_while(|column| column.sort_order.is_some())
            .count();
        if columns
            .iter()
            .skip(key_column_count)
            .any(|column| column.sort_order.is_some())
        {
            return Err(MarlError::InvalidConfig(
                "key columns must form a prefix of the schema".into(),
            ));
        }
        if columns.iter().any(|column| column.value_type.is_sentinel()) {
            return Err(MarlError::InvalidConfig(
                "sentinel value types cannot appear in a schema".into(),
            ));
        }

        let mut lock_names: Vec<String> = Vec::new();
        let mut column_to_lock = Vec::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            let group = match (&column.lock, index < key_column_count) {
                (Some(_), true) => {
                    return Err(MarlError::InvalidConfig(format!(
                        "key column {} cannot have a lock group",
                        column.name
                    )));
                }
                (Some(name), false) => {
                    match lock_names.iter().position(|existing| existing == name) {
                        Some(position) => position + 1,
                        None => {
                            lock_names.push(name.clone());
                            lock_names.len()
                        }
                    }
                }
                (None, _) => PRIMARY_LOCK_INDEX,
            };
            column_to_lock.push(group);
        }

        let lock_count = lock_names.len() + 1;
        if lock_count > u32::BITS as usize {
            return Err(MarlError::InvalidConfig(format!(
                "too many lock groups: {lock_count}"
            )));
        }

        Ok(TableSchema {
            columns,
            key_column_count,
            column_to_lock,
            lock_count,
        })
    }

    /// The columns, key columns first.
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Number of key columns.
    pub fn key_column_count(&self) -> usize {
        self.key_column_count
    }

    /// Number of value (non-key) columns.
    pub fn value_column_count(&self) -> usize {
        self.columns.len() - self.key_column_count
    }

    /// Total number of lock groups, including the primary one.
    pub fn lock_count(&self) -> usize {
        self.lock_count
    }

    /// Returns true iff the schema has key columns.
    pub fn is_sorted(&self) -> bool {
        self.key_column_count > 0
    }

    /// Lock group of column `column_index`.
    pub fn lock_index(&self, column_index: usize) -> usize {
        self.column_to_lock[column_index]
    }

    /// Computes the lock mask of a column-mode write touching the row's
    /// value columns. Row-mode writes use [`LockMask::PRIMARY`] instead.
    pub fn column_lock_mask(&self, row: &UnversionedRow) -> LockMask {
        let mut mask = LockMask::empty();
        for value in &row.values {
            let index = value.id as usize;
            if index >= self.key_column_count {
                mask.add_group(self.lock_index(index));
            }
        }
        mask
    }

    /// Validates a row arriving in a write request: all key columns
    /// present and correctly typed, value ids in bounds, values typed per
    /// the schema.
    pub fn validate_row(&self, row: &UnversionedRow) -> MarlResult<()> {
        if row.values.len() < self.key_column_count {
            return Err(MarlError::InvalidRow(format!(
                "row has {} values but the schema has {} key columns",
                row.values.len(),
                self.key_column_count
            )));
        }
        let mut previous_id: Option<u16> = None;
        for (position, value) in row.values.iter().enumerate() {
            let index = value.id as usize;
            if index >= self.columns.len() {
                return Err(MarlError::InvalidRow(format!(
                    "column id {index} out of bounds for schema of {} columns",
                    self.columns.len()
                )));
            }
            if position < self.key_column_count && index != position {
                return Err(MarlError::InvalidRow(format!(
                    "expected key column {position}, got column id {index}"
                )));
            }
            if let Some(previous) = previous_id {
                if value.id <= previous {
                    return Err(MarlError::InvalidRow(
                        "row values must be sorted by column id".into(),
                    ));
                }
            }
            previous_id = Some(value.id);
            self.validate_value(index, &value.value)?;
        }
        Ok(())
    }

    /// Validates a bare key: exactly the key columns, correctly typed.
    pub fn validate_key(&self, key: &[Value]) -> MarlResult<()> {
        if key.len() != self.key_column_count {
            return Err(MarlError::InvalidRow(format!(
                "key has {} values but the schema has {} key columns",
                key.len(),
                self.key_column_count
            )));
        }
        for (index, value) in key.iter().enumerate() {
            self.validate_value(index, value)?;
        }
        Ok(())
    }

    fn validate_value(&self, column_index: usize, value: &Value) -> MarlResult<()> {
        let expected = self.columns[column_index].value_type;
        let actual = value.value_type();
        if actual != expected && actual != ValueType::Null {
            return Err(MarlError::InvalidRow(format!(
                "column {} expects {expected}, got {actual}",
                self.columns[column_index].name
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (index, column) in self.columns.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            if column.sort_order.is_some() {
                write!(f, "{}: {} key", column.name, column.value_type)?;
            } else {
                write!(f, "{}: {}", column.name, column.value_type)?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_lock_schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::key("k", ValueType::Int64),
            ColumnSchema::value("a", ValueType::Int64),
            ColumnSchema::value_with_lock("b", ValueType::String, "secondary"),
            ColumnSchema::value_with_lock("c", ValueType::Int64, "secondary"),
        ])
        .unwrap()
    }

    #[test]
    fn lock_groups_assigned_in_declaration_order() {
        let schema = two_lock_schema();
        assert_eq!(schema.lock_count(), 2);
        assert_eq!(schema.lock_index(0), PRIMARY_LOCK_INDEX);
        assert_eq!(schema.lock_index(1), PRIMARY_LOCK_INDEX);
        assert_eq!(schema.lock_index(2), 1);
        assert_eq!(schema.lock_index(3), 1);
    }

    #[test]
    fn column_mode_mask_covers_touched_groups_only() {
        let schema = two_lock_schema();
        let row = UnversionedRow::from_pairs([(0, Value::Int64(1)), (2, Value::from("x"))]);
        let mask = schema.column_lock_mask(&row);
        assert!(!mask.has_group(PRIMARY_LOCK_INDEX));
        assert!(mask.has_group(1));
    }

    #[test]
    fn row_validation_rejects_bad_rows() {
        let schema = two_lock_schema();

        let missing_key = UnversionedRow::from_pairs([(1, Value::Int64(1))]);
        assert!(schema.validate_row(&missing_key).is_err());

        let bad_type = UnversionedRow::from_pairs([(0, Value::Int64(1)), (2, Value::Int64(2))]);
        assert!(schema.validate_row(&bad_type).is_err());

        let good =
            UnversionedRow::from_pairs([(0, Value::Int64(1)), (1, Value::Null), (2, Value::from("x"))]);
        schema.validate_row(&good).unwrap();
    }

    #[test]
    fn key_columns_must_prefix_schema() {
        let result = TableSchema::new(vec![
            ColumnSchema::value("v", ValueType::Int64),
            ColumnSchema::key("k", ValueType::Int64),
        ]);
        assert!(result.is_err());
    }
}
