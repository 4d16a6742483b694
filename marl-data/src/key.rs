use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;

use proptest::prelude::{any, Strategy};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// An owning row key: the values of the key columns, in schema order.
///
/// A key may be shorter than the key schema (a *prefix* key); missing
/// positions compare as [`Value::Min`]. The empty key is therefore the
/// smallest possible key and serves as the pivot of the first partition.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key(pub Box<[Value]>);

impl proptest::arbitrary::Arbitrary for Key {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Key>;

    fn arbitrary_with(_: ()) -> Self::Strategy {
        proptest::collection::vec(any::<Value>(), 0..4)
            .prop_map(Key::from_values)
            .boxed()
    }
}

impl Key {
    /// The empty key, smaller than every other key.
    pub fn empty() -> Key {
        Key(Box::new([]))
    }

    /// Builds a key from an iterator of values.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Key {
        Key(values.into_iter().collect())
    }

    /// Returns true iff this is the empty (negative-infinity) key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of key positions present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Approximate memory footprint.
    pub fn data_weight(&self) -> usize {
        self.0.iter().map(Value::data_weight).sum()
    }
}

impl Deref for Key {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        // Positions absent from a prefix key read as Min.
        let common = self.0.len().min(other.0.len());
        for index in 0..common {
            match self.0[index].cmp(&other.0[index]) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

macro_rules! fmt_key_impl {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "[")?;
            for (index, value) in self.0.iter().enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{value}")?;
            }
            write!(f, "]")
        }
    };
}

impl fmt::Debug for Key {
    fmt_key_impl!();
}

impl fmt::Display for Key {
    fmt_key_impl!();
}

impl<const N: usize> From<[Value; N]> for Key {
    fn from(values: [Value; N]) -> Self {
        Key(Box::new(values))
    }
}

/// One end of a key range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyBound {
    /// Unbounded end.
    Unbounded,
    /// Inclusive on the lower side, exclusive on the upper side, matching
    /// the `[lower, upper)` convention all range reads use.
    Key(Key),
}

impl KeyBound {
    /// Returns the bound's key, if any.
    pub fn as_key(&self) -> Option<&Key> {
        match self {
            KeyBound::Unbounded => None,
            KeyBound::Key(key) => Some(key),
        }
    }
}

/// Compares a key against an upper bound: returns true iff `key` lies
/// below `upper`.
pub fn compare_key_bounds(key: &Key, upper: &KeyBound) -> bool {
    match upper {
        KeyBound::Unbounded => true,
        KeyBound::Key(bound) => key < bound,
    }
}

#[cfg(test)]
mod tests {
    use test_strategy::proptest;

    use super::*;
    use crate::value::Value;

    #[test]
    fn empty_key_is_minimal() {
        let empty = Key::empty();
        let one = Key::from([Value::Int64(i64::MIN)]);
        assert!(empty < one);
        assert!(empty.is_empty());
    }

    #[test]
    fn prefix_key_sorts_before_extension() {
        let prefix = Key::from([Value::Int64(1)]);
        let full = Key::from([Value::Int64(1), Value::Null]);
        assert!(prefix < full);
    }

    #[proptest]
    fn key_order_is_total(lhs: Key, rhs: Key) {
        assert_eq!(lhs.cmp(&rhs), rhs.cmp(&lhs).reverse());
        if lhs.cmp(&rhs) == Ordering::Equal {
            assert_eq!(lhs, rhs);
        }
    }
}
