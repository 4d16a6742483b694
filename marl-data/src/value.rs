use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use proptest::prelude::{any, Just, Strategy};
use proptest::prop_oneof;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use test_strategy::Arbitrary;

/// The type of a [`Value`], as it appears in schemas and on the wire.
///
/// The discriminants are the wire type tags and are part of the client
/// protocol; they must never change.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    Arbitrary,
)]
#[repr(u8)]
pub enum ValueType {
    /// Sentinel ordered before every other value. Never stored.
    Min = 0x00,
    /// Missing value.
    Null = 0x02,
    /// Signed 64-bit integer.
    Int64 = 0x03,
    /// Unsigned 64-bit integer.
    Uint64 = 0x04,
    /// 64-bit IEEE float.
    Double = 0x05,
    /// Boolean.
    Boolean = 0x06,
    /// Byte string.
    String = 0x10,
    /// Sentinel ordered after every other value. Never stored.
    Max = 0xef,
}

impl ValueType {
    /// Parses a wire type tag.
    pub fn from_tag(tag: u8) -> Option<ValueType> {
        match tag {
            0x00 => Some(ValueType::Min),
            0x02 => Some(ValueType::Null),
            0x03 => Some(ValueType::Int64),
            0x04 => Some(ValueType::Uint64),
            0x05 => Some(ValueType::Double),
            0x06 => Some(ValueType::Boolean),
            0x10 => Some(ValueType::String),
            0xef => Some(ValueType::Max),
            _ => None,
        }
    }

    /// Returns true for the `Min`/`Max` sentinels, which may appear in key
    /// bounds but never in stored rows.
    pub fn is_sentinel(self) -> bool {
        matches!(self, ValueType::Min | ValueType::Max)
    }
}

/// A single scalar value.
///
/// Values of different types are ordered by their wire type tag, so that a
/// key comparison never needs the schema. `Min` and `Max` exist to express
/// unbounded key prefixes (a pivot key shorter than the key schema is
/// implicitly padded with `Min`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// Sentinel ordered before everything.
    Min,
    /// Missing value.
    Null,
    /// Signed integer.
    Int64(i64),
    /// Unsigned integer.
    Uint64(u64),
    /// IEEE double; ordered by total order, NaN greatest.
    Double(f64),
    /// Boolean.
    Boolean(bool),
    /// Byte string. `Arc` so rows can be shared between stores and readers
    /// without copying payloads.
    String(Arc<[u8]>),
    /// Sentinel ordered after everything.
    Max,
}

impl Value {
    /// Returns the value's type.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Min => ValueType::Min,
            Value::Null => ValueType::Null,
            Value::Int64(_) => ValueType::Int64,
            Value::Uint64(_) => ValueType::Uint64,
            Value::Double(_) => ValueType::Double,
            Value::Boolean(_) => ValueType::Boolean,
            Value::String(_) => ValueType::String,
            Value::Max => ValueType::Max,
        }
    }

    /// Returns true iff the value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Approximate heap + inline footprint, used by dynamic-store memory
    /// accounting.
    pub fn data_weight(&self) -> usize {
        match self {
            Value::String(bytes) => std::mem::size_of::<Value>() + bytes.len(),
            _ => std::mem::size_of::<Value>(),
        }
    }

    /// Builds a string value from anything byte-like.
    pub fn string(bytes: impl AsRef<[u8]>) -> Value {
        Value::String(Arc::from(bytes.as_ref()))
    }
}

impl proptest::arbitrary::Arbitrary for Value {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Value>;

    // Sentinels are excluded: they never occur in stored data.
    fn arbitrary_with(_: ()) -> Self::Strategy {
        prop_oneof![
            Just(Value::Null),
            any::<i64>().prop_map(Value::Int64),
            any::<u64>().prop_map(Value::Uint64),
            any::<f64>().prop_map(Value::Double),
            any::<bool>().prop_map(Value::Boolean),
            proptest::collection::vec(any::<u8>(), 0..16)
                .prop_map(|bytes| Value::String(bytes.into())),
        ]
        .boxed()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Int64(lhs), Int64(rhs)) => lhs.cmp(rhs),
            (Uint64(lhs), Uint64(rhs)) => lhs.cmp(rhs),
            (Double(lhs), Double(rhs)) => lhs.total_cmp(rhs),
            (Boolean(lhs), Boolean(rhs)) => lhs.cmp(rhs),
            (String(lhs), String(rhs)) => lhs.cmp(rhs),
            (lhs, rhs) => lhs.value_type().cmp(&rhs.value_type()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value_type().hash(state);
        match self {
            Value::Int64(v) => v.hash(state),
            Value::Uint64(v) => v.hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Boolean(v) => v.hash(state),
            Value::String(v) => v.hash(state),
            Value::Min | Value::Null | Value::Max => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Min => write!(f, "<min>"),
            Value::Null => write!(f, "#"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Uint64(v) => write!(f, "{v}u"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "%{v}"),
            Value::String(v) => write!(f, "{:?}", String::from_utf8_lossy(v)),
            Value::Max => write!(f, "<max>"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use test_strategy::proptest;

    use super::*;

    #[test]
    fn cross_type_order_follows_tags() {
        assert!(Value::Min < Value::Null);
        assert!(Value::Null < Value::Int64(i64::MIN));
        assert!(Value::Int64(i64::MAX) < Value::Uint64(0));
        assert!(Value::string("zzz") < Value::Max);
    }

    #[test]
    fn doubles_totally_ordered() {
        assert!(Value::Double(f64::NEG_INFINITY) < Value::Double(0.0));
        assert!(Value::Double(0.0) < Value::Double(f64::NAN));
    }

    #[proptest]
    fn ordering_is_antisymmetric(lhs: Value, rhs: Value) {
        assert_eq!(lhs.cmp(&rhs), rhs.cmp(&lhs).reverse());
    }

    #[proptest]
    fn tag_round_trips(value: Value) {
        let tag = value.value_type() as u8;
        assert_eq!(ValueType::from_tag(tag), Some(value.value_type()));
    }
}
