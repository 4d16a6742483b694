use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A cluster-wide 128-bit object id, rendered as four dash-separated hex
/// words the way the rest of the system prints ids.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectId(pub u64, pub u64);

impl ObjectId {
    /// The null id.
    pub const NULL: ObjectId = ObjectId(0, 0);

    /// Generates a fresh random id.
    pub fn generate() -> ObjectId {
        let mut rng = rand::rng();
        ObjectId(rng.random(), rng.random())
    }

    /// Returns true iff this is the null id.
    pub fn is_null(&self) -> bool {
        *self == ObjectId::NULL
    }

    /// The low 32 bits, used as a creation-order counter by forced
    /// compaction checks (ids are minted with a monotone low word by the
    /// master; random in tests).
    pub fn counter(&self) -> u32 {
        self.1 as u32
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{:x}-{:x}-{:x}",
            self.0 >> 32,
            self.0 as u32,
            self.1 >> 32,
            self.1 as u32
        )
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ObjectId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 4 {
            return Err(format!("malformed object id {s:?}"));
        }
        let mut words = [0u64; 4];
        for (word, part) in words.iter_mut().zip(&parts) {
            *word = u64::from_str_radix(part, 16).map_err(|e| e.to_string())?;
        }
        Ok(ObjectId(
            (words[0] << 32) | words[1],
            (words[2] << 32) | words[3],
        ))
    }
}

macro_rules! define_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub ObjectId);

        impl $name {
            /// The null id.
            pub const NULL: $name = $name(ObjectId::NULL);

            /// Generates a fresh random id.
            pub fn generate() -> $name {
                $name(ObjectId::generate())
            }

            /// Returns true iff this is the null id.
            pub fn is_null(&self) -> bool {
                self.0.is_null()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

define_id! {
    /// Id of a tablet.
    TabletId
}
define_id! {
    /// Id of a store. Chunk stores share their id with the backing chunk.
    StoreId
}
define_id! {
    /// Id of a partition.
    PartitionId
}
define_id! {
    /// Id of a transaction.
    TransactionId
}
define_id! {
    /// Id of a chunk.
    ChunkId
}

impl From<ChunkId> for StoreId {
    fn from(id: ChunkId) -> StoreId {
        StoreId(id.0)
    }
}

impl From<StoreId> for ChunkId {
    fn from(id: StoreId) -> ChunkId {
        ChunkId(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips() {
        let id = ObjectId(0x1234_5678_9abc_def0, 0x0fed_cba9_8765_4321);
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(TabletId::generate(), TabletId::generate());
        assert!(TabletId::NULL.is_null());
    }
}
