//! Client bindings for Marl: the object-id types shared across the
//! cluster, the binary wire protocol spoken between clients and tablet
//! cells, and client-side write options.

mod id;
mod options;
pub mod wire;

pub use id::{ChunkId, ObjectId, PartitionId, StoreId, TabletId, TransactionId};
pub use options::{Atomicity, Durability, TabletServiceOptions, TabletWriteOptions};

use serde::{Deserialize, Serialize};

/// Accumulator detecting that all fragments of a multi-request transaction
/// have arrived.
///
/// Every write batch carries a signature share; the shares of a complete
/// transaction sum (wrapping) to [`FINAL_SIGNATURE`]. Commit is refused
/// until the accumulated value matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub u32);

/// Signature of a transaction nobody has written to yet.
pub const INITIAL_SIGNATURE: Signature = Signature(0);

/// The value a complete transaction's signature shares sum to.
pub const FINAL_SIGNATURE: Signature = Signature(1);

impl Signature {
    /// Adds a share, wrapping.
    pub fn accumulate(&mut self, share: Signature) {
        self.0 = self.0.wrapping_add(share.0);
    }

    /// Returns true iff the accumulated signature permits commit.
    pub fn is_final(self) -> bool {
        self == FINAL_SIGNATURE
    }
}

impl Default for Signature {
    fn default() -> Self {
        INITIAL_SIGNATURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_sum_to_final() {
        let mut signature = INITIAL_SIGNATURE;
        signature.accumulate(Signature(0x8000_0001));
        assert!(!signature.is_final());
        signature.accumulate(Signature(0x8000_0000));
        assert!(signature.is_final());
    }
}
