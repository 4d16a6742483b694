use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use test_strategy::Arbitrary;

/// A hybrid 64-bit timestamp minted by the cluster's timestamp provider.
///
/// The upper bits encode wall-clock seconds since the epoch, the low 30
/// bits a per-second counter. The tablet never mints its own timestamps;
/// this type only carries and compares them.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Arbitrary,
)]
pub struct Timestamp(pub u64);

const COUNTER_BITS: u32 = 30;

/// "No timestamp": the default before one is assigned.
pub const NULL_TIMESTAMP: Timestamp = Timestamp(0);

/// Smallest valid timestamp.
pub const MIN_TIMESTAMP: Timestamp = Timestamp(1);

/// Largest valid timestamp.
pub const MAX_TIMESTAMP: Timestamp = Timestamp(0x3fff_ffff_ffff_ff00);

/// Sentinel requesting all committed versions rather than a snapshot at a
/// particular instant. Used by versioned (compaction) readers.
pub const ALL_COMMITTED_TIMESTAMP: Timestamp = Timestamp(0x3fff_ffff_ffff_ff01);

impl Timestamp {
    /// Builds a timestamp from wall-clock seconds and a counter.
    pub fn from_parts(unix_seconds: u64, counter: u32) -> Timestamp {
        Timestamp((unix_seconds << COUNTER_BITS) | u64::from(counter))
    }

    /// Wall-clock seconds component.
    pub fn unix_seconds(self) -> u64 {
        self.0 >> COUNTER_BITS
    }

    /// The timestamp `duration` earlier, saturating at [`MIN_TIMESTAMP`].
    /// Used to derive retained timestamps from TTL configs.
    pub fn saturating_sub(self, duration: Duration) -> Timestamp {
        let delta = duration.as_secs() << COUNTER_BITS;
        Timestamp(self.0.saturating_sub(delta).max(MIN_TIMESTAMP.0))
    }

    /// Returns true for real (assigned, non-sentinel) timestamps.
    pub fn is_valid(self) -> bool {
        self >= MIN_TIMESTAMP && self <= MAX_TIMESTAMP
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_round_trip() {
        let ts = Timestamp::from_parts(1_700_000_000, 17);
        assert_eq!(ts.unix_seconds(), 1_700_000_000);
        assert!(ts.is_valid());
    }

    #[test]
    fn sentinels_are_ordered() {
        assert!(NULL_TIMESTAMP < MIN_TIMESTAMP);
        assert!(MIN_TIMESTAMP < MAX_TIMESTAMP);
        assert!(MAX_TIMESTAMP < ALL_COMMITTED_TIMESTAMP);
        assert!(!ALL_COMMITTED_TIMESTAMP.is_valid());
    }

    #[test]
    fn ttl_subtraction_saturates() {
        let ts = Timestamp::from_parts(100, 0);
        assert_eq!(
            ts.saturating_sub(Duration::from_secs(1_000_000)),
            MIN_TIMESTAMP
        );
    }
}
