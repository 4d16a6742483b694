//! Typed configuration for every tunable of the tablet node.
//!
//! Each block deserializes from the node's config file; defaults match
//! the values production clusters run with. `validate` is called once at
//! load time and again on remount for the per-table block.

use std::time::Duration;

use marl_errors::{MarlError, MarlResult};
use serde::{Deserialize, Serialize};

/// How many versions and how much history reads and compactions must
/// retain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Versions of a value that are always retained.
    pub min_data_versions: usize,
    /// Versions beyond which values are discarded even inside the TTL.
    pub max_data_versions: usize,
    /// History always retained, whatever the version count.
    pub min_data_ttl: Duration,
    /// History beyond which values are discarded even within
    /// `max_data_versions`.
    pub max_data_ttl: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            min_data_versions: 1,
            max_data_versions: 1,
            min_data_ttl: Duration::from_secs(300),
            max_data_ttl: Duration::from_secs(300),
        }
    }
}

/// Per-table mount configuration. Changes on remount.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableMountConfig {
    /// Retention knobs for versioned reads and compaction.
    pub retention: RetentionConfig,

    /// Rotate the active store when its row count reaches this.
    pub max_dynamic_store_row_count: usize,
    /// Rotate the active store when its value count reaches this.
    pub max_dynamic_store_value_count: usize,
    /// Rotate the active store when its memory footprint reaches this.
    pub max_dynamic_store_pool_size: usize,
    /// Rotate a non-empty active store at least this often.
    pub dynamic_store_auto_flush_period: Duration,

    /// Split partitions larger than this.
    pub max_partition_data_size: u64,
    /// Target size of partitions produced by splits.
    pub desired_partition_data_size: u64,
    /// Merge partitions that cannot reach this even with all of Eden.
    pub min_partition_data_size: u64,
    /// Hard cap on the partition count.
    pub max_partition_count: usize,

    /// Lower bound on stores per Eden partitioning pass.
    pub min_partitioning_store_count: usize,
    /// Upper bound on stores per Eden partitioning pass.
    pub max_partitioning_store_count: usize,
    /// Lower bound on the data a partitioning pass moves.
    pub min_partitioning_data_size: u64,
    /// Upper bound on the data a partitioning pass moves (ignored for a
    /// minimal store set).
    pub max_partitioning_data_size: u64,

    /// Lower bound on stores per compaction.
    pub min_compaction_store_count: usize,
    /// Upper bound on stores per compaction.
    pub max_compaction_store_count: usize,
    /// Stores below this size always chain into a compaction window.
    pub compaction_data_size_base: u64,
    /// Geometric-progression bound: a store joins the window only while
    /// its size is below `ratio` times the window's running sum.
    pub compaction_data_size_ratio: f64,

    /// Sample keys requested per partition per sampling pass.
    pub samples_per_partition: usize,

    /// Fail reads that would have to visit more stores than this.
    pub max_read_fan_in: usize,
    /// Keep the overlapping store count at or below this.
    pub max_overlapping_store_count: usize,

    /// Preload chunk data into RAM.
    pub in_memory_mode: InMemoryMode,
    /// Size of the per-chunk lookup hash table; zero disables it.
    pub lookup_hash_table_size: usize,

    /// Master switch for compaction and partitioning.
    pub enable_compaction_and_partitioning: bool,
    /// Compact every store whose id counter is at or below this.
    pub forced_compaction_revision: Option<u32>,
    /// Compact stores older than this.
    pub auto_compaction_period: Option<Duration>,
}

impl Default for TableMountConfig {
    fn default() -> Self {
        TableMountConfig {
            retention: RetentionConfig::default(),
            max_dynamic_store_row_count: 1_000_000,
            max_dynamic_store_value_count: 10_000_000,
            max_dynamic_store_pool_size: 1 << 30,
            dynamic_store_auto_flush_period: Duration::from_secs(3600),
            max_partition_data_size: 256 << 20,
            desired_partition_data_size: 192 << 20,
            min_partition_data_size: 16 << 20,
            max_partition_count: 10_240,
            min_partitioning_store_count: 1,
            max_partitioning_store_count: 10,
            min_partitioning_data_size: 16 << 20,
            max_partitioning_data_size: 256 << 20,
            min_compaction_store_count: 3,
            max_compaction_store_count: 5,
            compaction_data_size_base: 16 << 20,
            compaction_data_size_ratio: 2.0,
            samples_per_partition: 1,
            max_read_fan_in: 20,
            max_overlapping_store_count: 30,
            in_memory_mode: InMemoryMode::None,
            lookup_hash_table_size: 0,
            enable_compaction_and_partitioning: true,
            forced_compaction_revision: None,
            auto_compaction_period: None,
        }
    }
}

impl TableMountConfig {
    /// Cross-field validation, run at mount and remount.
    pub fn validate(&self) -> MarlResult<()> {
        if self.min_partition_data_size >= self.desired_partition_data_size {
            return Err(MarlError::InvalidConfig(
                "min_partition_data_size must be less than desired_partition_data_size".into(),
            ));
        }
        if self.desired_partition_data_size >= self.max_partition_data_size {
            return Err(MarlError::InvalidConfig(
                "desired_partition_data_size must be less than max_partition_data_size".into(),
            ));
        }
        if self.max_compaction_store_count <= self.min_compaction_store_count {
            return Err(MarlError::InvalidConfig(
                "max_compaction_store_count must be greater than min_compaction_store_count".into(),
            ));
        }
        if self.compaction_data_size_ratio <= 1.0 {
            return Err(MarlError::InvalidConfig(
                "compaction_data_size_ratio must be greater than one".into(),
            ));
        }
        Ok(())
    }
}

/// Whether a tablet's chunk data is preloaded into RAM, and in which
/// form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InMemoryMode {
    /// Chunks are read from storage on demand.
    #[default]
    None,
    /// Compressed blocks are kept in RAM.
    Compressed,
    /// Blocks are decompressed at preload time.
    Uncompressed,
}

/// Tablet manager knobs shared by all tablets of a cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletManagerConfig {
    /// Initial allocation unit of a dynamic store; forced rotation is
    /// pointless below twice this.
    pub pool_chunk_size: usize,
    /// Upper bound on a single wait for a blocked row.
    pub max_blocked_row_wait: Duration,
    /// Cool-down after a failed background operation on a store.
    pub error_backoff: Duration,
}

impl Default for TabletManagerConfig {
    fn default() -> Self {
        TabletManagerConfig {
            pool_chunk_size: 64 << 10,
            max_blocked_row_wait: Duration::from_secs(5),
            error_backoff: Duration::from_secs(60),
        }
    }
}

/// Transaction manager knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionManagerConfig {
    /// Longest lease a client may request.
    pub max_transaction_timeout: Duration,
    /// Transactions older than this are aborted regardless of pings.
    pub max_transaction_duration: Duration,
    /// Period of the leader's barrier check.
    pub barrier_check_period: Duration,
    /// Capacity of the recently-aborted transaction id pool.
    pub max_aborted_transaction_pool_size: usize,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        TransactionManagerConfig {
            max_transaction_timeout: Duration::from_secs(60),
            max_transaction_duration: Duration::from_secs(60),
            barrier_check_period: Duration::from_millis(100),
            max_aborted_transaction_pool_size: 1000,
        }
    }
}

/// Store flusher knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreFlusherConfig {
    /// Threads in the flush pool.
    pub thread_pool_size: usize,
    /// Concurrent flushes across all tablets.
    pub max_concurrent_flushes: usize,
    /// Forced-rotation candidates must hold at least this much data.
    pub min_forced_flush_data_size: u64,
}

impl Default for StoreFlusherConfig {
    fn default() -> Self {
        StoreFlusherConfig {
            thread_pool_size: 1,
            max_concurrent_flushes: 1,
            min_forced_flush_data_size: 1 << 20,
        }
    }
}

/// Store compactor knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreCompactorConfig {
    /// Threads in the compaction pool.
    pub thread_pool_size: usize,
    /// Concurrent compactions across all tablets.
    pub max_concurrent_compactions: usize,
    /// Concurrent Eden partitionings across all tablets.
    pub max_concurrent_partitionings: usize,
    /// Writers kept alive at once while demultiplexing a partitioning.
    pub partitioning_writer_pool_size: usize,
}

impl Default for StoreCompactorConfig {
    fn default() -> Self {
        StoreCompactorConfig {
            thread_pool_size: 1,
            max_concurrent_compactions: 1,
            max_concurrent_partitionings: 1,
            partitioning_writer_pool_size: 4,
        }
    }
}

/// Store preloader knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorePreloaderConfig {
    /// Concurrent preloads across all tablets.
    pub max_concurrent_preloads: usize,
    /// Bytes requested per block-read window.
    pub window_size: u64,
    /// How long intercepted chunk data outlives its writer before being
    /// dropped if no store claims it.
    pub intercepted_data_retention_time: Duration,
}

impl Default for StorePreloaderConfig {
    fn default() -> Self {
        StorePreloaderConfig {
            max_concurrent_preloads: 1,
            window_size: 16 << 20,
            intercepted_data_retention_time: Duration::from_secs(60),
        }
    }
}

/// Partition balancer knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionBalancerConfig {
    /// Minimum samples a split needs.
    pub min_partitioning_sample_count: usize,
    /// Samples requested per split.
    pub max_partitioning_sample_count: usize,
    /// Concurrent sampling fetches.
    pub max_concurrent_samplings: usize,
    /// Minimum interval between samplings of one partition.
    pub resampling_period: Duration,
}

impl Default for PartitionBalancerConfig {
    fn default() -> Self {
        PartitionBalancerConfig {
            min_partitioning_sample_count: 10,
            max_partitioning_sample_count: 1000,
            max_concurrent_samplings: 8,
            resampling_period: Duration::from_secs(60),
        }
    }
}

/// Security manager knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityManagerConfig {
    /// How long a permission check result stays valid.
    pub table_permission_cache_ttl: Duration,
    /// How long a failed check stays cached.
    pub table_permission_cache_error_ttl: Duration,
}

impl Default for SecurityManagerConfig {
    fn default() -> Self {
        SecurityManagerConfig {
            table_permission_cache_ttl: Duration::from_secs(300),
            table_permission_cache_error_ttl: Duration::from_secs(15),
        }
    }
}

/// Top-level tablet node configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletNodeConfig {
    /// Tablet cell slots this node runs.
    pub slots: usize,
    /// Memory budget for all dynamic stores.
    pub memory_limit: u64,
    /// Fraction of `memory_limit` past which rotations are forced.
    pub forced_rotation_memory_ratio: f64,

    /// Tablet manager block.
    pub tablet_manager: TabletManagerConfig,
    /// Transaction manager block.
    pub transaction_manager: TransactionManagerConfig,
    /// Flusher block.
    pub store_flusher: StoreFlusherConfig,
    /// Compactor block.
    pub store_compactor: StoreCompactorConfig,
    /// Preloader block.
    pub store_preloader: StorePreloaderConfig,
    /// Balancer block.
    pub partition_balancer: PartitionBalancerConfig,
    /// Security block.
    pub security_manager: SecurityManagerConfig,
}

impl TabletNodeConfig {
    /// Validation of the whole node block.
    pub fn validate(&self) -> MarlResult<()> {
        if !(0.0..=1.0).contains(&self.forced_rotation_memory_ratio) {
            return Err(MarlError::InvalidConfig(
                "forced_rotation_memory_ratio must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        TableMountConfig::default().validate().unwrap();
        TabletNodeConfig {
            slots: 4,
            memory_limit: 1 << 30,
            forced_rotation_memory_ratio: 0.8,
            ..TabletNodeConfig::default()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn partition_size_triple_is_checked() {
        let config = TableMountConfig {
            min_partition_data_size: 300 << 20,
            ..TableMountConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn mount_config_deserializes_from_partial_json() {
        let config: TableMountConfig =
            serde_json::from_str(r#"{"max_read_fan_in": 5, "in_memory_mode": "Uncompressed"}"#)
                .unwrap();
        assert_eq!(config.max_read_fan_in, 5);
        assert_eq!(config.in_memory_mode, InMemoryMode::Uncompressed);
        assert_eq!(config.max_partition_count, 10_240);
    }
}
