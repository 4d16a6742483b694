use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether writes in a transaction take locks and go through two-phase
/// commit, or carry their own commit timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atomicity {
    /// Locked, two-phase writes.
    #[default]
    Full,
    /// Lock-free writes with caller-supplied commit timestamps.
    None,
}

/// Durability requested for a write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Acknowledge once the mutation is in the replicated log.
    #[default]
    Sync,
    /// Acknowledge as soon as the mutation is accepted locally.
    Async,
}

/// Per-write options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletWriteOptions {
    /// Write atomicity.
    #[serde(default)]
    pub atomicity: Atomicity,
    /// Write durability.
    #[serde(default)]
    pub durability: Durability,
    /// Prelock rows while the batch is decoded, before the mutation is
    /// committed to the log.
    #[serde(default = "default_true")]
    pub prelock: bool,
}

fn default_true() -> bool {
    true
}

/// Client-side behavior knobs for talking to tablet cells.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletServiceOptions {
    /// Retry `RequestQueueSizeLimitExceeded` responses with exponential
    /// backoff instead of surfacing them.
    #[serde(default)]
    pub retry_request_queue_size_limit_exceeded: bool,
    /// First backoff delay for such retries.
    #[serde(default = "default_backoff")]
    pub retry_backoff: Duration,
    /// Upper bound on the backoff delay.
    #[serde(default = "default_max_backoff")]
    pub max_retry_backoff: Duration,
}

fn default_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

impl Default for TabletServiceOptions {
    fn default() -> Self {
        TabletServiceOptions {
            retry_request_queue_size_limit_exceeded: false,
            retry_backoff: default_backoff(),
            max_retry_backoff: default_max_backoff(),
        }
    }
}
