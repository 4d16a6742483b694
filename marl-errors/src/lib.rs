//! Error types for all of Marl.
//!
//! Every fallible operation in the workspace returns [`MarlResult`]. The
//! single [`MarlError`] enum doubles as the wire-visible error taxonomy:
//! variants carry their attributes as typed fields so callers (and tests)
//! can match on them instead of parsing messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for all Marl operations.
pub type MarlResult<T> = Result<T, MarlError>;

/// An error that can occur in the tablet node core.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MarlError {
    /// A write ran into a row lock held by a conflicting transaction, or
    /// into a lock group committed after the writer's start timestamp.
    ///
    /// Retriable by the client with a fresh start timestamp.
    #[error(
        "transaction lock conflict on key {key} (holder: {holder_id:?}, \
         last commit timestamp: {last_commit_timestamp})"
    )]
    TransactionLockConflict {
        /// Formatted row key the conflict occurred on.
        key: String,
        /// Id of the conflicting holder, if one is still active.
        holder_id: Option<String>,
        /// Raw value of the lock group's last commit timestamp.
        last_commit_timestamp: u64,
    },

    /// The referenced transaction is not known to this tablet cell.
    #[error("no such transaction {0}")]
    NoSuchTransaction(String),

    /// A transaction was asked to make a transition its current state does
    /// not allow.
    #[error("transaction {id} is in state {state}, which forbids this operation")]
    InvalidTransactionState {
        /// Transaction id.
        id: String,
        /// Current state name.
        state: String,
    },

    /// Commit was requested before all fragments of the transaction arrived.
    #[error("transaction {id} is incomplete: expected signature {expected:#x}, actual {actual:#x}")]
    TransactionSignatureMismatch {
        /// Transaction id.
        id: String,
        /// The final signature commit requires.
        expected: u32,
        /// The signature accumulated so far.
        actual: u32,
    },

    /// A transient transaction with a recently-aborted id was about to be
    /// revived.
    #[error("abort was requested for transaction {0}")]
    TransactionAlreadyAborted(String),

    /// Too many stores overlap the requested range; compaction is behind.
    #[error("read fan-in limit exceeded; please wait until your data is merged")]
    ReadFanInExceeded {
        /// Tablet the read targeted.
        tablet_id: String,
        /// Number of stores the read would have to visit.
        fan_in: usize,
        /// Configured limit.
        fan_in_limit: usize,
    },

    /// The request queue of the target service is full.
    ///
    /// Retried by the RPC layer with exponential backoff iff the client
    /// opted in via `retry_request_queue_size_limit_exceeded`.
    #[error("request queue size limit exceeded")]
    RequestQueueSizeLimitExceeded,

    /// A chunk required to serve the request could not be read.
    #[error("chunk {0} is unavailable")]
    ChunkUnavailable(String),

    /// The authenticated user lacks the required permission.
    #[error("user {user} lacks {permission} permission for table {table_id}")]
    AuthorizationError {
        /// Table the check ran against.
        table_id: String,
        /// User name.
        user: String,
        /// Permission name.
        permission: String,
    },

    /// The target tablet is not in the mounted state.
    #[error("tablet {tablet_id} is not mounted (state: {state})")]
    TabletNotMounted {
        /// Tablet id.
        tablet_id: String,
        /// Current tablet state name.
        state: String,
    },

    /// A request carried a stale mount revision.
    #[error(
        "invalid mount revision of tablet {tablet_id}: expected {expected:#x}, received {actual:#x}"
    )]
    InvalidMountRevision {
        /// Tablet id.
        tablet_id: String,
        /// The tablet's current mount revision.
        expected: u64,
        /// The revision the request carried.
        actual: u64,
    },

    /// A checked state transition found the entity in an unexpected state.
    #[error("{entity} is in state {actual}, expected {expected}")]
    InvalidState {
        /// Description of the entity (partition, store, ...).
        entity: String,
        /// State the caller expected.
        expected: String,
        /// State actually observed.
        actual: String,
    },

    /// A malformed row arrived in a write or lookup request.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// A malformed or unsupported wire command was received.
    #[error("invalid wire command: {0}")]
    InvalidWireCommand(String),

    /// A config block failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An internal invariant was violated. Always indicates a bug; the
    /// affected tablet is crashed rather than allowed to persist corrupt
    /// state.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl MarlError {
    /// Returns true iff the client may retry the failed operation verbatim
    /// after backing off.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            MarlError::TransactionLockConflict { .. }
                | MarlError::RequestQueueSizeLimitExceeded
                | MarlError::ChunkUnavailable(_)
        )
    }

    /// Returns true iff this error indicates a bug in the tablet node
    /// itself rather than a bad request or transient condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MarlError::Internal(_))
    }
}

/// Wrapper for an error plus the chain of errors that caused it.
///
/// Background tasks wrap the inner failure so that the log line at the
/// outermost catch site still shows where the failure originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorChain {
    /// The outermost error.
    pub error: MarlError,
    /// Inner errors, outermost first.
    pub inner: Vec<MarlError>,
}

impl ErrorChain {
    /// Wraps `error` with no inner chain.
    pub fn new(error: MarlError) -> Self {
        ErrorChain {
            error,
            inner: Vec::new(),
        }
    }

    /// Pushes `error` on top of the chain, demoting the current outermost
    /// error to the inner list.
    pub fn wrap(mut self, error: MarlError) -> Self {
        self.inner.insert(0, std::mem::replace(&mut self.error, error));
        self
    }
}

impl fmt::Display for ErrorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        for inner in &self.inner {
            write!(f, "; caused by: {inner}")?;
        }
        Ok(())
    }
}

impl From<MarlError> for ErrorChain {
    fn from(error: MarlError) -> Self {
        ErrorChain::new(error)
    }
}

/// Constructs a [`MarlError::Internal`] from format arguments.
#[macro_export]
macro_rules! internal_err {
    ($($format_args:tt)*) => {
        $crate::MarlError::Internal(format!($($format_args)*))
    };
}

/// Returns a [`MarlError::Internal`] from the enclosing function.
#[macro_export]
macro_rules! internal {
    ($($format_args:tt)*) => {
        return Err($crate::internal_err!($($format_args)*).into())
    };
}

/// Checks a condition that can only be false if there is a bug, returning
/// [`MarlError::Internal`] if it does not hold.
#[macro_export]
macro_rules! invariant {
    ($expr:expr, $($format_args:tt)+) => {
        if !$expr {
            $crate::internal!($($format_args)+)
        }
    };
    ($expr:expr) => {
        if !$expr {
            $crate::internal!("assertion failed: {}", stringify!($expr))
        }
    };
}

/// Like [`invariant!`], comparing two expressions for equality.
#[macro_export]
macro_rules! invariant_eq {
    ($lhs:expr, $rhs:expr $(,)?) => {
        match (&$lhs, &$rhs) {
            (lhs, rhs) if lhs == rhs => {}
            (lhs, rhs) => $crate::internal!(
                "assertion failed: {} == {} (left: {:?}, right: {:?})",
                stringify!($lhs),
                stringify!($rhs),
                lhs,
                rhs
            ),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_invariant() -> MarlResult<()> {
        invariant!(1 + 1 == 3, "arithmetic is broken");
        Ok(())
    }

    #[test]
    fn invariant_macro_returns_internal() {
        let err = fails_invariant().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("arithmetic is broken"));
    }

    #[test]
    fn retriability() {
        assert!(MarlError::RequestQueueSizeLimitExceeded.is_retriable());
        assert!(!MarlError::NoSuchTransaction("abc".into()).is_retriable());
        assert!(!MarlError::RequestQueueSizeLimitExceeded.is_fatal());
    }

    #[test]
    fn chain_display_includes_causes() {
        let chain = ErrorChain::new(MarlError::ChunkUnavailable("c1".into()))
            .wrap(internal_err!("flush failed"));
        let rendered = chain.to_string();
        assert!(rendered.contains("flush failed"));
        assert!(rendered.contains("caused by"));
        assert!(rendered.contains("c1"));
    }
}
