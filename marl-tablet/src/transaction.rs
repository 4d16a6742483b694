//! Transactions as the tablet cell sees them.

use std::collections::VecDeque;
use std::time::Duration;

use marl_client::{Signature, StoreId, TabletId, TransactionId, INITIAL_SIGNATURE};
use marl_data::{Key, Timestamp, UnversionedRow, NULL_TIMESTAMP};
use marl_errors::MarlError;
use serde::{Deserialize, Serialize};
use strum::Display;

/// State of a transaction.
///
/// The legal transitions are:
/// `Active → TransientCommitPrepared → PersistentCommitPrepared`,
/// `Active → PersistentCommitPrepared`,
/// `{Active, PersistentCommitPrepared} → Committed → Serialized`,
/// `Active → TransientAbortPrepared → Aborted`, and any state
/// `→ Aborted` under force. Anything else is rejected with
/// `InvalidTransactionState`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum TransactionState {
    /// Accepting writes.
    Active,
    /// Commit-prepared on the leader only; rolled back on leadership
    /// loss.
    TransientCommitPrepared,
    /// Commit-prepared through the replicated log.
    PersistentCommitPrepared,
    /// Abort-prepared on the leader only.
    TransientAbortPrepared,
    /// Committed; awaiting serialization by the barrier.
    Committed,
    /// Serialized: no transaction with a smaller commit timestamp can
    /// still commit.
    Serialized,
    /// Aborted.
    Aborted,
}

/// Handle to a row a transaction holds locks on.
///
/// Stores are referenced by id, not by pointer: the row is re-resolved
/// through the tablet's store set on every access, which keeps rotation
/// and store removal free of dangling references.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRef {
    /// The tablet owning the row.
    pub tablet_id: TabletId,
    /// The dynamic store the row lives in.
    pub store_id: StoreId,
    /// The row key.
    pub key: Key,
}

/// A buffered write applied at commit time (ordered tablets and
/// lockless sorted writes).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteLogRecord {
    /// Write one row.
    Write {
        /// Target tablet.
        tablet_id: TabletId,
        /// The row.
        row: UnversionedRow,
    },
    /// Delete one row by key.
    Delete {
        /// Target tablet.
        tablet_id: TabletId,
        /// The key.
        key: Key,
    },
}

/// A transaction participating in this tablet cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id.
    pub id: TransactionId,
    /// Snapshot timestamp the transaction reads at.
    pub start_timestamp: Timestamp,
    /// Lease length.
    pub timeout: Duration,
    /// Created on the leader outside the replicated log.
    pub transient: bool,

    /// Current state, including leader-only transient states.
    pub state: TransactionState,
    /// State as the replicated log knows it; transient prepares roll
    /// back to this on leadership loss.
    pub persistent_state: TransactionState,

    /// Prepare timestamp, [`NULL_TIMESTAMP`] until prepared.
    pub prepare_timestamp: Timestamp,
    /// Commit timestamp, [`NULL_TIMESTAMP`] until committed.
    pub commit_timestamp: Timestamp,

    /// Signature accumulated through the replicated log.
    pub persistent_signature: Signature,
    /// Signature accumulated on the leader.
    pub transient_signature: Signature,

    /// Rows whose locks this transaction confirmed through the log.
    pub locked_rows: Vec<RowRef>,
    /// Rows locked during request decoding, confirmed on mutation
    /// application.
    pub prelocked_rows: VecDeque<RowRef>,

    /// Locked sorted writes, replayed on recovery.
    pub immediate_locked_write_log: Vec<WriteLogRecord>,
    /// Lockless sorted writes, applied at commit.
    pub immediate_lockless_write_log: Vec<WriteLogRecord>,
    /// Ordered-tablet writes, applied at commit in signature order.
    pub delayed_write_log: Vec<WriteLogRecord>,

    /// A lease is registered for this transaction on the leader.
    #[serde(skip)]
    pub has_lease: bool,
}

impl Transaction {
    /// Creates a fresh active transaction.
    pub fn new(
        id: TransactionId,
        start_timestamp: Timestamp,
        timeout: Duration,
        transient: bool,
    ) -> Transaction {
        Transaction {
            id,
            start_timestamp,
            timeout,
            transient,
            state: TransactionState::Active,
            persistent_state: TransactionState::Active,
            prepare_timestamp: NULL_TIMESTAMP,
            commit_timestamp: NULL_TIMESTAMP,
            persistent_signature: INITIAL_SIGNATURE,
            transient_signature: INITIAL_SIGNATURE,
            locked_rows: Vec::new(),
            prelocked_rows: VecDeque::new(),
            immediate_locked_write_log: Vec::new(),
            immediate_lockless_write_log: Vec::new(),
            delayed_write_log: Vec::new(),
            has_lease: false,
        }
    }

    /// True while the transaction still accepts writes.
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// True once a prepare timestamp is assigned and commit has not
    /// happened.
    pub fn is_prepared(&self) -> bool {
        matches!(
            self.state,
            TransactionState::TransientCommitPrepared | TransactionState::PersistentCommitPrepared
        )
    }

    /// True once committed (or serialized).
    pub fn is_committed(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Committed | TransactionState::Serialized
        )
    }

    /// The error describing an operation illegal in the current state.
    pub fn invalid_state_error(&self) -> MarlError {
        MarlError::InvalidTransactionState {
            id: self.id.to_string(),
            state: self.state.to_string(),
        }
    }

    /// All row refs this transaction holds locks on, locked first.
    pub fn all_locked_rows(&self) -> impl Iterator<Item = &RowRef> {
        self.locked_rows.iter().chain(self.prelocked_rows.iter())
    }
}
