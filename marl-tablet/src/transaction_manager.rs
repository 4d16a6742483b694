//! The transaction manager: ordering of prepares and commits, the
//! serialization barrier, and transaction leases.
//!
//! Two maps are kept: `persistent` transactions exist in the replicated
//! log and survive snapshots; `transient` transactions exist only on the
//! leader until their first persistent mutation promotes them. A
//! periodic leader task watches the minimum outstanding prepare
//! timestamp and, whenever it advances, commits a
//! `HandleTransactionBarrier` mutation; applying that mutation pops
//! committed transactions from a min-heap by commit timestamp and marks
//! them `Serialized` — the point where their writes become visible to
//! snapshot readers.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use marl_client::{Signature, TransactionId};
use marl_data::{Timestamp, MIN_TIMESTAMP, NULL_TIMESTAMP};
use marl_errors::{invariant, MarlError, MarlResult};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::TransactionManagerConfig;
use crate::interfaces::{TimestampProvider, TransactionSupervisor};
use crate::transaction::{RowRef, Transaction, TransactionState};

/// A bounded FIFO of recently-aborted transaction ids.
///
/// Creating a transient transaction with a pooled id fails, closing the
/// race where a write arriving after an abort could silently revive the
/// transaction.
#[derive(Debug, Default)]
struct TransactionIdPool {
    max_size: usize,
    id_set: HashSet<TransactionId>,
    id_queue: VecDeque<TransactionId>,
}

impl TransactionIdPool {
    fn new(max_size: usize) -> TransactionIdPool {
        TransactionIdPool {
            max_size,
            id_set: HashSet::new(),
            id_queue: VecDeque::new(),
        }
    }

    fn register(&mut self, id: TransactionId) {
        if self.id_set.insert(id) {
            self.id_queue.push_back(id);
        }
        while self.id_queue.len() > self.max_size {
            let expired = self.id_queue.pop_front().expect("non-empty queue");
            self.id_set.remove(&expired);
        }
    }

    fn is_registered(&self, id: TransactionId) -> bool {
        self.id_set.contains(&id)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SerializingEntry {
    commit_timestamp: Timestamp,
    id: TransactionId,
}

impl Ord for SerializingEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.commit_timestamp, self.id).cmp(&(other.commit_timestamp, other.id))
    }
}

impl PartialOrd for SerializingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// What happened to a transaction, reported back to the automaton so it
/// can visit the affected rows.
#[derive(Debug)]
pub enum TransactionEvent {
    /// The transaction was prepared; stamp the prepare timestamp onto
    /// its locked rows.
    Prepared {
        /// The transaction id.
        id: TransactionId,
        /// Its prepare timestamp.
        prepare_timestamp: Timestamp,
        /// Rows to stamp.
        locked_rows: Vec<RowRef>,
    },
    /// The transaction committed; publish its edits.
    Committed {
        /// The transaction id.
        id: TransactionId,
        /// Its commit timestamp.
        commit_timestamp: Timestamp,
        /// Rows to publish.
        locked_rows: Vec<RowRef>,
    },
    /// The transaction aborted; discard its edits.
    Aborted {
        /// The transaction id.
        id: TransactionId,
        /// Rows to roll back.
        locked_rows: Vec<RowRef>,
    },
    /// The transaction was serialized by a barrier.
    Serialized {
        /// The transaction id.
        id: TransactionId,
        /// Its commit timestamp.
        commit_timestamp: Timestamp,
    },
}

/// The transaction manager of one tablet cell.
pub struct TransactionManager {
    config: TransactionManagerConfig,
    timestamp_provider: Arc<dyn TimestampProvider>,

    persistent: HashMap<TransactionId, Transaction>,
    transient: HashMap<TransactionId, Transaction>,

    prepared: BTreeSet<(Timestamp, TransactionId)>,
    serializing: BinaryHeap<Reverse<SerializingEntry>>,
    last_serialized_commit_timestamp: Timestamp,
    transient_barrier_timestamp: Timestamp,

    abort_id_pool: TransactionIdPool,

    leases_enabled: bool,
    supervisor: Option<Arc<dyn TransactionSupervisor>>,
    lease_handles: HashMap<TransactionId, JoinHandle<()>>,
}

impl TransactionManager {
    /// Creates a manager with no transactions.
    pub fn new(
        config: TransactionManagerConfig,
        timestamp_provider: Arc<dyn TimestampProvider>,
    ) -> TransactionManager {
        let abort_id_pool = TransactionIdPool::new(config.max_aborted_transaction_pool_size);
        TransactionManager {
            config,
            timestamp_provider,
            persistent: HashMap::new(),
            transient: HashMap::new(),
            prepared: BTreeSet::new(),
            serializing: BinaryHeap::new(),
            last_serialized_commit_timestamp: MIN_TIMESTAMP,
            transient_barrier_timestamp: MIN_TIMESTAMP,
            abort_id_pool,
            leases_enabled: false,
            supervisor: None,
            lease_handles: HashMap::new(),
        }
    }

    /// Looks up a transaction in either map.
    pub fn find_transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.transient.get(&id).or_else(|| self.persistent.get(&id))
    }

    /// Looks up a transaction mutably in either map.
    pub fn find_transaction_mut(&mut self, id: TransactionId) -> Option<&mut Transaction> {
        if self.transient.contains_key(&id) {
            self.transient.get_mut(&id)
        } else {
            self.persistent.get_mut(&id)
        }
    }

    /// Looks up a transaction or fails with `NoSuchTransaction`.
    pub fn get_transaction(&self, id: TransactionId) -> MarlResult<&Transaction> {
        self.find_transaction(id)
            .ok_or_else(|| MarlError::NoSuchTransaction(id.to_string()))
    }

    fn get_persistent_mut(&mut self, id: TransactionId) -> MarlResult<&mut Transaction> {
        self.persistent
            .get_mut(&id)
            .ok_or_else(|| MarlError::NoSuchTransaction(id.to_string()))
    }

    /// Finds or lazily creates a transaction.
    pub fn get_or_create_transaction(
        &mut self,
        id: TransactionId,
        start_timestamp: Timestamp,
        timeout: Duration,
        transient: bool,
    ) -> MarlResult<&mut Transaction> {
        if self.transient.contains_key(&id) {
            return Ok(self.transient.get_mut(&id).expect("checked above"));
        }
        if self.persistent.contains_key(&id) {
            return Ok(self.persistent.get_mut(&id).expect("checked above"));
        }

        if transient && self.abort_id_pool.is_registered(id) {
            return Err(MarlError::TransactionAlreadyAborted(id.to_string()));
        }

        let timeout = timeout.min(self.config.max_transaction_timeout);
        let transaction = Transaction::new(id, start_timestamp, timeout, transient);
        debug!(
            transaction_id = %id,
            start_timestamp = %start_timestamp,
            transient,
            "transaction started"
        );

        let map = if transient {
            &mut self.transient
        } else {
            &mut self.persistent
        };
        map.insert(id, transaction);
        self.create_lease(id);
        Ok(self
            .find_transaction_mut(id)
            .expect("transaction was just inserted"))
    }

    /// Moves a transient transaction into the persistent map; the first
    /// replicated mutation referencing a transaction does this.
    pub fn make_transaction_persistent(&mut self, id: TransactionId) -> MarlResult<()> {
        if let Some(mut transaction) = self.transient.remove(&id) {
            transaction.transient = false;
            self.persistent.insert(id, transaction);
            debug!(transaction_id = %id, "transaction became persistent");
            return Ok(());
        }
        invariant!(
            self.persistent.contains_key(&id),
            "promoting unknown transaction {id}"
        );
        Ok(())
    }

    /// Accumulates a signature share.
    pub fn add_signature(&mut self, id: TransactionId, share: Signature, persistent: bool) {
        if let Some(transaction) = self.find_transaction_mut(id) {
            if persistent {
                transaction.persistent_signature.accumulate(share);
            }
            transaction.transient_signature.accumulate(share);
        }
    }

    /// Prepares a transaction for commit.
    ///
    /// Transient prepares happen on the leader before the commit
    /// mutation is sequenced; persistent prepares happen when it is.
    /// The only legal prepare of an already-prepared transaction is the
    /// persistent promotion of a transient prepare.
    pub fn prepare_commit(
        &mut self,
        id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
    ) -> MarlResult<TransactionEvent> {
        let transaction = self
            .find_transaction_mut(id)
            .ok_or_else(|| MarlError::NoSuchTransaction(id.to_string()))?;

        let state = if persistent {
            transaction.persistent_state
        } else {
            transaction.state
        };
        if state != TransactionState::Active
            && !(persistent && state == TransactionState::TransientCommitPrepared)
        {
            return Err(transaction.invalid_state_error());
        }

        let signature = if persistent {
            transaction.persistent_signature
        } else {
            transaction.transient_signature
        };
        if !signature.is_final() {
            return Err(MarlError::TransactionSignatureMismatch {
                id: id.to_string(),
                expected: marl_client::FINAL_SIGNATURE.0,
                actual: signature.0,
            });
        }

        if transaction.state == TransactionState::Active {
            invariant!(
                transaction.prepare_timestamp == NULL_TIMESTAMP,
                "active transaction {id} already carries a prepare timestamp"
            );
            transaction.prepare_timestamp = prepare_timestamp;
            transaction.state = if persistent {
                TransactionState::PersistentCommitPrepared
            } else {
                TransactionState::TransientCommitPrepared
            };
            if persistent {
                transaction.persistent_state = TransactionState::PersistentCommitPrepared;
            }
            let locked_rows: Vec<RowRef> = transaction.all_locked_rows().cloned().collect();
            let prepare_timestamp = transaction.prepare_timestamp;
            self.prepared.insert((prepare_timestamp, id));
            debug!(
                transaction_id = %id,
                persistent,
                prepare_timestamp = %prepare_timestamp,
                "transaction commit prepared"
            );
            return Ok(TransactionEvent::Prepared {
                id,
                prepare_timestamp,
                locked_rows,
            });
        }

        // Promotion of a transient prepare: the timestamp is already
        // registered; only the persistent state advances.
        transaction.state = TransactionState::PersistentCommitPrepared;
        transaction.persistent_state = TransactionState::PersistentCommitPrepared;
        let prepare_timestamp = transaction.prepare_timestamp;
        let locked_rows: Vec<RowRef> = transaction.all_locked_rows().cloned().collect();
        Ok(TransactionEvent::Prepared {
            id,
            prepare_timestamp,
            locked_rows,
        })
    }

    /// Marks an abort as pending on the leader, registering the id in
    /// the abort pool.
    pub fn prepare_abort(&mut self, id: TransactionId, force: bool) -> MarlResult<()> {
        self.abort_id_pool.register(id);
        let transaction = self
            .find_transaction_mut(id)
            .ok_or_else(|| MarlError::NoSuchTransaction(id.to_string()))?;
        if !transaction.is_active() && !force {
            return Err(transaction.invalid_state_error());
        }
        if transaction.is_active() {
            transaction.state = TransactionState::TransientAbortPrepared;
        }
        Ok(())
    }

    /// Commits a transaction at `commit_timestamp` and queues it for
    /// serialization.
    pub fn commit_transaction(
        &mut self,
        id: TransactionId,
        commit_timestamp: Timestamp,
    ) -> MarlResult<TransactionEvent> {
        let transaction = self.get_persistent_mut(id)?;

        if transaction.persistent_state == TransactionState::Committed {
            debug!(transaction_id = %id, "transaction is already committed");
            return Ok(TransactionEvent::Committed {
                id,
                commit_timestamp: transaction.commit_timestamp,
                locked_rows: Vec::new(),
            });
        }
        if transaction.persistent_state != TransactionState::Active
            && transaction.persistent_state != TransactionState::PersistentCommitPrepared
        {
            return Err(transaction.invalid_state_error());
        }

        transaction.commit_timestamp = commit_timestamp;
        transaction.state = TransactionState::Committed;
        transaction.persistent_state = TransactionState::Committed;
        let locked_rows: Vec<RowRef> = transaction.all_locked_rows().cloned().collect();
        let prepare_timestamp = transaction.prepare_timestamp;

        self.serializing.push(Reverse(SerializingEntry {
            commit_timestamp,
            id,
        }));
        if prepare_timestamp != NULL_TIMESTAMP {
            self.prepared.remove(&(prepare_timestamp, id));
        }
        self.close_lease(id);

        debug!(
            transaction_id = %id,
            commit_timestamp = %commit_timestamp,
            "transaction committed"
        );
        Ok(TransactionEvent::Committed {
            id,
            commit_timestamp,
            locked_rows,
        })
    }

    /// Aborts a transaction.
    pub fn abort_transaction(&mut self, id: TransactionId, force: bool) -> MarlResult<TransactionEvent> {
        let transaction = self.get_persistent_mut(id)?;
        if transaction.persistent_state == TransactionState::PersistentCommitPrepared && !force {
            return Err(transaction.invalid_state_error());
        }

        transaction.state = TransactionState::Aborted;
        transaction.persistent_state = TransactionState::Aborted;
        let locked_rows: Vec<RowRef> = transaction.all_locked_rows().cloned().collect();
        let prepare_timestamp = transaction.prepare_timestamp;
        if prepare_timestamp != NULL_TIMESTAMP {
            self.prepared.remove(&(prepare_timestamp, id));
        }
        self.close_lease(id);
        self.persistent.remove(&id);

        debug!(transaction_id = %id, force, "transaction aborted");
        Ok(TransactionEvent::Aborted { id, locked_rows })
    }

    /// Drops a transient transaction that never became persistent.
    pub fn drop_transaction(&mut self, id: TransactionId) -> MarlResult<Transaction> {
        self.close_lease(id);
        self.transient
            .remove(&id)
            .ok_or_else(|| MarlError::NoSuchTransaction(id.to_string()))
    }

    /// The minimum prepare timestamp still outstanding; the latest
    /// issued timestamp when nothing is prepared.
    pub fn min_prepare_timestamp(&self) -> Timestamp {
        match self.prepared.first() {
            Some((timestamp, _)) => *timestamp,
            None => self.timestamp_provider.latest(),
        }
    }

    /// Checks whether the barrier can advance; returns the new barrier
    /// timestamp if a `HandleTransactionBarrier` mutation should be
    /// committed. Leader only.
    pub fn check_barrier(&mut self) -> Option<Timestamp> {
        let min_prepare = self.min_prepare_timestamp();
        if min_prepare <= self.transient_barrier_timestamp {
            return None;
        }
        debug!(
            barrier_timestamp = %min_prepare,
            "committing transaction barrier"
        );
        self.transient_barrier_timestamp = min_prepare;
        Some(min_prepare)
    }

    /// Applies a barrier mutation: serializes every committed
    /// transaction with a commit timestamp at or below it.
    pub fn handle_transaction_barrier(
        &mut self,
        barrier_timestamp: Timestamp,
    ) -> MarlResult<Vec<TransactionEvent>> {
        let mut events = Vec::new();
        while let Some(Reverse(entry)) = self.serializing.peek() {
            if entry.commit_timestamp > barrier_timestamp {
                break;
            }
            let Reverse(entry) = self.serializing.pop().expect("peeked above");
            invariant!(
                entry.commit_timestamp > self.last_serialized_commit_timestamp,
                "serialization went backwards: {} after {}",
                entry.commit_timestamp,
                self.last_serialized_commit_timestamp
            );
            self.last_serialized_commit_timestamp = entry.commit_timestamp;

            if let Some(transaction) = self.persistent.get_mut(&entry.id) {
                transaction.state = TransactionState::Serialized;
                transaction.persistent_state = TransactionState::Serialized;
                debug!(
                    transaction_id = %entry.id,
                    commit_timestamp = %entry.commit_timestamp,
                    "transaction serialized"
                );
                self.persistent.remove(&entry.id);
                events.push(TransactionEvent::Serialized {
                    id: entry.id,
                    commit_timestamp: entry.commit_timestamp,
                });
            }
        }
        Ok(events)
    }

    /// Starts the leader epoch: re-creates leases for every revivable
    /// persistent transaction.
    pub fn start_leader_epoch(&mut self, supervisor: Arc<dyn TransactionSupervisor>) {
        debug_assert!(self.transient.is_empty());
        self.leases_enabled = true;
        self.supervisor = Some(supervisor);
        self.transient_barrier_timestamp = MIN_TIMESTAMP;

        let revivable: Vec<TransactionId> = self
            .persistent
            .values()
            .filter(|transaction| {
                matches!(
                    transaction.state,
                    TransactionState::Active | TransactionState::PersistentCommitPrepared
                )
            })
            .map(|transaction| transaction.id)
            .collect();
        for id in revivable {
            self.create_lease(id);
        }
    }

    /// Stops the leader epoch: drops transient transactions and rolls
    /// back transient prepares of persistent ones. Returns the events
    /// the automaton must apply (lock releases for dropped transients).
    pub fn stop_leader_epoch(&mut self) -> Vec<TransactionEvent> {
        self.leases_enabled = false;
        for (_, handle) in self.lease_handles.drain() {
            handle.abort();
        }
        self.supervisor = None;

        let mut events = Vec::new();
        for (id, transaction) in self.transient.drain() {
            if transaction.prepare_timestamp != NULL_TIMESTAMP {
                self.prepared.remove(&(transaction.prepare_timestamp, id));
            }
            events.push(TransactionEvent::Aborted {
                id,
                locked_rows: transaction.all_locked_rows().cloned().collect(),
            });
        }

        for transaction in self.persistent.values_mut() {
            if transaction.state == TransactionState::TransientCommitPrepared {
                self.prepared
                    .remove(&(transaction.prepare_timestamp, transaction.id));
                transaction.prepare_timestamp = NULL_TIMESTAMP;
            }
            transaction.state = transaction.persistent_state;
            transaction.transient_signature = transaction.persistent_signature;
            transaction.has_lease = false;
        }
        events
    }

    /// Transactions in either map; test and introspection hook.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transient.values().chain(self.persistent.values())
    }

    /// Serializes the persistent map for a snapshot.
    pub fn save(&self) -> (Vec<Transaction>, Timestamp) {
        let mut transactions: Vec<Transaction> = self.persistent.values().cloned().collect();
        transactions.sort_by_key(|transaction| transaction.id);
        (transactions, self.last_serialized_commit_timestamp)
    }

    /// Restores the persistent map from a snapshot, rebuilding the
    /// prepared set and the serializing heap.
    pub fn load(&mut self, transactions: Vec<Transaction>, last_serialized: Timestamp) {
        self.persistent.clear();
        self.transient.clear();
        self.prepared.clear();
        self.serializing.clear();
        self.last_serialized_commit_timestamp = last_serialized;

        for transaction in transactions {
            if transaction.state == TransactionState::Committed {
                self.serializing.push(Reverse(SerializingEntry {
                    commit_timestamp: transaction.commit_timestamp,
                    id: transaction.id,
                }));
            }
            if transaction.is_prepared() && !transaction.is_committed() {
                self.prepared
                    .insert((transaction.prepare_timestamp, transaction.id));
            }
            self.persistent.insert(transaction.id, transaction);
        }
    }

    fn create_lease(&mut self, id: TransactionId) {
        if !self.leases_enabled {
            return;
        }
        let timeout = {
            let Some(transaction) = self.find_transaction_mut(id) else {
                return;
            };
            if transaction.has_lease {
                return;
            }
            transaction.has_lease = true;
            transaction.timeout
        };
        let timeout = timeout.min(self.config.max_transaction_duration);
        let supervisor = Arc::clone(self.supervisor.as_ref().expect("leases require supervisor"));

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // The abort is replicated, not local: the supervisor
            // broadcasts it to every participant.
            if let Err(error) = supervisor.abort_transaction(id).await {
                warn!(transaction_id = %id, %error, "error aborting expired transaction");
            }
        });
        self.lease_handles.insert(id, handle);
    }

    fn close_lease(&mut self, id: TransactionId) {
        if let Some(handle) = self.lease_handles.remove(&id) {
            handle.abort();
        }
        if let Some(transaction) = self.find_transaction_mut(id) {
            transaction.has_lease = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use marl_client::FINAL_SIGNATURE;

    use super::*;

    struct FixedTimestamps(Timestamp);

    #[async_trait::async_trait]
    impl TimestampProvider for FixedTimestamps {
        async fn generate(&self) -> MarlResult<Timestamp> {
            Ok(self.0)
        }
        fn latest(&self) -> Timestamp {
            self.0
        }
    }

    fn manager() -> TransactionManager {
        TransactionManager::new(
            TransactionManagerConfig::default(),
            Arc::new(FixedTimestamps(Timestamp(1000))),
        )
    }

    fn started(manager: &mut TransactionManager, start: u64) -> TransactionId {
        let id = TransactionId::generate();
        let transaction = manager
            .get_or_create_transaction(id, Timestamp(start), Duration::from_secs(10), false)
            .unwrap();
        transaction.persistent_signature = FINAL_SIGNATURE;
        transaction.transient_signature = FINAL_SIGNATURE;
        id
    }

    #[test]
    fn prepare_requires_final_signature() {
        let mut manager = manager();
        let id = TransactionId::generate();
        manager
            .get_or_create_transaction(id, Timestamp(100), Duration::from_secs(10), false)
            .unwrap();

        let error = manager.prepare_commit(id, true, Timestamp(110)).unwrap_err();
        assert!(matches!(
            error,
            MarlError::TransactionSignatureMismatch { .. }
        ));
    }

    #[test]
    fn barrier_serializes_in_commit_order() {
        let mut manager = manager();
        let tx1 = started(&mut manager, 100);
        let tx2 = started(&mut manager, 101);

        manager.prepare_commit(tx1, true, Timestamp(110)).unwrap();
        manager.prepare_commit(tx2, true, Timestamp(111)).unwrap();
        assert_eq!(manager.min_prepare_timestamp(), Timestamp(110));

        manager.commit_transaction(tx2, Timestamp(120)).unwrap();
        // tx1 is still prepared below tx2's commit timestamp, so the
        // barrier cannot pass 110 and tx2 stays unserialized.
        assert_eq!(manager.min_prepare_timestamp(), Timestamp(110));
        let barrier = manager.check_barrier();
        assert_eq!(barrier, None);

        manager.commit_transaction(tx1, Timestamp(115)).unwrap();
        let barrier = manager.check_barrier().unwrap();
        assert_eq!(barrier, Timestamp(1000));

        let events = manager.handle_transaction_barrier(barrier).unwrap();
        let serialized: Vec<Timestamp> = events
            .iter()
            .map(|event| match event {
                TransactionEvent::Serialized {
                    commit_timestamp, ..
                } => *commit_timestamp,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(serialized, vec![Timestamp(115), Timestamp(120)]);
        assert!(manager.find_transaction(tx1).is_none());
        assert!(manager.find_transaction(tx2).is_none());
    }

    #[test]
    fn barrier_leaves_later_commits_queued() {
        let mut manager = manager();
        let tx1 = started(&mut manager, 100);
        manager.prepare_commit(tx1, true, Timestamp(110)).unwrap();
        manager.commit_transaction(tx1, Timestamp(115)).unwrap();

        let events = manager.handle_transaction_barrier(Timestamp(114)).unwrap();
        assert!(events.is_empty());
        assert!(manager.find_transaction(tx1).is_some());

        let events = manager.handle_transaction_barrier(Timestamp(115)).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn aborted_id_cannot_be_revived_transiently() {
        let mut manager = manager();
        let id = TransactionId::generate();
        manager
            .get_or_create_transaction(id, Timestamp(100), Duration::from_secs(10), false)
            .unwrap();
        manager.prepare_abort(id, false).unwrap();
        manager.abort_transaction(id, true).unwrap();

        let error = manager
            .get_or_create_transaction(id, Timestamp(200), Duration::from_secs(10), true)
            .unwrap_err();
        assert!(matches!(error, MarlError::TransactionAlreadyAborted(_)));

        // Persistent creation (mutation replay) is still allowed.
        manager
            .get_or_create_transaction(id, Timestamp(200), Duration::from_secs(10), false)
            .unwrap();
    }

    #[test]
    fn commit_of_prepared_abort_is_rejected() {
        let mut manager = manager();
        let id = started(&mut manager, 100);
        manager.prepare_commit(id, true, Timestamp(110)).unwrap();
        let error = manager.abort_transaction(id, false).unwrap_err();
        assert!(matches!(
            error,
            MarlError::InvalidTransactionState { .. }
        ));
        manager.abort_transaction(id, true).unwrap();
    }

    #[test]
    fn save_load_round_trips_persistent_state() {
        let mut manager = manager();
        let tx1 = started(&mut manager, 100);
        let tx2 = started(&mut manager, 101);
        manager.prepare_commit(tx1, true, Timestamp(110)).unwrap();
        manager.prepare_commit(tx2, true, Timestamp(111)).unwrap();
        manager.commit_transaction(tx2, Timestamp(120)).unwrap();

        let (saved, last_serialized) = manager.save();
        let mut restored = self::manager();
        restored.load(saved, last_serialized);

        assert_eq!(restored.min_prepare_timestamp(), Timestamp(110));
        assert!(restored.find_transaction(tx2).is_some());

        // The restored heap still serializes tx2 once the barrier
        // passes its commit timestamp.
        restored.commit_transaction(tx1, Timestamp(115)).unwrap();
        let events = restored.handle_transaction_barrier(Timestamp(130)).unwrap();
        assert_eq!(events.len(), 2);
    }
}
