//! `Universe`: the concurrent store of object histories, and the mint for transactions and
//! coordinators (§4.6).
//!
//! Holds three concurrent maps (objects, live transactions, and the [`CoordinatorTable`]'s own
//! internal map), one dedicated lock for `historyStart`, and the two commit/abort callback FIFOs
//! described in §3. No method here ever calls back into application code while holding a lock:
//! `TransactionListener` callbacks are queued by [`crate::transaction::Transaction`] and drained by
//! [`Universe::drain_callbacks`] once the triggering public call has released every lockable it
//! touched.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::coordinator::CoordinatorTable;
use crate::error::EngineError;
use crate::id::{CoordinatorId, IdAllocator, ObjectId, TransactionId};
use crate::object::ObjectData;
use crate::time::Instant;
use crate::transaction::{Transaction, TransactionListener};

type FxMap<K, V> = DashMap<K, V, foldhash::fast::FixedState>;

/// A point-in-time snapshot of the universe's size, for observability (§10's introspection
/// addition; not part of the transactional API).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UniverseStats {
    pub object_count: usize,
    pub live_transaction_count: usize,
    pub history_start: Instant,
    pub history_end: Instant,
}

pub struct Universe<S> {
    history_start: Mutex<Instant>,
    objects: FxMap<ObjectId, Arc<ObjectData<S>>>,
    transactions: FxMap<TransactionId, Arc<Transaction<S>>>,
    coordinators: CoordinatorTable,
    id_alloc: Arc<IdAllocator>,
    commit_callbacks: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    abort_callbacks: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
}

impl<S> Universe<S> {
    /// Creates a fresh universe with no objects and the given `historyStart`. `historyStart` may
    /// later be advanced with [`Self::set_history_start`], but never regressed.
    pub fn new(history_start: Instant) -> Arc<Self> {
        let id_alloc = Arc::new(IdAllocator::new());
        Arc::new(Universe {
            history_start: Mutex::new(history_start),
            objects: DashMap::default(),
            transactions: DashMap::default(),
            coordinators: CoordinatorTable::new(id_alloc.clone()),
            id_alloc,
            commit_callbacks: Mutex::new(VecDeque::new()),
            abort_callbacks: Mutex::new(VecDeque::new()),
        })
    }

    /// `beginTransaction(listener)`: allocates a fresh single-member coordinator and a transaction
    /// in `Reading`, and records it in the live-transaction map.
    pub fn begin_transaction(
        self: &Arc<Self>,
        listener: Option<Arc<dyn TransactionListener>>,
    ) -> Arc<Transaction<S>> {
        let tx_id = self.id_alloc.next_transaction_id();
        let lockable_id = self.id_alloc.next_lockable_id();
        let coordinator = self.coordinators.create(tx_id);
        let tx = Arc::new(Transaction::new(tx_id, lockable_id, coordinator.id, self.clone(), listener));
        self.transactions.insert(tx_id, tx.clone());
        tracing::debug!(tx_id = ?tx_id, coordinator_id = ?coordinator.id, "transaction begun");
        tx
    }

    pub fn history_start(&self) -> Instant {
        *self.history_start.lock()
    }

    /// `historyEnd`: the greatest instant up to which every object is known-committed, i.e.
    /// `max(historyStart, min over all objects of latestCommit)`. The empty universe's history end
    /// is `END_OF_TIME` (nothing constrains it).
    pub fn history_end(&self) -> Instant {
        self.history_end_given(self.history_start())
    }

    fn history_end_given(&self, start: Instant) -> Instant {
        let min_commit = self.objects.iter().map(|e| e.value().latest_commit()).min();
        match min_commit {
            Some(m) => m.max(start),
            None => Instant::END_OF_TIME,
        }
    }

    /// `setHistoryStart(t)`: requires `historyStart <= t <= historyEnd`. Older records may remain
    /// but are not guaranteed complete; reads before the new bound subsequently fail with
    /// [`EngineError::Prehistory`].
    pub fn set_history_start(&self, t: Instant) -> Result<(), EngineError> {
        let mut guard = self.history_start.lock();
        if t < *guard {
            return Err(EngineError::InvalidArgument(format!(
                "historyStart must not regress: {t} < current {guard}"
            )));
        }
        let end = self.history_end_given(*guard);
        if t > end {
            return Err(EngineError::InvalidArgument(format!(
                "historyStart {t} must not exceed historyEnd {end}"
            )));
        }
        *guard = t;
        Ok(())
    }

    /// Every object id the universe currently knows about (has ever had a write attempted for).
    /// Used by the engine's driver bootstrap (§4.7's "every currently-known object") and tests.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.iter().map(|e| *e.key()).collect()
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        self.objects.contains_key(&object)
    }

    /// The `latestCommit` of `object`, or `START_OF_TIME` if the universe has never seen it. Used
    /// by [`crate::engine::SimulationEngine`]'s drivers to find `whenPrev` without minting an
    /// `ObjectData` for an object that may never actually get created.
    pub(crate) fn latest_commit_of(&self, object: ObjectId) -> Instant {
        self.objects.get(&object).map(|d| d.latest_commit()).unwrap_or(Instant::START_OF_TIME)
    }

    pub fn stats(&self) -> UniverseStats {
        UniverseStats {
            object_count: self.objects.len(),
            live_transaction_count: self.transactions.len(),
            history_start: self.history_start(),
            history_end: self.history_end(),
        }
    }

    pub(crate) fn object_data_or_create(&self, object: ObjectId) -> Arc<ObjectData<S>> {
        if let Some(existing) = self.objects.get(&object) {
            return existing.clone();
        }
        self.objects
            .entry(object)
            .or_insert_with(|| Arc::new(ObjectData::new(self.id_alloc.next_lockable_id())))
            .clone()
    }

    pub(crate) fn coordinators(&self) -> &CoordinatorTable {
        &self.coordinators
    }

    pub(crate) fn coordinator_of(&self, tx: TransactionId) -> Option<CoordinatorId> {
        self.transactions.get(&tx).map(|t| t.coordinator_id())
    }

    /// Fixes up the `coordinator` field of every transaction that [`CoordinatorTable::merge`] (via
    /// `add_predecessor` or an explicit `merge`) folded into a new survivor coordinator.
    pub(crate) fn apply_retarget(&self, retargeted: Vec<TransactionId>) {
        for tx_id in retargeted {
            if let Some(tx) = self.transactions.get(&tx_id) {
                let resolved = self.coordinators.resolve(tx.coordinator_id());
                tx.set_coordinator(resolved);
            }
        }
    }

    pub(crate) fn abort_transaction(&self, tx: TransactionId) {
        if let Some(t) = self.transactions.get(&tx) {
            t.clone().begin_abort();
        }
    }

    pub(crate) fn clear_past_the_end_read(&self, tx: TransactionId, object: ObjectId)
    where
        S: PartialEq,
    {
        let coordinator = {
            let Some(t) = self.transactions.get(&tx) else {
                return;
            };
            t.clear_past_the_end_read(object);
            t.coordinator_id()
        };
        self.try_commit_coordinator(coordinator);
    }

    /// `commitIfPossible`: permitted iff the coordinator has no predecessors and every mutual
    /// transaction is `Committing` with no outstanding past-the-end reads. On success, commits
    /// every mutual transaction, then recursively offers every successor coordinator the same
    /// chance (having just lost a predecessor edge).
    pub(crate) fn try_commit_coordinator(&self, id: CoordinatorId)
    where
        S: PartialEq,
    {
        let resolved = self.coordinators.resolve(id);
        let Some(coordinator) = self.coordinators.try_get(resolved) else {
            return;
        };
        if coordinator.has_predecessors() {
            return;
        }
        let mutuals = coordinator.mutual_transactions();
        let all_ready = mutuals
            .iter()
            .all(|txid| self.transactions.get(txid).map(|t| t.is_ready_to_commit()).unwrap_or(false));
        if !all_ready {
            return;
        }

        tracing::debug!(coordinator_id = ?resolved, transactions = mutuals.len(), "coordinator committing");
        for txid in &mutuals {
            if let Some(tx) = self.transactions.get(txid) {
                tx.finalize_commit();
            }
        }

        let successors = coordinator.successors();
        for succ in successors {
            self.coordinators.remove_predecessor(succ, resolved);
            self.try_commit_coordinator(succ);
        }
        self.coordinators.retire(resolved);
    }

    /// `beginAbort`'s cascade: every mutual transaction aborts, every predecessor is relieved of
    /// the now-moot successor edge, and every successor is forced to abort in turn (it depended on
    /// a write that will never happen).
    pub(crate) fn abort_coordinator(&self, id: CoordinatorId)
    where
        S: PartialEq,
    {
        let resolved = self.coordinators.resolve(id);
        let Some(coordinator) = self.coordinators.try_get(resolved) else {
            return;
        };

        tracing::warn!(coordinator_id = ?resolved, "coordinator aborting");
        for txid in coordinator.mutual_transactions() {
            if let Some(tx) = self.transactions.get(&txid) {
                if tx.mark_aborting() {
                    tx.finalize_abort();
                }
            }
        }

        for pred in coordinator.predecessors() {
            self.coordinators.remove_successor(pred, resolved);
        }
        for succ in coordinator.successors() {
            self.coordinators.remove_predecessor(succ, resolved);
            self.abort_coordinator(succ);
        }
        self.coordinators.retire(resolved);
    }

    /// Drops `tx` from the live-transaction map and from its coordinator's mutual-transaction set.
    /// Only called once `tx` has actually reached `Committed` or `Aborted` — never while it is
    /// merely `Committing`, since other transactions may still need to resolve its coordinator.
    pub(crate) fn retire_transaction(&self, tx: TransactionId) {
        if let Some((_, t)) = self.transactions.remove(&tx) {
            let coordinator = t.coordinator_id();
            self.coordinators.remove_mutual(coordinator, tx);
            self.coordinators.retire(coordinator);
        }
    }

    /// Deletes an `ObjectData` entirely once a rollback has left its history empty. Safe to call
    /// speculatively: if another transaction has since started writing the same object again, the
    /// next `object_data_or_create` simply mints a fresh one.
    pub(crate) fn retire_object(&self, object: ObjectId) {
        self.objects.remove(&object);
    }

    pub(crate) fn enqueue_commit_callback(&self, cb: Box<dyn FnOnce() + Send>) {
        self.commit_callbacks.lock().push_back(cb);
    }

    pub(crate) fn enqueue_abort_callback(&self, cb: Box<dyn FnOnce() + Send>) {
        self.abort_callbacks.lock().push_back(cb);
    }

    /// Runs every queued `TransactionListener` callback, outside of any lockable's lock. Called by
    /// every public `Transaction` entry point that might have triggered a commit or abort cascade
    /// (`begin_commit`, `put`, `begin_abort`, `close`), after it has released its own locks.
    pub(crate) fn drain_callbacks(&self) {
        loop {
            let next_commit = self.commit_callbacks.lock().pop_front();
            match next_commit {
                Some(cb) => cb(),
                None => break,
            }
        }
        loop {
            let next_abort = self.abort_callbacks.lock().pop_front();
            match next_abort {
                Some(cb) => cb(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectState;

    fn new_universe() -> Arc<Universe<i32>> {
        Universe::new(Instant::from_nanos(0))
    }

    #[test]
    fn empty_universe_has_end_of_time_history_end() {
        let universe = new_universe();
        assert_eq!(universe.history_end(), Instant::END_OF_TIME);
    }

    #[test]
    fn history_start_cannot_regress() {
        let universe = new_universe();
        universe.set_history_start(Instant::from_nanos(10)).unwrap();
        assert!(universe.set_history_start(Instant::from_nanos(5)).is_err());
    }

    #[test]
    fn solo_write_commits_and_is_readable() {
        let universe = new_universe();
        let object = ObjectId::from_u128(1);

        let tx = universe.begin_transaction(None);
        let initial: ObjectState<i32> = tx.get_object_state(object, Instant::from_nanos(0)).unwrap();
        assert!(initial.is_none());
        tx.begin_write(Instant::from_nanos(10)).unwrap();
        tx.put(object, Some(Arc::new(42))).unwrap();
        tx.begin_commit().unwrap();
        tx.close();

        assert_eq!(universe.transactions.len(), 0);

        let reader = universe.begin_transaction(None);
        let value = reader.get_object_state(object, Instant::from_nanos(15)).unwrap();
        assert_eq!(value, Some(Arc::new(42)));
        reader.close();
    }

    #[test]
    fn prehistory_read_is_rejected() {
        let universe = new_universe();
        universe.set_history_start(Instant::from_nanos(50)).unwrap();
        let tx = universe.begin_transaction(None);
        let result = tx.get_object_state(ObjectId::from_u128(1), Instant::from_nanos(40));
        assert!(matches!(result, Err(EngineError::Prehistory { .. })));
    }

    #[test]
    fn destruction_forbids_future_resurrection() {
        let universe = new_universe();
        let object = ObjectId::from_u128(7);

        let create = universe.begin_transaction(None);
        create.begin_write(Instant::from_nanos(10)).unwrap();
        create.put(object, Some(Arc::new(1))).unwrap();
        create.begin_commit().unwrap();
        create.close();

        let destroy = universe.begin_transaction(None);
        destroy.get_object_state(object, Instant::from_nanos(10)).unwrap();
        destroy.begin_write(Instant::from_nanos(30)).unwrap();
        destroy.put(object, None).unwrap();
        destroy.begin_commit().unwrap();
        destroy.close();

        let reader = universe.begin_transaction(None);
        assert_eq!(reader.get_object_state(object, Instant::from_nanos(40)).unwrap(), None);
        reader.close();

        let resurrect = universe.begin_transaction(None);
        resurrect.begin_write(Instant::from_nanos(50)).unwrap();
        let result = resurrect.put(object, Some(Arc::new(9)));
        assert!(result.is_err());
        resurrect.close();
    }
}
