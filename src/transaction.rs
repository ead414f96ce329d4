//! `Transaction<S>`: the open/closed state machine described in §4.5, and the
//! `TransactionListener` callback interface from §6.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::id::{CoordinatorId, LockableId, ObjectId, ObjectStateId, TransactionId};
use crate::object::ObjectState;
use crate::time::Instant;
use crate::universe::Universe;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TransactionState {
    Reading,
    Writing,
    Committing,
    Aborting,
    Committed,
    Aborted,
}

fn state_name(state: TransactionState) -> &'static str {
    match state {
        TransactionState::Reading => "Reading",
        TransactionState::Writing => "Writing",
        TransactionState::Committing => "Committing",
        TransactionState::Aborting => "Aborting",
        TransactionState::Committed => "Committed",
        TransactionState::Aborted => "Aborted",
    }
}

/// Called back, on an unspecified executor thread, when a transaction this listener is attached
/// to finishes. Default methods are no-ops so callers only implement what they need.
pub trait TransactionListener: Send + Sync {
    fn on_commit(&self) {}
    fn on_abort(&self) {}
    fn on_create(&self, _object: ObjectId) {}
}

struct TransactionInner<S> {
    state: TransactionState,
    coordinator: CoordinatorId,
    object_states_read: HashMap<ObjectStateId, ObjectState<S>>,
    object_states_written: HashMap<ObjectId, ObjectState<S>>,
    dependencies: HashMap<ObjectId, ObjectStateId>,
    past_the_end_reads: HashSet<ObjectId>,
    when: Option<Instant>,
}

/// A single atomic read/write operation against a [`Universe`]. See §4.5 for the full per-state
/// operation table; each public method here implements one column of that table.
pub struct Transaction<S> {
    pub id: TransactionId,
    pub lockable_id: LockableId,
    universe: Arc<Universe<S>>,
    listener: Option<Arc<dyn TransactionListener>>,
    /// Wraps this transaction's whole lifetime, per §10.1: every `tracing::debug!`/`tracing::warn!`
    /// call below is made with this span entered, so they all nest under one `transaction` span
    /// tagged with `tx_id`/`coordinator_id` rather than appearing as unrelated top-level events.
    span: tracing::Span,
    inner: Mutex<TransactionInner<S>>,
}

impl<S> Transaction<S> {
    pub(crate) fn new(
        id: TransactionId,
        lockable_id: LockableId,
        coordinator: CoordinatorId,
        universe: Arc<Universe<S>>,
        listener: Option<Arc<dyn TransactionListener>>,
    ) -> Self {
        let span = tracing::debug_span!("transaction", tx_id = ?id, coordinator_id = ?coordinator);
        Transaction {
            id,
            lockable_id,
            universe,
            listener,
            span,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Reading,
                coordinator,
                object_states_read: HashMap::new(),
                object_states_written: HashMap::new(),
                dependencies: HashMap::new(),
                past_the_end_reads: HashSet::new(),
                when: None,
            }),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn coordinator_id(&self) -> CoordinatorId {
        self.inner.lock().coordinator
    }

    pub(crate) fn set_coordinator(&self, id: CoordinatorId) {
        self.inner.lock().coordinator = id;
    }

    /// The instant passed to `beginWrite`, once set. Used by
    /// [`crate::engine::SimulationEngine`]'s driver to learn `whenNext` after the application's
    /// transition callback returns, without exposing the whole internal state struct.
    pub(crate) fn when(&self) -> Option<Instant> {
        self.inner.lock().when
    }

    pub(crate) fn written_objects(&self) -> Vec<ObjectId> {
        self.inner.lock().object_states_written.keys().copied().collect()
    }

    /// Snapshot of the earliest `ObjectStateId` read per object, used by the engine's driver to
    /// find cross-object dependencies worth waking a different driver over (§4.7 step 3).
    pub(crate) fn dependencies_snapshot(&self) -> Vec<(ObjectId, ObjectStateId)> {
        self.inner.lock().dependencies.iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// `getObjectState`, the Reading-row read-through path (with the Aborting/Aborted rows'
    /// cached-only behavior).
    pub fn get_object_state(&self, object: ObjectId, t: Instant) -> Result<ObjectState<S>, EngineError>
    where
        S: Clone + PartialEq,
    {
        let _enter = self.span.enter();
        let history_start = self.universe.history_start();
        if t < history_start {
            return Err(EngineError::Prehistory {
                requested: t,
                history_start,
            });
        }

        let key = ObjectStateId::new(object, t);
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::Reading => {}
            TransactionState::Aborting | TransactionState::Aborted => {
                return inner
                    .object_states_read
                    .get(&key)
                    .cloned()
                    .ok_or(EngineError::AbortedTransaction);
            }
            other => {
                return Err(EngineError::illegal_state("getObjectState", "Reading", state_name(other)));
            }
        }

        if let Some(cached) = inner.object_states_read.get(&key) {
            return Ok(cached.clone());
        }

        let coordinator = inner.coordinator;
        drop(inner);

        let data = self.universe.object_data_or_create(object);
        let read = data.read_uncached(self.id, t);

        let mut inner = self.inner.lock();
        inner.object_states_read.insert(key, read.value.clone());
        let dep = inner.dependencies.entry(object).or_insert(key);
        if key < *dep {
            *dep = key;
        }
        if read.past_the_end {
            inner.past_the_end_reads.insert(object);
        }
        drop(inner);

        for writer in read.blocking_writers {
            if writer == self.id {
                continue;
            }
            if let Some(writer_coordinator) = self.universe.coordinator_of(writer) {
                let retargeted = self.universe.coordinators().add_predecessor(writer_coordinator, coordinator);
                self.universe.apply_retarget(retargeted);
            }
        }

        Ok(read.value)
    }

    /// `beginWrite(t)`.
    pub fn begin_write(&self, t: Instant) -> Result<(), EngineError> {
        let _enter = self.span.enter();
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::Reading => {
                if t <= Instant::START_OF_TIME {
                    return Err(EngineError::InvalidArgument(
                        "beginWrite at START_OF_TIME is not allowed".to_string(),
                    ));
                }
                if inner.dependencies.values().any(|dep| dep.when >= t) {
                    return Err(EngineError::InvalidArgument(
                        "beginWrite instant must be strictly after every instant already read".to_string(),
                    ));
                }
                inner.when = Some(t);
                inner.state = TransactionState::Writing;
                tracing::debug!(tx_id = ?self.id, when = %t, "transaction Reading -> Writing");
                Ok(())
            }
            TransactionState::Aborting => Ok(()),
            TransactionState::Aborted => Err(EngineError::AbortedTransaction),
            other => Err(EngineError::illegal_state("beginWrite", "Reading", state_name(other))),
        }
    }

    /// `put(o, s)`.
    pub fn put(&self, object: ObjectId, state: ObjectState<S>) -> Result<(), EngineError>
    where
        S: PartialEq + Clone,
    {
        let _enter = self.span.enter();
        let (t, coordinator) = {
            let mut inner = self.inner.lock();
            match inner.state {
                TransactionState::Writing => {
                    let t = inner.when.expect("when is set at the Reading -> Writing edge");
                    (t, inner.coordinator)
                }
                TransactionState::Aborting => {
                    inner.object_states_written.insert(object, state);
                    return Ok(());
                }
                TransactionState::Aborted => return Err(EngineError::AbortedTransaction),
                other => return Err(EngineError::illegal_state("put", "Writing", state_name(other))),
            }
        };

        let data = self.universe.object_data_or_create(object);
        let mut abort_set = Vec::new();
        let mut escalate_set = Vec::new();
        let outcome = data.try_append(self.id, t, state.clone(), &mut abort_set, &mut escalate_set);

        if outcome.is_err() {
            self.begin_abort();
            return Err(EngineError::AbortedTransaction);
        }

        self.inner.lock().object_states_written.insert(object, state);

        for aborted in abort_set {
            if aborted != self.id {
                self.universe.abort_transaction(aborted);
            }
        }
        for escalated in escalate_set {
            if escalated == self.id {
                continue;
            }
            if let Some(escalated_coordinator) = self.universe.coordinator_of(escalated) {
                let retargeted = self.universe.coordinators().add_predecessor(coordinator, escalated_coordinator);
                self.universe.apply_retarget(retargeted);
            }
            self.universe.clear_past_the_end_read(escalated, object);
        }

        self.universe.drain_callbacks();
        Ok(())
    }

    /// `beginCommit`.
    pub fn begin_commit(&self) -> Result<(), EngineError> {
        let _enter = self.span.enter();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                TransactionState::Reading | TransactionState::Writing => {
                    inner.state = TransactionState::Committing;
                }
                TransactionState::Aborting | TransactionState::Aborted => {
                    return Err(EngineError::AbortedTransaction);
                }
                other => {
                    return Err(EngineError::illegal_state(
                        "beginCommit",
                        "Reading or Writing",
                        state_name(other),
                    ));
                }
            }
        }
        tracing::debug!(tx_id = ?self.id, "transaction -> Committing");
        self.universe.try_commit_coordinator(self.coordinator_id());
        self.universe.drain_callbacks();
        Ok(())
    }

    /// `beginAbort`: may be called unilaterally on any open transaction. Cascades through the
    /// whole mutually-dependent coordinator cluster (§4.4).
    pub fn begin_abort(&self) {
        let _enter = self.span.enter();
        if self.mark_aborting() {
            self.universe.abort_coordinator(self.coordinator_id());
            self.universe.drain_callbacks();
        }
    }

    /// `close`. A no-op once the transaction is `Committing` or later: per §4.5's table, closing a
    /// transaction that is waiting to commit does not cancel it, and the transaction's entry in the
    /// universe's live-transaction map is only dropped once it actually reaches `Committed` or
    /// `Aborted` (see `finalize_commit`/`finalize_abort`) — retiring it any earlier would break a
    /// `coordinator_of` lookup made by another transaction still racing to commit against it.
    pub fn close(&self) {
        let _enter = self.span.enter();
        let state = self.inner.lock().state;
        match state {
            TransactionState::Reading | TransactionState::Writing => self.begin_abort(),
            TransactionState::Aborting => {
                self.finalize_abort();
                self.universe.drain_callbacks();
            }
            TransactionState::Committing | TransactionState::Committed | TransactionState::Aborted => {}
        }
    }

    /// Readiness check used by `Universe::try_commit_coordinator`: in `Committing` with no
    /// outstanding past-the-end reads.
    pub(crate) fn is_ready_to_commit(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == TransactionState::Committing && inner.past_the_end_reads.is_empty()
    }

    pub(crate) fn clear_past_the_end_read(&self, object: ObjectId) {
        self.inner.lock().past_the_end_reads.remove(&object);
    }

    /// Commits every write this transaction made and transitions to `Committed`. Only called once
    /// the owning coordinator has verified every mutual transaction is ready.
    pub(crate) fn finalize_commit(&self)
    where
        S: PartialEq,
    {
        let _enter = self.span.enter();
        let (when, written) = {
            let mut inner = self.inner.lock();
            let when = inner.when;
            let written = std::mem::take(&mut inner.object_states_written);
            inner.state = TransactionState::Committed;
            (when, written)
        };

        if let Some(when) = when {
            for (object, _) in &written {
                let data = self.universe.object_data_or_create(*object);
                if let Err(err) = data.commit_writer(self.id, when) {
                    tracing::error!(tx_id = ?self.id, object = %object, when = %when, %err, "commitWriter contract violation");
                }
            }
        }
        tracing::debug!(tx_id = ?self.id, "transaction -> Committed");

        // The listener runs later, off the caller's FIFO (§3: "two FIFOs of pending commit/abort
        // callbacks"), never while a lockable's mutex is held. `drain_callbacks` is called by
        // whichever public entry point (`begin_commit`, `put`, `begin_abort`) triggered this
        // commit, once it has released every lock it was holding.
        if let Some(listener) = self.listener.clone() {
            let created: Vec<ObjectId> = written.keys().copied().collect();
            self.universe.enqueue_commit_callback(Box::new(move || {
                listener.on_commit();
                for object in created {
                    listener.on_create(object);
                }
            }));
        }
        self.universe.retire_transaction(self.id);
    }

    /// Marks this transaction `Aborting` if it is currently open. Returns whether a transition
    /// happened (idempotent: a second call on an already-aborting/aborted transaction is a no-op).
    pub(crate) fn mark_aborting(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Aborting => false,
            _ => {
                inner.state = TransactionState::Aborting;
                true
            }
        }
    }

    /// Rolls back every write this transaction made and transitions `Aborting -> Aborted`.
    pub(crate) fn finalize_abort(&self)
    where
        S: PartialEq,
    {
        let _enter = self.span.enter();
        let (when, written) = {
            let mut inner = self.inner.lock();
            if inner.state != TransactionState::Aborting {
                return;
            }
            inner.state = TransactionState::Aborted;
            (inner.when, std::mem::take(&mut inner.object_states_written))
        };

        if let Some(when) = when {
            for (object, _) in written {
                let data = self.universe.object_data_or_create(object);
                if data.rollback_write(self.id, when) {
                    self.universe.retire_object(object);
                }
            }
        }
        tracing::warn!(tx_id = ?self.id, "transaction -> Aborted");
        if let Some(listener) = self.listener.clone() {
            self.universe
                .enqueue_abort_callback(Box::new(move || listener.on_abort()));
        }
        self.universe.retire_transaction(self.id);
    }
}
