//! `ObjectData`: one simulated object's committed/uncommitted state history, plus the reader and
//! writer trackers that make optimistic conflict detection possible (§4.3).
//!
//! Each `ObjectData` owns a single `parking_lot::Mutex` guarding all of its fields, per §5's
//! locking discipline. Callers that need more than one `ObjectData` locked at once acquire them
//! in ascending [`LockableId`] order (the total lock order described in §5); that ordering lives
//! in `universe.rs`, since only the universe sees more than one object at a time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::history::ValueHistory;
use crate::id::{LockableId, TransactionId};
use crate::set_history::SetHistory;
use crate::time::Instant;

/// The application-supplied payload at one instant, or `None` if the object does not exist (or
/// has been destroyed) at that instant. Reference-counted so successive history entries share the
/// same allocation rather than copying it (§9's "structural sharing" note).
pub type ObjectState<S> = Option<Arc<S>>;

pub struct ObjectData<S> {
    pub lockable_id: LockableId,
    inner: Mutex<ObjectDataInner<S>>,
}

struct ObjectDataInner<S> {
    state_history: ValueHistory<ObjectState<S>>,
    uncommitted_writers: SetHistory<TransactionId>,
    uncommitted_readers: SetHistory<TransactionId>,
    /// Transactions that asked for an instant past the last recorded transition, keyed by the
    /// exact instant they asked for. Tracked separately from `uncommitted_readers` (rather than
    /// as a boolean-history segment) so that a later append can tell the two cases apart: an
    /// append landing exactly on a pending reader's requested instant aborts it (its answer
    /// changed), while any other append past the old end merely escalates it (§8 scenario 4 vs.
    /// scenario 2).
    past_the_end_readers: HashMap<TransactionId, Instant>,
    latest_commit: Instant,
}

impl<S> ObjectDataInner<S> {
    fn is_empty(&self) -> bool {
        self.state_history.first_value().is_none() && self.state_history.last_transition_time().is_none()
    }
}

/// What `try_append` did.
#[derive(Debug, Eq, PartialEq)]
pub enum TryAppendOutcome {
    /// A new transition was recorded.
    Appended,
    /// `tx` had already recorded this exact state at this exact instant; treated as an
    /// idempotent acknowledgement rather than a duplicate-write error (see `DESIGN.md`).
    AlreadyCreated,
}

/// An optimistic-conflict failure from the write path. Per §7 these never surface to the caller
/// as an `EngineError` — they are converted directly into a transaction abort.
#[derive(Debug, Eq, PartialEq)]
pub enum TryAppendConflict {
    /// `t` is at or before `latestCommit`: the write target is already settled history.
    WriteInvalidated,
    /// The object's last committed value is the destruction sentinel (`None`) and `state` is
    /// non-null: resurrection is forbidden.
    Resurrection,
}

/// The result of an uncommitted-aware read (§4.3's `readUncached`).
pub struct ReadResult<S> {
    pub value: ObjectState<S>,
    /// Transactions that must commit before the reading transaction can (they wrote the segment
    /// the reader just observed, or the segment immediately after it).
    pub blocking_writers: Vec<TransactionId>,
    /// Whether `t` is past the last recorded transition: the reader asked for the future.
    pub past_the_end: bool,
}

impl<S> ObjectData<S> {
    pub fn new(lockable_id: LockableId) -> Self {
        ObjectData {
            lockable_id,
            inner: Mutex::new(ObjectDataInner {
                state_history: ValueHistory::new(None),
                uncommitted_writers: SetHistory::new(),
                uncommitted_readers: SetHistory::new(),
                past_the_end_readers: HashMap::new(),
                latest_commit: Instant::START_OF_TIME,
            }),
        }
    }

    pub fn latest_commit(&self) -> Instant {
        self.inner.lock().latest_commit
    }

    pub fn last_transition_time(&self) -> Option<Instant> {
        self.inner.lock().state_history.last_transition_time()
    }

    pub fn state_at(&self, t: Instant) -> ObjectState<S>
    where
        S: Clone,
    {
        self.inner.lock().state_history.get(t).clone()
    }

    pub fn exists_at(&self, t: Instant) -> bool {
        self.inner.lock().state_history.get(t).is_some()
    }

    /// `commitWriter`: marks `tx`'s write at `t` as settled, advancing `latestCommit`.
    pub fn commit_writer(&self, tx: TransactionId, t: Instant) -> Result<(), EngineError>
    where
        S: PartialEq,
    {
        let mut inner = self.inner.lock();
        if inner.latest_commit >= t {
            return Err(EngineError::illegal_state(
                "commitWriter",
                "latestCommit < t",
                "latestCommit >= t",
            ));
        }
        if !inner.state_history.has_transition_at(t) {
            return Err(EngineError::illegal_state(
                "commitWriter",
                "a transition recorded at t",
                "no transition at t",
            ));
        }
        let destroyed = inner.state_history.get(t).is_none();
        inner.latest_commit = if destroyed { Instant::END_OF_TIME } else { t };
        inner.uncommitted_writers.remove(&tx);
        Ok(())
    }

    /// `rollBackWrite`: undoes `tx`'s uncommitted write at `t`, if it is still there. Returns
    /// `true` if the object's history is now empty, meaning the caller may delete this
    /// `ObjectData` entirely.
    pub fn rollback_write(&self, tx: TransactionId, t: Instant) -> bool
    where
        S: PartialEq,
    {
        let mut inner = self.inner.lock();
        if inner.latest_commit < t && inner.uncommitted_writers.contains_at(t, &tx) {
            inner.state_history.remove_transitions_from(t);
        }
        inner.uncommitted_writers.remove(&tx);
        inner.is_empty()
    }

    /// `tryAppend`: the central write path. On success, fills `abort_set` with transactions that
    /// must now abort (they read a value this write just overwrote) and `escalate_set` with
    /// transactions that must be promoted from past-the-end readers to successors of `tx` (they
    /// were reading beyond the end, and `tx` just extended the end past them).
    pub fn try_append(
        &self,
        tx: TransactionId,
        t: Instant,
        state: ObjectState<S>,
        abort_set: &mut Vec<TransactionId>,
        escalate_set: &mut Vec<TransactionId>,
    ) -> Result<TryAppendOutcome, TryAppendConflict>
    where
        S: PartialEq,
    {
        let mut inner = self.inner.lock();

        if t <= inner.latest_commit {
            return Err(TryAppendConflict::WriteInvalidated);
        }
        // A null current value only means "destroyed" (committed or still in flight) if some
        // transition actually put it there; a virgin object with no transitions at all is also
        // `last_value() == None` by construction (`ValueHistory::new(None)`), and must stay
        // creatable. Checking `last_transition_time().is_some()` alongside `last_value().is_none()`
        // tells the two cases apart.
        if inner.state_history.last_transition_time().is_some()
            && inner.state_history.last_value().is_none()
            && state.is_some()
        {
            return Err(TryAppendConflict::Resurrection);
        }
        if *inner.state_history.get(t) == state && inner.uncommitted_writers.contains_at(t, &tx) {
            return Ok(TryAppendOutcome::AlreadyCreated);
        }

        inner
            .state_history
            .append_transition(t, state)
            .map_err(|_| TryAppendConflict::WriteInvalidated)?;

        inner.uncommitted_writers.add_until(t, tx);

        abort_set.extend(inner.uncommitted_readers.get(t));

        // Any successful append resolves every pending past-the-end reader: one landing exactly
        // on a reader's requested instant invalidates the value it already cached (abort); any
        // other append merely narrows the open future the reader was blocked on (escalate).
        for (reader, requested) in inner.past_the_end_readers.drain() {
            if requested == t {
                abort_set.push(reader);
            } else {
                escalate_set.push(reader);
            }
        }

        Ok(TryAppendOutcome::Appended)
    }

    /// `readUncached`: the value at `t`, plus whatever bookkeeping an uncommitted read requires.
    pub fn read_uncached(&self, tx: TransactionId, t: Instant) -> ReadResult<S>
    where
        S: Clone,
    {
        let mut inner = self.inner.lock();
        let value = inner.state_history.get(t).clone();
        let mut blocking_writers = Vec::new();
        let mut past_the_end = false;

        if inner.latest_commit < t {
            let last = inner.state_history.last_transition_time();
            past_the_end = t > last.unwrap_or(Instant::START_OF_TIME);

            if past_the_end {
                inner.past_the_end_readers.insert(tx, t);
            } else {
                inner.uncommitted_readers.add_until(t, tx);
            }

            blocking_writers.extend(inner.uncommitted_writers.get(t));
            if let Some(next) = inner.state_history.transition_at_or_after(t) {
                blocking_writers.extend(inner.uncommitted_writers.get(next));
            }
            blocking_writers.sort_unstable();
            blocking_writers.dedup();
        }

        ReadResult {
            value,
            blocking_writers,
            past_the_end,
        }
    }
}
