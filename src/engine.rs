//! `SimulationEngine<S>`: the driver layer on top of [`crate::universe::Universe`] (§4.7).
//!
//! The engine never blocks and never spawns a thread. Each object gets one [`ObjectDriver`],
//! advanced by submitting a `Runnable` (see `executor.rs`) that runs one transaction attempt and
//! returns. Progress past that one attempt happens because the driver's own
//! [`crate::transaction::TransactionListener`] reschedules it from `on_commit`/`on_abort` — which
//! may run synchronously (commit resolved immediately, no predecessors) or much later (some other
//! thread's cascade finally resolves this driver's coordinator).

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::executor::Executor;
use crate::id::ObjectId;
use crate::object::ObjectState;
use crate::time::Instant;
use crate::transaction::{Transaction, TransactionListener};
use crate::universe::Universe;

type FxMap<K, V> = DashMap<K, V, foldhash::fast::FixedState>;

/// The application's per-step state-transition function (§6's `PutNextStateTransition`).
///
/// Given a transaction already positioned to read `object`'s state, and the instant (`when_prev`)
/// and value (`prior_state`) that state was last committed at, the implementation must: read zero
/// or more earlier states if it needs them, call `tx.begin_write(when_next)` for some `when_next >
/// when_prev`, and call `tx.put(object, new_state)` exactly once with a state that differs from
/// `prior_state` (or `None` to destroy the object). It may also `tx.put` other, newly-minted
/// object ids to create objects.
///
/// Returns `anyhow::Result` rather than `Result<_, EngineError>` so the implementation can report
/// an arbitrary domain failure (not just the engine's own contract violations, which still
/// propagate here via `?` since `EngineError` converts into `anyhow::Error`); the driver wraps
/// whatever comes back in [`EngineError::CallbackFailed`] per §7's "wrap in a diagnostic"
/// requirement before logging and aborting.
pub trait PutNextStateTransition<S>: Send + Sync {
    fn put_next_state_transition(
        &self,
        tx: &Transaction<S>,
        object: ObjectId,
        when_prev: Instant,
        prior_state: ObjectState<S>,
    ) -> anyhow::Result<()>;
}

struct DriverInner<S> {
    advance_to: Instant,
    steps: BTreeMap<Instant, Vec<oneshot::Sender<Result<ObjectState<S>, EngineError>>>>,
    dependent_objects: HashSet<ObjectId>,
    object_dependencies: HashSet<ObjectId>,
}

/// One object's advance-state worker. `running` makes scheduling idempotent: a second
/// `advance_history`/`compute_object_state` call while a step is already in flight raises
/// `advance_to` but does not submit a second `Runnable` (§4.7: "scheduling is a hint").
struct ObjectDriver<S> {
    object: ObjectId,
    running: AtomicBool,
    inner: Mutex<DriverInner<S>>,
}

impl<S> ObjectDriver<S> {
    fn new(object: ObjectId, advance_to: Instant) -> Self {
        ObjectDriver {
            object,
            running: AtomicBool::new(false),
            inner: Mutex::new(DriverInner {
                advance_to,
                steps: BTreeMap::new(),
                dependent_objects: HashSet::new(),
                object_dependencies: HashSet::new(),
            }),
        }
    }
}

/// Drives one object's driver through `on_commit`/`on_abort`. Constructed fresh for every attempt
/// (a driver may retry many times; each retry gets its own listener, since `when_next` and the
/// read-dependency snapshot differ per attempt).
struct DriverListener<S> {
    engine: Arc<SimulationEngine<S>>,
    object: ObjectId,
    when_next: Mutex<Option<Instant>>,
    dependencies: Mutex<Vec<(ObjectId, crate::id::ObjectStateId)>>,
}

impl<S> TransactionListener for DriverListener<S>
where
    S: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_commit(&self) {
        let when_next = *self.when_next.lock();
        let dependencies = self.dependencies.lock().clone();
        tracing::debug!(object_id = %self.object, ?when_next, "driver step committed");
        self.engine.clone().on_driver_committed(self.object, dependencies);
    }

    fn on_abort(&self) {
        tracing::warn!(object_id = %self.object, "driver step aborted; will retry");
        self.engine.clone().on_driver_aborted(self.object);
    }

    fn on_create(&self, created: ObjectId) {
        if created != self.object {
            let target = *self.engine.universal_target.lock();
            tracing::debug!(object_id = %created, creator = %self.object, "waking driver for newly created object");
            self.engine.advance_object(created, target);
        }
    }
}

/// The driver layer: mints and schedules [`ObjectDriver`]s, wires each one's transaction to a
/// [`DriverListener`], and exposes `advance_history`/`compute_object_state` to the host process.
pub struct SimulationEngine<S> {
    universe: Arc<Universe<S>>,
    executor: Arc<dyn Executor>,
    transition: Arc<dyn PutNextStateTransition<S>>,
    drivers: FxMap<ObjectId, Arc<ObjectDriver<S>>>,
    universal_target: Mutex<Instant>,
}

impl<S> SimulationEngine<S>
where
    S: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(
        universe: Arc<Universe<S>>,
        executor: Arc<dyn Executor>,
        transition: Arc<dyn PutNextStateTransition<S>>,
    ) -> Arc<Self> {
        Arc::new(SimulationEngine {
            universe,
            executor,
            transition,
            drivers: DashMap::default(),
            universal_target: Mutex::new(Instant::START_OF_TIME),
        })
    }

    pub fn universe(&self) -> &Arc<Universe<S>> {
        &self.universe
    }

    /// `advanceHistory(t)`: raises the universal target and wakes every currently-known object's
    /// driver, plus every driver already minted even if its object has since been destroyed (a
    /// destroyed object's driver simply finds itself already at or past `t` and idles).
    pub fn advance_history(self: &Arc<Self>, t: Instant) {
        {
            let mut target = self.universal_target.lock();
            if *target < t {
                *target = t;
            }
        }
        let known: HashSet<ObjectId> = self
            .universe
            .object_ids()
            .into_iter()
            .chain(self.drivers.iter().map(|e| *e.key()))
            .collect();
        for object in known {
            self.advance_object(object, t);
        }
    }

    /// `advanceHistory(o, t)`: wakes a single object's driver toward (at least) `t`.
    pub fn advance_object(self: &Arc<Self>, object: ObjectId, t: Instant) {
        let driver = self.driver_for(object);
        {
            let mut inner = driver.inner.lock();
            if inner.advance_to < t {
                inner.advance_to = t;
            }
        }
        self.schedule_driver(object);
    }

    /// `computeObjectState(o, t)`: returns a future that resolves with the committed state of `o`
    /// at `t` once it is known. If `t` is already covered by `o`'s committed history, resolves
    /// (almost) immediately; otherwise installs a slot that `on_driver_committed` fulfills once
    /// `o`'s `latestCommit` reaches `t`.
    ///
    /// Per §9's open question, an object that is never created leaves its slot unfulfilled
    /// forever: this implementation does not synthesize a null result for it.
    pub fn compute_object_state(self: &Arc<Self>, object: ObjectId, t: Instant) -> ComputedState<S> {
        let (sender, receiver) = oneshot::channel();
        if self.universe.latest_commit_of(object) >= t {
            let _ = sender.send(self.read_committed(object, t));
            return ComputedState { receiver };
        }

        let driver = self.driver_for(object);
        {
            let mut inner = driver.inner.lock();
            inner.steps.entry(t).or_default().push(sender);
            if inner.advance_to < t {
                inner.advance_to = t;
            }
        }
        self.schedule_driver(object);
        ComputedState { receiver }
    }

    fn driver_for(&self, object: ObjectId) -> Arc<ObjectDriver<S>> {
        if let Some(existing) = self.drivers.get(&object) {
            return existing.clone();
        }
        let target = *self.universal_target.lock();
        self.drivers
            .entry(object)
            .or_insert_with(|| Arc::new(ObjectDriver::new(object, target)))
            .clone()
    }

    fn schedule_driver(self: &Arc<Self>, object: ObjectId) {
        let driver = self.driver_for(object);
        if driver.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let engine = self.clone();
        self.executor.execute(Box::new(move || engine.run_driver_step(object)));
    }

    fn read_committed(&self, object: ObjectId, t: Instant) -> Result<ObjectState<S>, EngineError> {
        let tx = self.universe.begin_transaction(None);
        let result = tx.get_object_state(object, t);
        tx.close();
        result
    }

    /// One driver task: a single transaction attempt (§4.7's "driver task" algorithm, steps 1-4).
    fn run_driver_step(self: Arc<Self>, object: ObjectId) {
        let driver = self.driver_for(object);
        let target = driver.inner.lock().advance_to;
        let when_prev = self.universe.latest_commit_of(object);

        if when_prev >= target {
            self.finish_step(object);
            return;
        }

        let _span = tracing::debug_span!("driver_step", object_id = %object, when = %when_prev).entered();

        let listener = Arc::new(DriverListener {
            engine: self.clone(),
            object,
            when_next: Mutex::new(None),
            dependencies: Mutex::new(Vec::new()),
        });
        let tx = self.universe.begin_transaction(Some(listener.clone()));

        let prior_state = match tx.get_object_state(object, when_prev) {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(object_id = %object, %err, "driver's own read of whenPrev failed");
                tx.close();
                self.finish_step(object);
                return;
            }
        };

        match self.transition.put_next_state_transition(&tx, object, when_prev, prior_state) {
            Ok(()) => {
                *listener.when_next.lock() = tx.when();
                *listener.dependencies.lock() = tx.dependencies_snapshot();
                if let Err(err) = tx.begin_commit() {
                    tracing::warn!(object_id = %object, %err, "beginCommit rejected after a successful transition");
                }
            }
            Err(err) => {
                let wrapped = EngineError::callback_failed(object, when_prev, err);
                tracing::warn!(object_id = %object, %wrapped, "putNextStateTransition failed; aborting");
                tx.begin_abort();
            }
        }
        tx.close();
    }

    /// Runs after a driver transaction settles, whatever the outcome: clears `running`, and
    /// resubmits the driver if its target has not yet been reached.
    fn finish_step(self: &Arc<Self>, object: ObjectId) {
        let driver = self.driver_for(object);
        driver.running.store(false, Ordering::Release);
        let target = driver.inner.lock().advance_to;
        if self.universe.latest_commit_of(object) < target {
            self.schedule_driver(object);
        }
    }

    /// On commit: clear the wait-set this step accumulated, register fresh forward dependencies
    /// for whatever this step read beyond its target's own committed front, fulfill any
    /// `computeObjectState` slots the new `latestCommit` now covers, wake every driver waiting on
    /// this object, then retry or idle per `finish_step`.
    fn on_driver_committed(self: Arc<Self>, object: ObjectId, dependencies: Vec<(ObjectId, crate::id::ObjectStateId)>) {
        let driver = self.driver_for(object);
        driver.inner.lock().object_dependencies.clear();

        let latest_commit = self.universe.latest_commit_of(object);
        for (dep_object, dep_state_id) in &dependencies {
            if *dep_object == object {
                continue;
            }
            if self.universe.latest_commit_of(*dep_object) < dep_state_id.when {
                driver.inner.lock().object_dependencies.insert(*dep_object);
                let dep_driver = self.driver_for(*dep_object);
                dep_driver.inner.lock().dependent_objects.insert(object);
                self.advance_object(*dep_object, dep_state_id.when);
            }
        }

        let (ready, dependents) = {
            let mut inner = driver.inner.lock();
            let due: Vec<Instant> = inner.steps.keys().filter(|t| **t <= latest_commit).copied().collect();
            let ready: Vec<(Instant, Vec<oneshot::Sender<Result<ObjectState<S>, EngineError>>>)> = due
                .into_iter()
                .filter_map(|t| inner.steps.remove(&t).map(|senders| (t, senders)))
                .collect();
            let dependents: Vec<ObjectId> = inner.dependent_objects.iter().copied().collect();
            (ready, dependents)
        };
        for (t, senders) in ready {
            for sender in senders {
                let _ = sender.send(self.read_committed(object, t));
            }
        }
        for dependent in dependents {
            self.advance_object(dependent, latest_commit);
        }

        self.finish_step(object);
    }

    fn on_driver_aborted(self: Arc<Self>, object: ObjectId) {
        self.finish_step(object);
    }
}

/// The future returned by [`SimulationEngine::compute_object_state`]. Resolves with the committed
/// state at the requested instant, or with a propagated [`EngineError`] (e.g. `Prehistory`, if
/// `historyStart` advances past the requested instant before it is ever committed). If the object
/// is never created, this future simply never resolves.
pub struct ComputedState<S> {
    receiver: oneshot::Receiver<Result<ObjectState<S>, EngineError>>,
}

impl<S> Future for ComputedState<S> {
    type Output = Result<ObjectState<S>, EngineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The sender side was dropped without ever completing the slot (the engine itself
            // was torn down). Treated the same as "never created": stay pending rather than
            // synthesizing an error the caller never asked for.
            Poll::Ready(Err(_)) => Poll::Pending,
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ImmediateExecutor;

    struct Increment;

    impl PutNextStateTransition<i32> for Increment {
        fn put_next_state_transition(
            &self,
            tx: &Transaction<i32>,
            object: ObjectId,
            when_prev: Instant,
            prior_state: ObjectState<i32>,
        ) -> anyhow::Result<()> {
            let next_value = prior_state.map(|v| *v).unwrap_or(0) + 1;
            tx.begin_write(when_prev.checked_add(10)?)?;
            tx.put(object, Some(Arc::new(next_value)))?;
            Ok(())
        }
    }

    fn new_engine() -> (Arc<Universe<i32>>, Arc<SimulationEngine<i32>>) {
        let universe = Universe::new(Instant::from_nanos(0));
        let engine = SimulationEngine::new(universe.clone(), Arc::new(ImmediateExecutor), Arc::new(Increment));
        (universe, engine)
    }

    #[test]
    fn solo_advance_commits_successive_increments() {
        let (universe, engine) = new_engine();
        let object = ObjectId::from_u128(1);

        // Seed the object's creation directly, as an external committed transaction would.
        let creator = universe.begin_transaction(None);
        creator.begin_write(Instant::from_nanos(10)).unwrap();
        creator.put(object, Some(Arc::new(0))).unwrap();
        creator.begin_commit().unwrap();
        creator.close();

        engine.advance_object(object, Instant::from_nanos(30));

        assert_eq!(universe.latest_commit_of(object), Instant::from_nanos(30));
        let reader = universe.begin_transaction(None);
        assert_eq!(reader.get_object_state(object, Instant::from_nanos(30)).unwrap(), Some(Arc::new(2)));
        reader.close();
    }

    #[test]
    fn compute_object_state_resolves_once_the_target_commits() {
        let (universe, engine) = new_engine();
        let object = ObjectId::from_u128(2);

        let creator = universe.begin_transaction(None);
        creator.begin_write(Instant::from_nanos(10)).unwrap();
        creator.put(object, Some(Arc::new(0))).unwrap();
        creator.begin_commit().unwrap();
        creator.close();

        let future = engine.compute_object_state(object, Instant::from_nanos(20));
        let waker = futures_noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut pinned = Box::pin(future);
        match pinned.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(value)) => assert_eq!(value, Some(Arc::new(1))),
            Poll::Ready(Err(err)) => panic!("expected a resolved value, got an error: {err}"),
            Poll::Pending => panic!("expected the future to resolve once the driver committed its target"),
        }
    }

    #[test]
    fn compute_object_state_on_an_already_committed_instant_resolves_immediately() {
        let (universe, engine) = new_engine();
        let object = ObjectId::from_u128(3);
        let tx = universe.begin_transaction(None);
        tx.begin_write(Instant::from_nanos(10)).unwrap();
        tx.put(object, Some(Arc::new(7))).unwrap();
        tx.begin_commit().unwrap();
        tx.close();

        let future = engine.compute_object_state(object, Instant::from_nanos(10));
        let waker = futures_noop_waker();
        let mut cx = Context::from_waker(&waker);
        match Box::pin(future).as_mut().poll(&mut cx) {
            Poll::Ready(Ok(value)) => assert_eq!(value, Some(Arc::new(7))),
            _ => panic!("an already-committed instant should resolve without waiting on a driver"),
        }
    }

    // A minimal no-op `Waker`, since these tests poll synchronously under `ImmediateExecutor`
    // rather than running inside a real async runtime.
    fn futures_noop_waker() -> std::task::Waker {
        use std::task::{RawWaker, RawWakerVTable, Waker};
        fn clone(_: *const ()) -> RawWaker {
            raw_waker()
        }
        fn no_op(_: *const ()) {}
        fn raw_waker() -> RawWaker {
            static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        unsafe { Waker::from_raw(raw_waker()) }
    }
}
