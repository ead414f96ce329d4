//! The six numbered end-to-end scenarios from the design document, plus the boundary behaviours
//! alongside them. Mirrors `peregrine/tests/{history,caching,graph_structuring}.rs`'s role:
//! cross-module behavior that no single unit test inside `src/` exercises end to end.

mod support;

use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use osprey::{EngineError, ImmediateExecutor, Instant, ObjectId, ObjectState, PutNextStateTransition, Transaction, Universe};
use support::{Payload, ThreadPoolExecutor};

struct NoopTransition;

impl PutNextStateTransition<Payload> for NoopTransition {
    fn put_next_state_transition(
        &self,
        _tx: &Transaction<Payload>,
        _object: ObjectId,
        _when_prev: Instant,
        _prior_state: ObjectState<Payload>,
    ) -> anyhow::Result<()> {
        unreachable!("this test drives writes directly through Transaction, not the engine");
    }
}

/// Scenario 1: solo advance. A created object's driver advances it through one state transition;
/// reads before, at, and after the transition observe the expected committed values.
#[test]
fn scenario_1_solo_advance() {
    let universe = Universe::new(Instant::from_nanos(0));
    let object = ObjectId::from_u128(1);

    let creator = universe.begin_transaction(None);
    creator.begin_write(Instant::from_nanos(10)).unwrap();
    creator.put(object, Some(Arc::new(Payload::new("s0", 0)))).unwrap();
    creator.begin_commit().unwrap();
    creator.close();

    struct WriteOnce;
    impl PutNextStateTransition<Payload> for WriteOnce {
        fn put_next_state_transition(
            &self,
            tx: &Transaction<Payload>,
            object: ObjectId,
            when_prev: Instant,
            _prior_state: ObjectState<Payload>,
        ) -> anyhow::Result<()> {
            tx.begin_write(when_prev.checked_add(10)?)?;
            tx.put(object, Some(Arc::new(Payload::new("s1", 1))))?;
            Ok(())
        }
    }

    let engine = osprey::SimulationEngine::new(universe.clone(), Arc::new(ImmediateExecutor), Arc::new(WriteOnce));
    engine.advance_object(object, Instant::from_nanos(20));

    let reader = universe.begin_transaction(None);
    assert_eq!(
        reader.get_object_state(object, Instant::from_nanos(15)).unwrap(),
        Some(Arc::new(Payload::new("s0", 0)))
    );
    assert_eq!(
        reader.get_object_state(object, Instant::from_nanos(20)).unwrap(),
        Some(Arc::new(Payload::new("s1", 1)))
    );
    reader.close();
    assert_eq!(universe.stats().history_end, Instant::from_nanos(20));
}

/// Scenario 2: read-then-write conflict. T1 reads (B, 5); before T1 writes, T2 writes (B, 5) and
/// commits first. T1 must abort; a fresh transaction observes T2's value.
#[test]
fn scenario_2_read_then_write_conflict() {
    let universe: Arc<Universe<Payload>> = Universe::new(Instant::from_nanos(0));
    let object = ObjectId::from_u128(2);

    let t1 = universe.begin_transaction(None);
    let seen = t1.get_object_state(object, Instant::from_nanos(5)).unwrap();
    assert_eq!(seen, None);

    let t2 = universe.begin_transaction(None);
    t2.begin_write(Instant::from_nanos(5)).unwrap();
    t2.put(object, Some(Arc::new(Payload::new("s_prime", 99)))).unwrap();
    t2.begin_commit().unwrap();
    t2.close();

    // T1's cached read is now stale: any attempt for it to proceed must fail, having been
    // cascaded into Aborting by T2's write.
    assert_eq!(t1.state(), osprey::TransactionState::Aborting);
    t1.close();

    let retry = universe.begin_transaction(None);
    let retried = retry.get_object_state(object, Instant::from_nanos(5)).unwrap();
    assert_eq!(retried, Some(Arc::new(Payload::new("s_prime", 99))));
    retry.close();
}

/// Scenario 3: mutual dependency. T1 reads (X, 10) and writes (Y, 20); T2 reads (Y, 15) and writes
/// (X, 20). Each depends on the other's pending write, so they must share one coordinator and
/// commit as a unit rather than deadlock.
#[test]
fn scenario_3_mutual_dependency_commits_as_one_unit() {
    let universe: Arc<Universe<Payload>> = Universe::new(Instant::from_nanos(0));
    let x = ObjectId::from_u128(10);
    let y = ObjectId::from_u128(20);

    let t1 = universe.begin_transaction(None);
    t1.get_object_state(x, Instant::from_nanos(10)).unwrap();
    t1.begin_write(Instant::from_nanos(20)).unwrap();
    t1.put(y, Some(Arc::new(Payload::new("y1", 1)))).unwrap();

    let t2 = universe.begin_transaction(None);
    // T2 reads Y at 15: this is a past-the-end read racing T1's pending write at 20.
    t2.get_object_state(y, Instant::from_nanos(15)).unwrap();
    t2.begin_write(Instant::from_nanos(20)).unwrap();
    t2.put(x, Some(Arc::new(Payload::new("x1", 1)))).unwrap();

    t1.begin_commit().unwrap();
    t2.begin_commit().unwrap();

    // Whichever commit call actually resolved the cluster, both must land in the same terminal
    // state: either both committed (success) or both aborted (the engine is free to break the
    // cycle by abort instead of merge, but never by stalling forever or letting one half proceed
    // alone).
    let t1_done = matches!(t1.state(), osprey::TransactionState::Committed | osprey::TransactionState::Aborted);
    let t2_done = matches!(t2.state(), osprey::TransactionState::Committed | osprey::TransactionState::Aborted);
    assert!(t1_done && t2_done);
    assert_eq!(t1.state(), t2.state());

    t1.close();
    t2.close();
}

/// Scenario 4: past-the-end read. T1 reads (Z, 100) when Z's history ends at 50, blocking its
/// commit. T2 then writes (Z, 80), which escalates (rather than aborts) T1's pending read, since
/// 80 != 100. Once T2 commits, T1 (having no other predecessor) is free to commit too.
#[test]
fn scenario_4_past_the_end_read_is_escalated_not_aborted() {
    let universe: Arc<Universe<Payload>> = Universe::new(Instant::from_nanos(0));
    let z = ObjectId::from_u128(30);

    let seed = universe.begin_transaction(None);
    seed.begin_write(Instant::from_nanos(50)).unwrap();
    seed.put(z, Some(Arc::new(Payload::new("z0", 0)))).unwrap();
    seed.begin_commit().unwrap();
    seed.close();

    let t1 = universe.begin_transaction(None);
    let read = t1.get_object_state(z, Instant::from_nanos(100)).unwrap();
    assert_eq!(read, Some(Arc::new(Payload::new("z0", 0))));
    t1.begin_commit().unwrap();
    assert_eq!(t1.state(), osprey::TransactionState::Committing, "blocked on its own past-the-end read");

    let t2 = universe.begin_transaction(None);
    t2.begin_write(Instant::from_nanos(80)).unwrap();
    t2.put(z, Some(Arc::new(Payload::new("z1", 1)))).unwrap();
    t2.begin_commit().unwrap();
    t2.close();

    assert_eq!(t1.state(), osprey::TransactionState::Committed);
    t1.close();
}

/// Scenario 5: destruction is forever. Committing a null state at (W, 30) makes any later
/// non-null write fail, and reads past that point keep observing null.
#[test]
fn scenario_5_destruction_is_forever() {
    let universe: Arc<Universe<Payload>> = Universe::new(Instant::from_nanos(0));
    let w = ObjectId::from_u128(40);

    let create = universe.begin_transaction(None);
    create.begin_write(Instant::from_nanos(10)).unwrap();
    create.put(w, Some(Arc::new(Payload::new("alive", 1)))).unwrap();
    create.begin_commit().unwrap();
    create.close();

    let destroy = universe.begin_transaction(None);
    destroy.get_object_state(w, Instant::from_nanos(10)).unwrap();
    destroy.begin_write(Instant::from_nanos(30)).unwrap();
    destroy.put(w, None).unwrap();
    destroy.begin_commit().unwrap();
    destroy.close();

    let resurrect = universe.begin_transaction(None);
    resurrect.begin_write(Instant::from_nanos(40)).unwrap();
    assert!(resurrect.put(w, Some(Arc::new(Payload::new("zombie", 9)))).is_err());
    resurrect.close();

    let reader = universe.begin_transaction(None);
    assert_eq!(reader.get_object_state(w, Instant::from_nanos(40)).unwrap(), None);
    reader.close();
}

/// Scenario 6: prehistory. Advancing `historyStart` past an instant makes any later read of that
/// instant fail, regardless of what (if anything) was ever recorded there.
#[test]
fn scenario_6_prehistory() {
    let universe: Arc<Universe<Payload>> = Universe::new(Instant::from_nanos(0));
    universe.set_history_start(Instant::from_nanos(50)).unwrap();

    let tx = universe.begin_transaction(None);
    let err = tx.get_object_state(ObjectId::from_u128(50), Instant::from_nanos(40)).unwrap_err();
    assert!(matches!(err, EngineError::Prehistory { .. }));
    tx.close();
}

/// `computeObjectState` resolving asynchronously once a concurrent, multi-threaded driver commits
/// its target — exercises the engine against `ThreadPoolExecutor` rather than the deterministic
/// `ImmediateExecutor`, and awaits the returned future from a `#[tokio::test]` body.
#[tokio::test]
async fn compute_object_state_resolves_under_a_real_thread_pool() {
    let universe: Arc<Universe<Payload>> = Universe::new(Instant::from_nanos(0));
    let object = ObjectId::from_u128(60);

    let creator = universe.begin_transaction(None);
    creator.begin_write(Instant::from_nanos(10)).unwrap();
    creator.put(object, Some(Arc::new(Payload::new("s0", 0)))).unwrap();
    creator.begin_commit().unwrap();
    creator.close();

    struct WriteOnce;
    impl PutNextStateTransition<Payload> for WriteOnce {
        fn put_next_state_transition(
            &self,
            tx: &Transaction<Payload>,
            object: ObjectId,
            when_prev: Instant,
            _prior_state: ObjectState<Payload>,
        ) -> anyhow::Result<()> {
            thread::sleep(StdDuration::from_millis(1));
            tx.begin_write(when_prev.checked_add(10)?)?;
            tx.put(object, Some(Arc::new(Payload::new("s1", 1))))?;
            Ok(())
        }
    }

    let engine = osprey::SimulationEngine::new(universe.clone(), ThreadPoolExecutor::new(2), Arc::new(WriteOnce));
    let value = engine.compute_object_state(object, Instant::from_nanos(20)).await.unwrap();
    assert_eq!(value, Some(Arc::new(Payload::new("s1", 1))));
}

/// `computeObjectState` for an object that is never created must not resolve with a spurious
/// value — per the design document's resolution of the corresponding open question, the future
/// simply never completes. We only assert it stays `Pending` after a generous timeout, since
/// "never" cannot itself be directly observed.
#[tokio::test]
async fn compute_object_state_for_an_uncreated_object_never_resolves() {
    let universe: Arc<Universe<Payload>> = Universe::new(Instant::from_nanos(0));
    let engine = osprey::SimulationEngine::new(universe, Arc::new(ImmediateExecutor), Arc::new(NoopTransition));
    let phantom = ObjectId::from_u128(70);

    let outcome = tokio::time::timeout(StdDuration::from_millis(50), engine.compute_object_state(phantom, Instant::from_nanos(5))).await;
    assert!(outcome.is_err(), "expected a timeout, not a resolved value, for an object that was never created");
}
