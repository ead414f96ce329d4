//! A multi-threaded, parallel discrete-event simulation kernel.
//!
//! A [`Universe`] is a concurrent, optimistic-transactional store of per-object state histories:
//! readers and writers proceed without blocking on each other, conflicts are detected rather than
//! prevented, and conflicting transactions abort and retry instead of serializing behind a lock. A
//! [`SimulationEngine`] sits on top of it, driving each object's history forward by repeatedly
//! running a caller-supplied state-transition callback on a caller-supplied [`Executor`].
//!
//! This crate does not implement distributed operation, disk persistence, rollback of already-
//! committed state, wall-clock synchronization, or a process-oriented modelling layer — see the
//! design notes in `DESIGN.md` for what is and isn't in scope.
//!
//! ```
//! use std::sync::Arc;
//! use osprey::{ImmediateExecutor, Instant, ObjectId, ObjectState, PutNextStateTransition, Transaction, Universe};
//!
//! struct Counter;
//!
//! impl PutNextStateTransition<i32> for Counter {
//!     fn put_next_state_transition(
//!         &self,
//!         tx: &Transaction<i32>,
//!         object: ObjectId,
//!         when_prev: Instant,
//!         prior_state: ObjectState<i32>,
//!     ) -> anyhow::Result<()> {
//!         let next = prior_state.map(|v| *v).unwrap_or(0) + 1;
//!         tx.begin_write(when_prev.checked_add(1)?)?;
//!         tx.put(object, Some(Arc::new(next)))?;
//!         Ok(())
//!     }
//! }
//!
//! let universe = Universe::new(Instant::from_nanos(0));
//! let object = ObjectId::new();
//! let tx = universe.begin_transaction(None);
//! tx.begin_write(Instant::from_nanos(1)).unwrap();
//! tx.put(object, Some(Arc::new(0))).unwrap();
//! tx.begin_commit().unwrap();
//! tx.close();
//!
//! let engine = osprey::SimulationEngine::new(universe.clone(), Arc::new(ImmediateExecutor), Arc::new(Counter));
//! engine.advance_object(object, Instant::from_nanos(5));
//! assert_eq!(universe.begin_transaction(None).get_object_state(object, Instant::from_nanos(5)).unwrap(), Some(Arc::new(4)));
//! ```

mod coordinator;
mod engine;
mod error;
mod executor;
mod history;
mod id;
mod object;
mod set_history;
mod time;
mod transaction;
mod universe;

pub use engine::{ComputedState, PutNextStateTransition, SimulationEngine};
pub use error::EngineError;
pub use executor::{Executor, ImmediateExecutor, Runnable};
pub use history::ValueHistory;
pub use id::{CoordinatorId, LockableId, ObjectId, ObjectStateId, TransactionId};
pub use object::{ObjectState, ReadResult, TryAppendConflict, TryAppendOutcome};
pub use set_history::SetHistory;
pub use time::Instant;
pub use transaction::{Transaction, TransactionListener, TransactionState};
pub use universe::{Universe, UniverseStats};
