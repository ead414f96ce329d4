//! `Executor`: the caller-supplied unit-of-work dispatcher §5 and §6 describe.
//!
//! The engine never spawns a thread of its own; every background advance step is a `Runnable`
//! handed to whatever executor the host process constructed the [`crate::engine::SimulationEngine`]
//! with. This mirrors the teacher lineage's own insistence on a caller-supplied executor
//! (`swift`/`peregrine`'s `ExecEnvironment` + `async_executor::StaticExecutor` pairing) without
//! adopting its bump-allocator/stack-depth machinery, which is specific to that lineage's
//! activity-expansion recursion and has no counterpart here.

/// A unit of work the engine wants run, at the caller's discretion, on any thread.
pub type Runnable = Box<dyn FnOnce() + Send>;

/// The engine's only concurrency primitive: something that can run a [`Runnable`].
///
/// Implementations may run `task` synchronously on the calling thread (useful for deterministic
/// tests), hand it to a thread pool, or queue it on an async runtime. Scheduling is a hint — per
/// §4.7, if `execute` drops `task` instead of running it, the engine is not told and simply relies
/// on the next external wake (a later write, or another `advance_history` call) to retry.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Runnable);
}

/// Runs every task immediately, on the calling thread, before `execute` returns. Deterministic:
/// useful for tests that want to assert on state right after triggering an advance, and for
/// embedding this crate in a host that already has its own single-threaded event loop.
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
    fn execute(&self, task: Runnable) {
        task();
    }
}
