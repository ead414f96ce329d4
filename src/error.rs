//! The engine's one concrete error type.
//!
//! Per §7 of the design: contract violations and prehistory reads are the only failure kinds a
//! caller ever sees as an `Err`. Optimistic-conflict failures (a read invalidated by a concurrent
//! write, a cycle forcing a coordinator merge, a past-the-end read going stale) never construct an
//! `EngineError` at all; they are represented purely as a transaction's internal transition to
//! `Aborting`.

use crate::id::ObjectId;
use crate::time::Instant;

/// Everything that can go wrong calling into this crate, as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A read (or `setHistoryStart`) referenced an instant before `historyStart`.
    #[error("read at {requested} is before history start {history_start}")]
    Prehistory {
        requested: Instant,
        history_start: Instant,
    },

    /// The operation is not valid in the transaction's current state (e.g. `put` while Reading).
    #[error("cannot {op}: transaction is {actual}, expected {expected}")]
    IllegalState {
        expected: &'static str,
        actual: &'static str,
        op: &'static str,
    },

    /// A caller-supplied argument violates a documented precondition (e.g. a negative advance, or
    /// a write at `START_OF_TIME`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Instant arithmetic would have overflowed `i64` nanoseconds.
    #[error("time arithmetic overflowed")]
    TimeOverflow,

    /// The transaction cannot commit: it (or a coordinator predecessor) has already aborted, or
    /// is not in the `Committing` state.
    #[error("transaction was aborted and cannot commit")]
    AbortedTransaction,

    /// The application's `putNextStateTransition` callback returned an error. Wraps it with the
    /// object and instant being advanced, per §7's "wrap in a diagnostic" requirement.
    #[error("next-state callback for {object:?} at {when} failed: {source}")]
    CallbackFailed {
        object: ObjectId,
        when: Instant,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    pub(crate) fn illegal_state(op: &'static str, expected: &'static str, actual: &'static str) -> Self {
        EngineError::IllegalState {
            expected,
            actual,
            op,
        }
    }

    /// Wraps a `putNextStateTransition` failure with the prior state id and instant it was called
    /// with, per §7's "wrap in a diagnostic that includes the prior state id and the instants
    /// involved" requirement.
    pub(crate) fn callback_failed(object: ObjectId, when: Instant, source: anyhow::Error) -> Self {
        EngineError::CallbackFailed { object, when, source }
    }
}
