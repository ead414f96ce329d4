//! Simulated time.
//!
//! `Instant` is a signed nanosecond count since an implied epoch, the same newtype-over-`i64`
//! shape the teacher lineage uses for its `Time`/`Duration` types, but with checked arithmetic:
//! this engine must fail explicitly on overflow rather than wrap (see [`Instant::checked_add`]).

use crate::error::EngineError;
use derive_more::{Add, Display, Sub};

/// A single tick, the smallest representable gap between two instants.
pub const ONE_TICK: i64 = 1;

/// A point in simulated time: a signed count of nanoseconds since an implied epoch.
///
/// Totally ordered, with distinguished sentinels [`Instant::START_OF_TIME`] and
/// [`Instant::END_OF_TIME`].
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Add, Sub)]
pub struct Instant(i64);

impl Instant {
    /// The minimum representable instant. No read or write may observe a time before
    /// `historyStart`, which itself can never regress below this.
    pub const START_OF_TIME: Instant = Instant(i64::MIN);

    /// The maximum representable instant. Used as the "commit front" of a destroyed object,
    /// and as the implicit upper bound of an unbounded `advanceHistory`.
    pub const END_OF_TIME: Instant = Instant(i64::MAX);

    /// Constructs an instant directly from a nanosecond count.
    pub const fn from_nanos(nanos: i64) -> Self {
        Instant(nanos)
    }

    /// The underlying nanosecond count.
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// `self + ticks`, failing with [`EngineError::TimeOverflow`] instead of wrapping.
    pub fn checked_add(self, ticks: i64) -> Result<Instant, EngineError> {
        self.0
            .checked_add(ticks)
            .map(Instant)
            .ok_or(EngineError::TimeOverflow)
    }

    /// `self - ticks`, failing with [`EngineError::TimeOverflow`] instead of wrapping.
    pub fn checked_sub(self, ticks: i64) -> Result<Instant, EngineError> {
        self.0
            .checked_sub(ticks)
            .map(Instant)
            .ok_or(EngineError::TimeOverflow)
    }

    /// The instant one tick after this one. Used by the escalation check in
    /// [`crate::object::ObjectData::try_append`] (`lastTransitionTime + 1 tick`).
    pub fn next_tick(self) -> Result<Instant, EngineError> {
        self.checked_add(ONE_TICK)
    }

    /// Whether this is either sentinel.
    pub fn is_sentinel(self) -> bool {
        self == Instant::START_OF_TIME || self == Instant::END_OF_TIME
    }
}

// `derive_more::Add`/`Sub` give us `Instant + Instant`, which isn't meaningful on its own, but
// the crate has no distinct `Duration` type (plain `i64` tick counts are used instead, following
// the spec's "nanosecond-granularity arithmetic" wording rather than introducing a second
// newtype). Provide the operators people actually want: instant +/- raw tick counts, unchecked
// (the checked variants above are for call sites that must surface `TimeOverflow`).
impl std::ops::Add<i64> for Instant {
    type Output = Instant;
    fn add(self, rhs: i64) -> Instant {
        Instant(self.0 + rhs)
    }
}

impl std::ops::Sub<i64> for Instant {
    type Output = Instant;
    fn sub(self, rhs: i64) -> Instant {
        Instant(self.0 - rhs)
    }
}
