//! Identifiers: object identity, transaction/coordinator identity, and the shared "lockable id"
//! space used to impose the total lock order described in §5.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// A 128-bit globally-unique object identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Mints a fresh, random object id.
    pub fn new() -> Self {
        ObjectId(Uuid::new_v4())
    }

    /// Constructs an id from raw bytes, mainly useful for deterministic tests.
    pub const fn from_u128(value: u128) -> Self {
        ObjectId(Uuid::from_u128(value))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(ObjectId, Instant)`, ordered lexicographically by instant first, then by id.
///
/// This is the opposite field order from [`ObjectStateId`]'s declaration, so `Ord`/`PartialOrd`
/// are implemented by hand rather than derived.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObjectStateId {
    pub object: ObjectId,
    pub when: crate::time::Instant,
}

impl ObjectStateId {
    pub fn new(object: ObjectId, when: crate::time::Instant) -> Self {
        ObjectStateId { object, when }
    }
}

impl Ord for ObjectStateId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.when, self.object).cmp(&(other.when, other.object))
    }
}

impl PartialOrd for ObjectStateId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A monotonically-increasing id shared by all lockable entities (`ObjectData`, `Transaction`,
/// `TransactionCoordinator`). Acquiring locks in ascending `LockableId` order is what gives the
/// engine a total lock order and rules out lock-cycle deadlock (§5).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LockableId(u64);

/// A transaction's identity, distinct from its `LockableId` (a transaction and its coordinator
/// are different lockables, minted from the same counter, but addressed independently).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TransactionId(u64);

/// A coordinator's identity. Coordinators are merged over time; a `CoordinatorId` that has been
/// folded into another one is resolved through [`crate::coordinator::CoordinatorTable::resolve`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct CoordinatorId(u64);

/// A single monotonic counter backing transaction ids, coordinator ids, and lockable ids. The
/// Universe owns exactly one of these; sharing the counter across all three kinds keeps lockable
/// ids usable as a total order across mixed sets of transactions and coordinators.
#[derive(Default)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn new() -> Self {
        IdAllocator(AtomicU64::new(0))
    }

    fn next_raw(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_transaction_id(&self) -> TransactionId {
        TransactionId(self.next_raw())
    }

    pub fn next_coordinator_id(&self) -> CoordinatorId {
        CoordinatorId(self.next_raw())
    }

    pub fn next_lockable_id(&self) -> LockableId {
        LockableId(self.next_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Instant;

    #[test]
    fn object_state_id_orders_by_instant_first() {
        let a = ObjectId::from_u128(1);
        let b = ObjectId::from_u128(2);
        let early_b = ObjectStateId::new(b, Instant::from_nanos(0));
        let late_a = ObjectStateId::new(a, Instant::from_nanos(1));
        assert!(early_b < late_a);
    }

    #[test]
    fn allocator_ids_are_distinct_and_increasing() {
        let alloc = IdAllocator::new();
        let a = alloc.next_lockable_id();
        let b = alloc.next_lockable_id();
        assert!(a < b);
    }
}
