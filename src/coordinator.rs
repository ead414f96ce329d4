//! `TransactionCoordinator`: a mutually-dependent cluster of transactions that commits or aborts
//! as one unit, plus the predecessor/successor algebra and merge operation from §4.4.
//!
//! Coordinators are kept in a [`CoordinatorTable`] alongside a redirect map: merging folds a set
//! of coordinators into one survivor and leaves the folded-away ids behind as tombstones pointing
//! at the survivor, following the "non-owning handles into an arena, resolved through an
//! indirection table" shape §9's design notes call for.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::id::{CoordinatorId, IdAllocator, LockableId, TransactionId};

pub struct TransactionCoordinator {
    pub id: CoordinatorId,
    pub lockable_id: LockableId,
    inner: Mutex<CoordinatorInner>,
}

struct CoordinatorInner {
    mutual_transactions: HashSet<TransactionId>,
    predecessors: HashSet<CoordinatorId>,
    successors: HashSet<CoordinatorId>,
}

impl TransactionCoordinator {
    pub fn mutual_transactions(&self) -> Vec<TransactionId> {
        self.inner.lock().mutual_transactions.iter().copied().collect()
    }

    pub fn predecessors(&self) -> HashSet<CoordinatorId> {
        self.inner.lock().predecessors.clone()
    }

    pub fn successors(&self) -> HashSet<CoordinatorId> {
        self.inner.lock().successors.clone()
    }

    pub fn has_predecessors(&self) -> bool {
        !self.inner.lock().predecessors.is_empty()
    }
}

/// Locks `a` then `b` in ascending `lockable_id` order, but always returns `(guard_of_a,
/// guard_of_b)` regardless of which was physically acquired first. This is the "locked chain"
/// primitive from §5, specialised to the common two-lockable case.
fn lock_two<'a>(
    a: &'a TransactionCoordinator,
    b: &'a TransactionCoordinator,
) -> (MutexGuard<'a, CoordinatorInner>, MutexGuard<'a, CoordinatorInner>) {
    if a.lockable_id <= b.lockable_id {
        let ga = a.inner.lock();
        let gb = b.inner.lock();
        (ga, gb)
    } else {
        let gb = b.inner.lock();
        let ga = a.inner.lock();
        (ga, gb)
    }
}

/// Owns every live `TransactionCoordinator`, mints fresh ones, and resolves ids that have been
/// folded away by a merge.
pub struct CoordinatorTable {
    alloc: Arc<IdAllocator>,
    coordinators: DashMap<CoordinatorId, Arc<TransactionCoordinator>, foldhash::fast::FixedState>,
    redirects: DashMap<CoordinatorId, CoordinatorId, foldhash::fast::FixedState>,
}

impl CoordinatorTable {
    pub fn new(alloc: Arc<IdAllocator>) -> Self {
        CoordinatorTable {
            alloc,
            coordinators: DashMap::default(),
            redirects: DashMap::default(),
        }
    }

    /// Mints a fresh single-member coordinator owning `tx`.
    pub fn create(&self, tx: TransactionId) -> Arc<TransactionCoordinator> {
        let id = self.alloc.next_coordinator_id();
        let coordinator = Arc::new(TransactionCoordinator {
            id,
            lockable_id: self.alloc.next_lockable_id(),
            inner: Mutex::new(CoordinatorInner {
                mutual_transactions: HashSet::from([tx]),
                predecessors: HashSet::new(),
                successors: HashSet::new(),
            }),
        });
        self.coordinators.insert(id, coordinator.clone());
        coordinator
    }

    /// Follows the redirect chain to the current live coordinator id for `id`, compressing the
    /// path as it goes.
    pub fn resolve(&self, id: CoordinatorId) -> CoordinatorId {
        let mut current = id;
        let mut hops = Vec::new();
        while let Some(next) = self.redirects.get(&current).map(|r| *r) {
            hops.push(current);
            current = next;
        }
        for hop in hops {
            self.redirects.insert(hop, current);
        }
        current
    }

    pub fn get(&self, id: CoordinatorId) -> Arc<TransactionCoordinator> {
        let resolved = self.resolve(id);
        self.coordinators
            .get(&resolved)
            .expect("coordinator id must be live or resolvable")
            .clone()
    }

    /// As [`Self::get`], but returns `None` instead of panicking if `id` has already been retired
    /// (every mutual transaction closed before some other thread's cascade reached it).
    pub fn try_get(&self, id: CoordinatorId) -> Option<Arc<TransactionCoordinator>> {
        let resolved = self.resolve(id);
        self.coordinators.get(&resolved).map(|c| c.clone())
    }

    /// Drops `tx` from `id`'s mutual-transaction set once that transaction has closed, so that
    /// [`Self::retire`] can later observe the coordinator as empty.
    pub fn remove_mutual(&self, id: CoordinatorId, tx: TransactionId) {
        let resolved = self.resolve(id);
        if let Some(coord) = self.coordinators.get(&resolved) {
            coord.inner.lock().mutual_transactions.remove(&tx);
        }
    }

    /// Adds a predecessor edge: `p` must commit before `s`. Implements the three-way algebra from
    /// §4.4: no-op if already implied, merge on cycle, otherwise propagate the transitive closure
    /// both ways. Returns the transactions whose `coordinator` field must be updated to point at
    /// the id they were merged into, if a merge happened.
    pub fn add_predecessor(&self, p: CoordinatorId, s: CoordinatorId) -> Vec<TransactionId> {
        let p_id = self.resolve(p);
        let s_id = self.resolve(s);
        if p_id == s_id {
            return Vec::new();
        }

        let p_coord = self.get(p_id);
        let s_coord = self.get(s_id);
        let (mut p_guard, mut s_guard) = lock_two(&p_coord, &s_coord);

        if s_guard.predecessors.contains(&p_id) {
            return Vec::new();
        }
        if s_guard.successors.contains(&p_id) || p_guard.predecessors.contains(&s_id) {
            drop(p_guard);
            drop(s_guard);
            let (dest, source) = if p_id <= s_id { (p_id, s_id) } else { (s_id, p_id) };
            return self.merge(dest, [source]);
        }

        let p_closure: HashSet<CoordinatorId> = p_guard
            .predecessors
            .iter()
            .copied()
            .chain(std::iter::once(p_id))
            .collect();
        let s_closure: HashSet<CoordinatorId> = s_guard
            .successors
            .iter()
            .copied()
            .chain(std::iter::once(s_id))
            .collect();

        s_guard.predecessors.extend(p_closure.iter().copied());
        p_guard.successors.extend(s_closure.iter().copied());
        drop(p_guard);
        drop(s_guard);

        for succ_id in &s_closure {
            if *succ_id == s_id {
                continue;
            }
            let succ = self.get(*succ_id);
            succ.inner.lock().predecessors.extend(p_closure.iter().copied());
        }
        for pred_id in &p_closure {
            if *pred_id == p_id {
                continue;
            }
            let pred = self.get(*pred_id);
            pred.inner.lock().successors.extend(s_closure.iter().copied());
        }

        Vec::new()
    }

    /// Folds `sources` into `dest`, iterating to a fixed point over any new predecessor/successor
    /// intersections the fold creates (§4.4's merge). Returns every transaction that was retargeted
    /// to `dest` (or to whatever `dest` was itself further merged into).
    pub fn merge(
        &self,
        dest: CoordinatorId,
        sources: impl IntoIterator<Item = CoordinatorId>,
    ) -> Vec<TransactionId> {
        let dest_id = self.resolve(dest);
        let dest_coord = self.get(dest_id);
        let mut retargeted = Vec::new();

        let mut frontier: Vec<CoordinatorId> = sources
            .into_iter()
            .map(|s| self.resolve(s))
            .filter(|s| *s != dest_id)
            .collect();

        while !frontier.is_empty() {
            for src_id in frontier.drain(..).collect::<Vec<_>>() {
                if src_id == dest_id || self.resolve(src_id) == dest_id {
                    continue;
                }
                let src_coord = self.get(src_id);
                let (mut dest_guard, mut src_guard) = lock_two(&dest_coord, &src_coord);

                dest_guard.predecessors.extend(src_guard.predecessors.iter().copied());
                dest_guard.successors.extend(src_guard.successors.iter().copied());
                let moved_txs: Vec<TransactionId> = src_guard.mutual_transactions.drain().collect();
                dest_guard.mutual_transactions.extend(moved_txs.iter().copied());
                src_guard.predecessors.clear();
                src_guard.successors.clear();
                drop(src_guard);
                drop(dest_guard);

                self.redirects.insert(src_id, dest_id);
                self.coordinators.remove(&src_id);
                retargeted.extend(moved_txs);
            }

            let mut dest_guard = dest_coord.inner.lock();
            dest_guard.predecessors.remove(&dest_id);
            dest_guard.successors.remove(&dest_id);
            let new_cycles: Vec<CoordinatorId> = dest_guard
                .predecessors
                .intersection(&dest_guard.successors)
                .copied()
                .collect();
            drop(dest_guard);
            frontier = new_cycles;
        }

        retargeted
    }

    /// `beginAbort`'s predecessor half: `id` no longer needs `pred` to commit first (either
    /// because `pred` just aborted, or because it just committed).
    pub fn remove_predecessor(&self, id: CoordinatorId, pred: CoordinatorId) {
        let id = self.resolve(id);
        let pred = self.resolve(pred);
        if let Some(coord) = self.coordinators.get(&id) {
            coord.inner.lock().predecessors.remove(&pred);
        }
    }

    /// `beginAbort`'s successor half: `id` no longer needs to wait for `succ`'s predecessor edge
    /// (used when `id` itself is aborting and relieves its successors of that dependency... see
    /// `remove_predecessor`, called from the successor's own id by the caller).
    pub fn remove_successor(&self, id: CoordinatorId, succ: CoordinatorId) {
        let id = self.resolve(id);
        let succ = self.resolve(succ);
        if let Some(coord) = self.coordinators.get(&id) {
            coord.inner.lock().successors.remove(&succ);
        }
    }

    /// Drops a coordinator once it has no more live mutual transactions (every one of them has
    /// closed). Safe to call on an id that has already been redirected away; it is then a no-op.
    pub fn retire(&self, id: CoordinatorId) {
        let resolved = self.resolve(id);
        let should_remove = self
            .coordinators
            .get(&resolved)
            .map(|c| c.mutual_transactions().is_empty())
            .unwrap_or(false);
        if should_remove {
            self.coordinators.remove(&resolved);
        }
    }
}
