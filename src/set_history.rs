//! `SetHistory<T>`: a time-indexed set of `T`, represented as one boolean [`ValueHistory`] per
//! element (§4.2). Absent elements are implicitly false everywhere, matching "the first value is
//! the empty set".

use crate::history::ValueHistory;
use crate::time::Instant;
use std::collections::HashMap;
use std::hash::Hash;

/// A `ValueHistory<HashSet<T>>`, decomposed into per-element membership histories so that adding
/// or removing one element never touches the others' entries.
///
/// Not a concurrent structure on its own: every `SetHistory` in this crate lives behind the lock
/// of the `ObjectData` that owns it (§4.3).
#[derive(Clone, Debug, Default)]
pub struct SetHistory<T: Eq + Hash + Clone> {
    members: HashMap<T, ValueHistory<bool>>,
}

impl<T: Eq + Hash + Clone> SetHistory<T> {
    pub fn new() -> Self {
        SetHistory {
            members: HashMap::new(),
        }
    }

    /// The set of elements present at `t`.
    pub fn get(&self, t: Instant) -> Vec<T>
    where
        T: Clone,
    {
        self.members
            .iter()
            .filter(|(_, h)| *h.get(t))
            .map(|(x, _)| x.clone())
            .collect()
    }

    /// Whether `x` is present at `t`.
    pub fn contains_at(&self, t: Instant, x: &T) -> bool {
        self.members.get(x).map(|h| *h.get(t)).unwrap_or(false)
    }

    /// The full membership history of `x`, if it has ever been touched.
    pub fn contains(&self, x: &T) -> Option<&ValueHistory<bool>> {
        self.members.get(x)
    }

    /// Marks `x` present from `t` onward.
    pub fn add_from(&mut self, t: Instant, x: T) {
        self.members
            .entry(x)
            .or_insert_with(|| ValueHistory::new(false))
            .set_value_from(t, true);
    }

    /// Marks `x` present for every instant at or before `t` (inclusive). Implemented as
    /// [`ValueHistory::set_value_until`] on `t`'s successor tick, since that primitive's boundary
    /// is exclusive of its argument; overflow at `END_OF_TIME` degrades to "present everywhere".
    pub fn add_until(&mut self, t: Instant, x: T) {
        let bound = t.next_tick().unwrap_or(Instant::END_OF_TIME);
        self.members
            .entry(x)
            .or_insert_with(|| ValueHistory::new(false))
            .set_value_until(bound, true);
    }

    /// Marks `x` absent at every instant, past and future.
    pub fn remove(&mut self, x: &T) {
        if let Some(history) = self.members.get_mut(x) {
            history.set_value_from(Instant::START_OF_TIME, false);
        }
    }

    /// Drops every membership history, resetting to the empty set everywhere.
    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn is_empty_at(&self, t: Instant) -> bool {
        self.members.values().all(|h| !*h.get(t))
    }
}
