//! `ValueHistory<V>`: an immutable-at-the-start, append-friendly time-indexed sequence of values.
//!
//! Mirrors the `Timeline<R, M>` shape used throughout the teacher lineage
//! (`examples/JoelCourtney-swift/swift/src/timeline.rs`: a `BTreeMap<Time, _>` plus
//! `last`/`last_before`/`first_after` lookups) but indexes plain values instead of operation
//! pointers, and enforces the "no two consecutive equal values" normal form described in §4.1.

use crate::time::Instant;
use std::collections::BTreeMap;

/// A mapping from [`Instant`] to `V`, total on all instants via a distinguished first value plus
/// a finite, time-ordered sequence of transitions.
///
/// Two consecutive values (the first value and the first transition, or any two adjacent
/// transitions) are never equal — this is enforced by every mutating method, not just assumed.
#[derive(Clone, Debug)]
pub struct ValueHistory<V> {
    first_value: V,
    transitions: BTreeMap<Instant, V>,
}

impl<V: Clone + PartialEq> ValueHistory<V> {
    /// A history with `first_value` at `START_OF_TIME` and no transitions.
    pub fn new(first_value: V) -> Self {
        ValueHistory {
            first_value,
            transitions: BTreeMap::new(),
        }
    }

    /// The value at `START_OF_TIME`.
    pub fn first_value(&self) -> &V {
        &self.first_value
    }

    /// The value at `END_OF_TIME`: the last transition's value, or the first value if there are
    /// no transitions.
    pub fn last_value(&self) -> &V {
        self.transitions
            .values()
            .next_back()
            .unwrap_or(&self.first_value)
    }

    /// The value at `t`: the value of the greatest transition at or before `t`, or the first
    /// value if none precedes it. Total on every `Instant`.
    pub fn get(&self, t: Instant) -> &V {
        self.transitions
            .range(..=t)
            .next_back()
            .map(|(_, v)| v)
            .unwrap_or(&self.first_value)
    }

    pub fn first_transition_time(&self) -> Option<Instant> {
        self.transitions.keys().next().copied()
    }

    pub fn last_transition_time(&self) -> Option<Instant> {
        self.transitions.keys().next_back().copied()
    }

    /// The least transition time at or after `t`, if any.
    pub fn transition_at_or_after(&self, t: Instant) -> Option<Instant> {
        self.transitions.range(t..).next().map(|(k, _)| *k)
    }

    /// Whether there is a transition recorded at exactly `t`.
    pub fn has_transition_at(&self, t: Instant) -> bool {
        self.transitions.contains_key(&t)
    }

    /// A lazy, restartable sequence of `(time, value)` transitions, in time order. Does not
    /// include the first value.
    pub fn transitions(&self) -> impl Iterator<Item = (Instant, &V)> + '_ {
        self.transitions.iter().map(|(t, v)| (*t, v))
    }

    /// Appends `(t, v)`. Requires `t` to be strictly after the last transition (or, if there are
    /// none, any `t`), and `v` to differ from the current last value.
    pub fn append_transition(&mut self, t: Instant, v: V) -> Result<(), crate::error::EngineError> {
        if let Some(last_t) = self.last_transition_time() {
            if t <= last_t {
                return Err(crate::error::EngineError::InvalidArgument(format!(
                    "appendTransition at {t} is not strictly after the last transition at {last_t}"
                )));
            }
        }
        if v == *self.last_value() {
            return Err(crate::error::EngineError::InvalidArgument(
                "appendTransition value equals the current last value".to_string(),
            ));
        }
        self.transitions.insert(t, v);
        Ok(())
    }

    /// Erases every transition at or after `t`.
    pub fn remove_transitions_from(&mut self, t: Instant) {
        self.transitions.split_off(&t);
    }

    /// Replaces the suffix from `t` onward with `v`, merging the boundary so the no-equal-
    /// consecutive invariant holds (no transition is inserted if `v` already equals the value that
    /// would otherwise be active just before `t`).
    pub fn set_value_from(&mut self, t: Instant, v: V) {
        self.remove_transitions_from(t);
        if t == Instant::START_OF_TIME {
            self.first_value = v;
            return;
        }
        if *self.last_value() != v {
            self.transitions.insert(t, v);
        }
    }

    /// Replaces the prefix strictly before `t` with `v`; the value at and after `t` is unchanged.
    /// A no-op if `t` is `START_OF_TIME` (there is nothing before it to replace).
    pub fn set_value_until(&mut self, t: Instant, v: V) {
        if t <= Instant::START_OF_TIME {
            return;
        }
        let value_at_t = self.get(t).clone();
        let mut tail = self.transitions.split_off(&t);
        // `split_off` only keeps transitions already sitting at or after `t`; if none was recorded
        // exactly at `t`, the old value there (`value_at_t`, inherited from whatever preceded it)
        // must be re-anchored before the new `first_value` takes over the prefix, or the suffix
        // would silently adopt `v` too.
        if value_at_t != v {
            tail.entry(t).or_insert_with(|| value_at_t.clone());
        }
        self.transitions = tail;
        self.first_value = v;
        if value_at_t == v && self.transitions.get(&t) == Some(&v) {
            self.transitions.remove(&t);
        }
    }
}

impl<V: PartialEq> PartialEq for ValueHistory<V> {
    fn eq(&self, other: &Self) -> bool {
        self.first_value == other.first_value && self.transitions == other.transitions
    }
}

impl<V: Eq> Eq for ValueHistory<V> {}
