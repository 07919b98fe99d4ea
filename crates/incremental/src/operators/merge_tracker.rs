//! Duplicate-key resolution shared by the merge family.
//!
//! Several contributors (child streams, parent items, source streams) can
//! provide a value for the same key. The tracker keeps every contribution in
//! arrival order and publishes exactly one of them per key.

use crate::options::MergeOptions;
use core::hash::Hash;
use hashbrown::{HashMap, HashSet};
use keyflux_core::{ChangeAwareCache, ChangeReason, ChangeSet, Item, Key};

pub(crate) struct MergeTracker<T, K, P> {
    candidates: HashMap<K, Vec<(P, T)>>,
    visible: HashMap<K, P>,
    by_contributor: HashMap<P, HashSet<K>>,
    output: ChangeAwareCache<T, K>,
    options: MergeOptions<T>,
}

impl<T, K, P> MergeTracker<T, K, P>
where
    T: Item,
    K: Key,
    P: Clone + Eq + Hash,
{
    pub(crate) fn new(options: MergeOptions<T>) -> Self {
        Self {
            candidates: HashMap::new(),
            visible: HashMap::new(),
            by_contributor: HashMap::new(),
            output: ChangeAwareCache::new(),
            options,
        }
    }

    /// Replays one contributor's change-set.
    pub(crate) fn apply(&mut self, contributor: &P, changes: &ChangeSet<T, K>) {
        for change in changes {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.add_or_update(contributor, change.key().clone(), change.current().clone())
                }
                ChangeReason::Remove => self.remove(contributor, change.key()),
                ChangeReason::Refresh => {
                    self.refresh(contributor, change.key(), change.current().clone())
                }
                ChangeReason::Moved => {}
            }
        }
    }

    pub(crate) fn add_or_update(&mut self, contributor: &P, key: K, value: T) {
        let list = self.candidates.entry(key.clone()).or_default();
        match list.iter().position(|(p, _)| p == contributor) {
            Some(index) => list[index].1 = value,
            None => list.push((contributor.clone(), value)),
        }
        self.by_contributor
            .entry(contributor.clone())
            .or_default()
            .insert(key.clone());
        self.reselect(&key, Some(contributor));
    }

    pub(crate) fn remove(&mut self, contributor: &P, key: &K) {
        if let Some(list) = self.candidates.get_mut(key) {
            list.retain(|(p, _)| p != contributor);
        }
        if let Some(keys) = self.by_contributor.get_mut(contributor) {
            keys.remove(key);
        }
        self.reselect(key, Some(contributor));
    }

    pub(crate) fn refresh(&mut self, contributor: &P, key: &K, value: T) {
        let Some(list) = self.candidates.get_mut(key) else {
            return;
        };
        let Some(slot) = list.iter_mut().find(|(p, _)| p == contributor) else {
            return;
        };
        slot.1 = value;
        let was_visible = self.visible.get(key) == Some(contributor);
        if self.options.comparer.is_some() {
            self.reselect(key, None);
        }
        if was_visible && self.visible.get(key) == Some(contributor) {
            self.output.refresh(key);
        }
    }

    /// Withdraws every contribution of `contributor`.
    pub(crate) fn remove_contributor(&mut self, contributor: &P) {
        let Some(keys) = self.by_contributor.remove(contributor) else {
            return;
        };
        for key in keys {
            if let Some(list) = self.candidates.get_mut(&key) {
                list.retain(|(p, _)| p != contributor);
            }
            self.reselect(&key, Some(contributor));
        }
    }

    /// Keys currently contributed by `contributor`.
    pub(crate) fn keys_of(&self, contributor: &P) -> Vec<K> {
        self.by_contributor
            .get(contributor)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn capture_changes(&mut self) -> ChangeSet<T, K> {
        self.output.capture_changes()
    }

    /// Publishes the winning contribution for `key`.
    ///
    /// A change of winner is always an update. The same winner publishes an
    /// update only when `changed` is the winner and its value is not equal.
    fn reselect(&mut self, key: &K, changed: Option<&P>) {
        let chosen = self.candidates.get(key).and_then(|list| {
            let best = match &self.options.comparer {
                Some(comparer) => list.iter().min_by(|a, b| comparer(&a.1, &b.1)),
                None => list.first(),
            };
            best.cloned()
        });
        let Some((winner, value)) = chosen else {
            self.candidates.remove(key);
            self.visible.remove(key);
            self.output.remove(key);
            return;
        };
        let switched = self.visible.get(key) != Some(&winner);
        let publish = match self.output.get(key) {
            None => true,
            Some(_) if switched => true,
            Some(current) => {
                changed == Some(&winner)
                    && !self
                        .options
                        .equality
                        .as_ref()
                        .is_some_and(|equal| equal(current, &value))
            }
        };
        if publish {
            self.output.add_or_update(key.clone(), value);
        }
        self.visible.insert(key.clone(), winner);
    }
}
