//! Change set for tracking keyed collection changes.
//!
//! A ChangeSet is the ordered batch of changes produced by one upstream
//! emission. Order is significant: replaying a change-set against a shadow
//! cache must see each key's state as of the start of the batch.

use crate::change::{Change, ChangeReason};

/// An ordered batch of keyed changes.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeSet<T, K> {
    changes: Vec<Change<T, K>>,
}

impl<T, K> Default for ChangeSet<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> ChangeSet<T, K> {
    /// Creates a new empty change set.
    #[inline]
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
        }
    }

    /// Creates an empty change set with room for `capacity` changes.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            changes: Vec::with_capacity(capacity),
        }
    }

    /// Creates a change set representing an initial state.
    ///
    /// All items are treated as additions, in iteration order.
    pub fn initial(items: impl IntoIterator<Item = (K, T)>) -> Self {
        items
            .into_iter()
            .map(|(key, value)| Change::add(key, value))
            .collect()
    }

    /// Returns true if there are no changes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the total number of changes.
    #[inline]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Appends a change.
    #[inline]
    pub fn push(&mut self, change: Change<T, K>) {
        self.changes.push(change);
    }

    /// Appends every change of another change set, keeping order.
    pub fn merge(&mut self, other: ChangeSet<T, K>) {
        self.changes.extend(other.changes);
    }

    /// Clears all changes.
    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// Iterates over the changes in order.
    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, Change<T, K>> {
        self.changes.iter()
    }

    /// Returns the changes as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[Change<T, K>] {
        &self.changes
    }

    /// Number of changes with the given reason.
    pub fn count(&self, reason: ChangeReason) -> usize {
        self.changes.iter().filter(|c| c.reason() == reason).count()
    }

    /// Number of additions.
    #[inline]
    pub fn adds(&self) -> usize {
        self.count(ChangeReason::Add)
    }

    /// Number of updates.
    #[inline]
    pub fn updates(&self) -> usize {
        self.count(ChangeReason::Update)
    }

    /// Number of removals.
    #[inline]
    pub fn removes(&self) -> usize {
        self.count(ChangeReason::Remove)
    }

    /// Number of refreshes.
    #[inline]
    pub fn refreshes(&self) -> usize {
        self.count(ChangeReason::Refresh)
    }

    /// Number of moves.
    #[inline]
    pub fn moves(&self) -> usize {
        self.count(ChangeReason::Moved)
    }

    /// Maps every value, keeping keys and reasons.
    pub fn map<U, F>(self, mut f: F) -> ChangeSet<U, K>
    where
        F: FnMut(T) -> U,
    {
        self.changes.into_iter().map(|c| c.map(&mut f)).collect()
    }
}

impl<T, K> IntoIterator for ChangeSet<T, K> {
    type Item = Change<T, K>;
    type IntoIter = std::vec::IntoIter<Change<T, K>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, T, K> IntoIterator for &'a ChangeSet<T, K> {
    type Item = &'a Change<T, K>;
    type IntoIter = core::slice::Iter<'a, Change<T, K>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl<T, K> FromIterator<Change<T, K>> for ChangeSet<T, K> {
    fn from_iter<I: IntoIterator<Item = Change<T, K>>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

impl<T, K> From<Vec<Change<T, K>>> for ChangeSet<T, K> {
    fn from(changes: Vec<Change<T, K>>) -> Self {
        Self { changes }
    }
}

impl<T, K> Extend<Change<T, K>> for ChangeSet<T, K> {
    fn extend<I: IntoIterator<Item = Change<T, K>>>(&mut self, iter: I) {
        self.changes.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_set_new() {
        let cs: ChangeSet<i32, i32> = ChangeSet::new();
        assert!(cs.is_empty());
        assert_eq!(cs.len(), 0);
    }

    #[test]
    fn test_change_set_initial() {
        let cs = ChangeSet::initial(vec![(1, "a"), (2, "b")]);
        assert_eq!(cs.adds(), 2);
        assert_eq!(cs.len(), 2);
        assert_eq!(*cs.as_slice()[1].key(), 2);
    }

    #[test]
    fn test_change_set_counts() {
        let cs: ChangeSet<i32, i32> = vec![
            Change::add(1, 10),
            Change::update(1, 11, 10),
            Change::refresh(1, 11),
            Change::moved(1, 11, 0, 1),
            Change::remove(1, 11),
        ]
        .into();

        assert_eq!(cs.adds(), 1);
        assert_eq!(cs.updates(), 1);
        assert_eq!(cs.refreshes(), 1);
        assert_eq!(cs.moves(), 1);
        assert_eq!(cs.removes(), 1);
    }

    #[test]
    fn test_change_set_merge_keeps_order() {
        let mut cs1: ChangeSet<i32, i32> = ChangeSet::new();
        cs1.push(Change::add(1, 10));

        let mut cs2 = ChangeSet::new();
        cs2.push(Change::add(2, 20));
        cs2.push(Change::remove(1, 10));

        cs1.merge(cs2);

        let keys: Vec<i32> = cs1.iter().map(|c| *c.key()).collect();
        assert_eq!(keys, vec![1, 2, 1]);
        assert_eq!(cs1.removes(), 1);
    }

    #[test]
    fn test_change_set_map() {
        let cs: ChangeSet<i32, i32> = vec![Change::add(1, 10), Change::update(1, 12, 10)].into();
        let mapped = cs.map(|v| v.to_string());
        assert_eq!(mapped.as_slice()[1].previous(), Some(&"10".to_string()));
    }

    #[test]
    fn test_change_set_clear() {
        let mut cs = ChangeSet::new();
        cs.push(Change::add(1, 10));
        assert!(!cs.is_empty());
        cs.clear();
        assert!(cs.is_empty());
    }
}
