//! Keyed shadow caches.
//!
//! Every stateful operator keeps a private mirror of what its downstream
//! currently sees so it can turn the next upstream batch into a correct diff.
//! `ShadowCache` is the plain mirror; `ChangeAwareCache` additionally records
//! the changes its own mutations imply, so an operator can mutate freely and
//! then capture exactly one outgoing change-set.

use crate::change::{Change, ChangeReason};
use crate::change_set::ChangeSet;
use core::hash::Hash;
use hashbrown::HashMap;

/// A key to value mirror mutated only by replaying changes.
#[derive(Clone, Debug)]
pub struct ShadowCache<T, K> {
    data: HashMap<K, T>,
}

impl<T, K> Default for ShadowCache<T, K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> ShadowCache<T, K>
where
    K: Eq + Hash,
{
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Returns the number of items.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the cache holds no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Looks up the value for a key.
    #[inline]
    pub fn get(&self, key: &K) -> Option<&T> {
        self.data.get(key)
    }

    /// Returns true if the key is present.
    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Inserts or replaces a value, returning the replaced one.
    #[inline]
    pub fn insert(&mut self, key: K, value: T) -> Option<T> {
        self.data.insert(key, value)
    }

    /// Removes a key, returning its value.
    #[inline]
    pub fn remove(&mut self, key: &K) -> Option<T> {
        self.data.remove(key)
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Iterates over key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &T)> {
        self.data.iter()
    }

    /// Iterates over keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.keys()
    }

    /// Iterates over values.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.data.values()
    }

    /// Drains every item out of the cache.
    pub fn drain(&mut self) -> impl Iterator<Item = (K, T)> + '_ {
        self.data.drain()
    }
}

impl<T, K> ShadowCache<T, K>
where
    T: Clone,
    K: Eq + Hash + Clone,
{
    /// Replays a change-set in order.
    ///
    /// Adds and updates store the current value, removes drop the key,
    /// refreshes and moves leave the mirror untouched.
    pub fn apply(&mut self, changes: &ChangeSet<T, K>) {
        for change in changes {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.data.insert(change.key().clone(), change.current().clone());
                }
                ChangeReason::Remove => {
                    self.data.remove(change.key());
                }
                ChangeReason::Refresh | ChangeReason::Moved => {}
            }
        }
    }

    /// Returns the current contents as an all-add change-set.
    pub fn snapshot(&self) -> ChangeSet<T, K> {
        ChangeSet::initial(self.data.iter().map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Returns clones of every key/value pair.
    pub fn to_vec(&self) -> Vec<(K, T)> {
        self.data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A keyed cache that records the changes implied by its own mutations.
#[derive(Clone, Debug)]
pub struct ChangeAwareCache<T, K> {
    data: HashMap<K, T>,
    changes: ChangeSet<T, K>,
}

impl<T, K> Default for ChangeAwareCache<T, K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K> ChangeAwareCache<T, K>
where
    K: Eq + Hash,
{
    /// Creates an empty cache with no pending changes.
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            changes: ChangeSet::new(),
        }
    }

    /// Returns the number of items.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the cache holds no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Looks up the value for a key.
    #[inline]
    pub fn get(&self, key: &K) -> Option<&T> {
        self.data.get(key)
    }

    /// Returns true if the key is present.
    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Iterates over key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &T)> {
        self.data.iter()
    }

    /// Iterates over keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.keys()
    }

    /// Iterates over values.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.data.values()
    }

    /// Returns true if mutations are waiting to be captured.
    #[inline]
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Takes the recorded changes, leaving an empty pending list.
    pub fn capture_changes(&mut self) -> ChangeSet<T, K> {
        core::mem::take(&mut self.changes)
    }
}

impl<T, K> ChangeAwareCache<T, K>
where
    T: Clone,
    K: Eq + Hash + Clone,
{
    /// Adds or replaces a value, recording an add or an update.
    pub fn add_or_update(&mut self, key: K, value: T) {
        match self.data.insert(key.clone(), value.clone()) {
            Some(previous) => self.changes.push(Change::update(key, value, previous)),
            None => self.changes.push(Change::add(key, value)),
        }
    }

    /// Removes a key, recording a remove when it was present.
    pub fn remove(&mut self, key: &K) -> Option<T> {
        let removed = self.data.remove(key);
        if let Some(value) = &removed {
            self.changes.push(Change::remove(key.clone(), value.clone()));
        }
        removed
    }

    /// Records a refresh for a present key.
    pub fn refresh(&mut self, key: &K) -> bool {
        match self.data.get(key) {
            Some(value) => {
                self.changes.push(Change::refresh(key.clone(), value.clone()));
                true
            }
            None => false,
        }
    }

    /// Removes every item, recording a remove for each.
    pub fn clear(&mut self) {
        for (key, value) in self.data.drain() {
            self.changes.push(Change::remove(key, value));
        }
    }

    /// Replays an upstream change-set, recording the equivalent changes.
    ///
    /// An add for a present key is recorded as an update; a remove or refresh
    /// for an absent key is ignored; moves are dropped.
    pub fn clone_changes(&mut self, changes: &ChangeSet<T, K>) {
        for change in changes {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.add_or_update(change.key().clone(), change.current().clone());
                }
                ChangeReason::Remove => {
                    self.remove(change.key());
                }
                ChangeReason::Refresh => {
                    self.refresh(change.key());
                }
                ChangeReason::Moved => {}
            }
        }
    }

    /// Returns the current contents as an all-add change-set.
    pub fn snapshot(&self) -> ChangeSet<T, K> {
        ChangeSet::initial(self.data.iter().map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Returns clones of every key/value pair.
    pub fn to_vec(&self) -> Vec<(K, T)> {
        self.data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
