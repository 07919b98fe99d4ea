//! The `SourceCache` front door.
//!
//! A `SourceCache` is an `ObservableCache` that derives each item's key with a
//! key selector, so producers add and remove items rather than key/value
//! pairs.

use crate::cache::{CacheUpdater, ObservableCache, SuspendNotifications};
use crate::observable::Observable;
use keyflux_core::{ChangeSet, Error, Item, Key, KeySelector};
use std::sync::Arc;

/// A mutable keyed collection that publishes its changes.
pub struct SourceCache<T, K> {
    cache: ObservableCache<T, K>,
    key_selector: KeySelector<T, K>,
}

impl<T, K> Clone for SourceCache<T, K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            key_selector: self.key_selector.clone(),
        }
    }
}

/// Item-level mutation API handed to `SourceCache::edit`.
pub struct SourceUpdater<'a, 'b, T, K> {
    inner: &'a mut CacheUpdater<'b, T, K>,
    key_selector: &'a KeySelector<T, K>,
}

impl<'a, 'b, T: Item, K: Key> SourceUpdater<'a, 'b, T, K> {
    /// Adds or replaces an item under its own key.
    pub fn add_or_update(&mut self, item: T) {
        let key = (self.key_selector)(&item);
        self.inner.add_or_update(key, item);
    }

    /// Adds or replaces several items.
    pub fn add_or_update_many(&mut self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.add_or_update(item);
        }
    }

    /// Removes the item stored under the same key as `item`.
    pub fn remove(&mut self, item: &T) -> Option<T> {
        let key = (self.key_selector)(item);
        self.inner.remove(&key)
    }

    /// Removes the item stored under `key`.
    pub fn remove_key(&mut self, key: &K) -> Option<T> {
        self.inner.remove(key)
    }

    /// Removes several keys.
    pub fn remove_keys<'k>(&mut self, keys: impl IntoIterator<Item = &'k K>)
    where
        K: 'k,
    {
        for key in keys {
            self.inner.remove(key);
        }
    }

    /// Signals that `item` changed in place.
    pub fn refresh(&mut self, item: &T) -> bool {
        let key = (self.key_selector)(item);
        self.inner.refresh(&key)
    }

    /// Signals that the item under `key` changed in place.
    pub fn refresh_key(&mut self, key: &K) -> bool {
        self.inner.refresh(key)
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Looks up an item as of this point in the edit.
    pub fn lookup(&self, key: &K) -> Option<&T> {
        self.inner.lookup(key)
    }

    /// Returns the number of items as of this point in the edit.
    pub fn count(&self) -> usize {
        self.inner.count()
    }
}

impl<T: Item, K: Key> SourceCache<T, K> {
    /// Creates an empty source keyed by `key_selector`.
    pub fn new<F>(key_selector: F) -> Self
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            cache: ObservableCache::new(),
            key_selector: Arc::new(key_selector),
        }
    }

    /// Returns the key of `item`.
    pub fn key_of(&self, item: &T) -> K {
        (self.key_selector)(item)
    }

    /// Applies a batch of item mutations and publishes them as one change-set.
    pub fn edit<R>(&self, f: impl FnOnce(&mut SourceUpdater<'_, '_, T, K>) -> R) -> R {
        let key_selector = &self.key_selector;
        self.cache.edit(|inner| {
            f(&mut SourceUpdater {
                inner,
                key_selector,
            })
        })
    }

    /// Adds or replaces one item.
    pub fn add_or_update(&self, item: T) {
        self.edit(|u| u.add_or_update(item));
    }

    /// Adds or replaces several items in one change-set.
    pub fn add_or_update_many(&self, items: impl IntoIterator<Item = T>) {
        self.edit(|u| u.add_or_update_many(items));
    }

    /// Removes the item under `key`.
    pub fn remove_key(&self, key: &K) -> Option<T> {
        self.edit(|u| u.remove_key(key))
    }

    /// Removes several keys in one change-set.
    pub fn remove_keys<'k>(&self, keys: impl IntoIterator<Item = &'k K>)
    where
        K: 'k,
    {
        self.edit(|u| u.remove_keys(keys));
    }

    /// Signals that the item under `key` changed in place.
    pub fn refresh_key(&self, key: &K) -> bool {
        self.edit(|u| u.refresh_key(key))
    }

    /// Removes every item.
    pub fn clear(&self) {
        self.edit(|u| u.clear());
    }

    /// Returns the item under `key`.
    pub fn lookup(&self, key: &K) -> Option<T> {
        self.cache.lookup(key)
    }

    /// Returns every item.
    pub fn items(&self) -> Vec<T> {
        self.cache.items()
    }

    /// Returns every key.
    pub fn keys(&self) -> Vec<K> {
        self.cache.keys()
    }

    /// Returns the number of items.
    pub fn count(&self) -> usize {
        self.cache.count()
    }

    /// Streams the current contents, then every later change-set.
    pub fn connect(&self) -> Observable<ChangeSet<T, K>> {
        self.cache.connect()
    }

    /// Suspends notifications until the returned guard is dropped.
    pub fn suspend_notifications(&self) -> SuspendNotifications<T, K> {
        self.cache.suspend_notifications()
    }

    /// Completes every observer.
    pub fn complete(&self) {
        self.cache.complete();
    }

    /// Fails every observer with `error`.
    pub fn error(&self, error: Error) {
        self.cache.error(error);
    }

    /// Returns the underlying keyed cache.
    pub fn as_cache(&self) -> &ObservableCache<T, K> {
        &self.cache
    }
}

impl<T, K> core::fmt::Debug for SourceCache<T, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SourceCache").finish_non_exhaustive()
    }
}
