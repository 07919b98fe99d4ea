//! Observable keyed cache with notification suspension.
//!
//! `ObservableCache` is the mutable, keyed store behind every front door: the
//! `SourceCache`, the per-group caches produced by grouping, and the children
//! of tree nodes. Mutations happen inside `edit`, and each edit is published to
//! connected observers as one change-set.
//!
//! Notifications can be suspended. While suspended, edits still apply (so
//! `lookup` and `items` see them immediately) but nothing is published. When
//! the last suspension is released the net effect of every suspended edit is
//! published as a single change-set, and observers that connected during the
//! suspension receive the full contents instead.

use crate::gate::Gate;
use crate::observable::Observable;
use crate::observer::SharedObserver;
use crate::subject::Terminal;
use crate::subscription::{Subscription, SubscriptionId, SubscriptionManager};
use hashbrown::hash_map::Entry;
use hashbrown::{HashMap, HashSet};
use keyflux_core::{Change, ChangeAwareCache, ChangeReason, ChangeSet, Error, Item, Key};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Pre-suspension state of a key touched while suspended.
struct Touched<T> {
    before: Option<T>,
    updated: bool,
    refreshed: bool,
}

struct Suspension<T, K> {
    depth: usize,
    order: Vec<K>,
    touched: HashMap<K, Touched<T>>,
    deferred: HashSet<SubscriptionId>,
}

impl<T: Item, K: Key> Suspension<T, K> {
    fn new() -> Self {
        Self {
            depth: 0,
            order: Vec::new(),
            touched: HashMap::new(),
            deferred: HashSet::new(),
        }
    }

    #[inline]
    fn is_active(&self) -> bool {
        self.depth > 0
    }

    fn record(&mut self, changes: &ChangeSet<T, K>) {
        for change in changes {
            let before = match change.reason() {
                ChangeReason::Add => None,
                ChangeReason::Update => change.previous().cloned(),
                ChangeReason::Remove | ChangeReason::Refresh | ChangeReason::Moved => {
                    Some(change.current().clone())
                }
            };
            let touched = match self.touched.entry(change.key().clone()) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    self.order.push(change.key().clone());
                    vacant.insert(Touched {
                        before,
                        updated: false,
                        refreshed: false,
                    })
                }
            };
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => touched.updated = true,
                ChangeReason::Refresh => touched.refreshed = true,
                ChangeReason::Remove | ChangeReason::Moved => {}
            }
        }
    }

    /// Folds every recorded key into its net change against `data`.
    fn take_net_changes(&mut self, data: &ChangeAwareCache<T, K>) -> ChangeSet<T, K> {
        let mut net = ChangeSet::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            let Some(touched) = self.touched.remove(&key) else {
                continue;
            };
            match (touched.before, data.get(&key)) {
                (None, Some(after)) => net.push(Change::add(key, after.clone())),
                (Some(before), None) => net.push(Change::remove(key, before)),
                (Some(before), Some(after)) if touched.updated => {
                    net.push(Change::update(key, after.clone(), before))
                }
                (Some(_), Some(after)) if touched.refreshed => {
                    net.push(Change::refresh(key, after.clone()))
                }
                _ => {}
            }
        }
        net
    }

    fn discard(&mut self) {
        self.depth = 0;
        self.order.clear();
        self.touched.clear();
        self.deferred.clear();
    }
}

struct CacheState<T, K> {
    data: ChangeAwareCache<T, K>,
    observers: SubscriptionManager<ChangeSet<T, K>>,
    terminal: Option<Terminal>,
    suspension: Suspension<T, K>,
}

struct CacheInner<T, K> {
    gate: Gate,
    state: Mutex<CacheState<T, K>>,
}

/// A keyed cache that publishes its mutations as change-sets.
///
/// Cloning yields another handle to the same cache.
pub struct ObservableCache<T, K> {
    inner: Arc<CacheInner<T, K>>,
}

impl<T, K> Clone for ObservableCache<T, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, K> ObservableCache<T, K> {
    /// Returns true if both handles refer to the same cache.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Item, K: Key> Default for ObservableCache<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutation API handed to `ObservableCache::edit`.
pub struct CacheUpdater<'a, T, K> {
    data: &'a mut ChangeAwareCache<T, K>,
}

impl<'a, T: Item, K: Key> CacheUpdater<'a, T, K> {
    /// Adds or replaces the value for `key`.
    pub fn add_or_update(&mut self, key: K, value: T) {
        self.data.add_or_update(key, value);
    }

    /// Removes `key`, returning its value when present.
    pub fn remove(&mut self, key: &K) -> Option<T> {
        self.data.remove(key)
    }

    /// Signals that the value for `key` changed in place.
    pub fn refresh(&mut self, key: &K) -> bool {
        self.data.refresh(key)
    }

    /// Signals a refresh for every item.
    pub fn refresh_all(&mut self) {
        let keys: Vec<K> = self.data.keys().cloned().collect();
        for key in &keys {
            self.data.refresh(key);
        }
    }

    /// Removes every item.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Looks up the value for `key` as of this point in the edit.
    pub fn lookup(&self, key: &K) -> Option<&T> {
        self.data.get(key)
    }

    /// Returns the number of items as of this point in the edit.
    pub fn count(&self) -> usize {
        self.data.len()
    }
}

impl<T: Item, K: Key> ObservableCache<T, K> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                gate: Gate::new(),
                state: Mutex::new(CacheState {
                    data: ChangeAwareCache::new(),
                    observers: SubscriptionManager::new(),
                    terminal: None,
                    suspension: Suspension::new(),
                }),
            }),
        }
    }

    /// Applies a batch of mutations and publishes them as one change-set.
    ///
    /// The updater must not call back into this cache; it exposes `lookup`
    /// and `count` for reads inside the edit.
    pub fn edit<R>(&self, f: impl FnOnce(&mut CacheUpdater<'_, T, K>) -> R) -> R {
        let _gate = self.inner.gate.enter();
        let (result, changes, observers) = {
            let mut state = self.inner.state.lock();
            let result = f(&mut CacheUpdater {
                data: &mut state.data,
            });
            let changes = state.data.capture_changes();
            if changes.is_empty() || state.terminal.is_some() {
                return result;
            }
            if state.suspension.is_active() {
                state.suspension.record(&changes);
                return result;
            }
            (result, changes, state.observers.observers())
        };
        publish(&observers, changes);
        result
    }

    /// Returns the value for `key`.
    pub fn lookup(&self, key: &K) -> Option<T> {
        self.inner.state.lock().data.get(key).cloned()
    }

    /// Returns every value.
    pub fn items(&self) -> Vec<T> {
        self.inner.state.lock().data.values().cloned().collect()
    }

    /// Returns every key.
    pub fn keys(&self) -> Vec<K> {
        self.inner.state.lock().data.keys().cloned().collect()
    }

    /// Returns every key/value pair.
    pub fn key_values(&self) -> Vec<(K, T)> {
        self.inner.state.lock().data.to_vec()
    }

    /// Returns the number of items.
    pub fn count(&self) -> usize {
        self.inner.state.lock().data.len()
    }

    /// Returns true if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Returns the number of connected observers.
    pub fn observer_count(&self) -> usize {
        self.inner.state.lock().observers.len()
    }

    /// Returns true while notifications are suspended.
    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspension.is_active()
    }

    /// Streams the current contents, then every later change-set.
    ///
    /// The initial contents are delivered as one all-add change-set, which is
    /// skipped when the cache is empty. Observers connecting while
    /// notifications are suspended receive the contents on resume.
    pub fn connect(&self) -> Observable<ChangeSet<T, K>> {
        let inner = self.inner.clone();
        Observable::create(move |observer: SharedObserver<ChangeSet<T, K>>| {
            let _gate = inner.gate.enter();
            let mut state = inner.state.lock();
            if let Some(terminal) = state.terminal.clone() {
                drop(state);
                terminal.deliver(&observer);
                return Subscription::empty();
            }
            let id = state.observers.subscribe(observer.clone());
            let initial = if state.suspension.is_active() {
                state.suspension.deferred.insert(id);
                None
            } else {
                Some(state.data.snapshot())
            };
            drop(state);
            tracing::trace!(id, "cache observer connected");
            if let Some(initial) = initial.filter(|changes| !changes.is_empty()) {
                observer.on_next(initial);
            }
            let weak: Weak<CacheInner<T, K>> = Arc::downgrade(&inner);
            Subscription::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut state = inner.state.lock();
                    state.observers.unsubscribe(id);
                    state.suspension.deferred.remove(&id);
                }
            })
        })
    }

    /// Suspends notifications until the returned guard is dropped.
    ///
    /// Suspensions nest; publishing resumes when every guard is gone.
    pub fn suspend_notifications(&self) -> SuspendNotifications<T, K> {
        let _gate = self.inner.gate.enter();
        self.inner.state.lock().suspension.depth += 1;
        SuspendNotifications {
            cache: self.clone(),
        }
    }

    fn resume(&self) {
        let _gate = self.inner.gate.enter();
        let (net, snapshot, entries) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            if !state.suspension.is_active() {
                return;
            }
            state.suspension.depth -= 1;
            if state.suspension.is_active() || state.terminal.is_some() {
                return;
            }
            let net = state.suspension.take_net_changes(&state.data);
            let deferred = core::mem::take(&mut state.suspension.deferred);
            let snapshot = state.data.snapshot();
            let entries: Vec<_> = state
                .observers
                .entries()
                .into_iter()
                .map(|(id, observer)| (deferred.contains(&id), observer))
                .collect();
            (net, snapshot, entries)
        };
        tracing::debug!(changes = net.len(), "resuming cache notifications");
        for (deferred, observer) in entries {
            if deferred {
                if !snapshot.is_empty() {
                    observer.on_next(snapshot.clone());
                }
            } else if !net.is_empty() {
                observer.on_next(net.clone());
            }
        }
    }

    /// Completes every observer. Later edits still apply but are not published.
    pub fn complete(&self) {
        self.terminate(Terminal::Completed);
    }

    /// Fails every observer with `error`.
    pub fn error(&self, error: Error) {
        self.terminate(Terminal::Error(error));
    }

    /// Returns true once the cache has completed or failed.
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminal.is_some()
    }

    fn terminate(&self, terminal: Terminal) {
        let _gate = self.inner.gate.enter();
        let observers = {
            let mut state = self.inner.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(terminal.clone());
            state.suspension.discard();
            state.observers.drain()
        };
        for observer in &observers {
            terminal.deliver(observer);
        }
    }
}

fn publish<T: Clone, K: Clone>(
    observers: &[SharedObserver<ChangeSet<T, K>>],
    changes: ChangeSet<T, K>,
) {
    if let Some((last, rest)) = observers.split_last() {
        for observer in rest {
            observer.on_next(changes.clone());
        }
        last.on_next(changes);
    }
}

impl<T, K> core::fmt::Debug for ObservableCache<T, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObservableCache").finish_non_exhaustive()
    }
}

/// Keeps notifications suspended while alive.
#[must_use = "notifications resume as soon as the guard is dropped"]
pub struct SuspendNotifications<T: Item, K: Key> {
    cache: ObservableCache<T, K>,
}

impl<T: Item, K: Key> Drop for SuspendNotifications<T, K> {
    fn drop(&mut self) {
        self.cache.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    type Batches = Arc<Mutex<Vec<ChangeSet<&'static str, u32>>>>;

    fn record(cache: &ObservableCache<&'static str, u32>) -> (Batches, Subscription) {
        let batches: Batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let sub = cache.connect().subscribe_next(move |cs| sink.lock().push(cs));
        (batches, sub)
    }

    #[test]
    fn test_edit_publishes_one_batch() {
        let cache = ObservableCache::new();
        let (batches, _sub) = record(&cache);

        cache.edit(|u| {
            u.add_or_update(1, "a");
            u.add_or_update(2, "b");
            u.remove(&1);
        });

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].adds(), 2);
        assert_eq!(batches[0].removes(), 1);
        assert_eq!(cache.keys(), vec![2]);
    }

    #[test]
    fn test_connect_replays_contents() {
        let cache = ObservableCache::new();
        cache.edit(|u| u.add_or_update(1, "a"));

        let (batches, _sub) = record(&cache);
        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].adds(), 1);
    }

    #[test]
    fn test_empty_cache_connect_emits_nothing() {
        let cache: ObservableCache<&'static str, u32> = ObservableCache::new();
        let (batches, _sub) = record(&cache);
        assert!(batches.lock().is_empty());
    }

    #[test]
    fn test_suspend_add_then_remove_cancels() {
        let cache = ObservableCache::new();
        cache.edit(|u| u.add_or_update(1, "keep"));
        let (batches, _sub) = record(&cache);

        let guard = cache.suspend_notifications();
        cache.edit(|u| u.add_or_update(2, "temp"));
        cache.edit(|u| u.remove(&2));
        cache.edit(|u| u.add_or_update(3, "new"));
        assert_eq!(cache.lookup(&3), Some("new"));
        assert_eq!(batches.lock().len(), 1);
        drop(guard);

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        let resumed = &batches[1];
        assert_eq!(resumed.len(), 1);
        assert_eq!(*resumed.as_slice()[0].key(), 3);
        assert_eq!(resumed.as_slice()[0].reason(), ChangeReason::Add);
    }

    #[test]
    fn test_suspend_net_update_and_refresh() {
        let cache = ObservableCache::new();
        cache.edit(|u| {
            u.add_or_update(1, "a");
            u.add_or_update(2, "b");
            u.add_or_update(3, "c");
        });
        let (batches, _sub) = record(&cache);

        {
            let _guard = cache.suspend_notifications();
            cache.edit(|u| {
                u.add_or_update(1, "a1");
                u.add_or_update(1, "a2");
                u.refresh(&2);
                u.remove(&3);
            });
        }

        let batches = batches.lock();
        let resumed: Vec<_> = batches[1]
            .iter()
            .map(|c| (c.reason(), *c.key(), *c.current(), c.previous().copied()))
            .collect();
        assert_eq!(
            resumed,
            vec![
                (ChangeReason::Update, 1, "a2", Some("a")),
                (ChangeReason::Refresh, 2, "b", None),
                (ChangeReason::Remove, 3, "c", None),
            ]
        );
    }

    #[test]
    fn test_nested_suspension_needs_every_guard() {
        let cache = ObservableCache::new();
        let (batches, _sub) = record(&cache);

        let outer = cache.suspend_notifications();
        let inner = cache.suspend_notifications();
        cache.edit(|u| u.add_or_update(1, "a"));
        drop(inner);
        assert!(cache.is_suspended());
        assert!(batches.lock().is_empty());

        drop(outer);
        assert!(!cache.is_suspended());
        assert_eq!(batches.lock().len(), 1);
    }

    #[test]
    fn test_connect_during_suspension_gets_contents_on_resume() {
        let cache = ObservableCache::new();
        cache.edit(|u| u.add_or_update(1, "a"));
        let (early, _s1) = record(&cache);

        let guard = cache.suspend_notifications();
        cache.edit(|u| u.add_or_update(2, "b"));
        let (late, _s2) = record(&cache);
        assert!(late.lock().is_empty());
        drop(guard);

        let early = early.lock();
        assert_eq!(early.len(), 2);
        assert_eq!(early[1].adds(), 1);

        let late = late.lock();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].adds(), 2);
    }

    #[test]
    fn test_completion_not_suppressed_by_suspension() {
        let cache: ObservableCache<&'static str, u32> = ObservableCache::new();
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        let _sub = cache.connect().subscribe_all(
            |_| panic!("nothing should be published"),
            |_| {},
            move || flag.store(true, Ordering::SeqCst),
        );

        let guard = cache.suspend_notifications();
        cache.edit(|u| u.add_or_update(1, "a"));
        cache.complete();
        assert!(completed.load(Ordering::SeqCst));
        drop(guard);
    }

    #[test]
    fn test_dispose_disconnects() {
        let cache = ObservableCache::new();
        let (batches, sub) = record(&cache);
        assert_eq!(cache.observer_count(), 1);
        sub.dispose();
        assert_eq!(cache.observer_count(), 0);

        cache.edit(|u| u.add_or_update(1, "a"));
        assert!(batches.lock().is_empty());
    }
}
