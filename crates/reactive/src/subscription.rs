//! Subscription handles and observer bookkeeping.
//!
//! This module provides the RAII `Subscription` returned by every subscribe
//! call, containers for groups of subscriptions, and a manager for tracking
//! the observers attached to a hot stream.

use crate::observer::SharedObserver;
use core::hash::Hash;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Unique identifier for a subscription.
pub type SubscriptionId = u64;

type Teardown = Box<dyn FnOnce() + Send>;

/// A handle to a live subscription.
///
/// Dropping the handle, or calling `dispose`, tears the subscription down
/// synchronously.
#[must_use = "dropping a Subscription disposes it"]
pub struct Subscription {
    teardown: Option<Teardown>,
}

impl Subscription {
    /// Creates a subscription that runs `teardown` once when disposed.
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Creates a subscription with nothing to tear down.
    #[inline]
    pub fn empty() -> Self {
        Self { teardown: None }
    }

    /// Returns true if disposing still has work to do.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.teardown.is_some()
    }

    /// Tears the subscription down now.
    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A group of subscriptions disposed together.
///
/// Subscriptions added after disposal are disposed immediately.
pub struct CompositeSubscription {
    subscriptions: Mutex<Option<Vec<Subscription>>>,
}

impl Default for CompositeSubscription {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeSubscription {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Some(Vec::new())),
        }
    }

    /// Adds a subscription to the group.
    pub fn add(&self, subscription: Subscription) {
        let mut guard = self.subscriptions.lock();
        if let Some(list) = guard.as_mut() {
            list.push(subscription);
            return;
        }
        drop(guard);
        drop(subscription);
    }

    /// Returns the number of held subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().as_ref().map_or(0, Vec::len)
    }

    /// Returns true if the group holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the group has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.subscriptions.lock().is_none()
    }

    /// Disposes every held subscription, in insertion order.
    pub fn dispose(&self) {
        let taken = self.subscriptions.lock().take();
        drop(taken);
    }

    /// Converts a shared group into a single subscription handle.
    pub fn into_subscription(self: Arc<Self>) -> Subscription {
        Subscription::new(move || self.dispose())
    }
}

struct SerialState {
    current: Option<Subscription>,
    disposed: bool,
}

/// A single replaceable subscription slot.
///
/// Setting a new subscription disposes the previous one.
pub struct SerialSubscription {
    state: Mutex<SerialState>,
}

impl Default for SerialSubscription {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialSubscription {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SerialState {
                current: None,
                disposed: false,
            }),
        }
    }

    /// Replaces the held subscription.
    pub fn set(&self, subscription: Subscription) {
        let mut state = self.state.lock();
        let previous = if state.disposed {
            Some(subscription)
        } else {
            state.current.replace(subscription)
        };
        drop(state);
        drop(previous);
    }

    /// Disposes the held subscription but keeps the slot usable.
    pub fn clear(&self) {
        let previous = self.state.lock().current.take();
        drop(previous);
    }

    /// Returns true if a subscription is held.
    pub fn is_set(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// Disposes the held subscription and every later one.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        let previous = state.current.take();
        drop(state);
        drop(previous);
    }
}

/// Subscriptions indexed by key, such as one child stream per parent item.
pub struct KeyedSubscriptions<K> {
    subscriptions: Mutex<Option<HashMap<K, Subscription>>>,
}

impl<K: Eq + Hash> Default for KeyedSubscriptions<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> KeyedSubscriptions<K> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Stores a subscription for a key, disposing any previous one.
    pub fn insert(&self, key: K, subscription: Subscription) {
        let mut guard = self.subscriptions.lock();
        let previous = match guard.as_mut() {
            Some(map) => map.insert(key, subscription),
            None => Some(subscription),
        };
        drop(guard);
        drop(previous);
    }

    /// Disposes the subscription for a key.
    pub fn remove(&self, key: &K) -> bool {
        let removed = self
            .subscriptions
            .lock()
            .as_mut()
            .and_then(|map| map.remove(key));
        let found = removed.is_some();
        drop(removed);
        found
    }

    /// Returns true if a subscription is held for the key.
    pub fn contains_key(&self, key: &K) -> bool {
        self.subscriptions
            .lock()
            .as_ref()
            .is_some_and(|map| map.contains_key(key))
    }

    /// Returns the number of held subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Returns true if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disposes every held subscription and rejects later inserts.
    pub fn dispose(&self) {
        let taken = self.subscriptions.lock().take();
        drop(taken);
    }
}

/// Tracks the observers attached to a hot stream.
pub struct SubscriptionManager<T> {
    /// Active observers
    subscriptions: HashMap<SubscriptionId, SharedObserver<T>>,
    /// Next subscription ID to assign
    next_id: SubscriptionId,
}

impl<T> Default for SubscriptionManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionManager<T> {
    /// Creates a new subscription manager.
    pub fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers an observer.
    ///
    /// Returns the subscription ID that can be used to unsubscribe.
    pub fn subscribe(&mut self, observer: SharedObserver<T>) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscriptions.insert(id, observer);
        id
    }

    /// Unsubscribes by ID.
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Returns the observer registered under an ID.
    pub fn get(&self, id: SubscriptionId) -> Option<SharedObserver<T>> {
        self.subscriptions.get(&id).cloned()
    }

    /// Returns a snapshot of every registered observer.
    ///
    /// Callers notify the snapshot after releasing any lock guarding the
    /// manager, so observers may subscribe or unsubscribe re-entrantly.
    pub fn observers(&self) -> Vec<SharedObserver<T>> {
        self.entries().into_iter().map(|(_, o)| o).collect()
    }

    /// Returns every registered observer with its ID, in subscription order.
    pub fn entries(&self) -> Vec<(SubscriptionId, SharedObserver<T>)> {
        let mut entries: Vec<_> = self
            .subscriptions
            .iter()
            .map(|(id, o)| (*id, o.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Returns the number of active subscriptions.
    #[inline]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns true if there are no subscriptions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Returns all subscription IDs.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions.keys().copied().collect()
    }

    /// Removes every observer, returning them.
    pub fn drain(&mut self) -> Vec<SharedObserver<T>> {
        let observers = self.observers();
        self.subscriptions.clear();
        observers
    }
}
