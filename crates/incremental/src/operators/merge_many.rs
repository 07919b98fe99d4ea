//! Per-item child streams merged into one.
//!
//! Every parent item gets its own child subscription, created when the item
//! is added, replaced when it is updated and disposed when it is removed. The
//! merged output completes once the parent has completed and every live child
//! has completed too. An error from the parent or from any child fails the
//! output and tears every child down.

use super::merge_tracker::MergeTracker;
use crate::options::MergeOptions;
use hashbrown::HashMap;
use keyflux_core::{ChangeReason, ChangeSet, Item, Key};
use keyflux_reactive::{
    AnonymousObserver, CompositeSubscription, Gate, KeyedSubscriptions, Observable,
    SharedObserver, Subscription,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Live children, each tagged with the generation it was subscribed under.
struct Children<K> {
    live: HashMap<K, u64>,
    next_generation: u64,
    parent_done: bool,
}

impl<K: Key> Children<K> {
    fn new() -> Self {
        Self {
            live: HashMap::new(),
            next_generation: 0,
            parent_done: false,
        }
    }

    fn start(&mut self, key: &K) -> u64 {
        self.next_generation += 1;
        self.live.insert(key.clone(), self.next_generation);
        self.next_generation
    }

    fn is_current(&self, key: &K, generation: u64) -> bool {
        self.live.get(key) == Some(&generation)
    }

    /// Marks a child finished; returns true if that leaves nothing to wait for.
    fn finish(&mut self, key: &K, generation: u64) -> bool {
        if self.is_current(key, generation) {
            self.live.remove(key);
        }
        self.is_done()
    }

    fn is_done(&self) -> bool {
        self.parent_done && self.live.is_empty()
    }
}

/// What a parent change asks of the child subscriptions.
enum ChildCommand<T, K> {
    Subscribe(K, T),
    Dispose(K),
}

fn child_commands<T: Item, K: Key>(changes: &ChangeSet<T, K>) -> Vec<ChildCommand<T, K>> {
    changes
        .iter()
        .filter_map(|change| match change.reason() {
            ChangeReason::Add | ChangeReason::Update => Some(ChildCommand::Subscribe(
                change.key().clone(),
                change.current().clone(),
            )),
            ChangeReason::Remove => Some(ChildCommand::Dispose(change.key().clone())),
            ChangeReason::Refresh | ChangeReason::Moved => None,
        })
        .collect()
}

/// Subscribes to `selector(item, key)` for every parent item and merges the
/// values of all children.
pub fn merge_many<T, K, U, F>(source: &Observable<ChangeSet<T, K>>, selector: F) -> Observable<U>
where
    T: Item,
    K: Key,
    U: Send + 'static,
    F: Fn(&T, &K) -> Observable<U> + Send + Sync + 'static,
{
    let source = source.clone();
    let selector = Arc::new(selector);
    Observable::create(move |observer: SharedObserver<U>| {
        let gate = Gate::new();
        let children = Arc::new(Mutex::new(Children::new()));
        let child_subscriptions = Arc::new(KeyedSubscriptions::new());
        let subscriptions = Arc::new(CompositeSubscription::new());

        let subscribe_child = {
            let gate = gate.clone();
            let children = children.clone();
            let child_subscriptions = child_subscriptions.clone();
            let selector = selector.clone();
            let observer = observer.clone();
            move |key: K, item: T| {
                let generation = children.lock().start(&key);
                let child = selector(&item, &key);
                let on_next = {
                    let gate = gate.clone();
                    let observer = observer.clone();
                    move |value: U| {
                        let _gate = gate.enter();
                        observer.on_next(value);
                    }
                };
                let on_error = observer.clone();
                let on_completed = {
                    let gate = gate.clone();
                    let children = children.clone();
                    let observer = observer.clone();
                    let key = key.clone();
                    move || {
                        let _gate = gate.enter();
                        if children.lock().finish(&key, generation) {
                            observer.on_completed();
                        }
                    }
                };
                let subscription = child.subscribe(
                    AnonymousObserver::new(on_next, move |e| on_error.on_error(e), on_completed)
                        .shared(),
                );
                if children.lock().is_current(&key, generation) {
                    child_subscriptions.insert(key, subscription);
                }
            }
        };

        let on_changes = {
            let gate = gate.clone();
            let children = children.clone();
            let child_subscriptions = child_subscriptions.clone();
            move |changes: ChangeSet<T, K>| {
                let _gate = gate.enter();
                for command in child_commands(&changes) {
                    match command {
                        ChildCommand::Subscribe(key, item) => {
                            child_subscriptions.remove(&key);
                            subscribe_child(key, item);
                        }
                        ChildCommand::Dispose(key) => {
                            children.lock().live.remove(&key);
                            child_subscriptions.remove(&key);
                        }
                    }
                }
            }
        };

        let on_error = observer.clone();
        let on_completed = {
            let children = children.clone();
            let observer = observer;
            move || {
                let _gate = gate.enter();
                let done = {
                    let mut children = children.lock();
                    children.parent_done = true;
                    children.is_done()
                };
                if done {
                    observer.on_completed();
                }
            }
        };

        subscriptions.add(source.subscribe(
            AnonymousObserver::new(on_changes, move |e| on_error.on_error(e), on_completed)
                .shared(),
        ));
        subscriptions.add(Subscription::new(move || child_subscriptions.dispose()));
        subscriptions.into_subscription()
    })
}

struct MergeState<U, CK, K> {
    tracker: MergeTracker<U, CK, K>,
    children: Children<K>,
}

/// Subscribes to a child change-set stream for every parent item and merges
/// the children into one keyed collection.
///
/// When several children provide the same child key only one value is
/// visible, chosen by `options`. Removing or replacing a parent withdraws
/// every value its child contributed.
pub fn merge_many_change_sets<T, K, U, CK, F>(
    source: &Observable<ChangeSet<T, K>>,
    selector: F,
    options: MergeOptions<U>,
) -> Observable<ChangeSet<U, CK>>
where
    T: Item,
    K: Key,
    U: Item,
    CK: Key,
    F: Fn(&T, &K) -> Observable<ChangeSet<U, CK>> + Send + Sync + 'static,
{
    let source = source.clone();
    let selector = Arc::new(selector);
    Observable::create(move |observer: SharedObserver<ChangeSet<U, CK>>| {
        let gate = Gate::new();
        let state = Arc::new(Mutex::new(MergeState {
            tracker: MergeTracker::new(options.clone()),
            children: Children::new(),
        }));
        let child_subscriptions = Arc::new(KeyedSubscriptions::new());
        let subscriptions = Arc::new(CompositeSubscription::new());

        let flush = {
            let state = state.clone();
            let observer = observer.clone();
            move || {
                let (changes, done) = {
                    let mut state = state.lock();
                    (state.tracker.capture_changes(), state.children.is_done())
                };
                if !changes.is_empty() {
                    observer.on_next(changes);
                }
                if done {
                    observer.on_completed();
                }
            }
        };
        let flush = Arc::new(flush);

        let subscribe_child = {
            let gate = gate.clone();
            let state = state.clone();
            let child_subscriptions = child_subscriptions.clone();
            let selector = selector.clone();
            let observer = observer.clone();
            let flush = flush.clone();
            move |key: K, item: T| {
                let generation = state.lock().children.start(&key);
                let child = selector(&item, &key);
                let on_next = {
                    let gate = gate.clone();
                    let state = state.clone();
                    let flush = flush.clone();
                    let key = key.clone();
                    move |changes: ChangeSet<U, CK>| {
                        let _gate = gate.enter();
                        {
                            let mut state = state.lock();
                            if !state.children.is_current(&key, generation) {
                                return;
                            }
                            state.tracker.apply(&key, &changes);
                        }
                        flush();
                    }
                };
                let on_error = observer.clone();
                let on_completed = {
                    let gate = gate.clone();
                    let state = state.clone();
                    let flush = flush.clone();
                    let key = key.clone();
                    move || {
                        let _gate = gate.enter();
                        state.lock().children.finish(&key, generation);
                        flush();
                    }
                };
                let subscription = child.subscribe(
                    AnonymousObserver::new(on_next, move |e| on_error.on_error(e), on_completed)
                        .shared(),
                );
                if state.lock().children.is_current(&key, generation) {
                    child_subscriptions.insert(key, subscription);
                }
            }
        };

        let on_changes = {
            let gate = gate.clone();
            let state = state.clone();
            let child_subscriptions = child_subscriptions.clone();
            let flush = flush.clone();
            move |changes: ChangeSet<T, K>| {
                let _gate = gate.enter();
                for command in child_commands(&changes) {
                    match command {
                        ChildCommand::Subscribe(key, item) => {
                            child_subscriptions.remove(&key);
                            {
                                let mut state = state.lock();
                                state.children.live.remove(&key);
                                state.tracker.remove_contributor(&key);
                            }
                            subscribe_child(key, item);
                        }
                        ChildCommand::Dispose(key) => {
                            child_subscriptions.remove(&key);
                            let mut state = state.lock();
                            state.children.live.remove(&key);
                            state.tracker.remove_contributor(&key);
                        }
                    }
                }
                flush();
            }
        };

        let on_error = observer;
        let on_completed = {
            let state = state.clone();
            move || {
                let _gate = gate.enter();
                state.lock().children.parent_done = true;
                flush();
            }
        };

        subscriptions.add(source.subscribe(
            AnonymousObserver::new(on_changes, move |e| on_error.on_error(e), on_completed)
                .shared(),
        ));
        subscriptions.add(Subscription::new(move || child_subscriptions.dispose()));
        subscriptions.into_subscription()
    })
}
