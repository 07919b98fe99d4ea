//! Filter operators.
//!
//! The static filter keeps a shadow of the items it currently includes; each
//! upstream change is re-evaluated against the predicate and turned into the
//! add, update or remove that keeps the shadow in step. The dynamic forms
//! additionally keep every upstream item so that a new predicate (or an
//! explicit re-apply tick) can re-evaluate the whole collection.
//!
//! Moves are always dropped: filtering changes relative positions, so an
//! upstream index is meaningless downstream.

use crate::options::FilterOptions;
use keyflux_core::{ChangeAwareCache, ChangeReason, ChangeSet, Item, Key, Predicate, ShadowCache};
use keyflux_reactive::{forward, CompositeSubscription, Gate, Observable, SharedObserver};
use parking_lot::Mutex;
use std::sync::Arc;

/// Applies one upstream change to the filtered shadow.
fn filter_change<T: Item, K: Key>(
    filtered: &mut ChangeAwareCache<T, K>,
    predicate: &(dyn Fn(&T) -> bool + Send + Sync),
    reason: ChangeReason,
    key: &K,
    current: &T,
) {
    match reason {
        ChangeReason::Add | ChangeReason::Update => {
            if predicate(current) {
                filtered.add_or_update(key.clone(), current.clone());
            } else {
                filtered.remove(key);
            }
        }
        ChangeReason::Remove => {
            filtered.remove(key);
        }
        ChangeReason::Refresh => {
            let included = filtered.contains_key(key);
            match (included, predicate(current)) {
                (true, true) => {
                    filtered.refresh(key);
                }
                (false, true) => filtered.add_or_update(key.clone(), current.clone()),
                (true, false) => {
                    filtered.remove(key);
                }
                (false, false) => {}
            }
        }
        ChangeReason::Moved => {}
    }
}

/// Re-evaluates every item, publishing only inclusion transitions.
fn reevaluate<T: Item, K: Key>(
    all: &ShadowCache<T, K>,
    filtered: &mut ChangeAwareCache<T, K>,
    predicate: &(dyn Fn(&T) -> bool + Send + Sync),
) {
    for (key, item) in all.iter() {
        let included = filtered.contains_key(key);
        match (included, predicate(item)) {
            (false, true) => filtered.add_or_update(key.clone(), item.clone()),
            (true, false) => {
                filtered.remove(key);
            }
            _ => {}
        }
    }
}

fn publish<T, K>(
    observer: &SharedObserver<ChangeSet<T, K>>,
    changes: ChangeSet<T, K>,
    options: FilterOptions,
) {
    if !changes.is_empty() || !options.suppress_empty_change_sets {
        observer.on_next(changes);
    }
}

/// Filters a change-set stream with a fixed predicate.
pub fn filter<T, K, F>(
    source: &Observable<ChangeSet<T, K>>,
    predicate: F,
    options: FilterOptions,
) -> Observable<ChangeSet<T, K>>
where
    T: Item,
    K: Key,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    let source = source.clone();
    let predicate: Predicate<T> = Arc::new(predicate);
    Observable::create(move |observer: SharedObserver<ChangeSet<T, K>>| {
        let gate = Gate::new();
        let filtered = Arc::new(Mutex::new(ChangeAwareCache::new()));
        let predicate = predicate.clone();
        let downstream = observer.clone();
        source.subscribe(forward(observer, move |changes: ChangeSet<T, K>| {
            let _gate = gate.enter();
            let out = {
                let mut filtered = filtered.lock();
                for change in &changes {
                    filter_change(
                        &mut filtered,
                        predicate.as_ref(),
                        change.reason(),
                        change.key(),
                        change.current(),
                    );
                }
                filtered.capture_changes()
            };
            publish(&downstream, out, options);
        }))
    })
}

struct DynamicState<T, K> {
    all: ShadowCache<T, K>,
    filtered: ChangeAwareCache<T, K>,
    predicate: Option<Predicate<T>>,
    source_done: bool,
    predicate_done: bool,
    reapply_done: bool,
}

impl<T, K> DynamicState<T, K> {
    /// True when the output can terminate.
    ///
    /// Normally every input has to finish. With empty change-sets
    /// suppressed, a predicate that can no longer arrive means nothing can
    /// ever be published, so completion is immediate.
    fn can_complete(&self, options: FilterOptions) -> bool {
        if self.source_done && self.predicate_done && self.reapply_done {
            return true;
        }
        options.suppress_empty_change_sets
            && self.predicate.is_none()
            && (self.source_done || self.predicate_done)
    }
}

/// Filters a change-set stream with a predicate supplied by a stream.
///
/// Nothing is published before the first predicate arrives. Each new
/// predicate, and each `reapply` tick, re-evaluates every item.
pub fn filter_dynamic<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    predicate_changed: &Observable<Predicate<T>>,
    reapply: &Observable<()>,
    options: FilterOptions,
) -> Observable<ChangeSet<T, K>>
where
    T: Item,
    K: Key,
{
    let source = source.clone();
    let predicate_changed = predicate_changed.clone();
    let reapply = reapply.clone();
    Observable::create(move |observer: SharedObserver<ChangeSet<T, K>>| {
        let gate = Gate::new();
        let state = Arc::new(Mutex::new(DynamicState {
            all: ShadowCache::new(),
            filtered: ChangeAwareCache::new(),
            predicate: None,
            source_done: false,
            predicate_done: false,
            reapply_done: false,
        }));
        let subscriptions = Arc::new(CompositeSubscription::new());

        let complete_if_done = {
            let state = state.clone();
            let observer = observer.clone();
            Arc::new(move |mark: &dyn Fn(&mut DynamicState<T, K>)| {
                let done = {
                    let mut state = state.lock();
                    mark(&mut *state);
                    state.can_complete(options)
                };
                if done {
                    observer.on_completed();
                }
            })
        };

        let on_predicate = {
            let gate = gate.clone();
            let state = state.clone();
            let downstream = observer.clone();
            move |predicate: Predicate<T>| {
                let _gate = gate.enter();
                let out = {
                    let mut state = state.lock();
                    let state = &mut *state;
                    reevaluate(&state.all, &mut state.filtered, predicate.as_ref());
                    state.predicate = Some(predicate);
                    state.filtered.capture_changes()
                };
                publish(&downstream, out, options);
            }
        };
        let predicate_observer = {
            let gate = gate.clone();
            let complete_if_done = complete_if_done.clone();
            let downstream = observer.clone();
            keyflux_reactive::AnonymousObserver::new(
                on_predicate,
                move |error| downstream.on_error(error),
                move || {
                    let _gate = gate.enter();
                    complete_if_done(&|s: &mut DynamicState<T, K>| s.predicate_done = true);
                },
            )
            .shared()
        };
        subscriptions.add(predicate_changed.subscribe(predicate_observer));

        let reapply_observer = {
            let next_gate = gate.clone();
            let done_gate = gate.clone();
            let state = state.clone();
            let downstream = observer.clone();
            let error_downstream = observer.clone();
            let complete_if_done = complete_if_done.clone();
            keyflux_reactive::AnonymousObserver::new(
                move |_: ()| {
                    let _gate = next_gate.enter();
                    let out = {
                        let mut state = state.lock();
                        let state = &mut *state;
                        let Some(predicate) = state.predicate.clone() else {
                            return;
                        };
                        reevaluate(&state.all, &mut state.filtered, predicate.as_ref());
                        state.filtered.capture_changes()
                    };
                    publish(&downstream, out, options);
                },
                move |error| error_downstream.on_error(error),
                move || {
                    let _gate = done_gate.enter();
                    complete_if_done(&|s: &mut DynamicState<T, K>| s.reapply_done = true);
                },
            )
            .shared()
        };
        subscriptions.add(reapply.subscribe(reapply_observer));

        let source_observer = {
            let next_gate = gate.clone();
            let done_gate = gate;
            let downstream = observer.clone();
            let error_downstream = observer;
            keyflux_reactive::AnonymousObserver::new(
                move |changes: ChangeSet<T, K>| {
                    let _gate = next_gate.enter();
                    let out = {
                        let mut state = state.lock();
                        let state = &mut *state;
                        state.all.apply(&changes);
                        let Some(predicate) = state.predicate.clone() else {
                            return;
                        };
                        for change in &changes {
                            filter_change(
                                &mut state.filtered,
                                predicate.as_ref(),
                                change.reason(),
                                change.key(),
                                change.current(),
                            );
                        }
                        state.filtered.capture_changes()
                    };
                    publish(&downstream, out, options);
                },
                move |error| error_downstream.on_error(error),
                move || {
                    let _gate = done_gate.enter();
                    complete_if_done(&|s: &mut DynamicState<T, K>| s.source_done = true);
                },
            )
            .shared()
        };
        subscriptions.add(source.subscribe(source_observer));

        subscriptions.into_subscription()
    })
}

/// Filters a change-set stream with a fixed predicate over a state value
/// supplied by a stream.
pub fn filter_on_state<T, K, S, F>(
    source: &Observable<ChangeSet<T, K>>,
    state: &Observable<S>,
    predicate: F,
    options: FilterOptions,
) -> Observable<ChangeSet<T, K>>
where
    T: Item,
    K: Key,
    S: Send + Sync + 'static,
    F: Fn(&S, &T) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    let predicates = state.map(move |value: S| {
        let predicate = predicate.clone();
        let value = Arc::new(value);
        Arc::new(move |item: &T| predicate(&value, item)) as Predicate<T>
    });
    filter_dynamic(source, &predicates, &Observable::empty(), options)
}
