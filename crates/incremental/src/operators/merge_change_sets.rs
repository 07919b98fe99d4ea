//! Merges a fixed list of change-set streams.

use super::merge_tracker::MergeTracker;
use crate::options::MergeOptions;
use keyflux_core::{ChangeSet, Item, Key};
use keyflux_reactive::{AnonymousObserver, CompositeSubscription, Gate, Observable, SharedObserver};
use parking_lot::Mutex;
use std::sync::Arc;

struct MergeState<T, K> {
    tracker: MergeTracker<T, K, usize>,
    remaining: usize,
}

/// Merges `sources` into one keyed collection.
///
/// A key provided by several sources is visible once, chosen by `options`.
/// The output completes when every source has completed, immediately for an
/// empty list.
pub fn merge_change_sets<T, K>(
    sources: Vec<Observable<ChangeSet<T, K>>>,
    options: MergeOptions<T>,
) -> Observable<ChangeSet<T, K>>
where
    T: Item,
    K: Key,
{
    Observable::create(move |observer: SharedObserver<ChangeSet<T, K>>| {
        let gate = Gate::new();
        let state = Arc::new(Mutex::new(MergeState {
            tracker: MergeTracker::new(options.clone()),
            remaining: sources.len(),
        }));
        let subscriptions = Arc::new(CompositeSubscription::new());
        let _init = gate.enter();

        for (index, source) in sources.iter().enumerate() {
            let on_next = {
                let gate = gate.clone();
                let state = state.clone();
                let observer = observer.clone();
                move |changes: ChangeSet<T, K>| {
                    let _gate = gate.enter();
                    let out = {
                        let mut state = state.lock();
                        state.tracker.apply(&index, &changes);
                        state.tracker.capture_changes()
                    };
                    if !out.is_empty() {
                        observer.on_next(out);
                    }
                }
            };
            let on_error = observer.clone();
            let on_completed = {
                let gate = gate.clone();
                let state = state.clone();
                let observer = observer.clone();
                move || {
                    let _gate = gate.enter();
                    let done = {
                        let mut state = state.lock();
                        state.remaining = state.remaining.saturating_sub(1);
                        state.remaining == 0
                    };
                    if done {
                        observer.on_completed();
                    }
                }
            };
            subscriptions.add(source.subscribe(
                AnonymousObserver::new(on_next, move |e| on_error.on_error(e), on_completed)
                    .shared(),
            ));
        }

        if sources.is_empty() {
            observer.on_completed();
        }
        drop(_init);
        subscriptions.into_subscription()
    })
}
