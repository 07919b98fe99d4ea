//! One-to-many flattening.
//!
//! Each parent item expands into zero or more children keyed by their own
//! key. Whenever a parent changes its full child set is derived again and
//! diffed against what that parent contributed before. A child key provided
//! by several parents is visible once, from the parent that provided it
//! first.
//!
//! The async form runs the selector as a future. Every invocation carries a
//! per-parent token; a result whose token has been superseded by a later
//! update, or whose parent has been removed, is discarded.

use super::merge_tracker::MergeTracker;
use crate::options::MergeOptions;
use futures::future::BoxFuture;
use futures::FutureExt;
use hashbrown::{HashMap, HashSet};
use keyflux_core::{ChangeReason, ChangeSet, Error, Item, Key, Result};
use keyflux_reactive::{forward, CompositeSubscription, Gate, Observable, SharedObserver, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Replaces everything `parent` contributed with `children`.
fn replace_children<U, CK, K, FK>(
    tracker: &mut MergeTracker<U, CK, K>,
    parent: &K,
    children: Vec<U>,
    key_of: &FK,
) where
    U: Item,
    CK: Key,
    K: Key,
    FK: Fn(&U) -> CK + ?Sized,
{
    let previous: HashSet<CK> = tracker.keys_of(parent).into_iter().collect();
    let mut current = HashSet::with_capacity(children.len());
    for child in children {
        let key = key_of(&child);
        current.insert(key.clone());
        tracker.add_or_update(parent, key, child);
    }
    for key in previous.difference(&current) {
        tracker.remove(parent, key);
    }
}

/// Expands every parent item into children with `selector`.
pub fn transform_many<T, K, U, CK, F, FK>(
    source: &Observable<ChangeSet<T, K>>,
    selector: F,
    child_key: FK,
) -> Observable<ChangeSet<U, CK>>
where
    T: Item,
    K: Key,
    U: Item,
    CK: Key,
    F: Fn(&T, &K) -> Vec<U> + Send + Sync + 'static,
    FK: Fn(&U) -> CK + Send + Sync + 'static,
{
    let source = source.clone();
    let selector = Arc::new(selector);
    let child_key = Arc::new(child_key);
    Observable::create(move |observer: SharedObserver<ChangeSet<U, CK>>| {
        let gate = Gate::new();
        let tracker = Arc::new(Mutex::new(MergeTracker::new(MergeOptions::default())));
        let selector = selector.clone();
        let child_key = child_key.clone();
        let downstream = observer.clone();
        source.subscribe(forward(observer, move |changes: ChangeSet<T, K>| {
            let _gate = gate.enter();
            let out = {
                let mut tracker = tracker.lock();
                for change in &changes {
                    let parent = change.key();
                    match change.reason() {
                        ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                            let children = selector(change.current(), parent);
                            replace_children(&mut tracker, parent, children, &*child_key);
                        }
                        ChangeReason::Remove => tracker.remove_contributor(parent),
                        ChangeReason::Moved => {}
                    }
                }
                tracker.capture_changes()
            };
            if !out.is_empty() {
                downstream.on_next(out);
            }
        }))
    })
}

/// Async child selector.
pub type AsyncSelector<T, K, U> = dyn Fn(&T, &K) -> BoxFuture<'static, Result<Vec<U>>> + Send + Sync;

struct AsyncState<U, CK, K> {
    tracker: MergeTracker<U, CK, K>,
    tokens: HashMap<K, u64>,
    next_token: u64,
    in_flight: HashMap<K, JoinHandle<()>>,
    parent_done: bool,
}

impl<U: Item, CK: Key, K: Key> AsyncState<U, CK, K> {
    fn is_done(&self) -> bool {
        self.parent_done && self.in_flight.is_empty()
    }
}

struct AsyncContext<U, CK, K> {
    gate: Gate,
    state: Mutex<AsyncState<U, CK, K>>,
    observer: SharedObserver<ChangeSet<U, CK>>,
    child_key: Arc<dyn Fn(&U) -> CK + Send + Sync>,
}

impl<U: Item, CK: Key, K: Key> AsyncContext<U, CK, K> {
    /// Applies a finished invocation unless it has been superseded.
    fn complete(&self, parent: K, token: u64, result: Result<Vec<U>>) {
        let _gate = self.gate.enter();
        let (out, done) = {
            let mut state = self.state.lock();
            if state.tokens.get(&parent) != Some(&token) {
                tracing::debug!(?parent, token, "discarding superseded transform result");
                return;
            }
            state.in_flight.remove(&parent);
            match result {
                Ok(children) => {
                    replace_children(&mut state.tracker, &parent, children, &*self.child_key)
                }
                Err(error) => {
                    drop(state);
                    self.observer.on_error(error);
                    return;
                }
            }
            (state.tracker.capture_changes(), state.is_done())
        };
        if !out.is_empty() {
            self.observer.on_next(out);
        }
        if done {
            self.observer.on_completed();
        }
    }

    fn abort_all(&self) {
        let handles: Vec<_> = self.state.lock().in_flight.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.abort();
        }
    }
}

fn start<T, K, U, CK>(
    context: &Arc<AsyncContext<U, CK, K>>,
    selector: &AsyncSelector<T, K, U>,
    parent: &K,
    item: &T,
) where
    T: Item,
    K: Key,
    U: Item,
    CK: Key,
{
    let token = {
        let mut state = context.state.lock();
        state.next_token += 1;
        let token = state.next_token;
        state.tokens.insert(parent.clone(), token);
        if let Some(stale) = state.in_flight.remove(parent) {
            stale.abort();
        }
        token
    };
    let mut future = selector(item, parent);
    if let Some(result) = (&mut future).now_or_never() {
        context.complete(parent.clone(), token, result);
        return;
    }
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(error) => {
            context
                .observer
                .on_error(Error::runtime(format!("async transform needs a tokio runtime: {error}")));
            return;
        }
    };
    let task_context = context.clone();
    let task_parent = parent.clone();
    let join = handle.spawn(async move {
        let result = future.await;
        task_context.complete(task_parent, token, result);
    });
    // The task applies its result under the gate, which the caller holds.
    context.state.lock().in_flight.insert(parent.clone(), join);
}

/// Expands every parent item into children with an async `selector`.
///
/// Results are applied in completion order. A result is discarded when its
/// parent was updated or removed after the invocation started. The output
/// completes once the parent has completed and no invocation is pending. A
/// selector error fails the output. Unsubscribing aborts pending work.
pub fn transform_many_async<T, K, U, CK, F, FK>(
    source: &Observable<ChangeSet<T, K>>,
    selector: F,
    child_key: FK,
) -> Observable<ChangeSet<U, CK>>
where
    T: Item,
    K: Key,
    U: Item,
    CK: Key,
    F: Fn(&T, &K) -> BoxFuture<'static, Result<Vec<U>>> + Send + Sync + 'static,
    FK: Fn(&U) -> CK + Send + Sync + 'static,
{
    let source = source.clone();
    let selector: Arc<AsyncSelector<T, K, U>> = Arc::new(selector);
    let child_key: Arc<dyn Fn(&U) -> CK + Send + Sync> = Arc::new(child_key);
    Observable::create(move |observer: SharedObserver<ChangeSet<U, CK>>| {
        let context = Arc::new(AsyncContext {
            gate: Gate::new(),
            state: Mutex::new(AsyncState {
                tracker: MergeTracker::new(MergeOptions::default()),
                tokens: HashMap::new(),
                next_token: 0,
                in_flight: HashMap::new(),
                parent_done: false,
            }),
            observer: observer.clone(),
            child_key: child_key.clone(),
        });
        let subscriptions = Arc::new(CompositeSubscription::new());

        let on_changes = {
            let context = context.clone();
            let selector = selector.clone();
            move |changes: ChangeSet<T, K>| {
                let _gate = context.gate.enter();
                for change in &changes {
                    let parent = change.key();
                    match change.reason() {
                        ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                            start(&context, &*selector, parent, change.current());
                        }
                        ChangeReason::Remove => {
                            let mut state = context.state.lock();
                            state.tokens.remove(parent);
                            if let Some(pending) = state.in_flight.remove(parent) {
                                pending.abort();
                            }
                            state.tracker.remove_contributor(parent);
                        }
                        ChangeReason::Moved => {}
                    }
                }
                let out = context.state.lock().tracker.capture_changes();
                if !out.is_empty() {
                    context.observer.on_next(out);
                }
            }
        };
        let on_error = {
            let context = context.clone();
            move |error: Error| {
                context.abort_all();
                context.observer.on_error(error);
            }
        };
        let on_completed = {
            let context = context.clone();
            move || {
                let _gate = context.gate.enter();
                let done = {
                    let mut state = context.state.lock();
                    state.parent_done = true;
                    state.is_done()
                };
                if done {
                    context.observer.on_completed();
                }
            }
        };

        subscriptions.add(source.subscribe_all(on_changes, on_error, on_completed));
        subscriptions.add(Subscription::new(move || context.abort_all()));
        subscriptions.into_subscription()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_reactive::{ChangeSetAggregator, SourceCache};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Clone, Debug, PartialEq)]
    struct Order {
        id: u32,
        lines: Vec<(u32, &'static str)>,
    }

    fn orders() -> SourceCache<Order, u32> {
        SourceCache::new(|o: &Order| o.id)
    }

    fn lines(
        source: &SourceCache<Order, u32>,
    ) -> ChangeSetAggregator<(u32, &'static str), u32> {
        ChangeSetAggregator::new(&transform_many(
            &source.connect(),
            |o: &Order, _: &u32| o.lines.clone(),
            |line: &(u32, &'static str)| line.0,
        ))
    }

    #[test]
    fn test_transform_many_expands_and_diffs() {
        let source = orders();
        let results = lines(&source);

        source.add_or_update(Order {
            id: 1,
            lines: vec![(10, "bolt"), (11, "nut")],
        });
        assert_eq!(results.count(), 2);

        source.add_or_update(Order {
            id: 1,
            lines: vec![(11, "washer")],
        });
        let last = results.last().unwrap();
        assert_eq!((last.updates(), last.removes()), (1, 1));
        assert_eq!(results.lookup(&11), Some((11, "washer")));

        source.remove_key(&1);
        assert_eq!(results.count(), 0);
    }

    #[test]
    fn test_transform_many_shared_child_key() {
        let source = orders();
        let results = lines(&source);

        source.add_or_update(Order {
            id: 1,
            lines: vec![(10, "first")],
        });
        source.add_or_update(Order {
            id: 2,
            lines: vec![(10, "second")],
        });
        assert_eq!(results.lookup(&10), Some((10, "first")));

        source.remove_key(&1);
        assert_eq!(results.lookup(&10), Some((10, "second")));
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_transform_many_async_ready_futures() {
        let source = orders();
        let results = ChangeSetAggregator::new(&transform_many_async(
            &source.connect(),
            |o: &Order, _: &u32| {
                let lines = o.lines.clone();
                async move { Ok(lines) }.boxed()
            },
            |line: &(u32, &'static str)| line.0,
        ));

        source.add_or_update(Order {
            id: 1,
            lines: vec![(10, "bolt")],
        });
        assert_eq!(results.count(), 1);

        source.complete();
        assert!(results.is_completed());
    }

    #[tokio::test]
    async fn test_transform_many_async_discards_superseded() {
        let pending: Arc<Mutex<Vec<oneshot::Receiver<Vec<(u32, &'static str)>>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        pending.lock().extend([first_rx, second_rx]);

        let source = orders();
        let queue = pending.clone();
        let results = ChangeSetAggregator::new(&transform_many_async(
            &source.connect(),
            move |_: &Order, _: &u32| {
                let rx = queue.lock().remove(0);
                async move { rx.await.map_err(|e| Error::upstream(e.to_string())) }.boxed()
            },
            |line: &(u32, &'static str)| line.0,
        ));

        source.add_or_update(Order { id: 1, lines: vec![] });
        source.add_or_update(Order { id: 1, lines: vec![] });

        let _ = second_tx.send(vec![(2, "newer")]);
        settle().await;
        let _ = first_tx.send(vec![(1, "older")]);
        settle().await;

        assert_eq!(results.count(), 1);
        assert_eq!(results.lookup(&2), Some((2, "newer")));
        assert!(results.error().is_none());
    }

    #[tokio::test]
    async fn test_transform_many_async_completion_waits() {
        let (tx, rx) = oneshot::channel::<Vec<(u32, &'static str)>>();
        let slot = Arc::new(Mutex::new(Some(rx)));
        let source = orders();
        let results = ChangeSetAggregator::new(&transform_many_async(
            &source.connect(),
            move |_: &Order, _: &u32| {
                let rx = slot.lock().take();
                async move {
                    match rx {
                        Some(rx) => rx.await.map_err(|e| Error::upstream(e.to_string())),
                        None => Ok(Vec::new()),
                    }
                }
                .boxed()
            },
            |line: &(u32, &'static str)| line.0,
        ));

        source.add_or_update(Order { id: 1, lines: vec![] });
        source.complete();
        assert!(!results.is_completed());

        let _ = tx.send(vec![(5, "late")]);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !results.is_completed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(results.count(), 1);
    }

    #[tokio::test]
    async fn test_transform_many_async_error() {
        let source = orders();
        let results = ChangeSetAggregator::new(&transform_many_async(
            &source.connect(),
            |_: &Order, _: &u32| async { Err(Error::upstream("lookup failed")) }.boxed(),
            |line: &(u32, &'static str)| line.0,
        ));

        source.add_or_update(Order { id: 1, lines: vec![] });
        assert_eq!(results.error(), Some(Error::upstream("lookup failed")));
    }

    #[test]
    fn test_transform_many_async_without_runtime() {
        let source = orders();
        let results = ChangeSetAggregator::new(&transform_many_async(
            &source.connect(),
            |_: &Order, _: &u32| futures::future::pending().boxed(),
            |line: &(u32, &'static str)| line.0,
        ));

        source.add_or_update(Order { id: 1, lines: vec![] });
        assert!(matches!(results.error(), Some(Error::Runtime { .. })));
    }
}
