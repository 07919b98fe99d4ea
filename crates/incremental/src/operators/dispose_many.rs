//! Releasing items once they leave the stream.
//!
//! Both operators forward each batch downstream before touching the values
//! it made unreachable, so nothing is released before its removal has been
//! observed. Removed values and the replaced value of an update are released
//! after their batch; everything still resident is released once the stream
//! terminates or the subscription is dropped, exactly once.

use futures::FutureExt;
use keyflux_core::{
    AsyncDisposable, ChangeReason, ChangeSet, Disposable, Error, Item, Key, ShadowCache,
};
use keyflux_reactive::{
    AnonymousObserver, AsyncSubject, CompositeSubscription, Gate, Observable, Observer,
    SharedObserver, Subscription,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Values resident downstream, until the stream ends.
struct Resident<T, K> {
    gate: Gate,
    cache: Mutex<Option<ShadowCache<T, K>>>,
}

impl<T: Item, K: Key> Resident<T, K> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Gate::new(),
            cache: Mutex::new(Some(ShadowCache::new())),
        })
    }

    /// Applies a batch and returns the values it made unreachable.
    ///
    /// An update whose previous value is `same` as the current one releases
    /// nothing.
    fn apply(&self, changes: &ChangeSet<T, K>, same: fn(&T, &T) -> bool) -> Vec<T> {
        let mut guard = self.cache.lock();
        let Some(cache) = guard.as_mut() else {
            return Vec::new();
        };
        let mut released = Vec::new();
        for change in changes {
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    if let Some(previous) =
                        cache.insert(change.key().clone(), change.current().clone())
                    {
                        if !same(&previous, change.current()) {
                            released.push(previous);
                        }
                    }
                }
                ChangeReason::Remove => {
                    if let Some(removed) = cache.remove(change.key()) {
                        released.push(removed);
                    }
                }
                ChangeReason::Refresh | ChangeReason::Moved => {}
            }
        }
        released
    }

    /// Takes everything still resident. Later calls return nothing.
    fn drain(&self) -> Vec<T> {
        self.cache
            .lock()
            .take()
            .map(|mut cache| cache.drain().map(|(_, item)| item).collect())
            .unwrap_or_default()
    }
}

fn dispose_all<T: Disposable>(items: Vec<T>) {
    for item in items {
        if let Err(error) = item.dispose() {
            tracing::warn!(%error, "item disposal failed");
        }
    }
}

/// Calls [`Disposable::dispose`] on every value that leaves the stream.
///
/// A failing disposal is logged and does not stop the rest of the batch. An
/// update that republishes the same resource (see
/// [`Disposable::same_resource`]) does not release it.
pub fn dispose_many<T, K>(source: &Observable<ChangeSet<T, K>>) -> Observable<ChangeSet<T, K>>
where
    T: Item + Disposable,
    K: Key,
{
    let source = source.clone();
    Observable::create(move |observer: SharedObserver<ChangeSet<T, K>>| {
        let resident = Resident::new();
        let subscriptions = Arc::new(CompositeSubscription::new());

        let on_next = {
            let resident = resident.clone();
            let observer = observer.clone();
            move |changes: ChangeSet<T, K>| {
                let _gate = resident.gate.enter();
                let released = resident.apply(&changes, <T as Disposable>::same_resource);
                observer.on_next(changes);
                dispose_all(released);
            }
        };
        let on_error = {
            let resident = resident.clone();
            let observer = observer.clone();
            move |error: Error| {
                let _gate = resident.gate.enter();
                observer.on_error(error);
                dispose_all(resident.drain());
            }
        };
        let on_completed = {
            let resident = resident.clone();
            move || {
                let _gate = resident.gate.enter();
                observer.on_completed();
                dispose_all(resident.drain());
            }
        };

        subscriptions.add(source.subscribe(
            AnonymousObserver::new(on_next, on_error, on_completed).shared(),
        ));
        subscriptions.add(Subscription::new(move || {
            let _gate = resident.gate.enter();
            dispose_all(resident.drain());
        }));
        subscriptions.into_subscription()
    })
}

struct Outstanding {
    running: usize,
    failures: Vec<String>,
    terminated: bool,
    signalled: bool,
}

/// Tracks asynchronous disposals and fires the completion signal once.
struct Disposals {
    state: Mutex<Outstanding>,
    signal: AsyncSubject<()>,
}

impl Disposals {
    fn new(signal: AsyncSubject<()>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Outstanding {
                running: 0,
                failures: Vec::new(),
                terminated: false,
                signalled: false,
            }),
            signal,
        })
    }

    fn start<T: AsyncDisposable>(self: &Arc<Self>, items: Vec<T>) {
        for item in items {
            let mut future = item.dispose_async();
            if let Some(result) = (&mut future).now_or_never() {
                self.record(result);
                continue;
            }
            let handle = match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    self.record(Err(Error::runtime(
                        "pending disposal requires a tokio runtime",
                    )));
                    continue;
                }
            };
            self.state.lock().running += 1;
            let disposals = self.clone();
            handle.spawn(async move {
                let result = future.await;
                disposals.state.lock().running -= 1;
                disposals.record(result);
            });
        }
    }

    fn record(&self, result: keyflux_core::Result<()>) {
        if let Err(error) = result {
            tracing::warn!(%error, "async item disposal failed");
            self.state.lock().failures.push(error.to_string());
        }
        self.try_signal();
    }

    fn terminate(&self) {
        self.state.lock().terminated = true;
        self.try_signal();
    }

    fn try_signal(&self) {
        let failures = {
            let mut state = self.state.lock();
            if !state.terminated || state.running > 0 || state.signalled {
                return;
            }
            state.signalled = true;
            std::mem::take(&mut state.failures)
        };
        if failures.is_empty() {
            tracing::debug!("all disposals completed");
            self.signal.on_next(());
            self.signal.on_completed();
        } else {
            self.signal.on_error(Error::disposal(failures));
        }
    }
}

/// Calls [`AsyncDisposable::dispose_async`] on every value that leaves the
/// stream.
///
/// `disposals_completed` is called once per subscription, before any
/// notification, with a stream that emits `()` and completes after the
/// stream has terminated and every disposal has finished. Failed disposals
/// are aggregated into an [`Error::Disposal`] on that stream instead.
///
/// Disposals that complete immediately run inline; pending ones are spawned
/// on the current tokio runtime.
pub fn async_dispose_many<T, K, F>(
    source: &Observable<ChangeSet<T, K>>,
    disposals_completed: F,
) -> Observable<ChangeSet<T, K>>
where
    T: Item + AsyncDisposable,
    K: Key,
    F: Fn(Observable<()>) + Send + Sync + 'static,
{
    let source = source.clone();
    let disposals_completed = Arc::new(disposals_completed);
    Observable::create(move |observer: SharedObserver<ChangeSet<T, K>>| {
        let signal = AsyncSubject::new();
        disposals_completed(signal.as_observable());
        let disposals = Disposals::new(signal);
        let resident = Resident::new();
        let subscriptions = Arc::new(CompositeSubscription::new());

        let finish = {
            let resident = resident.clone();
            let disposals = disposals.clone();
            move || {
                disposals.start(resident.drain());
                disposals.terminate();
            }
        };
        let finish = Arc::new(finish);

        let on_next = {
            let resident = resident.clone();
            let disposals = disposals.clone();
            let observer = observer.clone();
            move |changes: ChangeSet<T, K>| {
                let _gate = resident.gate.enter();
                let released = resident.apply(&changes, <T as AsyncDisposable>::same_resource);
                observer.on_next(changes);
                disposals.start(released);
            }
        };
        let on_error = {
            let resident = resident.clone();
            let finish = finish.clone();
            let observer = observer.clone();
            move |error: Error| {
                let _gate = resident.gate.enter();
                observer.on_error(error);
                finish();
            }
        };
        let on_completed = {
            let resident = resident.clone();
            let finish = finish.clone();
            move || {
                let _gate = resident.gate.enter();
                observer.on_completed();
                finish();
            }
        };

        subscriptions.add(source.subscribe(
            AnonymousObserver::new(on_next, on_error, on_completed).shared(),
        ));
        subscriptions.add(Subscription::new(move || {
            let _gate = resident.gate.enter();
            finish();
        }));
        subscriptions.into_subscription()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use keyflux_reactive::{ChangeSetAggregator, SourceCache};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::oneshot;

    /// Records the order in which notifications and disposals happen.
    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone)]
    struct Handle {
        id: u32,
        version: u32,
        log: Log,
        fail: bool,
    }

    impl Handle {
        fn new(id: u32, version: u32, log: &Log) -> Self {
            Self {
                id,
                version,
                log: log.clone(),
                fail: false,
            }
        }
    }

    impl core::fmt::Debug for Handle {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            write!(f, "Handle({}.{})", self.id, self.version)
        }
    }

    impl Disposable for Handle {
        fn dispose(&self) -> keyflux_core::Result<()> {
            self.log
                .lock()
                .push(format!("dispose {}.{}", self.id, self.version));
            if self.fail {
                Err(Error::upstream("handle stuck"))
            } else {
                Ok(())
            }
        }
    }

    impl AsyncDisposable for Handle {
        fn dispose_async(&self) -> BoxFuture<'static, keyflux_core::Result<()>> {
            let result = self.dispose();
            async move { result }.boxed()
        }
    }

    fn handles() -> SourceCache<Handle, u32> {
        SourceCache::new(|h: &Handle| h.id)
    }

    fn logging<T: Item, K: Key>(stream: &Observable<ChangeSet<T, K>>, log: &Log) -> Subscription {
        let log = log.clone();
        stream.subscribe_next(move |changes: ChangeSet<T, K>| {
            log.lock().push(format!("batch {}", changes.len()));
        })
    }

    #[test]
    fn test_dispose_after_removal_is_delivered() {
        let log: Log = Arc::default();
        let source = handles();
        let _sub = logging(&dispose_many(&source.connect()), &log);

        source.add_or_update(Handle::new(1, 1, &log));
        source.add_or_update(Handle::new(1, 2, &log));
        source.remove_key(&1);

        assert_eq!(
            *log.lock(),
            vec!["batch 1", "batch 1", "dispose 1.1", "batch 1", "dispose 1.2"]
        );
    }

    #[test]
    fn test_dispose_skips_republished_instance() {
        let log: Log = Arc::default();
        let source: SourceCache<Arc<Handle>, u32> = SourceCache::new(|h: &Arc<Handle>| h.id);
        let _sub = logging(&dispose_many(&source.connect()), &log);

        let shared = Arc::new(Handle::new(1, 1, &log));
        source.add_or_update(shared.clone());
        source.add_or_update(shared.clone());
        assert_eq!(*log.lock(), vec!["batch 1", "batch 1"]);

        source.add_or_update(Arc::new(Handle::new(1, 2, &log)));
        assert_eq!(
            *log.lock(),
            vec!["batch 1", "batch 1", "batch 1", "dispose 1.1"]
        );
    }

    #[test]
    fn test_dispose_remaining_on_completion_once() {
        let log: Log = Arc::default();
        let source = handles();
        let results = ChangeSetAggregator::new(&dispose_many(&source.connect()));
        source.add_or_update_many(vec![Handle::new(1, 1, &log), Handle::new(2, 1, &log)]);

        source.complete();
        drop(results);

        let mut disposed = log.lock().clone();
        disposed.sort();
        assert_eq!(disposed, vec!["dispose 1.1", "dispose 2.1"]);
    }

    #[test]
    fn test_dispose_on_unsubscribe() {
        let log: Log = Arc::default();
        let source = handles();
        let mut results = ChangeSetAggregator::new(&dispose_many(&source.connect()));
        source.add_or_update(Handle::new(7, 1, &log));

        results.dispose();
        assert_eq!(*log.lock(), vec!["dispose 7.1"]);
    }

    #[test]
    fn test_dispose_failure_does_not_stop_batch() {
        let log: Log = Arc::default();
        let source = handles();
        let _results = ChangeSetAggregator::new(&dispose_many(&source.connect()));
        let mut stuck = Handle::new(1, 1, &log);
        stuck.fail = true;
        source.add_or_update_many(vec![stuck, Handle::new(2, 1, &log)]);

        source.clear();
        assert_eq!(log.lock().len(), 2);
    }

    type SignalSlot = Arc<Mutex<Option<Observable<()>>>>;

    fn capture_signal(slot: &SignalSlot) -> impl Fn(Observable<()>) + Send + Sync + 'static {
        let slot = slot.clone();
        move |signal: Observable<()>| {
            *slot.lock() = Some(signal);
        }
    }

    #[test]
    fn test_async_signal_after_completion() {
        let log: Log = Arc::default();
        let slot = Arc::new(Mutex::new(None));
        let source = handles();
        let results = ChangeSetAggregator::new(&async_dispose_many(
            &source.connect(),
            capture_signal(&slot),
        ));
        let signal = slot.lock().clone().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let _signal = signal.subscribe_all(
            |_| {},
            |error| panic!("unexpected {error}"),
            move || flag.store(true, Ordering::SeqCst),
        );

        source.add_or_update(Handle::new(1, 1, &log));
        source.remove_key(&1);
        assert_eq!(*log.lock(), vec!["dispose 1.1"]);
        assert!(!done.load(Ordering::SeqCst));

        source.add_or_update(Handle::new(2, 1, &log));
        source.complete();
        assert!(results.is_completed());
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_async_accessor_called_before_items() {
        let log: Log = Arc::default();
        let source = handles();
        source.add_or_update(Handle::new(1, 1, &log));
        let order = log.clone();
        let stream = async_dispose_many(&source.connect(), move |_signal: Observable<()>| {
            order.lock().push("accessor".to_string());
        });
        let _sub = logging(&stream, &log);

        assert_eq!(*log.lock(), vec!["accessor", "batch 1"]);
    }

    #[test]
    fn test_async_failures_aggregate() {
        let log: Log = Arc::default();
        let slot = Arc::new(Mutex::new(None));
        let source = handles();
        let _results = ChangeSetAggregator::new(&async_dispose_many(
            &source.connect(),
            capture_signal(&slot),
        ));
        let mut stuck = Handle::new(1, 1, &log);
        stuck.fail = true;
        source.add_or_update_many(vec![stuck, Handle::new(2, 1, &log)]);
        source.complete();

        let error = Arc::new(Mutex::new(None));
        let sink = error.clone();
        let signal = slot.lock().clone().unwrap();
        let _signal = signal.subscribe_all(|_| {}, move |e| *sink.lock() = Some(e), || {});
        let error = error.lock().clone().unwrap();
        assert!(error.is_disposal());
        assert_eq!(log.lock().len(), 2);
    }

    struct Slow {
        id: u32,
        release: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl AsyncDisposable for Slow {
        fn dispose_async(&self) -> BoxFuture<'static, keyflux_core::Result<()>> {
            let release = self.release.lock().take();
            async move {
                if let Some(release) = release {
                    let _ = release.await;
                }
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_async_signal_waits_for_pending() {
        let (tx, rx) = oneshot::channel();
        let slow = Arc::new(Slow {
            id: 1,
            release: Mutex::new(Some(rx)),
        });
        let slot = Arc::new(Mutex::new(None));
        let source = SourceCache::new(|s: &Arc<Slow>| s.id);
        let _results = ChangeSetAggregator::new(&async_dispose_many(
            &source.connect(),
            capture_signal(&slot),
        ));
        source.add_or_update(slow);
        source.complete();

        let signal = slot.lock().clone().unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));
        let _signal = signal.subscribe_all(
            |_| {},
            |error| panic!("unexpected {error}"),
            move || {
                if let Some(tx) = done_tx.lock().take() {
                    let _ = tx.send(());
                }
            },
        );

        tokio::task::yield_now().await;
        tx.send(()).unwrap();
        done_rx.await.unwrap();
    }

    impl core::fmt::Debug for Slow {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            write!(f, "Slow({})", self.id)
        }
    }
}
