//! Time-based expiry.
//!
//! Every live item whose time selector returns a duration is due at the
//! scheduler time it was added or updated plus that duration. Only adds and
//! updates recompute the due time; refreshes and moves leave it untouched.
//!
//! Without a polling interval a single timer is kept for the earliest due
//! time and is replaced only when that time changes. With a polling interval
//! a periodic scan removes everything due at each tick. Either way all items
//! found due together are removed in one remove-only change-set, in due
//! order.

use crate::options::ExpireAfterOptions;
use hashbrown::HashMap;
use keyflux_core::{ChangeAwareCache, ChangeReason, ChangeSet, Error, Item, Key};
use keyflux_reactive::{
    AnonymousObserver, CompositeSubscription, Gate, Observable, SerialSubscription,
    SharedObserver, SharedScheduler, SourceCache, Subscription,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

type TimeSelector<T> = Arc<dyn Fn(&T) -> Option<Duration> + Send + Sync>;

struct ExpiryTracker<T, K> {
    items: ChangeAwareCache<T, K>,
    due: HashMap<K, (Duration, u64)>,
    index: BTreeMap<(Duration, u64), K>,
    next_seq: u64,
    scheduled: Option<Duration>,
}

impl<T: Item, K: Key> ExpiryTracker<T, K> {
    fn new() -> Self {
        Self {
            items: ChangeAwareCache::new(),
            due: HashMap::new(),
            index: BTreeMap::new(),
            next_seq: 0,
            scheduled: None,
        }
    }

    fn unschedule(&mut self, key: &K) {
        if let Some(entry) = self.due.remove(key) {
            self.index.remove(&entry);
        }
    }

    fn set_due(&mut self, key: &K, due: Option<Duration>) {
        let current = self.due.get(key).map(|(time, _)| *time);
        if current == due {
            return;
        }
        self.unschedule(key);
        if let Some(time) = due {
            let entry = (time, self.next_seq);
            self.next_seq += 1;
            self.due.insert(key.clone(), entry);
            self.index.insert(entry, key.clone());
        }
    }

    /// Replays upstream changes against what downstream holds and returns
    /// the change-set downstream should see.
    fn apply(
        &mut self,
        changes: &ChangeSet<T, K>,
        now: Duration,
        selector: &TimeSelector<T>,
    ) -> ChangeSet<T, K> {
        for change in changes {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    let due = selector(change.current()).map(|ttl| now.saturating_add(ttl));
                    self.items.add_or_update(key.clone(), change.current().clone());
                    self.set_due(key, due);
                }
                ChangeReason::Remove => {
                    self.items.remove(key);
                    self.unschedule(key);
                }
                ChangeReason::Refresh => {
                    self.items.refresh(key);
                }
                ChangeReason::Moved => {}
            }
        }
        self.items.capture_changes()
    }

    /// Removes everything due at or before `now`.
    fn take_expired(&mut self, now: Duration) -> ChangeSet<T, K> {
        while let Some(entry) = self.index.first_key_value().map(|(entry, _)| *entry) {
            if entry.0 > now {
                break;
            }
            let Some(key) = self.index.remove(&entry) else {
                break;
            };
            self.due.remove(&key);
            self.items.remove(&key);
        }
        self.items.capture_changes()
    }

    fn earliest(&self) -> Option<Duration> {
        self.index.keys().next().map(|(time, _)| *time)
    }
}

/// Where expired items go.
enum Sink<T, K> {
    Stream(SharedObserver<ChangeSet<T, K>>),
    Source {
        cache: SourceCache<T, K>,
        observer: SharedObserver<Vec<(K, T)>>,
    },
}

struct Expiry<T, K> {
    gate: Gate,
    tracker: Mutex<ExpiryTracker<T, K>>,
    selector: TimeSelector<T>,
    scheduler: SharedScheduler,
    timer: SerialSubscription,
    polling: bool,
    sink: Sink<T, K>,
}

impl<T: Item, K: Key> Expiry<T, K> {
    fn new(
        selector: TimeSelector<T>,
        scheduler: SharedScheduler,
        options: ExpireAfterOptions,
        sink: Sink<T, K>,
    ) -> Arc<Self> {
        let expiry = Arc::new(Self {
            gate: Gate::new(),
            tracker: Mutex::new(ExpiryTracker::new()),
            selector,
            scheduler,
            timer: SerialSubscription::new(),
            polling: options.polling_interval.is_some(),
            sink,
        });
        if let Some(interval) = options.polling_interval {
            let weak = Arc::downgrade(&expiry);
            expiry.timer.set(expiry.scheduler.schedule_periodic(
                interval,
                Box::new(move || {
                    if let Some(expiry) = weak.upgrade() {
                        expiry.fire();
                    }
                }),
            ));
        }
        expiry
    }

    fn on_changes(self: &Arc<Self>, changes: ChangeSet<T, K>) {
        let _gate = self.gate.enter();
        let now = self.scheduler.now();
        let visible = self.tracker.lock().apply(&changes, now, &self.selector);
        if let Sink::Stream(observer) = &self.sink {
            if !visible.is_empty() {
                observer.on_next(visible);
            }
        }
        self.reschedule();
    }

    fn fire(self: &Arc<Self>) {
        match &self.sink {
            Sink::Stream(observer) => {
                let _gate = self.gate.enter();
                let expired = self.take_expired();
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "items expired");
                    observer.on_next(expired);
                }
                self.reschedule();
            }
            Sink::Source { cache, observer } => {
                let expired = {
                    let _gate = self.gate.enter();
                    self.take_expired()
                };
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "items expired from source");
                    let pairs: Vec<(K, T)> = expired
                        .into_iter()
                        .map(|change| {
                            let (key, item, _) = change.into_parts();
                            (key, item)
                        })
                        .collect();
                    cache.remove_keys(pairs.iter().map(|(key, _)| key));
                    observer.on_next(pairs);
                }
                let _gate = self.gate.enter();
                self.reschedule();
            }
        }
    }

    fn take_expired(&self) -> ChangeSet<T, K> {
        let now = self.scheduler.now();
        let mut tracker = self.tracker.lock();
        tracker.scheduled = None;
        tracker.take_expired(now)
    }

    /// Keeps one timer armed for the earliest due time.
    fn reschedule(self: &Arc<Self>) {
        if self.polling {
            return;
        }
        let next = {
            let mut tracker = self.tracker.lock();
            let earliest = tracker.earliest();
            if earliest == tracker.scheduled {
                return;
            }
            tracker.scheduled = earliest;
            earliest
        };
        match next {
            Some(due) => {
                let weak: Weak<Self> = Arc::downgrade(self);
                self.timer.set(self.scheduler.schedule_at(
                    due,
                    Box::new(move || {
                        if let Some(expiry) = weak.upgrade() {
                            expiry.fire();
                        }
                    }),
                ));
            }
            None => self.timer.clear(),
        }
    }

    fn terminate(&self, error: Option<Error>) {
        let _gate = self.gate.enter();
        self.timer.dispose();
        match (&self.sink, error) {
            (Sink::Stream(observer), Some(error)) => observer.on_error(error),
            (Sink::Stream(observer), None) => observer.on_completed(),
            (Sink::Source { observer, .. }, Some(error)) => observer.on_error(error),
            (Sink::Source { observer, .. }, None) => observer.on_completed(),
        }
    }
}

fn run<T: Item, K: Key>(source: &Observable<ChangeSet<T, K>>, expiry: Arc<Expiry<T, K>>) -> Subscription {
    let subscriptions = Arc::new(CompositeSubscription::new());
    let on_next = expiry.clone();
    let on_error = expiry.clone();
    let on_completed = expiry.clone();
    subscriptions.add(source.subscribe(
        AnonymousObserver::new(
            move |changes| on_next.on_changes(changes),
            move |error| on_error.terminate(Some(error)),
            move || on_completed.terminate(None),
        )
        .shared(),
    ));
    subscriptions.add(Subscription::new(move || expiry.timer.dispose()));
    subscriptions.into_subscription()
}

/// Removes items once the duration chosen by `time_selector` has elapsed.
///
/// Source changes are forwarded against what downstream currently holds, so
/// an update to an expired key arrives as an add and a remove for it is
/// dropped; expirations are published as separate remove-only change-sets. Items whose selector returns `None`
/// never expire. Invalid options fail the stream on subscribe with
/// [`Error::InvalidArgument`].
pub fn expire_after<T, K, F>(
    source: &Observable<ChangeSet<T, K>>,
    time_selector: F,
    scheduler: SharedScheduler,
    options: ExpireAfterOptions,
) -> Observable<ChangeSet<T, K>>
where
    T: Item,
    K: Key,
    F: Fn(&T) -> Option<Duration> + Send + Sync + 'static,
{
    if let Err(error) = options.validate() {
        return Observable::throw(error);
    }
    let source = source.clone();
    let selector: TimeSelector<T> = Arc::new(time_selector);
    Observable::create(move |observer: SharedObserver<ChangeSet<T, K>>| {
        let expiry = Expiry::new(
            selector.clone(),
            scheduler.clone(),
            options,
            Sink::Stream(observer),
        );
        run(&source, expiry)
    })
}

/// Removes expired items from `source` itself, publishing each batch of
/// removed key/value pairs. Invalid options fail the stream on subscribe.
pub fn expire_after_source<T, K, F>(
    source: &SourceCache<T, K>,
    time_selector: F,
    scheduler: SharedScheduler,
    options: ExpireAfterOptions,
) -> Observable<Vec<(K, T)>>
where
    T: Item,
    K: Key,
    F: Fn(&T) -> Option<Duration> + Send + Sync + 'static,
{
    if let Err(error) = options.validate() {
        return Observable::throw(error);
    }
    let cache = source.clone();
    let selector: TimeSelector<T> = Arc::new(time_selector);
    Observable::create(move |observer: SharedObserver<Vec<(K, T)>>| {
        let expiry = Expiry::new(
            selector.clone(),
            scheduler.clone(),
            options,
            Sink::Source {
                cache: cache.clone(),
                observer,
            },
        );
        run(&cache.connect(), expiry)
    })
}
