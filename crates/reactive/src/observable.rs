//! Cold, push-based streams.
//!
//! An `Observable` runs its subscribe function once per subscriber. Every
//! subscriber is wrapped so that it sees at most one terminal notification,
//! nothing after it, and the upstream subscription is released as soon as the
//! stream terminates or the returned `Subscription` is dropped.

use crate::observer::{forward, AnonymousObserver, SafeObserver, SharedObserver};
use crate::subscription::Subscription;
use keyflux_core::Error;
use std::sync::Arc;

type SubscribeFn<T> = dyn Fn(SharedObserver<T>) -> Subscription + Send + Sync;

/// A stream of values that can be subscribed to any number of times.
pub struct Observable<T> {
    subscribe_fn: Arc<SubscribeFn<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            subscribe_fn: self.subscribe_fn.clone(),
        }
    }
}

impl<T: Send + 'static> Observable<T> {
    /// Creates an observable from a subscribe function.
    ///
    /// The function receives the subscriber and returns the subscription that
    /// tears down whatever it started.
    ///
    /// # Example
    ///
    /// ```rust
    /// use keyflux_reactive::{Observable, Subscription};
    ///
    /// let numbers = Observable::create(|observer| {
    ///     observer.on_next(1);
    ///     observer.on_next(2);
    ///     observer.on_completed();
    ///     Subscription::empty()
    /// });
    ///
    /// let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    /// let sink = seen.clone();
    /// let _sub = numbers.subscribe_next(move |v| sink.lock().push(v));
    /// assert_eq!(*seen.lock(), vec![1, 2]);
    /// ```
    pub fn create<F>(subscribe: F) -> Self
    where
        F: Fn(SharedObserver<T>) -> Subscription + Send + Sync + 'static,
    {
        Self {
            subscribe_fn: Arc::new(subscribe),
        }
    }

    /// Subscribes an observer.
    pub fn subscribe(&self, observer: SharedObserver<T>) -> Subscription {
        let safe = Arc::new(SafeObserver::new(observer));
        let upstream = (self.subscribe_fn)(safe.clone());
        safe.attach(upstream);
        Subscription::new(move || safe.detach())
    }

    /// Subscribes with a value callback only.
    pub fn subscribe_next<N>(&self, next: N) -> Subscription
    where
        N: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(AnonymousObserver::from_next(next).shared())
    }

    /// Subscribes with value, error and completion callbacks.
    pub fn subscribe_all<N, E, C>(&self, next: N, error: E, completed: C) -> Subscription
    where
        N: Fn(T) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        self.subscribe(AnonymousObserver::new(next, error, completed).shared())
    }

    /// A stream that completes immediately.
    pub fn empty() -> Self {
        Self::create(|observer| {
            observer.on_completed();
            Subscription::empty()
        })
    }

    /// A stream that never emits and never terminates.
    pub fn never() -> Self {
        Self::create(|_| Subscription::empty())
    }

    /// A stream that fails immediately with `error`.
    pub fn throw(error: Error) -> Self {
        Self::create(move |observer| {
            observer.on_error(error.clone());
            Subscription::empty()
        })
    }

    /// Transforms every value.
    pub fn map<U, F>(&self, f: F) -> Observable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Observable::create(move |observer: SharedObserver<U>| {
            let f = f.clone();
            let downstream = observer.clone();
            source.subscribe(forward(observer, move |value: T| downstream.on_next(f(value))))
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    /// A stream that emits every value of `values` then completes.
    pub fn from_iter<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let values: Arc<Vec<T>> = Arc::new(values.into_iter().collect());
        Self::create(move |observer| {
            for value in values.iter() {
                observer.on_next(value.clone());
            }
            observer.on_completed();
            Subscription::empty()
        })
    }

    /// A stream that emits one value then completes.
    pub fn just(value: T) -> Self {
        Self::from_iter(core::iter::once(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_observable_from_iter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicBool::new(false));
        let sink = seen.clone();
        let done = completed.clone();

        let _sub = Observable::from_iter(vec![1, 2, 3]).subscribe_all(
            move |v| sink.lock().push(v),
            |_| panic!("unexpected error"),
            move || done.store(true, Ordering::SeqCst),
        );

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert!(completed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_observable_map() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let _sub = Observable::from_iter(vec![1, 2])
            .map(|v| v * 10)
            .subscribe_next(move |v| sink.lock().push(v));

        assert_eq!(*seen.lock(), vec![10, 20]);
    }

    #[test]
    fn test_observable_throw() {
        let errors = Arc::new(AtomicUsize::new(0));
        let count = errors.clone();

        let _sub = Observable::<i32>::throw(Error::upstream("boom")).subscribe_all(
            |_| {},
            move |e| {
                assert_eq!(e, Error::upstream("boom"));
                count.fetch_add(1, Ordering::SeqCst);
            },
            || panic!("unexpected completion"),
        );

        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observable_cold_per_subscriber() {
        let subscribed = Arc::new(AtomicUsize::new(0));
        let count = subscribed.clone();
        let source = Observable::<i32>::create(move |observer| {
            count.fetch_add(1, Ordering::SeqCst);
            observer.on_completed();
            Subscription::empty()
        });

        let _a = source.subscribe_next(|_| {});
        let _b = source.subscribe_next(|_| {});
        assert_eq!(subscribed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observable_teardown_on_dispose() {
        let torn_down = Arc::new(AtomicBool::new(false));
        let flag = torn_down.clone();
        let source = Observable::<i32>::create(move |_| {
            let flag = flag.clone();
            Subscription::new(move || flag.store(true, Ordering::SeqCst))
        });

        let sub = source.subscribe_next(|_| {});
        assert!(!torn_down.load(Ordering::SeqCst));
        sub.dispose();
        assert!(torn_down.load(Ordering::SeqCst));
    }

    #[test]
    fn test_observable_teardown_on_terminal() {
        let torn_down = Arc::new(AtomicBool::new(false));
        let flag = torn_down.clone();
        let source = Observable::<i32>::create(move |observer| {
            let flag = flag.clone();
            observer.on_completed();
            Subscription::new(move || flag.store(true, Ordering::SeqCst))
        });

        let _sub = source.subscribe_next(|_| {});
        assert!(torn_down.load(Ordering::SeqCst));
    }
}
