//! Observers of push-based streams.
//!
//! An observer receives zero or more values followed by at most one terminal
//! notification: an error or a completion, never both.

use keyflux_core::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::subscription::Subscription;

/// Receives the notifications of a stream.
pub trait Observer<T>: Send + Sync {
    /// Delivers the next value.
    fn on_next(&self, value: T);

    /// Terminates the stream with an error.
    fn on_error(&self, error: Error);

    /// Terminates the stream normally.
    fn on_completed(&self);
}

/// Shared handle to an observer.
pub type SharedObserver<T> = Arc<dyn Observer<T>>;

type NextFn<T> = Box<dyn Fn(T) + Send + Sync>;
type ErrorFn = Box<dyn Fn(Error) + Send + Sync>;
type CompletedFn = Box<dyn Fn() + Send + Sync>;

/// An observer assembled from closures.
pub struct AnonymousObserver<T> {
    next: NextFn<T>,
    error: ErrorFn,
    completed: CompletedFn,
}

impl<T> AnonymousObserver<T> {
    /// Creates an observer from three callbacks.
    pub fn new<N, E, C>(next: N, error: E, completed: C) -> Self
    where
        N: Fn(T) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
        C: Fn() + Send + Sync + 'static,
    {
        Self {
            next: Box::new(next),
            error: Box::new(error),
            completed: Box::new(completed),
        }
    }

    /// Creates an observer that only handles values.
    ///
    /// Errors are logged, completion is ignored.
    pub fn from_next<N>(next: N) -> Self
    where
        N: Fn(T) + Send + Sync + 'static,
    {
        Self::new(
            next,
            |error| tracing::warn!(%error, "unhandled stream error"),
            || {},
        )
    }

    /// Wraps the observer in a shared handle.
    pub fn shared(self) -> SharedObserver<T>
    where
        T: 'static,
    {
        Arc::new(self)
    }
}

impl<T> Observer<T> for AnonymousObserver<T> {
    fn on_next(&self, value: T) {
        (self.next)(value)
    }

    fn on_error(&self, error: Error) {
        (self.error)(error)
    }

    fn on_completed(&self) {
        (self.completed)()
    }
}

/// Creates an observer that handles values itself and forwards terminal
/// notifications to `downstream`.
pub fn forward<T, U, N>(downstream: SharedObserver<U>, next: N) -> SharedObserver<T>
where
    T: 'static,
    U: 'static,
    N: Fn(T) + Send + Sync + 'static,
{
    let on_error = downstream.clone();
    let on_completed = downstream;
    Arc::new(AnonymousObserver::new(
        next,
        move |error| on_error.on_error(error),
        move || on_completed.on_completed(),
    ))
}

enum Upstream {
    Pending,
    #[allow(dead_code)]
    Attached(Subscription),
    Detached,
}

/// Enforces the observer grammar for one subscription.
///
/// Nothing is delivered after a terminal notification or after the
/// subscription is disposed, and the upstream subscription is released as
/// soon as a terminal notification has been delivered.
pub(crate) struct SafeObserver<T> {
    inner: SharedObserver<T>,
    stopped: AtomicBool,
    upstream: Mutex<Upstream>,
}

impl<T> SafeObserver<T> {
    pub(crate) fn new(inner: SharedObserver<T>) -> Self {
        Self {
            inner,
            stopped: AtomicBool::new(false),
            upstream: Mutex::new(Upstream::Pending),
        }
    }

    /// Stores the upstream subscription, or releases it at once when the
    /// stream already terminated during subscribe.
    pub(crate) fn attach(&self, subscription: Subscription) {
        let mut upstream = self.upstream.lock();
        if matches!(*upstream, Upstream::Pending) {
            *upstream = Upstream::Attached(subscription);
            return;
        }
        drop(upstream);
        drop(subscription);
    }

    /// Stops delivery and releases the upstream subscription.
    pub(crate) fn detach(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let previous = core::mem::replace(&mut *self.upstream.lock(), Upstream::Detached);
        drop(previous);
    }

    #[inline]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl<T> Observer<T> for SafeObserver<T> {
    fn on_next(&self, value: T) {
        if !self.is_stopped() {
            self.inner.on_next(value);
        }
    }

    fn on_error(&self, error: Error) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.inner.on_error(error);
            self.detach();
        }
    }

    fn on_completed(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.inner.on_completed();
            self.detach();
        }
    }
}
