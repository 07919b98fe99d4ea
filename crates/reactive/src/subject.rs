//! Hot multicast streams.
//!
//! A `Subject` is both an observer and an observable: values pushed into it
//! are broadcast to every current subscriber. `AsyncSubject` only publishes
//! the last value, once, when it completes, and replays that outcome to late
//! subscribers.

use crate::observable::Observable;
use crate::observer::{Observer, SharedObserver};
use crate::subscription::{Subscription, SubscriptionManager};
use keyflux_core::Error;
use parking_lot::Mutex;
use std::sync::Arc;

/// How a stream terminated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminal {
    /// Completed normally.
    Completed,
    /// Failed with an error.
    Error(Error),
}

impl Terminal {
    /// Delivers this terminal notification to an observer.
    pub fn deliver<T>(&self, observer: &SharedObserver<T>) {
        match self {
            Terminal::Completed => observer.on_completed(),
            Terminal::Error(error) => observer.on_error(error.clone()),
        }
    }
}

struct SubjectState<T> {
    observers: SubscriptionManager<T>,
    terminal: Option<Terminal>,
}

/// A hot stream that broadcasts pushed values to current subscribers.
pub struct Subject<T> {
    state: Arc<Mutex<SubjectState<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Subject<T> {
    /// Creates a subject with no subscribers.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SubjectState {
                observers: SubscriptionManager::new(),
                terminal: None,
            })),
        }
    }

    /// Pushes a value to every current subscriber.
    #[inline]
    pub fn next(&self, value: T) {
        self.on_next(value);
    }

    /// Returns the number of current subscribers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Returns true once the subject has terminated.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// Exposes the subject as an observable.
    ///
    /// Subscribing after termination receives the terminal notification only.
    pub fn as_observable(&self) -> Observable<T> {
        let state = self.state.clone();
        Observable::create(move |observer| {
            let mut guard = state.lock();
            if let Some(terminal) = guard.terminal.clone() {
                drop(guard);
                terminal.deliver(&observer);
                return Subscription::empty();
            }
            let id = guard.observers.subscribe(observer);
            drop(guard);
            let state = state.clone();
            Subscription::new(move || {
                state.lock().observers.unsubscribe(id);
            })
        })
    }

    fn terminate(&self, terminal: Terminal) {
        let observers = {
            let mut guard = self.state.lock();
            if guard.terminal.is_some() {
                return;
            }
            guard.terminal = Some(terminal.clone());
            guard.observers.drain()
        };
        for observer in observers {
            terminal.deliver(&observer);
        }
    }
}

impl<T: Clone + Send + 'static> Observer<T> for Subject<T> {
    fn on_next(&self, value: T) {
        let observers = {
            let guard = self.state.lock();
            if guard.terminal.is_some() {
                return;
            }
            guard.observers.observers()
        };
        if let Some((last, rest)) = observers.split_last() {
            for observer in rest {
                observer.on_next(value.clone());
            }
            last.on_next(value);
        }
    }

    fn on_error(&self, error: Error) {
        self.terminate(Terminal::Error(error));
    }

    fn on_completed(&self) {
        self.terminate(Terminal::Completed);
    }
}

struct AsyncState<T> {
    observers: SubscriptionManager<T>,
    last: Option<T>,
    terminal: Option<Terminal>,
}

/// A stream that publishes its final value, once, on completion.
///
/// Late subscribers receive the same outcome as early ones.
pub struct AsyncSubject<T> {
    state: Arc<Mutex<AsyncState<T>>>,
}

impl<T> Clone for AsyncSubject<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for AsyncSubject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> AsyncSubject<T> {
    /// Creates a pending subject.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AsyncState {
                observers: SubscriptionManager::new(),
                last: None,
                terminal: None,
            })),
        }
    }

    /// Returns true once the outcome is known.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// Exposes the subject as an observable.
    pub fn as_observable(&self) -> Observable<T> {
        let state = self.state.clone();
        Observable::create(move |observer| {
            let mut guard = state.lock();
            if let Some(terminal) = guard.terminal.clone() {
                let last = guard.last.clone();
                drop(guard);
                if let (Terminal::Completed, Some(value)) = (&terminal, last) {
                    observer.on_next(value);
                }
                terminal.deliver(&observer);
                return Subscription::empty();
            }
            let id = guard.observers.subscribe(observer);
            drop(guard);
            let state = state.clone();
            Subscription::new(move || {
                state.lock().observers.unsubscribe(id);
            })
        })
    }
}

impl<T: Clone + Send + 'static> Observer<T> for AsyncSubject<T> {
    fn on_next(&self, value: T) {
        let mut guard = self.state.lock();
        if guard.terminal.is_none() {
            guard.last = Some(value);
        }
    }

    fn on_error(&self, error: Error) {
        let observers = {
            let mut guard = self.state.lock();
            if guard.terminal.is_some() {
                return;
            }
            guard.terminal = Some(Terminal::Error(error.clone()));
            guard.observers.drain()
        };
        for observer in observers {
            observer.on_error(error.clone());
        }
    }

    fn on_completed(&self) {
        let (observers, last) = {
            let mut guard = self.state.lock();
            if guard.terminal.is_some() {
                return;
            }
            guard.terminal = Some(Terminal::Completed);
            (guard.observers.drain(), guard.last.clone())
        };
        for observer in observers {
            if let Some(value) = &last {
                observer.on_next(value.clone());
            }
            observer.on_completed();
        }
    }
}
