//! Keyflux Reactive - Push-based stream plumbing for keyflux.
//!
//! This crate provides the minimal observable model the keyflux operators are
//! built on, plus the mutable front doors that produce change-sets.
//!
//! # Core Concepts
//!
//! - `Observable` / `Observer`: cold push streams with exactly-once terminal
//!   notifications and automatic upstream release
//! - `Subscription`: RAII handle; dropping it unsubscribes
//! - `Subject` / `AsyncSubject`: hot multicast streams
//! - `Gate`: the per-operator serialization gate
//! - `Scheduler`: time source for time-driven operators, with a virtual-time
//!   `TestScheduler` and a tokio-backed `TokioScheduler`
//! - `ObservableCache` / `SourceCache`: keyed stores publishing change-sets,
//!   with reference-counted notification suspension
//! - `ChangeSetAggregator`: records a change-set stream for inspection
//!
//! # Example
//!
//! ```rust
//! use keyflux_reactive::{ChangeSetAggregator, SourceCache};
//!
//! let people = SourceCache::new(|p: &(u32, &'static str)| p.0);
//! let results = ChangeSetAggregator::new(&people.connect());
//!
//! {
//!     let _suspended = people.suspend_notifications();
//!     people.add_or_update((1, "alice"));
//!     people.remove_key(&1);
//!     people.add_or_update((2, "bob"));
//! }
//!
//! // One batch carrying only the net effect.
//! assert_eq!(results.message_count(), 1);
//! assert_eq!(results.summary().adds, 1);
//! ```

mod aggregator;
mod cache;
mod gate;
mod observable;
mod observer;
mod scheduler;
mod source;
mod subject;
mod subscription;

pub use aggregator::{ChangeSetAggregator, ChangeSummary};
pub use cache::{CacheUpdater, ObservableCache, SuspendNotifications};
pub use gate::{Gate, GateGuard};
pub use observable::Observable;
pub use observer::{forward, AnonymousObserver, Observer, SharedObserver};
pub use scheduler::{
    Action, PeriodicAction, Scheduler, SharedScheduler, TestScheduler, TokioScheduler,
    MIN_PERIOD,
};
pub use source::{SourceCache, SourceUpdater};
pub use subject::{AsyncSubject, Subject, Terminal};
pub use subscription::{
    CompositeSubscription, KeyedSubscriptions, SerialSubscription, Subscription,
    SubscriptionId, SubscriptionManager,
};
