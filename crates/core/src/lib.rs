//! Keyflux Core - Change model and shadow caches for keyflux.
//!
//! This crate provides the value types every keyflux operator consumes and
//! produces:
//!
//! - `Change`: one keyed mutation (Add, Update, Remove, Refresh, Moved)
//! - `ChangeSet`: an ordered batch of changes from one upstream emission
//! - `ShadowCache` / `ChangeAwareCache`: operator-private keyed mirrors
//! - `Error`: terminal stream errors and construction failures
//! - `Disposable` / `AsyncDisposable`: resource release for owned items
//!
//! # Example
//!
//! ```rust
//! use keyflux_core::{ChangeAwareCache, ChangeReason};
//!
//! let mut cache = ChangeAwareCache::new();
//! cache.add_or_update(1, "alice");
//! cache.add_or_update(1, "alicia");
//! cache.remove(&1);
//!
//! let changes = cache.capture_changes();
//! let reasons: Vec<_> = changes.iter().map(|c| c.reason()).collect();
//! assert_eq!(
//!     reasons,
//!     vec![ChangeReason::Add, ChangeReason::Update, ChangeReason::Remove]
//! );
//! ```

mod cache;
mod change;
mod change_set;
mod disposable;
mod error;
mod types;

pub use cache::{ChangeAwareCache, ShadowCache};
pub use change::{Change, ChangeReason};
pub use change_set::ChangeSet;
pub use disposable::{AsyncDisposable, Disposable};
pub use error::{Error, Result};
pub use types::{
    comparer_by, comparer_by_descending, default_equality, Comparer, EqualityComparer, Item, Key,
    KeySelector, Predicate,
};
