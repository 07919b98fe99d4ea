//! Item and key bounds plus the callback shapes shared by every operator.

use core::cmp::Ordering;
use core::fmt::Debug;
use core::hash::Hash;
use std::sync::Arc;

/// Values flowing through change streams.
///
/// Items are cloned into shadow caches and broadcast to several observers, and
/// operators may run on any thread the upstream emits from.
pub trait Item: Clone + Send + Sync + 'static {}

impl<T> Item for T where T: Clone + Send + Sync + 'static {}

/// Keys identifying items inside a keyed collection.
///
/// A key never changes for the lifetime of a logical item; re-keying is a
/// remove of the old key followed by an add of the new one.
pub trait Key: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<K> Key for K where K: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Inclusion test used by the filter family.
pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Ordering used by sort and by duplicate-key resolution.
pub type Comparer<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Equality used to decide whether a replacement is a real change.
pub type EqualityComparer<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Derives the key of an item.
pub type KeySelector<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

/// Builds a comparer from a key projection, ascending.
pub fn comparer_by<T, U, F>(projection: F) -> Comparer<T>
where
    T: 'static,
    U: Ord + 'static,
    F: Fn(&T) -> U + Send + Sync + 'static,
{
    Arc::new(move |a: &T, b: &T| projection(a).cmp(&projection(b)))
}

/// Builds a comparer from a key projection, descending.
pub fn comparer_by_descending<T, U, F>(projection: F) -> Comparer<T>
where
    T: 'static,
    U: Ord + 'static,
    F: Fn(&T) -> U + Send + Sync + 'static,
{
    Arc::new(move |a: &T, b: &T| projection(b).cmp(&projection(a)))
}

/// Equality comparer backed by `PartialEq`.
pub fn default_equality<T>() -> EqualityComparer<T>
where
    T: PartialEq + 'static,
{
    Arc::new(|a: &T, b: &T| a == b)
}
