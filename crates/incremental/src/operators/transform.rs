//! One-to-one projection of change-set streams.

use crate::options::TransformOptions;
use keyflux_core::{Change, ChangeReason, ChangeSet, Item, Key, ShadowCache};
use keyflux_reactive::{forward, Gate, Observable, SharedObserver};
use parking_lot::Mutex;
use std::sync::Arc;

/// Applies a transform to one upstream batch.
///
/// Keys, reasons and indices are preserved. Removes, refreshes and moves
/// carry the transformed value already published for the key.
fn transform_changes<T, K, U, F>(
    shadow: &mut ShadowCache<U, K>,
    changes: ChangeSet<T, K>,
    transform: &F,
    options: TransformOptions,
) -> ChangeSet<U, K>
where
    T: Item,
    K: Key,
    U: Item,
    F: Fn(&T, &K) -> U,
{
    let mut out = ChangeSet::with_capacity(changes.len());
    for change in changes {
        let key = change.key().clone();
        let index = change.current_index();
        match change.reason() {
            ChangeReason::Add | ChangeReason::Update => {
                let value = transform(change.current(), &key);
                let previous = shadow.insert(key.clone(), value.clone());
                out.push(match (previous, index) {
                    (Some(previous), Some(index)) => Change::update_at(key, value, previous, index),
                    (Some(previous), None) => Change::update(key, value, previous),
                    (None, Some(index)) => Change::add_at(key, value, index),
                    (None, None) => Change::add(key, value),
                });
            }
            ChangeReason::Remove => {
                if let Some(previous) = shadow.remove(&key) {
                    out.push(match index {
                        Some(index) => Change::remove_at(key, previous, index),
                        None => Change::remove(key, previous),
                    });
                }
            }
            ChangeReason::Refresh if options.transform_on_refresh => {
                let value = transform(change.current(), &key);
                if let Some(previous) = shadow.insert(key.clone(), value.clone()) {
                    out.push(Change::update(key, value, previous));
                }
            }
            ChangeReason::Refresh => {
                if let Some(current) = shadow.get(&key) {
                    out.push(match index {
                        Some(index) => Change::refresh_at(key, current.clone(), index),
                        None => Change::refresh(key, current.clone()),
                    });
                }
            }
            ChangeReason::Moved => {
                if let (Some(current), Some(to), Some(from)) =
                    (shadow.get(&key), index, change.previous_index())
                {
                    out.push(Change::moved(key, current.clone(), to, from));
                }
            }
        }
    }
    out
}

/// Projects every item with `transform`.
pub fn transform<T, K, U, F>(
    source: &Observable<ChangeSet<T, K>>,
    transform: F,
    options: TransformOptions,
) -> Observable<ChangeSet<U, K>>
where
    T: Item,
    K: Key,
    U: Item,
    F: Fn(&T, &K) -> U + Send + Sync + 'static,
{
    let source = source.clone();
    let transform = Arc::new(transform);
    Observable::create(move |observer: SharedObserver<ChangeSet<U, K>>| {
        let gate = Gate::new();
        let shadow = Arc::new(Mutex::new(ShadowCache::new()));
        let transform = transform.clone();
        let downstream = observer.clone();
        source.subscribe(forward(observer, move |changes: ChangeSet<T, K>| {
            let _gate = gate.enter();
            let out = transform_changes(&mut shadow.lock(), changes, &*transform, options);
            downstream.on_next(out);
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::sort;
    use crate::options::SortOptions;
    use keyflux_core::comparer_by;
    use keyflux_reactive::{ChangeSetAggregator, SourceCache};

    fn numbers() -> SourceCache<u32, u32> {
        SourceCache::new(|v: &u32| *v % 10)
    }

    #[test]
    fn test_transform_projects_values() {
        let source = numbers();
        let results = ChangeSetAggregator::new(&transform(
            &source.connect(),
            |v: &u32, k: &u32| format!("{k}={v}"),
            TransformOptions::default(),
        ));

        source.add_or_update(1);
        source.add_or_update(11);
        source.remove_key(&1);

        let summary = results.summary();
        assert_eq!((summary.adds, summary.updates, summary.removes), (1, 1, 1));
        let removed = results.last().unwrap();
        assert_eq!(removed.as_slice()[0].current(), "1=11");
    }

    #[test]
    fn test_transform_refresh_modes() {
        let counter = Arc::new(Mutex::new(0u32));
        let calls = counter.clone();
        let source = numbers();
        let plain = ChangeSetAggregator::new(&transform(
            &source.connect(),
            |v: &u32, _: &u32| *v,
            TransformOptions::default(),
        ));
        let retransformed = ChangeSetAggregator::new(&transform(
            &source.connect(),
            move |v: &u32, _: &u32| {
                *calls.lock() += 1;
                *v
            },
            TransformOptions::default().with_transform_on_refresh(true),
        ));

        source.add_or_update(3);
        source.refresh_key(&3);

        assert_eq!(*counter.lock(), 2);
        assert_eq!(retransformed.last().unwrap().updates(), 1);
        assert_eq!(plain.last().unwrap().refreshes(), 1);
    }

    #[test]
    fn test_transform_keeps_sorted_indices() {
        let source = numbers();
        let sorted = sort(
            &source.connect(),
            comparer_by(|v: &u32| *v),
            SortOptions::default(),
        );
        let results = ChangeSetAggregator::new(&transform(
            &sorted,
            |v: &u32, _: &u32| v * 100,
            TransformOptions::default(),
        ));

        source.add_or_update_many(vec![5, 2, 7]);
        source.add_or_update(12);

        assert_eq!(results.ordered_values(), vec![500, 700, 1200]);
    }
}
