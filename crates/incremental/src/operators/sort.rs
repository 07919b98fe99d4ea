//! Sort and sort-and-bind.
//!
//! The sorter keeps the collection as an ordered list and publishes
//! index-aware changes. Indices within one change-set are sequential: each
//! change's indices are valid against the list as left by the changes before
//! it. An update is published in place at the old index followed by a move
//! when the new value sorts elsewhere.

use crate::options::{SortAndBindOptions, SortOptions};
use hashbrown::HashMap;
use keyflux_core::{Change, ChangeReason, ChangeSet, Comparer, Item, Key};
use keyflux_reactive::{AnonymousObserver, CompositeSubscription, Gate, Observable, SharedObserver};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

/// An ordered list that can mirror a sorted change stream.
pub trait BindingList<T>: Send {
    /// Inserts `item` at `index`.
    fn insert(&mut self, index: usize, item: T);
    /// Removes the item at `index`.
    fn remove_at(&mut self, index: usize);
    /// Replaces the item at `index`.
    fn replace(&mut self, index: usize, item: T);
    /// Moves the item at `from` so that it ends up at `to`.
    fn move_item(&mut self, from: usize, to: usize);
    /// Replaces the whole contents.
    fn reset(&mut self, items: Vec<T>);
    /// Number of items.
    fn len(&self) -> usize;

    /// Returns true if the list is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> BindingList<T> for Vec<T> {
    fn insert(&mut self, index: usize, item: T) {
        Vec::insert(self, index, item);
    }

    fn remove_at(&mut self, index: usize) {
        self.remove(index);
    }

    fn replace(&mut self, index: usize, item: T) {
        self[index] = item;
    }

    fn move_item(&mut self, from: usize, to: usize) {
        let item = self.remove(from);
        Vec::insert(self, to, item);
    }

    fn reset(&mut self, items: Vec<T>) {
        *self = items;
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

struct Sorter<T, K> {
    list: Vec<(K, T)>,
    /// The value each listed key was last placed by.
    placed: HashMap<K, T>,
    comparer: Option<Comparer<T>>,
    use_binary_search: bool,
}

impl<T: Item, K: Key> Sorter<T, K> {
    fn new(use_binary_search: bool, capacity: Option<usize>) -> Self {
        let capacity = capacity.unwrap_or(0);
        Self {
            list: Vec::with_capacity(capacity),
            placed: HashMap::with_capacity(capacity),
            comparer: None,
            use_binary_search,
        }
    }

    /// Index of `key` in the list.
    ///
    /// Keys not in the list are answered from the map alone. With binary
    /// search enabled the scan starts at the first item that does not sort
    /// before the placed value, falling back to a full scan when the order
    /// has drifted since placement.
    fn position(&self, key: &K) -> Option<usize> {
        let placed = self.placed.get(key)?;
        if let (true, Some(comparer)) = (self.use_binary_search, &self.comparer) {
            let start = self
                .list
                .partition_point(|(_, existing)| comparer(existing, placed) == Ordering::Less);
            if let Some(offset) = self.list[start..].iter().position(|(k, _)| k == key) {
                return Some(start + offset);
            }
        }
        self.list.iter().position(|(k, _)| k == key)
    }

    fn insert_at(&mut self, index: usize, key: K, value: T) {
        self.placed.insert(key.clone(), value.clone());
        self.list.insert(index, (key, value));
    }

    fn remove_at(&mut self, index: usize) -> (K, T) {
        let entry = self.list.remove(index);
        self.placed.remove(&entry.0);
        entry
    }

    /// First index whose item sorts strictly after `item`.
    fn insertion_index(&self, comparer: &Comparer<T>, item: &T) -> usize {
        if self.use_binary_search {
            self.list
                .partition_point(|(_, existing)| comparer(existing, item) != Ordering::Greater)
        } else {
            self.list
                .iter()
                .position(|(_, existing)| comparer(existing, item) == Ordering::Greater)
                .unwrap_or(self.list.len())
        }
    }

    fn values(&self) -> Vec<T> {
        self.list.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Applies an upstream batch, returning the index-aware result.
    fn apply(&mut self, changes: &ChangeSet<T, K>) -> ChangeSet<T, K> {
        let Some(comparer) = self.comparer.clone() else {
            self.apply_unsorted(changes);
            return ChangeSet::new();
        };
        let mut out = ChangeSet::with_capacity(changes.len());
        for change in changes {
            let key = change.key();
            let current = change.current();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => match self.position(key) {
                    None => {
                        let index = self.insertion_index(&comparer, current);
                        self.insert_at(index, key.clone(), current.clone());
                        out.push(Change::add_at(key.clone(), current.clone(), index));
                    }
                    Some(old) => {
                        let (_, previous) = self.remove_at(old);
                        let index = self.insertion_index(&comparer, current);
                        self.insert_at(index, key.clone(), current.clone());
                        out.push(Change::update_at(
                            key.clone(),
                            current.clone(),
                            previous,
                            old,
                        ));
                        if index != old {
                            out.push(Change::moved(key.clone(), current.clone(), index, old));
                        }
                    }
                },
                ChangeReason::Remove => {
                    if let Some(old) = self.position(key) {
                        let (_, removed) = self.remove_at(old);
                        out.push(Change::remove_at(key.clone(), removed, old));
                    }
                }
                ChangeReason::Refresh => {
                    if let Some(old) = self.position(key) {
                        self.remove_at(old);
                        let index = self.insertion_index(&comparer, current);
                        self.insert_at(index, key.clone(), current.clone());
                        if index != old {
                            out.push(Change::moved(key.clone(), current.clone(), index, old));
                        }
                        out.push(Change::refresh_at(key.clone(), current.clone(), index));
                    }
                }
                ChangeReason::Moved => {}
            }
        }
        out
    }

    /// Tracks items while no comparer is known yet.
    fn apply_unsorted(&mut self, changes: &ChangeSet<T, K>) {
        for change in changes {
            let position = self.position(change.key());
            match (change.reason(), position) {
                (
                    ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh,
                    Some(index),
                ) => {
                    self.remove_at(index);
                    self.insert_at(index, change.key().clone(), change.current().clone());
                }
                (ChangeReason::Add | ChangeReason::Update, None) => {
                    let end = self.list.len();
                    self.insert_at(end, change.key().clone(), change.current().clone());
                }
                (ChangeReason::Remove, Some(index)) => {
                    self.remove_at(index);
                }
                _ => {}
            }
        }
    }

    /// Installs a comparer and reorders everything.
    ///
    /// The first comparer publishes the whole collection as adds; later ones
    /// publish the moves that turn the old order into the new one.
    fn set_comparer(&mut self, comparer: Comparer<T>) -> ChangeSet<T, K> {
        let first = self.comparer.is_none();
        self.comparer = Some(comparer);
        if first {
            if let Some(comparer) = &self.comparer {
                self.list.sort_by(|a, b| comparer(&a.1, &b.1));
            }
            return self
                .list
                .iter()
                .enumerate()
                .map(|(index, (k, v))| Change::add_at(k.clone(), v.clone(), index))
                .collect();
        }
        self.resort()
    }

    /// Re-sorts with the current comparer, publishing moves.
    fn resort(&mut self) -> ChangeSet<T, K> {
        let Some(comparer) = self.comparer.clone() else {
            return ChangeSet::new();
        };
        let mut target = self.list.clone();
        target.sort_by(|a, b| comparer(&a.1, &b.1));

        let mut out = ChangeSet::new();
        for (index, (key, _)) in target.iter().enumerate() {
            if &self.list[index].0 == key {
                continue;
            }
            let Some(from) = self.list[index..]
                .iter()
                .position(|(k, _)| k == key)
                .map(|offset| index + offset)
            else {
                continue;
            };
            let item = self.list.remove(from);
            out.push(Change::moved(item.0.clone(), item.1.clone(), index, from));
            self.list.insert(index, item);
        }
        out
    }
}

/// Mirrors a sorted change-set into a bound list.
struct Binder<T> {
    target: Arc<Mutex<dyn BindingList<T>>>,
    options: SortAndBindOptions,
    loaded: bool,
}

impl<T: Item> Binder<T> {
    fn apply<K: Key>(&mut self, changes: &ChangeSet<T, K>, sorted: &[T]) {
        if changes.is_empty() {
            return;
        }
        let first_load = !self.loaded;
        self.loaded = true;
        let mut target = self.target.lock();
        if (first_load && self.options.reset_on_first_time_load)
            || changes.len() > self.options.reset_threshold
        {
            target.reset(sorted.to_vec());
            return;
        }
        for change in changes {
            match (
                change.reason(),
                change.current_index(),
                change.previous_index(),
            ) {
                (ChangeReason::Add, Some(index), _) => target.insert(index, change.current().clone()),
                (ChangeReason::Remove, Some(index), _) => target.remove_at(index),
                (ChangeReason::Update | ChangeReason::Refresh, Some(index), _) => {
                    target.replace(index, change.current().clone())
                }
                (ChangeReason::Moved, Some(to), Some(from)) => target.move_item(from, to),
                _ => {}
            }
        }
    }
}

fn sort_core<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    comparer_changed: &Observable<Comparer<T>>,
    resort: &Observable<()>,
    use_binary_search: bool,
    bind: Option<(Arc<Mutex<dyn BindingList<T>>>, SortAndBindOptions)>,
) -> Observable<ChangeSet<T, K>>
where
    T: Item,
    K: Key,
{
    let source = source.clone();
    let comparer_changed = comparer_changed.clone();
    let resort = resort.clone();
    Observable::create(move |observer: SharedObserver<ChangeSet<T, K>>| {
        let gate = Gate::new();
        let capacity = bind.as_ref().and_then(|(_, options)| options.initial_capacity);
        let sorter = Arc::new(Mutex::new(Sorter::new(use_binary_search, capacity)));
        let binder = Arc::new(Mutex::new(bind.clone().map(|(target, options)| Binder {
            target,
            options,
            loaded: false,
        })));

        let emit = {
            let gate = gate.clone();
            let sorter = sorter.clone();
            let observer = observer.clone();
            Arc::new(move |step: &dyn Fn(&mut Sorter<T, K>) -> ChangeSet<T, K>| {
                let _gate = gate.enter();
                let (out, sorted) = {
                    let mut sorter = sorter.lock();
                    let out = step(&mut *sorter);
                    let sorted = binder.lock().is_some().then(|| sorter.values());
                    (out, sorted)
                };
                if let (Some(binder), Some(sorted)) = (binder.lock().as_mut(), sorted) {
                    binder.apply(&out, &sorted);
                }
                if !out.is_empty() {
                    observer.on_next(out);
                }
            })
        };

        let subscriptions = Arc::new(CompositeSubscription::new());

        let on_comparer = {
            let emit = emit.clone();
            move |comparer: Comparer<T>| {
                emit(&|sorter: &mut Sorter<T, K>| sorter.set_comparer(comparer.clone()))
            }
        };
        let downstream = observer.clone();
        subscriptions.add(comparer_changed.subscribe(
            AnonymousObserver::new(on_comparer, move |e| downstream.on_error(e), || {}).shared(),
        ));

        let on_resort = {
            let emit = emit.clone();
            move |_: ()| emit(&|sorter: &mut Sorter<T, K>| sorter.resort())
        };
        let downstream = observer.clone();
        subscriptions.add(resort.subscribe(
            AnonymousObserver::new(on_resort, move |e| downstream.on_error(e), || {}).shared(),
        ));

        let on_changes = move |changes: ChangeSet<T, K>| {
            emit(&|sorter: &mut Sorter<T, K>| sorter.apply(&changes))
        };
        let on_error = observer.clone();
        let on_completed = observer;
        let completion_gate = gate;
        subscriptions.add(source.subscribe(
            AnonymousObserver::new(
                on_changes,
                move |e| on_error.on_error(e),
                move || {
                    let _gate = completion_gate.enter();
                    on_completed.on_completed();
                },
            )
            .shared(),
        ));

        subscriptions.into_subscription()
    })
}

/// Sorts a change-set stream with a fixed comparer.
///
/// The output carries indices; the stream completes with the source.
pub fn sort<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    comparer: Comparer<T>,
    options: SortOptions,
) -> Observable<ChangeSet<T, K>>
where
    T: Item,
    K: Key,
{
    sort_core(
        source,
        &Observable::just(comparer),
        &Observable::never(),
        options.use_binary_search,
        None,
    )
}

/// Sorts with a comparer supplied by a stream and an explicit re-sort trigger.
///
/// Nothing is published before the first comparer arrives. Each later
/// comparer, and each `resort` tick, publishes the moves to the new order.
pub fn sort_dynamic<T, K>(
    source: &Observable<ChangeSet<T, K>>,
    comparer_changed: &Observable<Comparer<T>>,
    resort: &Observable<()>,
    options: SortOptions,
) -> Observable<ChangeSet<T, K>>
where
    T: Item,
    K: Key,
{
    sort_core(
        source,
        comparer_changed,
        resort,
        options.use_binary_search,
        None,
    )
}

/// Sorts and mirrors the order into `target`, passing the sorted change-sets
/// through.
pub fn sort_and_bind<T, K, L>(
    source: &Observable<ChangeSet<T, K>>,
    comparer: Comparer<T>,
    target: Arc<Mutex<L>>,
    options: SortAndBindOptions,
) -> Observable<ChangeSet<T, K>>
where
    T: Item,
    K: Key,
    L: BindingList<T> + 'static,
{
    if let Err(error) = options.validate() {
        return Observable::throw(error);
    }
    let target: Arc<Mutex<dyn BindingList<T>>> = target;
    sort_core(
        source,
        &Observable::just(comparer),
        &Observable::never(),
        options.use_binary_search,
        Some((target, options)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_core::{comparer_by, comparer_by_descending, Error};
    use keyflux_reactive::{ChangeSetAggregator, Observer, SourceCache, Subject};

    #[derive(Clone, Debug, PartialEq)]
    struct Person {
        name: &'static str,
        age: u32,
    }

    fn person(name: &'static str, age: u32) -> Person {
        Person { name, age }
    }

    fn people() -> SourceCache<Person, &'static str> {
        SourceCache::new(|p: &Person| p.name)
    }

    fn ages(results: &ChangeSetAggregator<Person, &'static str>) -> Vec<u32> {
        results.ordered_values().iter().map(|p| p.age).collect()
    }

    #[test]
    fn test_sort_initial_then_insert() {
        let source = people();
        let results = ChangeSetAggregator::new(&sort(
            &source.connect(),
            comparer_by(|p: &Person| p.age),
            SortOptions::default(),
        ));

        source.add_or_update_many(vec![person("p30", 30), person("p10", 10)]);
        assert_eq!(ages(&results), vec![10, 30]);

        source.add_or_update(person("p20", 20));
        let last = results.last().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last.as_slice()[0].reason(), ChangeReason::Add);
        assert_eq!(last.as_slice()[0].current_index(), Some(1));
        assert_eq!(ages(&results), vec![10, 20, 30]);
    }

    #[test]
    fn test_sort_update_moves() {
        let source = people();
        let results = ChangeSetAggregator::new(&sort(
            &source.connect(),
            comparer_by(|p: &Person| p.age),
            SortOptions::default(),
        ));
        source.add_or_update_many(vec![person("a", 1), person("b", 2), person("c", 3)]);

        source.add_or_update(person("a", 5));
        let last = results.last().unwrap();
        let shape: Vec<_> = last
            .iter()
            .map(|c| (c.reason(), c.previous_index(), c.current_index()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (ChangeReason::Update, Some(0), Some(0)),
                (ChangeReason::Moved, Some(0), Some(2)),
            ]
        );
        assert_eq!(ages(&results), vec![2, 3, 5]);
    }

    #[test]
    fn test_sort_update_in_place() {
        let source = people();
        let results = ChangeSetAggregator::new(&sort(
            &source.connect(),
            comparer_by(|p: &Person| p.age),
            SortOptions::default(),
        ));
        source.add_or_update_many(vec![person("a", 1), person("b", 10)]);
        source.add_or_update(person("a", 2));

        assert_eq!(results.last().unwrap().moves(), 0);
        assert_eq!(ages(&results), vec![2, 10]);
    }

    #[test]
    fn test_sort_remove_index() {
        let source = people();
        let results = ChangeSetAggregator::new(&sort(
            &source.connect(),
            comparer_by(|p: &Person| p.age),
            SortOptions::default().with_binary_search(true),
        ));
        source.add_or_update_many(vec![person("a", 1), person("b", 2), person("c", 3)]);
        source.remove_key(&"b");

        let last = results.last().unwrap();
        assert_eq!(last.as_slice()[0].current_index(), Some(1));
        assert_eq!(ages(&results), vec![1, 3]);
    }

    #[test]
    fn test_sort_dynamic_comparer_change() {
        let source = people();
        let comparers: Subject<Comparer<Person>> = Subject::new();
        let resort: Subject<()> = Subject::new();
        let results = ChangeSetAggregator::new(&sort_dynamic(
            &source.connect(),
            &comparers.as_observable(),
            &resort.as_observable(),
            SortOptions::default(),
        ));

        source.add_or_update_many(vec![person("a", 2), person("b", 1), person("c", 3)]);
        assert_eq!(results.message_count(), 0);

        comparers.next(comparer_by(|p: &Person| p.age));
        assert_eq!(ages(&results), vec![1, 2, 3]);

        comparers.next(comparer_by_descending(|p: &Person| p.age));
        assert_eq!(ages(&results), vec![3, 2, 1]);
        let last = results.last().unwrap();
        assert_eq!(last.len(), last.moves());
    }

    #[test]
    fn test_sort_resort_trigger() {
        let source = people();
        let flip = Arc::new(Mutex::new(false));
        let direction = flip.clone();
        let resort: Subject<()> = Subject::new();
        let comparer: Comparer<Person> = Arc::new(move |a: &Person, b: &Person| {
            if *direction.lock() {
                b.age.cmp(&a.age)
            } else {
                a.age.cmp(&b.age)
            }
        });
        let results = ChangeSetAggregator::new(&sort_dynamic(
            &source.connect(),
            &Observable::just(comparer),
            &resort.as_observable(),
            SortOptions::default(),
        ));
        source.add_or_update_many(vec![person("a", 1), person("b", 2)]);
        assert_eq!(ages(&results), vec![1, 2]);

        *flip.lock() = true;
        resort.next(());
        assert_eq!(ages(&results), vec![2, 1]);
    }

    #[test]
    fn test_sort_refresh_moves_item() {
        let source = people();
        let results = ChangeSetAggregator::new(&sort(
            &source.connect(),
            comparer_by(|p: &Person| p.age),
            SortOptions::default(),
        ));
        source.add_or_update_many(vec![person("a", 1), person("b", 2)]);
        source.refresh_key(&"a");
        let last = results.last().unwrap();
        assert_eq!(last.refreshes(), 1);
        assert_eq!(last.moves(), 0);
    }

    #[test]
    fn test_sort_and_bind_mirrors_order() {
        let source = people();
        let bound: Arc<Mutex<Vec<Person>>> = Arc::new(Mutex::new(Vec::new()));
        let _results = ChangeSetAggregator::new(&sort_and_bind(
            &source.connect(),
            comparer_by(|p: &Person| p.age),
            bound.clone(),
            SortAndBindOptions::default(),
        ));

        source.add_or_update_many(vec![person("c", 3), person("a", 1)]);
        source.add_or_update(person("b", 2));
        source.add_or_update(person("a", 9));
        source.remove_key(&"c");

        let ages: Vec<_> = bound.lock().iter().map(|p| p.age).collect();
        assert_eq!(ages, vec![2, 9]);
    }

    #[test]
    fn test_sort_and_bind_resets_large_batches() {
        struct Recording {
            items: Vec<u32>,
            resets: usize,
            inserts: usize,
        }

        impl BindingList<u32> for Recording {
            fn insert(&mut self, index: usize, item: u32) {
                self.inserts += 1;
                self.items.insert(index, item);
            }
            fn remove_at(&mut self, index: usize) {
                self.items.remove(index);
            }
            fn replace(&mut self, index: usize, item: u32) {
                self.items[index] = item;
            }
            fn move_item(&mut self, from: usize, to: usize) {
                let item = self.items.remove(from);
                self.items.insert(to, item);
            }
            fn reset(&mut self, items: Vec<u32>) {
                self.resets += 1;
                self.items = items;
            }
            fn len(&self) -> usize {
                self.items.len()
            }
        }

        let source = SourceCache::new(|v: &u32| *v);
        let bound = Arc::new(Mutex::new(Recording {
            items: Vec::new(),
            resets: 0,
            inserts: 0,
        }));
        let _results = ChangeSetAggregator::new(&sort_and_bind(
            &source.connect(),
            comparer_by(|v: &u32| *v),
            bound.clone(),
            SortAndBindOptions::default()
                .with_reset_threshold(3)
                .with_reset_on_first_time_load(false),
        ));

        source.add_or_update_many(vec![5, 1]);
        source.add_or_update_many(vec![9, 7, 3, 2]);
        source.add_or_update(4);

        let bound = bound.lock();
        assert_eq!(bound.items, vec![1, 2, 3, 4, 5, 7, 9]);
        assert_eq!(bound.resets, 1);
        assert_eq!(bound.inserts, 3);
    }

    #[test]
    fn test_sort_locates_tied_items() {
        for binary in [false, true] {
            let source = people();
            let results = ChangeSetAggregator::new(&sort(
                &source.connect(),
                comparer_by(|p: &Person| p.age),
                SortOptions::default().with_binary_search(binary),
            ));

            source.add_or_update_many(vec![
                person("a", 1),
                person("b", 1),
                person("c", 1),
                person("d", 2),
            ]);
            source.add_or_update(person("b", 1));
            source.remove_key(&"c");
            source.add_or_update(person("a", 3));

            let names: Vec<_> = results.ordered_values().iter().map(|p| p.name).collect();
            assert_eq!(names, vec!["b", "d", "a"], "binary search: {binary}");
        }
    }

    #[test]
    fn test_sort_dynamic_comparer_error_tears_down() {
        let source = people();
        let comparers: Subject<Comparer<Person>> = Subject::new();
        let resort: Subject<()> = Subject::new();
        let results = ChangeSetAggregator::new(&sort_dynamic(
            &source.connect(),
            &comparers.as_observable(),
            &resort.as_observable(),
            SortOptions::default(),
        ));
        comparers.next(comparer_by(|p: &Person| p.age));
        source.add_or_update(person("a", 1));

        comparers.on_error(Error::upstream("bad comparer"));

        assert_eq!(results.error(), Some(Error::upstream("bad comparer")));
        assert_eq!(resort.observer_count(), 0);
        assert_eq!(source.as_cache().observer_count(), 0);

        let seen = results.message_count();
        source.add_or_update(person("b", 2));
        resort.next(());
        assert_eq!(results.message_count(), seen);
    }

    #[test]
    fn test_sort_dynamic_resort_error_tears_down() {
        let source = people();
        let comparers: Subject<Comparer<Person>> = Subject::new();
        let resort: Subject<()> = Subject::new();
        let results = ChangeSetAggregator::new(&sort_dynamic(
            &source.connect(),
            &comparers.as_observable(),
            &resort.as_observable(),
            SortOptions::default(),
        ));
        comparers.next(comparer_by(|p: &Person| p.age));

        resort.on_error(Error::upstream("resort failed"));

        assert_eq!(results.error(), Some(Error::upstream("resort failed")));
        assert!(!results.is_completed());
        assert_eq!(comparers.observer_count(), 0);
        assert_eq!(source.as_cache().observer_count(), 0);
    }

    #[test]
    fn test_sort_and_bind_rejects_zero_threshold() {
        let source = people();
        let bound: Arc<Mutex<Vec<Person>>> = Arc::new(Mutex::new(Vec::new()));
        let results = ChangeSetAggregator::new(&sort_and_bind(
            &source.connect(),
            comparer_by(|p: &Person| p.age),
            bound.clone(),
            SortAndBindOptions::default().with_reset_threshold(0),
        ));
        source.add_or_update(person("a", 1));

        assert!(matches!(results.error(), Some(Error::InvalidArgument { .. })));
        assert_eq!(source.as_cache().observer_count(), 0);
        assert!(bound.lock().is_empty());
    }
}
