//! Grouping.
//!
//! Items are partitioned by a group key into per-group observable caches.
//! The output stream carries one change per group lifecycle transition: an
//! add once a new group has been populated and a remove once its last member
//! has left. Empty groups are destroyed and their cache completed.

use hashbrown::HashMap;
use keyflux_core::{Change, ChangeReason, ChangeSet, Error, Item, Key};
use keyflux_reactive::{
    AnonymousObserver, CompositeSubscription, Gate, Observable, ObservableCache, SharedObserver,
    Subscription,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// A group key plus the cache of its current members.
pub struct Group<T, K, G> {
    key: G,
    cache: ObservableCache<T, K>,
}

impl<T, K, G: Clone> Clone for Group<T, K, G> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<T: Item, K: Key, G> Group<T, K, G> {
    fn new(key: G) -> Self {
        Self {
            key,
            cache: ObservableCache::new(),
        }
    }

    /// The group key.
    pub fn key(&self) -> &G {
        &self.key
    }

    /// The member cache.
    pub fn cache(&self) -> &ObservableCache<T, K> {
        &self.cache
    }

    /// Connects to the member cache.
    pub fn connect(&self) -> Observable<ChangeSet<T, K>> {
        self.cache.connect()
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.cache.count()
    }

    /// Current members.
    pub fn items(&self) -> Vec<T> {
        self.cache.items()
    }

    /// Looks up a member.
    pub fn lookup(&self, key: &K) -> Option<T> {
        self.cache.lookup(key)
    }
}

impl<T, K, G: core::fmt::Debug> core::fmt::Debug for Group<T, K, G> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Group").field("key", &self.key).finish_non_exhaustive()
    }
}

enum MemberOp<T, K> {
    Upsert(K, T),
    Remove(K),
    Refresh(K),
}

/// Work computed under the state lock and applied after releasing it.
struct Plan<T, K, G> {
    ops: Vec<(Group<T, K, G>, Vec<MemberOp<T, K>>)>,
    output: ChangeSet<Group<T, K, G>, G>,
    destroyed: Vec<Group<T, K, G>>,
}

impl<T: Item, K: Key, G: Key> Plan<T, K, G> {
    fn execute(self, observer: &SharedObserver<ChangeSet<Group<T, K, G>, G>>) {
        for (group, ops) in self.ops {
            group.cache.edit(|updater| {
                for op in ops {
                    match op {
                        MemberOp::Upsert(key, value) => updater.add_or_update(key, value),
                        MemberOp::Remove(key) => {
                            updater.remove(&key);
                        }
                        MemberOp::Refresh(key) => {
                            updater.refresh(&key);
                        }
                    }
                }
            });
        }
        if !self.output.is_empty() {
            observer.on_next(self.output);
        }
        for group in self.destroyed {
            group.cache.complete();
        }
    }
}

struct GroupEntry<T, K, G> {
    group: Group<T, K, G>,
    members: usize,
}

struct GroupState<T, K, G> {
    members: HashMap<K, (G, T)>,
    groups: HashMap<G, GroupEntry<T, K, G>>,
}

/// Collects per-group ops for one batch, in first-touch order.
struct Batch<T, K, G> {
    order: Vec<G>,
    ops: HashMap<G, Vec<MemberOp<T, K>>>,
    created: Vec<G>,
    emptied: Vec<G>,
}

impl<T: Item, K: Key, G: Key> Batch<T, K, G> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            ops: HashMap::new(),
            created: Vec::new(),
            emptied: Vec::new(),
        }
    }

    fn push(&mut self, group: &G, op: MemberOp<T, K>) {
        if !self.ops.contains_key(group) {
            self.order.push(group.clone());
        }
        self.ops.entry(group.clone()).or_default().push(op);
    }
}

impl<T: Item, K: Key, G: Key> GroupState<T, K, G> {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    fn join(&mut self, batch: &mut Batch<T, K, G>, group: &G, key: K, value: T) {
        let entry = self.groups.entry(group.clone()).or_insert_with(|| {
            batch.created.push(group.clone());
            GroupEntry {
                group: Group::new(group.clone()),
                members: 0,
            }
        });
        entry.members += 1;
        batch.push(group, MemberOp::Upsert(key, value));
    }

    fn leave(&mut self, batch: &mut Batch<T, K, G>, group: &G, key: K) {
        if let Some(entry) = self.groups.get_mut(group) {
            entry.members = entry.members.saturating_sub(1);
            if entry.members == 0 {
                batch.emptied.push(group.clone());
            }
        }
        batch.push(group, MemberOp::Remove(key));
    }

    /// Places `key` in `target`, moving it out of its previous group.
    fn place(&mut self, batch: &mut Batch<T, K, G>, key: &K, target: G, value: T) {
        match self.members.insert(key.clone(), (target.clone(), value.clone())) {
            Some((previous, _)) if previous == target => {
                batch.push(&target, MemberOp::Upsert(key.clone(), value));
            }
            Some((previous, _)) => {
                self.leave(batch, &previous, key.clone());
                self.join(batch, &target, key.clone(), value);
            }
            None => self.join(batch, &target, key.clone(), value),
        }
    }

    fn apply<F>(&mut self, changes: &ChangeSet<T, K>, selector: &F) -> Plan<T, K, G>
    where
        F: Fn(&T) -> G,
    {
        let mut batch = Batch::new();
        for change in changes {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    let target = selector(change.current());
                    self.place(&mut batch, key, target, change.current().clone());
                }
                ChangeReason::Remove => {
                    if let Some((group, _)) = self.members.remove(key) {
                        self.leave(&mut batch, &group, key.clone());
                    }
                }
                ChangeReason::Refresh => {
                    let Some((current_group, _)) = self.members.get(key) else {
                        continue;
                    };
                    let target = selector(change.current());
                    if &target == current_group {
                        let group = target.clone();
                        self.members
                            .insert(key.clone(), (target, change.current().clone()));
                        batch.push(&group, MemberOp::Refresh(key.clone()));
                    } else {
                        self.place(&mut batch, key, target, change.current().clone());
                    }
                }
                ChangeReason::Moved => {}
            }
        }
        self.finish(batch)
    }

    /// Re-evaluates the group key of every member.
    fn regroup<F>(&mut self, selector: &F) -> Plan<T, K, G>
    where
        F: Fn(&T) -> G,
    {
        let mut batch = Batch::new();
        let moves: Vec<(K, G, T)> = self
            .members
            .iter()
            .filter_map(|(key, (group, value))| {
                let target = selector(value);
                (&target != group).then(|| (key.clone(), target, value.clone()))
            })
            .collect();
        for (key, target, value) in moves {
            self.place(&mut batch, &key, target, value);
        }
        self.finish(batch)
    }

    fn finish(&mut self, mut batch: Batch<T, K, G>) -> Plan<T, K, G> {
        let mut output = ChangeSet::new();
        let mut destroyed = Vec::new();

        for group_key in &batch.created {
            match self.groups.get(group_key) {
                Some(entry) if entry.members > 0 => {
                    output.push(Change::add(group_key.clone(), entry.group.clone()))
                }
                _ => {
                    if let Some(entry) = self.groups.remove(group_key) {
                        batch.ops.remove(group_key);
                        destroyed.push(entry.group);
                    }
                }
            }
        }
        for group_key in &batch.emptied {
            let still_empty = self
                .groups
                .get(group_key)
                .is_some_and(|entry| entry.members == 0);
            if !still_empty {
                continue;
            }
            if let Some(entry) = self.groups.remove(group_key) {
                output.push(Change::remove(group_key.clone(), entry.group.clone()));
                destroyed.push(entry.group);
            }
        }

        let ops = batch
            .order
            .iter()
            .filter_map(|group_key| {
                let ops = batch.ops.remove(group_key)?;
                let group = destroyed
                    .iter()
                    .find(|g| &g.key == group_key)
                    .or_else(|| self.groups.get(group_key).map(|entry| &entry.group))?
                    .clone();
                Some((group, ops))
            })
            .collect();

        Plan {
            ops,
            output,
            destroyed,
        }
    }

    fn all_groups(&self) -> Vec<Group<T, K, G>> {
        self.groups.values().map(|entry| entry.group.clone()).collect()
    }
}

/// Groups items by `selector`.
///
/// Equivalent to [`group_with_regroup`] with a trigger that never fires.
pub fn group<T, K, G, F>(
    source: &Observable<ChangeSet<T, K>>,
    selector: F,
) -> Observable<ChangeSet<Group<T, K, G>, G>>
where
    T: Item,
    K: Key,
    G: Key,
    F: Fn(&T) -> G + Send + Sync + 'static,
{
    group_with_regroup(source, selector, &Observable::never())
}

/// Groups items by `selector`, re-evaluating every item on each `regroup`
/// tick.
///
/// Group caches complete when their group is destroyed, when the source
/// completes, and on unsubscribe; a source error is forwarded to every live
/// group cache before it is forwarded downstream.
pub fn group_with_regroup<T, K, G, F>(
    source: &Observable<ChangeSet<T, K>>,
    selector: F,
    regroup: &Observable<()>,
) -> Observable<ChangeSet<Group<T, K, G>, G>>
where
    T: Item,
    K: Key,
    G: Key,
    F: Fn(&T) -> G + Send + Sync + 'static,
{
    let source = source.clone();
    let regroup = regroup.clone();
    let selector = Arc::new(selector);
    Observable::create(move |observer: SharedObserver<ChangeSet<Group<T, K, G>, G>>| {
        let gate = Gate::new();
        let state = Arc::new(Mutex::new(GroupState::new()));
        let subscriptions = Arc::new(CompositeSubscription::new());

        let terminate = {
            let gate = gate.clone();
            let state = state.clone();
            let observer = observer.clone();
            Arc::new(move |error: Option<Error>| {
                let _gate = gate.enter();
                let groups = state.lock().all_groups();
                for group in groups {
                    match &error {
                        Some(error) => group.cache.error(error.clone()),
                        None => group.cache.complete(),
                    }
                }
                match error {
                    Some(error) => observer.on_error(error),
                    None => observer.on_completed(),
                }
            })
        };

        {
            let gate = gate.clone();
            let state = state.clone();
            let selector = selector.clone();
            let downstream = observer.clone();
            let on_error = terminate.clone();
            subscriptions.add(regroup.subscribe(
                AnonymousObserver::new(
                    move |_: ()| {
                        let _gate = gate.enter();
                        let plan = state.lock().regroup(&*selector);
                        plan.execute(&downstream);
                    },
                    move |e| on_error(Some(e)),
                    || {},
                )
                .shared(),
            ));
        }

        {
            let gate = gate.clone();
            let state = state.clone();
            let selector = selector.clone();
            let downstream = observer.clone();
            let on_error = terminate.clone();
            let on_completed = terminate;
            subscriptions.add(source.subscribe(
                AnonymousObserver::new(
                    move |changes: ChangeSet<T, K>| {
                        let _gate = gate.enter();
                        let plan = state.lock().apply(&changes, &*selector);
                        plan.execute(&downstream);
                    },
                    move |e| on_error(Some(e)),
                    move || on_completed(None),
                )
                .shared(),
            ));
        }

        let teardown_state = state;
        subscriptions.add(Subscription::new(move || {
            let groups = teardown_state.lock().all_groups();
            for group in groups {
                group.cache.complete();
            }
        }));
        subscriptions.into_subscription()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_reactive::{ChangeSetAggregator, SourceCache, Subject};

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

    fn decade(p: &Person) -> u32 {
        p.age / 10
    }

    #[test]
    fn test_group_creates_populated_groups() {
        let source = people();
        let results = ChangeSetAggregator::new(&group(&source.connect(), decade));

        source.add_or_update_many(vec![person("a", 11), person("b", 15), person("c", 23)]);

        let last = results.last().unwrap();
        assert_eq!(last.adds(), 2);
        for change in &last {
            assert!(change.current().count() > 0);
        }
        assert_eq!(results.lookup(&1).unwrap().count(), 2);
        assert_eq!(results.lookup(&2).unwrap().items(), vec![person("c", 23)]);
    }

    #[test]
    fn test_group_moves_member_and_destroys_empty() {
        let source = people();
        let results = ChangeSetAggregator::new(&group(&source.connect(), decade));
        source.add_or_update_many(vec![person("a", 11), person("b", 25)]);

        let old_group = results.lookup(&1).unwrap();
        let member_changes = ChangeSetAggregator::new(&old_group.connect());

        source.add_or_update(person("a", 28));

        let last = results.last().unwrap();
        assert_eq!((last.adds(), last.removes()), (0, 1));
        assert!(results.lookup(&1).is_none());
        assert_eq!(results.lookup(&2).unwrap().count(), 2);
        assert!(member_changes.is_completed());
        assert_eq!(member_changes.count(), 0);
    }

    #[test]
    fn test_group_update_within_group() {
        let source = people();
        let results = ChangeSetAggregator::new(&group(&source.connect(), decade));
        source.add_or_update(person("a", 11));
        let members = ChangeSetAggregator::new(&results.lookup(&1).unwrap().connect());

        source.add_or_update(person("a", 12));

        assert_eq!(results.message_count(), 1);
        assert_eq!(members.last().unwrap().updates(), 1);
    }

    #[test]
    fn test_group_transient_group_never_published() {
        let source = people();
        let results = ChangeSetAggregator::new(&group(&source.connect(), decade));
        source.add_or_update(person("a", 11));

        source.edit(|updater| {
            updater.add_or_update(person("b", 35));
            updater.remove_key(&"b");
        });

        assert_eq!(results.summary().adds, 1);
        assert!(results.lookup(&3).is_none());
    }

    #[test]
    fn test_group_regroup_trigger() {
        let source = people();
        let threshold = Arc::new(Mutex::new(20u32));
        let limit = threshold.clone();
        let regroup: Subject<()> = Subject::new();
        let results = ChangeSetAggregator::new(&group_with_regroup(
            &source.connect(),
            move |p: &Person| p.age >= *limit.lock(),
            &regroup.as_observable(),
        ));
        source.add_or_update_many(vec![person("a", 15), person("b", 25)]);
        assert_eq!(results.lookup(&true).unwrap().count(), 1);

        *threshold.lock() = 10;
        regroup.next(());

        assert!(results.lookup(&false).is_none());
        assert_eq!(results.lookup(&true).unwrap().count(), 2);
    }

    #[test]
    fn test_group_refresh_reevaluates() {
        let source = people();
        let bucket = Arc::new(Mutex::new(0u32));
        let current = bucket.clone();
        let results = ChangeSetAggregator::new(&group(&source.connect(), move |_: &Person| {
            *current.lock()
        }));
        source.add_or_update(person("a", 1));

        *bucket.lock() = 1;
        source.refresh_key(&"a");

        assert!(results.lookup(&0).is_none());
        assert_eq!(results.lookup(&1).unwrap().count(), 1);
    }

    #[test]
    fn test_group_completion_completes_groups() {
        let source = people();
        let results = ChangeSetAggregator::new(&group(&source.connect(), decade));
        source.add_or_update(person("a", 11));
        let members = ChangeSetAggregator::new(&results.lookup(&1).unwrap().connect());

        source.complete();

        assert!(results.is_completed());
        assert!(members.is_completed());
    }

    #[test]
    fn test_group_error_reaches_groups() {
        let source = people();
        let results = ChangeSetAggregator::new(&group(&source.connect(), decade));
        source.add_or_update(person("a", 11));
        let members = ChangeSetAggregator::new(&results.lookup(&1).unwrap().connect());

        source.error(Error::upstream("lost"));

        assert_eq!(results.error(), Some(Error::upstream("lost")));
        assert_eq!(members.error(), Some(Error::upstream("lost")));
    }
}
