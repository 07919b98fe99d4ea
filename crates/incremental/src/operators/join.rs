//! Keyed joins.
//!
//! Both sides are mirrored in full. Each right item correlates to a left key
//! through `right_key_selector`; when several right items correlate to the
//! same left key the one applied last is the visible pairing, and removing it
//! falls back to the one applied before it.
//!
//! Nothing is emitted until both sides have been subscribed. Whatever either
//! side delivers while being subscribed becomes the initial state, and the
//! first emission is the join of both initial states.

use hashbrown::{HashMap, HashSet};
use keyflux_core::{ChangeAwareCache, ChangeReason, ChangeSet, Item, Key};
use keyflux_reactive::{AnonymousObserver, CompositeSubscription, Gate, Observable, SharedObserver};
use parking_lot::Mutex;
use std::sync::Arc;

/// Keys whose join results must be recomputed.
struct Affected<LK, RK> {
    left: Vec<LK>,
    right: Vec<RK>,
    refreshed_left: Vec<LK>,
    refreshed_right: Vec<RK>,
}

impl<LK: Key, RK: Key> Affected<LK, RK> {
    fn new() -> Self {
        Self {
            left: Vec::new(),
            right: Vec::new(),
            refreshed_left: Vec::new(),
            refreshed_right: Vec::new(),
        }
    }

    fn dedup(mut self) -> Self {
        fn unique<Q: Key>(keys: &mut Vec<Q>) {
            let mut seen = HashSet::new();
            keys.retain(|k| seen.insert(k.clone()));
        }
        unique(&mut self.left);
        unique(&mut self.right);
        unique(&mut self.refreshed_left);
        unique(&mut self.refreshed_right);
        self
    }
}

struct JoinState<L, LK, R, RK> {
    left: HashMap<LK, L>,
    right: HashMap<RK, R>,
    right_to_left: HashMap<RK, LK>,
    by_left: HashMap<LK, Vec<RK>>,
}

impl<L: Item, LK: Key, R: Item, RK: Key> JoinState<L, LK, R, RK> {
    fn new() -> Self {
        Self {
            left: HashMap::new(),
            right: HashMap::new(),
            right_to_left: HashMap::new(),
            by_left: HashMap::new(),
        }
    }

    /// The right item currently paired with `key`.
    fn visible_right(&self, key: &LK) -> Option<&R> {
        self.by_left
            .get(key)
            .and_then(|keys| keys.last())
            .and_then(|rk| self.right.get(rk))
    }

    fn left_of(&self, key: &RK) -> Option<&L> {
        self.right_to_left
            .get(key)
            .and_then(|lk| self.left.get(lk))
    }

    fn correlated(&self, key: &LK) -> impl Iterator<Item = &RK> {
        self.by_left.get(key).into_iter().flatten()
    }

    fn is_visible(&self, rk: &RK, lk: &LK) -> bool {
        self.by_left.get(lk).and_then(|keys| keys.last()) == Some(rk)
    }

    fn apply_left(&mut self, changes: &ChangeSet<L, LK>) -> Affected<LK, RK> {
        let mut affected = Affected::new();
        for change in changes {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.left.insert(key.clone(), change.current().clone());
                }
                ChangeReason::Remove => {
                    self.left.remove(key);
                }
                ChangeReason::Refresh => {
                    if self.left.contains_key(key) {
                        self.left.insert(key.clone(), change.current().clone());
                        affected.refreshed_left.push(key.clone());
                        affected.refreshed_right.extend(self.correlated(key).cloned());
                    }
                    continue;
                }
                ChangeReason::Moved => continue,
            }
            affected.left.push(key.clone());
            affected.right.extend(self.correlated(key).cloned());
        }
        affected.dedup()
    }

    fn unlink(&mut self, rk: &RK, lk: &LK) {
        if let Some(keys) = self.by_left.get_mut(lk) {
            keys.retain(|k| k != rk);
            if keys.is_empty() {
                self.by_left.remove(lk);
            }
        }
    }

    fn apply_right<F>(&mut self, changes: &ChangeSet<R, RK>, right_key: &F) -> Affected<LK, RK>
    where
        F: Fn(&R) -> LK,
    {
        let mut affected = Affected::new();
        for change in changes {
            let rk = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    self.upsert_right(&mut affected, rk, change.current().clone(), right_key);
                }
                ChangeReason::Remove => {
                    self.right.remove(rk);
                    if let Some(lk) = self.right_to_left.remove(rk) {
                        self.unlink(rk, &lk);
                        affected.left.push(lk);
                    }
                    affected.right.push(rk.clone());
                }
                ChangeReason::Refresh => {
                    let Some(previous) = self.right_to_left.get(rk).cloned() else {
                        continue;
                    };
                    let target = right_key(change.current());
                    if target == previous {
                        self.right.insert(rk.clone(), change.current().clone());
                        if self.is_visible(rk, &previous) {
                            affected.refreshed_left.push(previous);
                        }
                        affected.refreshed_right.push(rk.clone());
                    } else {
                        self.upsert_right(&mut affected, rk, change.current().clone(), right_key);
                    }
                }
                ChangeReason::Moved => {}
            }
        }
        affected.dedup()
    }

    fn upsert_right<F>(&mut self, affected: &mut Affected<LK, RK>, rk: &RK, value: R, right_key: &F)
    where
        F: Fn(&R) -> LK,
    {
        let target = right_key(&value);
        if let Some(previous) = self.right_to_left.insert(rk.clone(), target.clone()) {
            self.unlink(rk, &previous);
            if previous != target {
                affected.left.push(previous);
            }
        }
        self.by_left
            .entry(target.clone())
            .or_default()
            .push(rk.clone());
        self.right.insert(rk.clone(), value);
        affected.left.push(target);
        affected.right.push(rk.clone());
    }

    /// Every key of either side, for the initial evaluation.
    fn everything(&self) -> Affected<LK, RK> {
        let mut affected = Affected::new();
        affected.left.extend(self.left.keys().cloned());
        affected.left.extend(self.by_left.keys().cloned());
        affected.right.extend(self.right.keys().cloned());
        affected.dedup()
    }
}

type Resolver<L, LK, R, RK, O, OK> =
    dyn Fn(&JoinState<L, LK, R, RK>, &Affected<LK, RK>, &mut ChangeAwareCache<O, OK>) + Send + Sync;

struct JoinCore<L, LK, R, RK, O, OK> {
    join: JoinState<L, LK, R, RK>,
    output: ChangeAwareCache<O, OK>,
    initialized: bool,
    left_done: bool,
    right_done: bool,
}

fn join_core<L, LK, R, RK, O, OK, F>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key: F,
    resolve: Arc<Resolver<L, LK, R, RK, O, OK>>,
) -> Observable<ChangeSet<O, OK>>
where
    L: Item,
    LK: Key,
    R: Item,
    RK: Key,
    O: Item,
    OK: Key,
    F: Fn(&R) -> LK + Send + Sync + 'static,
{
    let left = left.clone();
    let right = right.clone();
    let right_key = Arc::new(right_key);
    Observable::create(move |observer: SharedObserver<ChangeSet<O, OK>>| {
        let gate = Gate::new();
        let core = Arc::new(Mutex::new(JoinCore {
            join: JoinState::new(),
            output: ChangeAwareCache::new(),
            initialized: false,
            left_done: false,
            right_done: false,
        }));
        let subscriptions = Arc::new(CompositeSubscription::new());

        let complete_if_done = {
            let core = core.clone();
            let observer = observer.clone();
            Arc::new(move || {
                let done = {
                    let core = core.lock();
                    core.initialized && core.left_done && core.right_done
                };
                if done {
                    observer.on_completed();
                }
            })
        };

        let _init = gate.enter();

        {
            let gate = gate.clone();
            let core = core.clone();
            let resolve = resolve.clone();
            let downstream = observer.clone();
            let on_error = observer.clone();
            let complete = complete_if_done.clone();
            let completion_gate = gate.clone();
            let completion_core = core.clone();
            subscriptions.add(left.subscribe(
                AnonymousObserver::new(
                    move |changes: ChangeSet<L, LK>| {
                        let _gate = gate.enter();
                        let out = {
                            let mut core = core.lock();
                            let core = &mut *core;
                            let affected = core.join.apply_left(&changes);
                            if !core.initialized {
                                return;
                            }
                            resolve(&core.join, &affected, &mut core.output);
                            core.output.capture_changes()
                        };
                        if !out.is_empty() {
                            downstream.on_next(out);
                        }
                    },
                    move |e| on_error.on_error(e),
                    move || {
                        let _gate = completion_gate.enter();
                        completion_core.lock().left_done = true;
                        complete();
                    },
                )
                .shared(),
            ));
        }

        {
            let gate = gate.clone();
            let core = core.clone();
            let resolve = resolve.clone();
            let right_key = right_key.clone();
            let downstream = observer.clone();
            let on_error = observer.clone();
            let complete = complete_if_done.clone();
            let completion_gate = gate.clone();
            let completion_core = core.clone();
            subscriptions.add(right.subscribe(
                AnonymousObserver::new(
                    move |changes: ChangeSet<R, RK>| {
                        let _gate = gate.enter();
                        let out = {
                            let mut core = core.lock();
                            let core = &mut *core;
                            let affected = core.join.apply_right(&changes, &*right_key);
                            if !core.initialized {
                                return;
                            }
                            resolve(&core.join, &affected, &mut core.output);
                            core.output.capture_changes()
                        };
                        if !out.is_empty() {
                            downstream.on_next(out);
                        }
                    },
                    move |e| on_error.on_error(e),
                    move || {
                        let _gate = completion_gate.enter();
                        completion_core.lock().right_done = true;
                        complete();
                    },
                )
                .shared(),
            ));
        }

        let initial = {
            let mut core = core.lock();
            let core = &mut *core;
            core.initialized = true;
            let everything = core.join.everything();
            resolve(&core.join, &everything, &mut core.output);
            core.output.capture_changes()
        };
        tracing::trace!(changes = initial.len(), "join initialized");
        if !initial.is_empty() {
            observer.on_next(initial);
        }
        complete_if_done();
        drop(_init);

        subscriptions.into_subscription()
    })
}

fn publish<O: Item, OK: Key>(output: &mut ChangeAwareCache<O, OK>, key: &OK, value: Option<O>) {
    match value {
        Some(value) => output.add_or_update(key.clone(), value),
        None => {
            output.remove(key);
        }
    }
}

/// Joins every left item with its paired right item, if any.
///
/// The output is keyed by the left key and holds one row per left item.
pub fn left_join<L, LK, R, RK, O, FK, FS>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: FK,
    result_selector: FS,
) -> Observable<ChangeSet<O, LK>>
where
    L: Item,
    LK: Key,
    R: Item,
    RK: Key,
    O: Item,
    FK: Fn(&R) -> LK + Send + Sync + 'static,
    FS: Fn(&LK, &L, Option<&R>) -> O + Send + Sync + 'static,
{
    let resolve: Arc<Resolver<L, LK, R, RK, O, LK>> =
        Arc::new(
            move |state: &JoinState<L, LK, R, RK>,
                  affected: &Affected<LK, RK>,
                  output: &mut ChangeAwareCache<O, LK>| {
            for key in &affected.left {
                let row = state
                    .left
                    .get(key)
                    .map(|l| result_selector(key, l, state.visible_right(key)));
                publish(output, key, row);
            }
            for key in &affected.refreshed_left {
                output.refresh(key);
            }
        });
    join_core(left, right, right_key_selector, resolve)
}

/// Joins left items that have a paired right item.
///
/// A left item whose pairing disappears is removed from the output.
pub fn inner_join<L, LK, R, RK, O, FK, FS>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: FK,
    result_selector: FS,
) -> Observable<ChangeSet<O, LK>>
where
    L: Item,
    LK: Key,
    R: Item,
    RK: Key,
    O: Item,
    FK: Fn(&R) -> LK + Send + Sync + 'static,
    FS: Fn(&LK, &L, &R) -> O + Send + Sync + 'static,
{
    let resolve: Arc<Resolver<L, LK, R, RK, O, LK>> =
        Arc::new(
            move |state: &JoinState<L, LK, R, RK>,
                  affected: &Affected<LK, RK>,
                  output: &mut ChangeAwareCache<O, LK>| {
            for key in &affected.left {
                let row = match (state.left.get(key), state.visible_right(key)) {
                    (Some(l), Some(r)) => Some(result_selector(key, l, r)),
                    _ => None,
                };
                publish(output, key, row);
            }
            for key in &affected.refreshed_left {
                output.refresh(key);
            }
        });
    join_core(left, right, right_key_selector, resolve)
}

/// Joins every left key present on either side.
pub fn full_join<L, LK, R, RK, O, FK, FS>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: FK,
    result_selector: FS,
) -> Observable<ChangeSet<O, LK>>
where
    L: Item,
    LK: Key,
    R: Item,
    RK: Key,
    O: Item,
    FK: Fn(&R) -> LK + Send + Sync + 'static,
    FS: Fn(&LK, Option<&L>, Option<&R>) -> O + Send + Sync + 'static,
{
    let resolve: Arc<Resolver<L, LK, R, RK, O, LK>> =
        Arc::new(
            move |state: &JoinState<L, LK, R, RK>,
                  affected: &Affected<LK, RK>,
                  output: &mut ChangeAwareCache<O, LK>| {
            for key in &affected.left {
                let row = match (state.left.get(key), state.visible_right(key)) {
                    (None, None) => None,
                    (l, r) => Some(result_selector(key, l, r)),
                };
                publish(output, key, row);
            }
            for key in &affected.refreshed_left {
                output.refresh(key);
            }
        });
    join_core(left, right, right_key_selector, resolve)
}

/// Joins every right item with the left item it correlates to, if any.
///
/// The output is keyed by the right key and holds one row per right item.
pub fn right_join<L, LK, R, RK, O, FK, FS>(
    left: &Observable<ChangeSet<L, LK>>,
    right: &Observable<ChangeSet<R, RK>>,
    right_key_selector: FK,
    result_selector: FS,
) -> Observable<ChangeSet<O, RK>>
where
    L: Item,
    LK: Key,
    R: Item,
    RK: Key,
    O: Item,
    FK: Fn(&R) -> LK + Send + Sync + 'static,
    FS: Fn(&RK, Option<&L>, &R) -> O + Send + Sync + 'static,
{
    let resolve: Arc<Resolver<L, LK, R, RK, O, RK>> =
        Arc::new(
            move |state: &JoinState<L, LK, R, RK>,
                  affected: &Affected<LK, RK>,
                  output: &mut ChangeAwareCache<O, RK>| {
            for key in &affected.right {
                let row = state
                    .right
                    .get(key)
                    .map(|r| result_selector(key, state.left_of(key), r));
                publish(output, key, row);
            }
            for key in &affected.refreshed_right {
                output.refresh(key);
            }
        });
    join_core(left, right, right_key_selector, resolve)
}
