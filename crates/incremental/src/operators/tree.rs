//! Parent/child trees built from a flat keyed collection.

use hashbrown::{HashMap, HashSet};
use keyflux_core::{ChangeAwareCache, ChangeReason, ChangeSet, Error, Item, Key};
use keyflux_reactive::{
    AnonymousObserver, CompositeSubscription, Gate, Observable, ObservableCache, SharedObserver,
    Subscription,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

struct NodeInner<T, K> {
    key: K,
    item: T,
    children: ObservableCache<Node<T, K>, K>,
    parent: RwLock<Option<Weak<NodeInner<T, K>>>>,
}

/// An item placed in a tree.
///
/// A node owns the cache of its children and refers to its parent weakly.
/// Updating an item yields a new node that keeps the same children cache.
pub struct Node<T, K> {
    inner: Arc<NodeInner<T, K>>,
}

impl<T, K> Clone for Node<T, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Item, K: Key> Node<T, K> {
    fn new(key: K, item: T, children: ObservableCache<Node<T, K>, K>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                key,
                item,
                children,
                parent: RwLock::new(None),
            }),
        }
    }

    /// The item's key.
    pub fn key(&self) -> &K {
        &self.inner.key
    }

    /// The wrapped item.
    pub fn item(&self) -> &T {
        &self.inner.item
    }

    /// The cache of direct children, keyed by child key.
    pub fn children(&self) -> &ObservableCache<Node<T, K>, K> {
        &self.inner.children
    }

    /// The parent node, if this node is placed under one that is still alive.
    pub fn parent(&self) -> Option<Node<T, K>> {
        self.inner
            .parent
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Node { inner })
    }

    /// Returns true if the node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Distance from the root; roots are at depth zero.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(node) = current {
            depth += 1;
            current = node.parent();
        }
        depth
    }

    fn set_parent(&self, parent: Option<&Node<T, K>>) {
        *self.inner.parent.write() = parent.map(|node| Arc::downgrade(&node.inner));
    }
}

impl<T: core::fmt::Debug, K: core::fmt::Debug> core::fmt::Debug for Node<T, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.inner.key)
            .field("item", &self.inner.item)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq)]
enum Placement<K> {
    Root,
    Under(K),
}

enum ChildOp<T, K> {
    Upsert(K, Node<T, K>),
    Remove(K),
    Refresh(K),
    Complete,
}

/// Edits to children caches, applied once the state lock is released.
struct ChildEdits<T, K> {
    edits: Vec<(ObservableCache<Node<T, K>, K>, ChildOp<T, K>)>,
}

impl<T: Item, K: Key> ChildEdits<T, K> {
    fn new() -> Self {
        Self { edits: Vec::new() }
    }

    fn push(&mut self, cache: &ObservableCache<Node<T, K>, K>, op: ChildOp<T, K>) {
        self.edits.push((cache.clone(), op));
    }

    /// Applies consecutive edits to the same cache as one batch.
    fn execute(self) {
        let mut pending: Option<(ObservableCache<Node<T, K>, K>, Vec<ChildOp<T, K>>)> = None;
        for (cache, op) in self.edits {
            match &mut pending {
                Some((current, ops)) if current.ptr_eq(&cache) => ops.push(op),
                _ => {
                    if let Some((current, ops)) = pending.take() {
                        Self::apply(&current, ops);
                    }
                    pending = Some((cache, vec![op]));
                }
            }
        }
        if let Some((current, ops)) = pending {
            Self::apply(&current, ops);
        }
    }

    fn apply(cache: &ObservableCache<Node<T, K>, K>, ops: Vec<ChildOp<T, K>>) {
        let mut complete = false;
        cache.edit(|updater| {
            for op in ops {
                match op {
                    ChildOp::Upsert(key, node) => updater.add_or_update(key, node),
                    ChildOp::Remove(key) => {
                        updater.remove(&key);
                    }
                    ChildOp::Refresh(key) => {
                        updater.refresh(&key);
                    }
                    ChildOp::Complete => complete = true,
                }
            }
        });
        if complete {
            cache.complete();
        }
    }
}

struct TreeState<T, K> {
    nodes: HashMap<K, Node<T, K>>,
    parents: HashMap<K, K>,
    children_of: HashMap<K, HashSet<K>>,
    roots: ChangeAwareCache<Node<T, K>, K>,
}

impl<T: Item, K: Key> TreeState<T, K> {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            parents: HashMap::new(),
            children_of: HashMap::new(),
            roots: ChangeAwareCache::new(),
        }
    }

    /// Where `key` belongs; a missing parent makes it a root.
    fn placement(&self, key: &K) -> Placement<K> {
        match self.parents.get(key) {
            Some(parent) if self.nodes.contains_key(parent) => Placement::Under(parent.clone()),
            _ => Placement::Root,
        }
    }

    fn declare_parent(&mut self, key: &K, parent: Option<K>) {
        let parent = parent.filter(|parent| parent != key);
        let previous = match &parent {
            Some(parent) => self.parents.insert(key.clone(), parent.clone()),
            None => self.parents.remove(key),
        };
        if previous == parent {
            return;
        }
        if let Some(previous) = previous {
            if let Some(siblings) = self.children_of.get_mut(&previous) {
                siblings.remove(key);
                if siblings.is_empty() {
                    self.children_of.remove(&previous);
                }
            }
        }
        if let Some(parent) = parent {
            self.children_of.entry(parent).or_default().insert(key.clone());
        }
    }

    fn live_children(&self, key: &K) -> Vec<Node<T, K>> {
        self.children_of
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|child| self.nodes.get(child).cloned())
            .collect()
    }

    fn attach(
        &mut self,
        edits: &mut ChildEdits<T, K>,
        placement: &Placement<K>,
        node: &Node<T, K>,
    ) {
        match placement {
            Placement::Root => {
                node.set_parent(None);
                self.roots.add_or_update(node.key().clone(), node.clone());
            }
            Placement::Under(parent) => {
                if let Some(parent) = self.nodes.get(parent) {
                    node.set_parent(Some(parent));
                    edits.push(
                        parent.children(),
                        ChildOp::Upsert(node.key().clone(), node.clone()),
                    );
                }
            }
        }
    }

    fn detach(&mut self, edits: &mut ChildEdits<T, K>, placement: &Placement<K>, key: &K) {
        match placement {
            Placement::Root => {
                self.roots.remove(key);
            }
            Placement::Under(parent) => {
                if let Some(parent) = self.nodes.get(parent) {
                    edits.push(parent.children(), ChildOp::Remove(key.clone()));
                }
            }
        }
    }

    fn upsert(&mut self, edits: &mut ChildEdits<T, K>, key: &K, item: T, parent: Option<K>) {
        let previous = self
            .nodes
            .get(key)
            .cloned()
            .map(|node| (self.placement(key), node));

        self.declare_parent(key, parent);
        let children = match &previous {
            Some((_, node)) => node.children().clone(),
            None => ObservableCache::new(),
        };
        let node = Node::new(key.clone(), item, children);
        self.nodes.insert(key.clone(), node.clone());
        let placement = self.placement(key);

        match &previous {
            Some((old, _)) if old == &placement => {}
            Some((old, _)) => self.detach(edits, old, key),
            None => {}
        }
        self.attach(edits, &placement, &node);

        for child in self.live_children(key) {
            if previous.is_none() {
                // Previously a virtual root waiting for this parent.
                self.roots.remove(child.key());
                edits.push(
                    node.children(),
                    ChildOp::Upsert(child.key().clone(), child.clone()),
                );
            }
            child.set_parent(Some(&node));
        }
    }

    fn refresh(&mut self, edits: &mut ChildEdits<T, K>, key: &K, parent: Option<K>) {
        let Some(node) = self.nodes.get(key).cloned() else {
            return;
        };
        let before = self.placement(key);
        self.declare_parent(key, parent);
        let after = self.placement(key);
        if before == after {
            match &after {
                Placement::Root => {
                    self.roots.refresh(key);
                }
                Placement::Under(parent) => {
                    if let Some(parent) = self.nodes.get(parent) {
                        edits.push(parent.children(), ChildOp::Refresh(key.clone()));
                    }
                }
            }
        } else {
            self.detach(edits, &before, key);
            self.attach(edits, &after, &node);
        }
    }

    fn remove(&mut self, edits: &mut ChildEdits<T, K>, key: &K) {
        if !self.nodes.contains_key(key) {
            return;
        }
        let placement = self.placement(key);
        self.detach(edits, &placement, key);
        self.declare_parent(key, None);
        let Some(node) = self.nodes.remove(key) else {
            return;
        };

        for child in self.live_children(key) {
            edits.push(node.children(), ChildOp::Remove(child.key().clone()));
            child.set_parent(None);
            self.roots.add_or_update(child.key().clone(), child);
        }
        edits.push(node.children(), ChildOp::Complete);
    }

    fn apply<F>(&mut self, changes: &ChangeSet<T, K>, parent_key: &F) -> ChildEdits<T, K>
    where
        F: Fn(&T) -> Option<K>,
    {
        let mut edits = ChildEdits::new();
        for change in changes {
            let key = change.key();
            match change.reason() {
                ChangeReason::Add | ChangeReason::Update => {
                    let parent = parent_key(change.current());
                    self.upsert(&mut edits, key, change.current().clone(), parent);
                }
                ChangeReason::Remove => self.remove(&mut edits, key),
                ChangeReason::Refresh => {
                    let parent = parent_key(change.current());
                    self.refresh(&mut edits, key, parent);
                }
                ChangeReason::Moved => {}
            }
        }
        edits
    }

    fn all_children(&self) -> Vec<ObservableCache<Node<T, K>, K>> {
        self.nodes
            .values()
            .map(|node| node.children().clone())
            .collect()
    }
}

/// Arranges items into trees using `parent_key`, emitting the root nodes.
///
/// An item whose parent key is `None`, equal to its own key, or not present
/// in the collection is a root. When a parent is removed its children become
/// roots; when a missing parent appears, the items waiting for it move under
/// it. Children caches are updated before the roots batch is published.
pub fn transform_to_tree<T, K, F>(
    source: &Observable<ChangeSet<T, K>>,
    parent_key: F,
) -> Observable<ChangeSet<Node<T, K>, K>>
where
    T: Item,
    K: Key,
    F: Fn(&T) -> Option<K> + Send + Sync + 'static,
{
    let source = source.clone();
    let parent_key = Arc::new(parent_key);
    Observable::create(move |observer: SharedObserver<ChangeSet<Node<T, K>, K>>| {
        let gate = Gate::new();
        let state = Arc::new(Mutex::new(TreeState::new()));
        let subscriptions = Arc::new(CompositeSubscription::new());

        let terminate = {
            let gate = gate.clone();
            let state = state.clone();
            let observer = observer.clone();
            Arc::new(move |error: Option<Error>| {
                let _gate = gate.enter();
                let caches = state.lock().all_children();
                for cache in caches {
                    match &error {
                        Some(error) => cache.error(error.clone()),
                        None => cache.complete(),
                    }
                }
                match error {
                    Some(error) => observer.on_error(error),
                    None => observer.on_completed(),
                }
            })
        };

        let on_next = {
            let gate = gate.clone();
            let state = state.clone();
            let parent_key = parent_key.clone();
            move |changes: ChangeSet<T, K>| {
                let _gate = gate.enter();
                let (edits, roots) = {
                    let mut state = state.lock();
                    let edits = state.apply(&changes, &*parent_key);
                    (edits, state.roots.capture_changes())
                };
                edits.execute();
                if !roots.is_empty() {
                    observer.on_next(roots);
                }
            }
        };
        let on_error = terminate.clone();
        subscriptions.add(source.subscribe(
            AnonymousObserver::new(
                on_next,
                move |e| on_error(Some(e)),
                move || terminate(None),
            )
            .shared(),
        ));

        subscriptions.add(Subscription::new(move || {
            let caches = state.lock().all_children();
            for cache in caches {
                cache.complete();
            }
        }));
        subscriptions.into_subscription()
    })
}
