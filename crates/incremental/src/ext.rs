//! Fluent operator access on change-set streams.

use crate::operators::{self, BindingList, Group, Node};
use crate::options::{
    ExpireAfterOptions, FilterOptions, MergeOptions, SortAndBindOptions, SortOptions,
    TransformOptions,
};
use futures::future::BoxFuture;
use keyflux_core::{AsyncDisposable, ChangeSet, Comparer, Disposable, Item, Key, Predicate, Result};
use keyflux_reactive::{Observable, SharedScheduler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Extension trait chaining operators on `Observable<ChangeSet<T, K>>`.
///
/// Each method forwards to the free function of the same name in
/// [`operators`](crate::operators).
pub trait ChangeSetStreamExt<T: Item, K: Key>: Sized {
    fn filter<F>(&self, predicate: F, options: FilterOptions) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static;

    fn filter_dynamic(
        &self,
        predicate_changed: &Observable<Predicate<T>>,
        reapply: &Observable<()>,
        options: FilterOptions,
    ) -> Observable<ChangeSet<T, K>>;

    fn filter_on_state<S, F>(
        &self,
        state: &Observable<S>,
        predicate: F,
        options: FilterOptions,
    ) -> Observable<ChangeSet<T, K>>
    where
        S: Send + Sync + 'static,
        F: Fn(&S, &T) -> bool + Send + Sync + 'static;

    fn sort(&self, comparer: Comparer<T>, options: SortOptions) -> Observable<ChangeSet<T, K>>;

    fn sort_dynamic(
        &self,
        comparer_changed: &Observable<Comparer<T>>,
        resort: &Observable<()>,
        options: SortOptions,
    ) -> Observable<ChangeSet<T, K>>;

    fn sort_and_bind<L>(
        &self,
        comparer: Comparer<T>,
        target: Arc<Mutex<L>>,
        options: SortAndBindOptions,
    ) -> Observable<ChangeSet<T, K>>
    where
        L: BindingList<T> + 'static;

    fn group<G, F>(&self, selector: F) -> Observable<ChangeSet<Group<T, K, G>, G>>
    where
        G: Key,
        F: Fn(&T) -> G + Send + Sync + 'static;

    fn group_with_regroup<G, F>(
        &self,
        selector: F,
        regroup: &Observable<()>,
    ) -> Observable<ChangeSet<Group<T, K, G>, G>>
    where
        G: Key,
        F: Fn(&T) -> G + Send + Sync + 'static;

    fn left_join<R, RK, O, FK, FS>(
        &self,
        right: &Observable<ChangeSet<R, RK>>,
        right_key_selector: FK,
        result_selector: FS,
    ) -> Observable<ChangeSet<O, K>>
    where
        R: Item,
        RK: Key,
        O: Item,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        FS: Fn(&K, &T, Option<&R>) -> O + Send + Sync + 'static;

    fn inner_join<R, RK, O, FK, FS>(
        &self,
        right: &Observable<ChangeSet<R, RK>>,
        right_key_selector: FK,
        result_selector: FS,
    ) -> Observable<ChangeSet<O, K>>
    where
        R: Item,
        RK: Key,
        O: Item,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        FS: Fn(&K, &T, &R) -> O + Send + Sync + 'static;

    fn full_join<R, RK, O, FK, FS>(
        &self,
        right: &Observable<ChangeSet<R, RK>>,
        right_key_selector: FK,
        result_selector: FS,
    ) -> Observable<ChangeSet<O, K>>
    where
        R: Item,
        RK: Key,
        O: Item,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        FS: Fn(&K, Option<&T>, Option<&R>) -> O + Send + Sync + 'static;

    fn right_join<R, RK, O, FK, FS>(
        &self,
        right: &Observable<ChangeSet<R, RK>>,
        right_key_selector: FK,
        result_selector: FS,
    ) -> Observable<ChangeSet<O, RK>>
    where
        R: Item,
        RK: Key,
        O: Item,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        FS: Fn(&RK, Option<&T>, &R) -> O + Send + Sync + 'static;

    fn merge_many<U, F>(&self, selector: F) -> Observable<U>
    where
        U: Send + 'static,
        F: Fn(&T, &K) -> Observable<U> + Send + Sync + 'static;

    fn merge_many_change_sets<U, CK, F>(
        &self,
        selector: F,
        options: MergeOptions<U>,
    ) -> Observable<ChangeSet<U, CK>>
    where
        U: Item,
        CK: Key,
        F: Fn(&T, &K) -> Observable<ChangeSet<U, CK>> + Send + Sync + 'static;

    fn transform<U, F>(&self, transform: F, options: TransformOptions) -> Observable<ChangeSet<U, K>>
    where
        U: Item,
        F: Fn(&T, &K) -> U + Send + Sync + 'static;

    fn transform_many<U, CK, F, FK>(&self, selector: F, child_key: FK) -> Observable<ChangeSet<U, CK>>
    where
        U: Item,
        CK: Key,
        F: Fn(&T, &K) -> Vec<U> + Send + Sync + 'static,
        FK: Fn(&U) -> CK + Send + Sync + 'static;

    fn transform_many_async<U, CK, F, FK>(
        &self,
        selector: F,
        child_key: FK,
    ) -> Observable<ChangeSet<U, CK>>
    where
        U: Item,
        CK: Key,
        F: Fn(&T, &K) -> BoxFuture<'static, Result<Vec<U>>> + Send + Sync + 'static,
        FK: Fn(&U) -> CK + Send + Sync + 'static;

    fn transform_to_tree<F>(&self, parent_key: F) -> Observable<ChangeSet<Node<T, K>, K>>
    where
        F: Fn(&T) -> Option<K> + Send + Sync + 'static;

    fn expire_after<F>(
        &self,
        time_selector: F,
        scheduler: SharedScheduler,
        options: ExpireAfterOptions,
    ) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) -> Option<Duration> + Send + Sync + 'static;

    fn dispose_many(&self) -> Observable<ChangeSet<T, K>>
    where
        T: Disposable;

    fn async_dispose_many<F>(&self, disposals_completed: F) -> Observable<ChangeSet<T, K>>
    where
        T: AsyncDisposable,
        F: Fn(Observable<()>) + Send + Sync + 'static;

    fn not_empty(&self) -> Observable<ChangeSet<T, K>>;
}

impl<T: Item, K: Key> ChangeSetStreamExt<T, K> for Observable<ChangeSet<T, K>> {
    fn filter<F>(&self, predicate: F, options: FilterOptions) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        operators::filter(self, predicate, options)
    }

    fn filter_dynamic(
        &self,
        predicate_changed: &Observable<Predicate<T>>,
        reapply: &Observable<()>,
        options: FilterOptions,
    ) -> Observable<ChangeSet<T, K>> {
        operators::filter_dynamic(self, predicate_changed, reapply, options)
    }

    fn filter_on_state<S, F>(
        &self,
        state: &Observable<S>,
        predicate: F,
        options: FilterOptions,
    ) -> Observable<ChangeSet<T, K>>
    where
        S: Send + Sync + 'static,
        F: Fn(&S, &T) -> bool + Send + Sync + 'static,
    {
        operators::filter_on_state(self, state, predicate, options)
    }

    fn sort(&self, comparer: Comparer<T>, options: SortOptions) -> Observable<ChangeSet<T, K>> {
        operators::sort(self, comparer, options)
    }

    fn sort_dynamic(
        &self,
        comparer_changed: &Observable<Comparer<T>>,
        resort: &Observable<()>,
        options: SortOptions,
    ) -> Observable<ChangeSet<T, K>> {
        operators::sort_dynamic(self, comparer_changed, resort, options)
    }

    fn sort_and_bind<L>(
        &self,
        comparer: Comparer<T>,
        target: Arc<Mutex<L>>,
        options: SortAndBindOptions,
    ) -> Observable<ChangeSet<T, K>>
    where
        L: BindingList<T> + 'static,
    {
        operators::sort_and_bind(self, comparer, target, options)
    }

    fn group<G, F>(&self, selector: F) -> Observable<ChangeSet<Group<T, K, G>, G>>
    where
        G: Key,
        F: Fn(&T) -> G + Send + Sync + 'static,
    {
        operators::group(self, selector)
    }

    fn group_with_regroup<G, F>(
        &self,
        selector: F,
        regroup: &Observable<()>,
    ) -> Observable<ChangeSet<Group<T, K, G>, G>>
    where
        G: Key,
        F: Fn(&T) -> G + Send + Sync + 'static,
    {
        operators::group_with_regroup(self, selector, regroup)
    }

    fn left_join<R, RK, O, FK, FS>(
        &self,
        right: &Observable<ChangeSet<R, RK>>,
        right_key_selector: FK,
        result_selector: FS,
    ) -> Observable<ChangeSet<O, K>>
    where
        R: Item,
        RK: Key,
        O: Item,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        FS: Fn(&K, &T, Option<&R>) -> O + Send + Sync + 'static,
    {
        operators::left_join(self, right, right_key_selector, result_selector)
    }

    fn inner_join<R, RK, O, FK, FS>(
        &self,
        right: &Observable<ChangeSet<R, RK>>,
        right_key_selector: FK,
        result_selector: FS,
    ) -> Observable<ChangeSet<O, K>>
    where
        R: Item,
        RK: Key,
        O: Item,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        FS: Fn(&K, &T, &R) -> O + Send + Sync + 'static,
    {
        operators::inner_join(self, right, right_key_selector, result_selector)
    }

    fn full_join<R, RK, O, FK, FS>(
        &self,
        right: &Observable<ChangeSet<R, RK>>,
        right_key_selector: FK,
        result_selector: FS,
    ) -> Observable<ChangeSet<O, K>>
    where
        R: Item,
        RK: Key,
        O: Item,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        FS: Fn(&K, Option<&T>, Option<&R>) -> O + Send + Sync + 'static,
    {
        operators::full_join(self, right, right_key_selector, result_selector)
    }

    fn right_join<R, RK, O, FK, FS>(
        &self,
        right: &Observable<ChangeSet<R, RK>>,
        right_key_selector: FK,
        result_selector: FS,
    ) -> Observable<ChangeSet<O, RK>>
    where
        R: Item,
        RK: Key,
        O: Item,
        FK: Fn(&R) -> K + Send + Sync + 'static,
        FS: Fn(&RK, Option<&T>, &R) -> O + Send + Sync + 'static,
    {
        operators::right_join(self, right, right_key_selector, result_selector)
    }

    fn merge_many<U, F>(&self, selector: F) -> Observable<U>
    where
        U: Send + 'static,
        F: Fn(&T, &K) -> Observable<U> + Send + Sync + 'static,
    {
        operators::merge_many(self, selector)
    }

    fn merge_many_change_sets<U, CK, F>(
        &self,
        selector: F,
        options: MergeOptions<U>,
    ) -> Observable<ChangeSet<U, CK>>
    where
        U: Item,
        CK: Key,
        F: Fn(&T, &K) -> Observable<ChangeSet<U, CK>> + Send + Sync + 'static,
    {
        operators::merge_many_change_sets(self, selector, options)
    }

    fn transform<U, F>(&self, transform: F, options: TransformOptions) -> Observable<ChangeSet<U, K>>
    where
        U: Item,
        F: Fn(&T, &K) -> U + Send + Sync + 'static,
    {
        operators::transform(self, transform, options)
    }

    fn transform_many<U, CK, F, FK>(&self, selector: F, child_key: FK) -> Observable<ChangeSet<U, CK>>
    where
        U: Item,
        CK: Key,
        F: Fn(&T, &K) -> Vec<U> + Send + Sync + 'static,
        FK: Fn(&U) -> CK + Send + Sync + 'static,
    {
        operators::transform_many(self, selector, child_key)
    }

    fn transform_many_async<U, CK, F, FK>(
        &self,
        selector: F,
        child_key: FK,
    ) -> Observable<ChangeSet<U, CK>>
    where
        U: Item,
        CK: Key,
        F: Fn(&T, &K) -> BoxFuture<'static, Result<Vec<U>>> + Send + Sync + 'static,
        FK: Fn(&U) -> CK + Send + Sync + 'static,
    {
        operators::transform_many_async(self, selector, child_key)
    }

    fn transform_to_tree<F>(&self, parent_key: F) -> Observable<ChangeSet<Node<T, K>, K>>
    where
        F: Fn(&T) -> Option<K> + Send + Sync + 'static,
    {
        operators::transform_to_tree(self, parent_key)
    }

    fn expire_after<F>(
        &self,
        time_selector: F,
        scheduler: SharedScheduler,
        options: ExpireAfterOptions,
    ) -> Observable<ChangeSet<T, K>>
    where
        F: Fn(&T) -> Option<Duration> + Send + Sync + 'static,
    {
        operators::expire_after(self, time_selector, scheduler, options)
    }

    fn dispose_many(&self) -> Observable<ChangeSet<T, K>>
    where
        T: Disposable,
    {
        operators::dispose_many(self)
    }

    fn async_dispose_many<F>(&self, disposals_completed: F) -> Observable<ChangeSet<T, K>>
    where
        T: AsyncDisposable,
        F: Fn(Observable<()>) + Send + Sync + 'static,
    {
        operators::async_dispose_many(self, disposals_completed)
    }

    fn not_empty(&self) -> Observable<ChangeSet<T, K>> {
        operators::not_empty(self)
    }
}
