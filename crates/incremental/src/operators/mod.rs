//! Change-set operators.
//!
//! Every operator takes one or more `Observable<ChangeSet<..>>` inputs and
//! returns a cold observable. Each subscription owns private state (the
//! shadow of what downstream has seen) and serializes its inputs through a
//! `Gate`, so a batch is applied, diffed and emitted before the next one is
//! accepted.
//!
//! - Filter: static, dynamic and state-driven predicates
//! - Sort / SortAndBind: index-aware ordering, optionally mirrored into a list
//! - Group: per-group member caches
//! - Join: left, inner, right and full joins
//! - MergeMany / MergeManyChangeSets / MergeChangeSets: flattening
//! - Transform / TransformMany / TransformManyAsync: projection
//! - ExpireAfter: time-based removal
//! - DisposeMany / AsyncDisposeMany: releasing removed items
//! - TransformToTree: parent/child trees

mod dispose_many;
mod expire_after;
mod filter;
mod group;
mod join;
mod merge_change_sets;
mod merge_many;
mod merge_tracker;
mod not_empty;
mod sort;
mod transform;
mod transform_many;
mod tree;

pub use dispose_many::{async_dispose_many, dispose_many};
pub use expire_after::{expire_after, expire_after_source};
pub use filter::{filter, filter_dynamic, filter_on_state};
pub use group::{group, group_with_regroup, Group};
pub use join::{full_join, inner_join, left_join, right_join};
pub use merge_change_sets::merge_change_sets;
pub use merge_many::{merge_many, merge_many_change_sets};
pub use not_empty::not_empty;
pub use sort::{sort, sort_and_bind, sort_dynamic, BindingList};
pub use transform::transform;
pub use transform_many::{transform_many, transform_many_async, AsyncSelector};
pub use tree::{transform_to_tree, Node};
