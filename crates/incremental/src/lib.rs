//! Keyflux Incremental - Operators over keyed change-set streams.
//!
//! Every operator consumes `Observable<ChangeSet<T, K>>` and publishes the
//! minimal change-set that keeps its downstream view in step with a
//! from-scratch evaluation over the current upstream state.
//!
//! # Operators
//!
//! - `filter`, `filter_dynamic`, `filter_on_state`: inclusion by predicate
//! - `sort`, `sort_dynamic`, `sort_and_bind`: ordering with index-aware changes
//! - `group`, `group_with_regroup`: per-group member caches
//! - `left_join`, `inner_join`, `right_join`, `full_join`: keyed joins
//! - `merge_many`, `merge_many_change_sets`, `merge_change_sets`: flattening
//! - `transform`, `transform_many`, `transform_many_async`: projection
//! - `expire_after`, `expire_after_source`: time-based removal
//! - `dispose_many`, `async_dispose_many`: releasing removed items
//! - `transform_to_tree`: parent/child trees
//! - `not_empty`: drops empty batches
//!
//! # Example
//!
//! ```rust
//! use keyflux_core::comparer_by;
//! use keyflux_incremental::{ChangeSetStreamExt, FilterOptions, SortOptions};
//! use keyflux_reactive::{ChangeSetAggregator, SourceCache};
//!
//! let people = SourceCache::new(|p: &(&'static str, u32)| p.0);
//! let adults = people
//!     .connect()
//!     .filter(|p: &(&'static str, u32)| p.1 >= 18, FilterOptions::default())
//!     .sort(comparer_by(|p: &(&'static str, u32)| p.1), SortOptions::default());
//! let results = ChangeSetAggregator::new(&adults);
//!
//! people.add_or_update_many(vec![("ann", 40), ("bob", 12), ("cid", 25)]);
//!
//! assert_eq!(results.ordered_values(), vec![("cid", 25), ("ann", 40)]);
//! ```

pub mod ext;
pub mod operators;
pub mod options;

pub use ext::ChangeSetStreamExt;
pub use operators::{
    async_dispose_many, dispose_many, expire_after, expire_after_source, filter, filter_dynamic,
    filter_on_state, full_join, group, group_with_regroup, inner_join, left_join,
    merge_change_sets, merge_many, merge_many_change_sets, not_empty, right_join, sort,
    sort_and_bind, sort_dynamic, transform, transform_many, transform_many_async,
    transform_to_tree, AsyncSelector, BindingList, Group, Node,
};
pub use options::{
    ExpireAfterOptions, FilterOptions, MergeOptions, SortAndBindOptions, SortOptions,
    TransformOptions,
};
