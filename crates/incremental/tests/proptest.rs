//! Property-based tests for keyflux-incremental using proptest.
//!
//! Each property drives a source cache with random batches of edits and
//! checks that the operator's downstream view equals a from-scratch
//! evaluation over the source's final contents.

use keyflux_core::{comparer_by, Predicate};
use keyflux_incremental::{filter, filter_dynamic, group, sort, FilterOptions, SortOptions};
use keyflux_reactive::{ChangeSetAggregator, Observable, Subject, SourceCache};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

type Row = (u32, u32);

#[derive(Clone, Debug)]
enum Edit {
    Upsert(u32, u32),
    Remove(u32),
    Refresh(u32),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0u32..20, 0u32..100).prop_map(|(k, v)| Edit::Upsert(k, v)),
        1 => (0u32..20).prop_map(Edit::Remove),
        1 => (0u32..20).prop_map(Edit::Refresh),
    ]
}

fn batches() -> impl Strategy<Value = Vec<Vec<Edit>>> {
    prop::collection::vec(prop::collection::vec(edit(), 1..6), 1..40)
}

fn rows() -> SourceCache<Row, u32> {
    SourceCache::new(|r: &Row| r.0)
}

fn apply(source: &SourceCache<Row, u32>, batches: &[Vec<Edit>]) {
    for batch in batches {
        source.edit(|updater| {
            for edit in batch {
                match edit {
                    Edit::Upsert(k, v) => updater.add_or_update((*k, *v)),
                    Edit::Remove(k) => {
                        updater.remove_key(k);
                    }
                    Edit::Refresh(k) => {
                        updater.refresh_key(k);
                    }
                }
            }
        });
    }
}

fn snapshot(source: &SourceCache<Row, u32>) -> BTreeMap<u32, u32> {
    source.items().into_iter().collect()
}

fn view(results: &ChangeSetAggregator<Row, u32>) -> BTreeMap<u32, u32> {
    results.data().values().copied().collect()
}

proptest! {
    /// The filtered view always equals the predicate applied to the source.
    #[test]
    fn filter_matches_recomputation(batches in batches()) {
        let source = rows();
        let results = ChangeSetAggregator::new(&filter(
            &source.connect(),
            |r: &Row| r.1 % 2 == 0,
            FilterOptions::default(),
        ));
        apply(&source, &batches);

        let expected: BTreeMap<u32, u32> =
            snapshot(&source).into_iter().filter(|(_, v)| v % 2 == 0).collect();
        prop_assert_eq!(view(&results), expected);
    }

    /// Swapping the predicate re-evaluates every item.
    #[test]
    fn dynamic_filter_matches_recomputation(
        batches in batches(),
        first in 0u32..100,
        second in 0u32..100,
    ) {
        let source = rows();
        let predicates: Subject<Predicate<Row>> = Subject::new();
        let results = ChangeSetAggregator::new(&filter_dynamic(
            &source.connect(),
            &predicates.as_observable(),
            &Observable::never(),
            FilterOptions::default(),
        ));

        predicates.next(Arc::new(move |r: &Row| r.1 < first));
        let (head, tail) = batches.split_at(batches.len() / 2);
        apply(&source, head);
        predicates.next(Arc::new(move |r: &Row| r.1 >= second));
        apply(&source, tail);

        let expected: BTreeMap<u32, u32> =
            snapshot(&source).into_iter().filter(|(_, v)| *v >= second).collect();
        prop_assert_eq!(view(&results), expected);
    }

    /// The sorted view lists the source in comparer order.
    #[test]
    fn sort_matches_recomputation(batches in batches(), binary in any::<bool>()) {
        let source = rows();
        let results = ChangeSetAggregator::new(&sort(
            &source.connect(),
            comparer_by(|r: &Row| (r.1, r.0)),
            SortOptions::default().with_binary_search(binary),
        ));
        apply(&source, &batches);

        let mut expected: Vec<Row> = source.items();
        expected.sort_by_key(|r| (r.1, r.0));
        prop_assert_eq!(results.ordered_values(), expected);
    }

    /// Groups partition the source exactly; no empty group survives.
    #[test]
    fn group_matches_recomputation(batches in batches()) {
        let source = rows();
        let results = ChangeSetAggregator::new(&group(&source.connect(), |r: &Row| r.1 % 5));
        apply(&source, &batches);

        let mut expected: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for (k, v) in snapshot(&source) {
            expected.entry(v % 5).or_default().insert(k);
        }
        let actual: BTreeMap<u32, BTreeSet<u32>> = results
            .data()
            .iter()
            .map(|(g, group)| (*g, group.items().into_iter().map(|r| r.0).collect()))
            .collect();
        prop_assert_eq!(actual, expected);
    }
}
