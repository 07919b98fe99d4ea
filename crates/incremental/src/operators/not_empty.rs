use keyflux_core::ChangeSet;
use keyflux_reactive::{forward, Observable, SharedObserver};

/// Drops empty change-sets.
pub fn not_empty<T, K>(source: &Observable<ChangeSet<T, K>>) -> Observable<ChangeSet<T, K>>
where
    T: Send + 'static,
    K: Send + 'static,
{
    let source = source.clone();
    Observable::create(move |observer: SharedObserver<ChangeSet<T, K>>| {
        let downstream = observer.clone();
        source.subscribe(forward(observer, move |changes: ChangeSet<T, K>| {
            if !changes.is_empty() {
                downstream.on_next(changes);
            }
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflux_core::Change;
    use keyflux_reactive::ChangeSetAggregator;

    #[test]
    fn test_not_empty_drops_empty_batches() {
        let batches = vec![
            ChangeSet::new(),
            ChangeSet::from(vec![Change::add(1, "a")]),
            ChangeSet::new(),
        ];
        let results = ChangeSetAggregator::new(&not_empty(&Observable::from_iter(batches)));

        assert_eq!(results.message_count(), 1);
        assert!(results.is_completed());
    }
}
