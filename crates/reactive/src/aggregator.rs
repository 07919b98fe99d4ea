//! Records a change-set stream for inspection.
//!
//! `ChangeSetAggregator` subscribes to a stream and keeps every batch it
//! receives, the keyed state those batches produce, and, for index-aware
//! producers, the ordered list they describe.

use crate::observable::Observable;
use crate::subscription::Subscription;
use keyflux_core::{ChangeReason, ChangeSet, Error, Item, Key, ShadowCache};
use parking_lot::Mutex;
use std::sync::Arc;

/// Totals across every recorded batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub batches: usize,
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
    pub refreshes: usize,
    pub moves: usize,
}

struct Recorded<T, K> {
    messages: Vec<ChangeSet<T, K>>,
    data: ShadowCache<T, K>,
    ordered: Vec<(K, T)>,
    error: Option<Error>,
    completed: bool,
}

impl<T: Item, K: Key> Recorded<T, K> {
    fn apply_ordered(&mut self, changes: &ChangeSet<T, K>) {
        for change in changes {
            let position = self.ordered.iter().position(|(k, _)| k == change.key());
            let entry = (change.key().clone(), change.current().clone());
            match change.reason() {
                ChangeReason::Add => match change.current_index() {
                    Some(index) if index <= self.ordered.len() => self.ordered.insert(index, entry),
                    _ => self.ordered.push(entry),
                },
                ChangeReason::Update => match position {
                    Some(index) => self.ordered[index] = entry,
                    None => self.ordered.push(entry),
                },
                ChangeReason::Remove => {
                    if let Some(index) = position {
                        self.ordered.remove(index);
                    }
                }
                ChangeReason::Moved => {
                    if let (Some(from), Some(to)) = (position, change.current_index()) {
                        let item = self.ordered.remove(from);
                        let to = to.min(self.ordered.len());
                        self.ordered.insert(to, item);
                    }
                }
                ChangeReason::Refresh => {}
            }
        }
    }
}

/// Subscribes to a change-set stream and records what it sees.
pub struct ChangeSetAggregator<T, K> {
    recorded: Arc<Mutex<Recorded<T, K>>>,
    subscription: Option<Subscription>,
}

impl<T: Item, K: Key> ChangeSetAggregator<T, K> {
    /// Starts recording `source`.
    pub fn new(source: &Observable<ChangeSet<T, K>>) -> Self {
        let recorded = Arc::new(Mutex::new(Recorded {
            messages: Vec::new(),
            data: ShadowCache::new(),
            ordered: Vec::new(),
            error: None,
            completed: false,
        }));
        let on_next = recorded.clone();
        let on_error = recorded.clone();
        let on_completed = recorded.clone();
        let subscription = source.subscribe_all(
            move |changes: ChangeSet<T, K>| {
                let mut recorded = on_next.lock();
                recorded.data.apply(&changes);
                recorded.apply_ordered(&changes);
                recorded.messages.push(changes);
            },
            move |error| on_error.lock().error = Some(error),
            move || on_completed.lock().completed = true,
        );
        Self {
            recorded,
            subscription: Some(subscription),
        }
    }

    /// Every batch received so far.
    pub fn messages(&self) -> Vec<ChangeSet<T, K>> {
        self.recorded.lock().messages.clone()
    }

    /// Number of batches received so far.
    pub fn message_count(&self) -> usize {
        self.recorded.lock().messages.len()
    }

    /// The most recent batch.
    pub fn last(&self) -> Option<ChangeSet<T, K>> {
        self.recorded.lock().messages.last().cloned()
    }

    /// The keyed state produced by every batch so far.
    pub fn data(&self) -> ShadowCache<T, K> {
        self.recorded.lock().data.clone()
    }

    /// Looks up a key in the recorded state.
    pub fn lookup(&self, key: &K) -> Option<T> {
        self.recorded.lock().data.get(key).cloned()
    }

    /// Number of items in the recorded state.
    pub fn count(&self) -> usize {
        self.recorded.lock().data.len()
    }

    /// The ordered list described by index-aware batches.
    pub fn ordered(&self) -> Vec<(K, T)> {
        self.recorded.lock().ordered.clone()
    }

    /// The values of `ordered`.
    pub fn ordered_values(&self) -> Vec<T> {
        self.recorded
            .lock()
            .ordered
            .iter()
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// The error the stream failed with, if any.
    pub fn error(&self) -> Option<Error> {
        self.recorded.lock().error.clone()
    }

    /// Returns true once the stream completed.
    pub fn is_completed(&self) -> bool {
        self.recorded.lock().completed
    }

    /// Totals across every batch.
    pub fn summary(&self) -> ChangeSummary {
        let recorded = self.recorded.lock();
        recorded
            .messages
            .iter()
            .fold(ChangeSummary::default(), |mut summary, changes| {
                summary.batches += 1;
                summary.adds += changes.adds();
                summary.updates += changes.updates();
                summary.removes += changes.removes();
                summary.refreshes += changes.refreshes();
                summary.moves += changes.moves();
                summary
            })
    }

    /// Stops recording. Recorded data stays available.
    pub fn dispose(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceCache;
    use keyflux_core::Change;

    #[test]
    fn test_aggregator_tracks_state() {
        let source = SourceCache::new(|v: &(u32, &'static str)| v.0);
        let results = ChangeSetAggregator::new(&source.connect());

        source.add_or_update((1, "a"));
        source.add_or_update((2, "b"));
        source.remove_key(&1);

        assert_eq!(results.message_count(), 3);
        assert_eq!(results.count(), 1);
        assert_eq!(results.lookup(&2), Some((2, "b")));
        let summary = results.summary();
        assert_eq!((summary.adds, summary.removes), (2, 1));
    }

    #[test]
    fn test_aggregator_ordered_from_indices() {
        let batches = vec![
            ChangeSet::from(vec![
                Change::add_at(1, "x", 0),
                Change::add_at(2, "y", 0),
                Change::add_at(3, "z", 2),
            ]),
            ChangeSet::from(vec![Change::moved(3, "z", 0, 2)]),
            ChangeSet::from(vec![Change::remove_at(2, "y", 1)]),
        ];
        let results = ChangeSetAggregator::new(&Observable::from_iter(batches));

        assert_eq!(results.ordered_values(), vec!["z", "x"]);
        assert!(results.is_completed());
    }

    #[test]
    fn test_aggregator_records_error() {
        let source = SourceCache::new(|v: &(u32, &'static str)| v.0);
        let mut results = ChangeSetAggregator::new(&source.connect());
        source.error(Error::upstream("boom"));

        assert_eq!(results.error(), Some(Error::upstream("boom")));
        results.dispose();
        assert!(!results.is_completed());
    }
}
