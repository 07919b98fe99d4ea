//! Operator configuration.
//!
//! Every option struct has a `Default` matching the documented behaviour and
//! chained `with_*` setters.

use keyflux_core::{Comparer, EqualityComparer, Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Options for the filter family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterOptions {
    /// Drop change-sets that end up empty after filtering.
    pub suppress_empty_change_sets: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            suppress_empty_change_sets: true,
        }
    }
}

impl FilterOptions {
    pub fn with_suppress_empty_change_sets(mut self, suppress: bool) -> Self {
        self.suppress_empty_change_sets = suppress;
        self
    }
}

/// Options for `sort`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortOptions {
    /// Locate insertion points by binary search. Only valid when the
    /// comparer is a strict total order; otherwise a linear scan is used.
    pub use_binary_search: bool,
}

impl SortOptions {
    pub fn with_binary_search(mut self, enabled: bool) -> Self {
        self.use_binary_search = enabled;
        self
    }
}

/// Options for `sort_and_bind`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortAndBindOptions {
    /// A batch with more changes than this replaces the bound list wholesale.
    pub reset_threshold: usize,
    /// Locate insertion points by binary search.
    pub use_binary_search: bool,
    /// Populate the bound list with one reset on the first non-empty batch.
    pub reset_on_first_time_load: bool,
    /// Capacity to reserve for the sorted list.
    pub initial_capacity: Option<usize>,
}

impl Default for SortAndBindOptions {
    fn default() -> Self {
        Self {
            reset_threshold: 25,
            use_binary_search: false,
            reset_on_first_time_load: true,
            initial_capacity: None,
        }
    }
}

impl SortAndBindOptions {
    pub fn with_reset_threshold(mut self, threshold: usize) -> Self {
        self.reset_threshold = threshold;
        self
    }

    pub fn with_binary_search(mut self, enabled: bool) -> Self {
        self.use_binary_search = enabled;
        self
    }

    pub fn with_reset_on_first_time_load(mut self, enabled: bool) -> Self {
        self.reset_on_first_time_load = enabled;
        self
    }

    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = Some(capacity);
        self
    }

    /// Rejects a zero reset threshold.
    pub fn validate(&self) -> Result<()> {
        if self.reset_threshold == 0 {
            return Err(Error::invalid_argument("reset threshold must be positive"));
        }
        Ok(())
    }
}

/// Options for the merge family.
///
/// When several contributors provide a value for the same key only one is
/// visible downstream. With a `comparer` the lowest value wins; otherwise
/// the earliest contributor wins. With an `equality` comparer an update from
/// the visible contributor that leaves the value equal is not published.
pub struct MergeOptions<T> {
    pub equality: Option<EqualityComparer<T>>,
    pub comparer: Option<Comparer<T>>,
}

impl<T> Clone for MergeOptions<T> {
    fn clone(&self) -> Self {
        Self {
            equality: self.equality.clone(),
            comparer: self.comparer.clone(),
        }
    }
}

impl<T> Default for MergeOptions<T> {
    fn default() -> Self {
        Self {
            equality: None,
            comparer: None,
        }
    }
}

impl<T> MergeOptions<T> {
    pub fn with_equality<F>(mut self, equality: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.equality = Some(Arc::new(equality));
        self
    }

    pub fn with_comparer(mut self, comparer: Comparer<T>) -> Self {
        self.comparer = Some(comparer);
        self
    }
}

impl<T> core::fmt::Debug for MergeOptions<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MergeOptions")
            .field("equality", &self.equality.is_some())
            .field("comparer", &self.comparer.is_some())
            .finish()
    }
}

/// Options for `expire_after`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpireAfterOptions {
    /// Scan for due items at this fixed interval instead of scheduling a
    /// timer for the next due time.
    pub polling_interval: Option<Duration>,
}

impl ExpireAfterOptions {
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    /// Rejects a zero polling interval.
    pub fn validate(&self) -> Result<()> {
        if self.polling_interval == Some(Duration::ZERO) {
            return Err(Error::invalid_argument("polling interval must be positive"));
        }
        Ok(())
    }
}

/// Options for `transform`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransformOptions {
    /// Re-run the transform on refresh and publish the result as an update.
    pub transform_on_refresh: bool,
}

impl TransformOptions {
    pub fn with_transform_on_refresh(mut self, enabled: bool) -> Self {
        self.transform_on_refresh = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert!(FilterOptions::default().suppress_empty_change_sets);
        let bind = SortAndBindOptions::default();
        assert_eq!(bind.reset_threshold, 25);
        assert!(!bind.use_binary_search);
        assert!(bind.reset_on_first_time_load);
        assert_eq!(ExpireAfterOptions::default().polling_interval, None);
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(SortAndBindOptions::default().validate().is_ok());
        assert_eq!(
            SortAndBindOptions::default().with_reset_threshold(0).validate(),
            Err(Error::invalid_argument("reset threshold must be positive"))
        );

        assert!(ExpireAfterOptions::default().validate().is_ok());
        let polling = ExpireAfterOptions::default().with_polling_interval(Duration::from_secs(1));
        assert!(polling.validate().is_ok());
        assert!(matches!(
            ExpireAfterOptions::default()
                .with_polling_interval(Duration::ZERO)
                .validate(),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_merge_options_builders() {
        let options = MergeOptions::<i32>::default()
            .with_equality(|a, b| a == b)
            .with_comparer(keyflux_core::comparer_by(|v: &i32| *v));
        assert!(options.equality.is_some());
        assert!(options.comparer.is_some());
    }
}
