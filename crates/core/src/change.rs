//! A single keyed mutation.
//!
//! A `Change` records why an item changed (`ChangeReason`), which key it
//! belongs to, the current value and, for updates, the value it replaced.
//! Index-aware producers (sort) also stamp the positions involved.

/// Why an item appears in a change-set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeReason {
    /// The key was not visible before.
    Add,
    /// The value for an existing key was replaced.
    Update,
    /// The key is no longer visible.
    Remove,
    /// The value is unchanged but its derived state should be re-evaluated.
    Refresh,
    /// The value is unchanged but its position moved.
    Moved,
}

/// One mutation against a keyed collection.
#[derive(Clone, Debug, PartialEq)]
pub struct Change<T, K> {
    reason: ChangeReason,
    key: K,
    current: T,
    previous: Option<T>,
    current_index: Option<usize>,
    previous_index: Option<usize>,
}

impl<T, K> Change<T, K> {
    /// Creates an add.
    #[inline]
    pub fn add(key: K, current: T) -> Self {
        Self::plain(ChangeReason::Add, key, current)
    }

    /// Creates an add at a position of an ordered collection.
    #[inline]
    pub fn add_at(key: K, current: T, index: usize) -> Self {
        Self {
            current_index: Some(index),
            ..Self::add(key, current)
        }
    }

    /// Creates an update. The previous value is mandatory.
    #[inline]
    pub fn update(key: K, current: T, previous: T) -> Self {
        Self {
            reason: ChangeReason::Update,
            key,
            current,
            previous: Some(previous),
            current_index: None,
            previous_index: None,
        }
    }

    /// Creates an in-place update at a position of an ordered collection.
    #[inline]
    pub fn update_at(key: K, current: T, previous: T, index: usize) -> Self {
        Self {
            current_index: Some(index),
            previous_index: Some(index),
            ..Self::update(key, current, previous)
        }
    }

    /// Creates a remove carrying the value that disappears.
    #[inline]
    pub fn remove(key: K, current: T) -> Self {
        Self::plain(ChangeReason::Remove, key, current)
    }

    /// Creates a remove at a position of an ordered collection.
    #[inline]
    pub fn remove_at(key: K, current: T, index: usize) -> Self {
        Self {
            current_index: Some(index),
            ..Self::remove(key, current)
        }
    }

    /// Creates a refresh signal.
    #[inline]
    pub fn refresh(key: K, current: T) -> Self {
        Self::plain(ChangeReason::Refresh, key, current)
    }

    /// Creates a refresh at a position of an ordered collection.
    #[inline]
    pub fn refresh_at(key: K, current: T, index: usize) -> Self {
        Self {
            current_index: Some(index),
            ..Self::refresh(key, current)
        }
    }

    /// Creates a move from `previous_index` to `current_index`.
    #[inline]
    pub fn moved(key: K, current: T, current_index: usize, previous_index: usize) -> Self {
        Self {
            reason: ChangeReason::Moved,
            key,
            current,
            previous: None,
            current_index: Some(current_index),
            previous_index: Some(previous_index),
        }
    }

    fn plain(reason: ChangeReason, key: K, current: T) -> Self {
        Self {
            reason,
            key,
            current,
            previous: None,
            current_index: None,
            previous_index: None,
        }
    }

    /// Returns the reason of this change.
    #[inline]
    pub fn reason(&self) -> ChangeReason {
        self.reason
    }

    /// Returns the key.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the current value.
    #[inline]
    pub fn current(&self) -> &T {
        &self.current
    }

    /// Returns the replaced value of an update.
    #[inline]
    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }

    /// Position after the change, for index-aware producers.
    #[inline]
    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    /// Position before the change, for index-aware producers.
    #[inline]
    pub fn previous_index(&self) -> Option<usize> {
        self.previous_index
    }

    /// Splits the change into its key, current and previous values.
    pub fn into_parts(self) -> (K, T, Option<T>) {
        (self.key, self.current, self.previous)
    }

    /// Maps the current and previous values, dropping positional information.
    ///
    /// Indices describe the producer's ordering, which a projection does not
    /// preserve in general.
    pub fn map<U, F>(self, mut f: F) -> Change<U, K>
    where
        F: FnMut(T) -> U,
    {
        Change {
            reason: self.reason,
            key: self.key,
            current: f(self.current),
            previous: self.previous.map(f),
            current_index: None,
            previous_index: None,
        }
    }
}
