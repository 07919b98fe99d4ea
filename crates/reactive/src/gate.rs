//! Per-operator serialization gate.
//!
//! Every operator instance processes one incoming batch at a time: apply to
//! the shadow state, compute the diff, emit downstream. The gate makes that
//! sequence atomic across threads. It is re-entrant so that a downstream
//! observer reacting synchronously on the same thread can feed the operator
//! again without deadlocking; operator state lives behind its own short-lived
//! mutex which is never held while emitting.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::Arc;

/// A shared, re-entrant mutual-exclusion gate.
#[derive(Clone, Default)]
pub struct Gate {
    lock: Arc<ReentrantMutex<()>>,
}

/// Proof that the current thread holds the gate.
pub type GateGuard<'a> = ReentrantMutexGuard<'a, ()>;

impl Gate {
    /// Creates a new gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the current thread holds the gate.
    #[inline]
    pub fn enter(&self) -> GateGuard<'_> {
        self.lock.lock()
    }

    /// Runs `f` while holding the gate.
    #[inline]
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }
}

impl core::fmt::Debug for Gate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gate").finish_non_exhaustive()
    }
}
