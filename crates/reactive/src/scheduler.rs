//! Time sources for time-driven operators.
//!
//! Operators never read the wall clock directly. They ask a `Scheduler` for
//! the current time and for future work, which lets tests substitute the
//! virtual-time `TestScheduler` and drive expiry deterministically with
//! `advance_by` / `advance_to`.

use crate::subscription::Subscription;
use keyflux_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A one-shot scheduled action.
pub type Action = Box<dyn FnOnce() + Send>;

/// A repeating scheduled action.
pub type PeriodicAction = Box<dyn FnMut() + Send>;

/// Shortest period a periodic action runs at; shorter periods are raised to it.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Schedules work at absolute times measured from the scheduler's origin.
///
/// Dropping the returned `Subscription` cancels the work. A cancelled action
/// never runs, even if its due time has already passed.
pub trait Scheduler: Send + Sync {
    /// Time elapsed since the scheduler's origin.
    fn now(&self) -> Duration;

    /// Runs `action` once at `due`, or as soon as possible if `due` has passed.
    fn schedule_at(&self, due: Duration, action: Action) -> Subscription;

    /// Runs `action` every `period`, starting one period from now.
    fn schedule_periodic(&self, period: Duration, action: PeriodicAction) -> Subscription;

    /// Runs `action` once after `delay`.
    fn schedule_after(&self, delay: Duration, action: Action) -> Subscription {
        self.schedule_at(self.now().saturating_add(delay), action)
    }
}

/// Shared handle to a scheduler.
pub type SharedScheduler = Arc<dyn Scheduler>;

enum Task {
    Once(Action),
    Periodic {
        period: Duration,
        action: PeriodicAction,
    },
}

struct Entry {
    cancelled: Arc<AtomicBool>,
    task: Task,
}

struct Clock {
    now: Duration,
    next_seq: u64,
    queue: BTreeMap<(Duration, u64), Entry>,
}

impl Clock {
    fn push(&mut self, due: Duration, entry: Entry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((due, seq), entry);
    }

    fn pop_due(&mut self, limit: Duration) -> Option<(Duration, Entry)> {
        let (&(due, seq), _) = self.queue.iter().next()?;
        if due > limit {
            return None;
        }
        let entry = self.queue.remove(&(due, seq))?;
        Some((due, entry))
    }
}

/// A deterministic virtual-time scheduler.
///
/// Time only moves when the test calls `advance_by`, `advance_to` or
/// `start`. Actions run on the calling thread in due-time order; actions due
/// at the same instant run in scheduling order.
#[derive(Clone)]
pub struct TestScheduler {
    clock: Arc<Mutex<Clock>>,
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TestScheduler {
    /// Creates a scheduler whose clock reads zero.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(Mutex::new(Clock {
                now: Duration::ZERO,
                next_seq: 0,
                queue: BTreeMap::new(),
            })),
        }
    }

    /// Returns a shared handle for operators.
    pub fn shared(&self) -> SharedScheduler {
        Arc::new(self.clone())
    }

    /// Moves the clock forward by `delta`, running everything that falls due.
    pub fn advance_by(&self, delta: Duration) {
        let target = self.now().saturating_add(delta);
        self.advance_to(target);
    }

    /// Moves the clock to `target`, running everything due at or before it.
    ///
    /// The clock never moves backwards.
    pub fn advance_to(&self, target: Duration) {
        loop {
            let next = {
                let mut clock = self.clock.lock();
                let next = clock.pop_due(target);
                if let Some((due, _)) = &next {
                    clock.now = clock.now.max(*due);
                }
                next
            };
            let Some((due, entry)) = next else { break };
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            match entry.task {
                Task::Once(action) => action(),
                Task::Periodic { period, mut action } => {
                    action();
                    if !entry.cancelled.load(Ordering::SeqCst) {
                        self.clock.lock().push(
                            due.saturating_add(period),
                            Entry {
                                cancelled: entry.cancelled,
                                task: Task::Periodic { period, action },
                            },
                        );
                    }
                }
            }
        }
        let mut clock = self.clock.lock();
        clock.now = clock.now.max(target);
    }

    /// Runs every pending one-shot action, advancing the clock as needed.
    ///
    /// Periodic actions fire along the way but do not keep `start` running.
    pub fn start(&self) {
        while let Some(due) = self.last_one_shot_due() {
            self.advance_to(due);
        }
    }

    /// Number of scheduled actions that have not been cancelled.
    pub fn pending(&self) -> usize {
        self.clock
            .lock()
            .queue
            .values()
            .filter(|entry| !entry.cancelled.load(Ordering::SeqCst))
            .count()
    }

    fn last_one_shot_due(&self) -> Option<Duration> {
        self.clock
            .lock()
            .queue
            .iter()
            .filter(|(_, entry)| {
                !entry.cancelled.load(Ordering::SeqCst) && matches!(entry.task, Task::Once(_))
            })
            .map(|(&(due, _), _)| due)
            .last()
    }

    fn enqueue(&self, due: Duration, task: Task) -> Subscription {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.clock.lock().push(
            due,
            Entry {
                cancelled: cancelled.clone(),
                task,
            },
        );
        Subscription::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

impl Scheduler for TestScheduler {
    fn now(&self) -> Duration {
        self.clock.lock().now
    }

    fn schedule_at(&self, due: Duration, action: Action) -> Subscription {
        self.enqueue(due, Task::Once(action))
    }

    fn schedule_periodic(&self, period: Duration, action: PeriodicAction) -> Subscription {
        let period = period.max(MIN_PERIOD);
        let due = self.now().saturating_add(period);
        self.enqueue(due, Task::Periodic { period, action })
    }
}

impl core::fmt::Debug for TestScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let clock = self.clock.lock();
        f.debug_struct("TestScheduler")
            .field("now", &clock.now)
            .field("queued", &clock.queue.len())
            .finish()
    }
}

/// A wall-clock scheduler running on a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
    origin: tokio::time::Instant,
}

impl TokioScheduler {
    /// Creates a scheduler spawning onto `handle`.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            origin: tokio::time::Instant::now(),
        }
    }

    /// Creates a scheduler on the runtime of the calling context.
    pub fn current() -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::runtime(e.to_string()))
    }

    /// Returns a shared handle for operators.
    pub fn shared(self) -> SharedScheduler {
        Arc::new(self)
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule_at(&self, due: Duration, action: Action) -> Subscription {
        let deadline = self.origin + due;
        let task = self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            action();
        });
        Subscription::new(move || task.abort())
    }

    fn schedule_periodic(&self, period: Duration, mut action: PeriodicAction) -> Subscription {
        let period = period.max(MIN_PERIOD);
        let task = self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                action();
            }
        });
        Subscription::new(move || task.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Action) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |tag: &'static str| -> Action {
            let sink = sink.clone();
            Box::new(move || sink.lock().push(tag))
        };
        (log, make)
    }

    #[test]
    fn test_actions_run_in_due_order() {
        let scheduler = TestScheduler::new();
        let (log, make) = recorder();

        let _b = scheduler.schedule_at(Duration::from_secs(20), make("b"));
        let _a = scheduler.schedule_at(Duration::from_secs(10), make("a"));

        scheduler.advance_to(Duration::from_secs(10));
        assert_eq!(*log.lock(), vec!["a"]);
        assert_eq!(scheduler.now(), Duration::from_secs(10));

        scheduler.advance_by(Duration::from_secs(10));
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_cancelled_action_never_runs() {
        let scheduler = TestScheduler::new();
        let (log, make) = recorder();

        let sub = scheduler.schedule_after(Duration::from_secs(1), make("x"));
        assert_eq!(scheduler.pending(), 1);
        sub.dispose();
        assert_eq!(scheduler.pending(), 0);

        scheduler.advance_by(Duration::from_secs(5));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_periodic_fires_each_period() {
        let scheduler = TestScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let sub = scheduler.schedule_periodic(
            Duration::from_secs(2),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.advance_by(Duration::from_secs(7));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        drop(sub);
        scheduler.advance_by(Duration::from_secs(10));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_periodic_zero_period_raised_to_minimum() {
        let scheduler = TestScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let _sub = scheduler.schedule_periodic(
            Duration::ZERO,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.advance_by(MIN_PERIOD * 5);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_action_can_schedule_more_work() {
        let scheduler = TestScheduler::new();
        let (log, make) = recorder();
        let inner = scheduler.clone();
        let held = Arc::new(Mutex::new(Vec::new()));
        let slot = held.clone();
        let follow_up = make("second");

        let _first = scheduler.schedule_at(
            Duration::from_secs(1),
            Box::new(move || {
                slot.lock()
                    .push(inner.schedule_at(Duration::from_secs(2), follow_up));
            }),
        );

        scheduler.start();
        assert_eq!(*log.lock(), vec!["second"]);
        assert_eq!(scheduler.now(), Duration::from_secs(2));
    }

    #[test]
    fn test_past_due_runs_on_next_advance() {
        let scheduler = TestScheduler::new();
        scheduler.advance_to(Duration::from_secs(5));
        let (log, make) = recorder();

        let _sub = scheduler.schedule_at(Duration::from_secs(1), make("late"));
        scheduler.advance_by(Duration::ZERO);
        assert_eq!(*log.lock(), vec!["late"]);
        assert_eq!(scheduler.now(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_runs_after_delay() {
        let scheduler = TokioScheduler::current().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let _sub = scheduler.schedule_after(
            Duration::from_millis(50),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_tokio_scheduler_requires_runtime() {
        assert!(matches!(
            TokioScheduler::current(),
            Err(Error::Runtime { .. })
        ));
    }
}
